use nalgebra::{DMatrix, DVector};
use std::collections::HashMap;
use std::error::Error;
use std::fmt;

/// time match tolerance of the snapshot stores
const TIME_TOL: f64 = 1.0e-12;

/////////////////////////////////////////////////////////////////////////////////////////////
//                TRAJECTORY
/////////////////////////////////////////////////////////////////////////////////////////////

/// dense trajectory: one column per stored time, column 0 is the initial
/// (or terminal, for an adjoint trajectory) condition
#[derive(Debug, Clone)]
pub struct Trajectory {
    pub data: DMatrix<f64>,
    pub times: DVector<f64>,
}

impl Trajectory {
    /// forward trajectory over num_steps uniform steps: times k * dt
    pub fn forward(ndof: usize, num_steps: usize, final_time: f64) -> Trajectory {
        assert!(num_steps > 0, "Number of time steps should be a positive number.");
        let dt = final_time / num_steps as f64;
        let times = DVector::from_fn(num_steps + 1, |k, _| k as f64 * dt);
        Trajectory {
            data: DMatrix::zeros(ndof, num_steps + 1),
            times,
        }
    }

    /// adjoint trajectory: column 0 holds the terminal condition at the
    /// final time, column k+1 the solve at final_time - k * dt
    pub fn adjoint(ndof: usize, num_steps: usize, final_time: f64) -> Trajectory {
        assert!(num_steps > 0, "Number of time steps should be a positive number.");
        let dt = final_time / num_steps as f64;
        let times = DVector::from_fn(num_steps + 1, |k, _| {
            if k == 0 {
                final_time
            } else {
                final_time - (k as f64 - 1.0) * dt
            }
        });
        Trajectory {
            data: DMatrix::zeros(ndof, num_steps + 1),
            times,
        }
    }

    /// single-column trajectory of a steady solve
    pub fn steady(ndof: usize, time: f64) -> Trajectory {
        Trajectory {
            data: DMatrix::zeros(ndof, 1),
            times: DVector::from_vec(vec![time]),
        }
    }

    pub fn num_columns(&self) -> usize {
        self.data.ncols()
    }

    pub fn num_steps(&self) -> usize {
        self.data.ncols() - 1
    }

    pub fn set_column(&mut self, k: usize, v: &DVector<f64>) {
        assert_eq!(v.len(), self.data.nrows());
        self.data.set_column(k, v);
    }

    pub fn column(&self, k: usize) -> DVector<f64> {
        self.data.column(k).into_owned()
    }
}

/////////////////////////////////////////////////////////////////////////////////////////////
//                KEYED SNAPSHOT STORE
/////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Clone, PartialEq)]
pub enum TrajectoryError {
    /// no snapshots at all under this key
    EmptyKey { key: usize },
    /// no snapshot matching the requested time
    NotFound { key: usize, time: f64 },
}

impl fmt::Display for TrajectoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrajectoryError::EmptyKey { key } => {
                write!(f, "no stored states under key {}", key)
            }
            TrajectoryError::NotFound { key, time } => {
                write!(f, "no stored state under key {} matching time {}", key, time)
            }
        }
    }
}

impl Error for TrajectoryError {}

/// snapshot store keyed by macro element id; snapshots per key are kept
/// sorted by time. A lookup miss is a hard error, never a silent zero fill.
pub struct TrajectoryStore {
    snapshots: HashMap<usize, Vec<(f64, DVector<f64>)>>,
}

impl TrajectoryStore {
    pub fn new() -> TrajectoryStore {
        TrajectoryStore {
            snapshots: HashMap::new(),
        }
    }

    pub fn has(&self, key: usize) -> bool {
        self.snapshots.get(&key).map(|v| !v.is_empty()).unwrap_or(false)
    }

    /// insert or replace the snapshot at this time
    pub fn store(&mut self, key: usize, time: f64, state: DVector<f64>) {
        let entry = self.snapshots.entry(key).or_insert_with(Vec::new);
        match entry.iter_mut().find(|(t, _)| (*t - time).abs() < TIME_TOL) {
            Some(slot) => slot.1 = state,
            None => {
                entry.push((time, state));
                entry.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap());
            }
        }
    }

    /// exact time match
    pub fn extract(&self, key: usize, time: f64) -> Result<DVector<f64>, TrajectoryError> {
        let entry = self.entry(key)?;
        entry
            .iter()
            .find(|(t, _)| (*t - time).abs() < TIME_TOL)
            .map(|(_, s)| s.clone())
            .ok_or(TrajectoryError::NotFound { key, time })
    }

    /// latest snapshot strictly before the requested time; falls back to
    /// the earliest snapshot when nothing precedes it
    pub fn extract_previous(&self, key: usize, time: f64) -> Result<DVector<f64>, TrajectoryError> {
        let entry = self.entry(key)?;
        let prev = entry
            .iter()
            .rev()
            .find(|(t, _)| *t < time - TIME_TOL)
            .or_else(|| entry.first());
        Ok(prev.unwrap().1.clone())
    }

    /// earliest snapshot strictly after the requested time
    pub fn extract_next(&self, key: usize, time: f64) -> Result<DVector<f64>, TrajectoryError> {
        let entry = self.entry(key)?;
        entry
            .iter()
            .find(|(t, _)| *t > time + TIME_TOL)
            .map(|(_, s)| s.clone())
            .ok_or(TrajectoryError::NotFound { key, time })
    }

    pub fn extract_last(&self, key: usize) -> Result<DVector<f64>, TrajectoryError> {
        let entry = self.entry(key)?;
        Ok(entry.last().unwrap().1.clone())
    }

    fn entry(&self, key: usize) -> Result<&Vec<(f64, DVector<f64>)>, TrajectoryError> {
        match self.snapshots.get(&key) {
            Some(v) if !v.is_empty() => Ok(v),
            _ => Err(TrajectoryError::EmptyKey { key }),
        }
    }
}
