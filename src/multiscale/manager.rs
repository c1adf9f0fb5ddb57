use crate::linalg::dof_map::Comm;
use crate::multiscale::subgrid::{MacroWorkset, SubgridModel};
use crate::numerical::trajectory::{TrajectoryError, TrajectoryStore};
use crate::numerical::transient::CostReporter;
use log::info;
use nalgebra::DVector;
use rayon::prelude::*;
use std::collections::HashMap;

/////////////////////////////////////////////////////////////////////////////////////////////
//                MULTISCALE MANAGER
/////////////////////////////////////////////////////////////////////////////////////////////

/// owns the sub-grid models and the mapping from macro element ids to
/// them. Registration is lazy: an element picks up its local problem and
/// initial state the first time the macro assembly reaches it, and the
/// trajectory stores live here so the models themselves stay stateless
/// between macro steps.
pub struct MultiscaleManager {
    pub models: Vec<SubgridModel>,
    /// macro element id to model index
    pub registry: HashMap<usize, usize>,
    pub soln: TrajectoryStore,
    pub adjsoln: TrajectoryStore,
}

impl MultiscaleManager {
    pub fn new() -> MultiscaleManager {
        MultiscaleManager {
            models: Vec::new(),
            registry: HashMap::new(),
            soln: TrajectoryStore::new(),
            adjsoln: TrajectoryStore::new(),
        }
    }

    pub fn add_model(&mut self, model: SubgridModel) -> usize {
        self.models.push(model);
        self.models.len() - 1
    }

    /// attach a macro element to a model and seed its initial local state
    pub fn register(
        &mut self,
        macro_elem: usize,
        model_index: usize,
        initial: DVector<f64>,
        start_time: f64,
    ) {
        assert!(
            model_index < self.models.len(),
            "model index {} is out of range, {} models are loaded",
            model_index,
            self.models.len()
        );
        assert_eq!(
            initial.len(),
            self.models[model_index].assembler.num_dofs(),
            "initial state does not match the sub-grid size"
        );
        self.registry.insert(macro_elem, model_index);
        self.soln.store(macro_elem, start_time, initial);
    }

    pub fn is_multiscale(&self, macro_elem: usize) -> bool {
        self.registry.contains_key(&macro_elem)
    }

    /// run the local solve of one registered element over the current macro
    /// step, condensing its flux into the workset
    pub fn solve_element(
        &mut self,
        macro_elem: usize,
        lambda: &DVector<f64>,
        macro_phi: &DVector<f64>,
        time: f64,
        macro_dt: f64,
        is_transient: bool,
        is_adjoint: bool,
        compute_jacobian: bool,
        compute_sens: bool,
        workset: &mut MacroWorkset,
        subgradient: &mut DVector<f64>,
    ) -> Result<(), TrajectoryError> {
        let model_index = *self
            .registry
            .get(&macro_elem)
            .ok_or(TrajectoryError::EmptyKey { key: macro_elem })?;
        self.models[model_index].solve(
            macro_elem,
            lambda,
            macro_phi,
            time,
            macro_dt,
            is_transient,
            is_adjoint,
            compute_jacobian,
            compute_sens,
            &mut self.soln,
            &mut self.adjsoln,
            workset,
            subgradient,
        )
    }

    /// estimated local work of the registered elements, scanned in
    /// parallel; a dense local solve costs num_dofs^3 per micro step
    pub fn update(&self) -> f64 {
        self.registry
            .par_iter()
            .map(|(_, &model_index)| {
                let model = &self.models[model_index];
                let n = model.assembler.num_dofs();
                (n * n * n * model.time_steps) as f64
            })
            .sum()
    }

    /// ratio of the most to the least loaded rank
    pub fn load_balance_factor(&self, comm: &dyn Comm) -> f64 {
        let local = self.update();
        let min = comm.min(local);
        let max = comm.max(local);
        let factor = if min > 0.0 { max / min } else { 1.0 };
        info!(
            "multiscale cost scan: {} local elements, cost = {}, balance factor = {}",
            self.registry.len(),
            local,
            factor
        );
        factor
    }
}

impl CostReporter for MultiscaleManager {
    fn local_cost(&mut self) -> f64 {
        self.update()
    }
}
