use crate::Utils::settings::{LinearMethod, SolverSettings};
use faer::mat::Mat;
use faer::prelude::*;
use faer::sparse::{SparseColMat, Triplet};
use faer_gmres::{JacobiPreconLinOp, restarted_gmres};
use log::warn;
use nalgebra::{DMatrix, DVector};

/////////////////////////////////////////////////////////////////////////////////////////////
//                GLOBAL MATRIX
/////////////////////////////////////////////////////////////////////////////////////////////

/// assembled global matrix kept in triplet form until a solve is requested;
/// duplicate (row, col) entries are summed on conversion
#[derive(Debug, Clone)]
pub struct GlobalMatrix {
    pub nrows: usize,
    pub ncols: usize,
    pub triplets: Vec<Triplet<usize, usize, f64>>,
}

impl GlobalMatrix {
    pub fn new(nrows: usize, ncols: usize) -> GlobalMatrix {
        GlobalMatrix {
            nrows,
            ncols,
            triplets: Vec::new(),
        }
    }

    pub fn from_triplets(
        nrows: usize,
        ncols: usize,
        triplets: Vec<Triplet<usize, usize, f64>>,
    ) -> GlobalMatrix {
        GlobalMatrix {
            nrows,
            ncols,
            triplets,
        }
    }

    pub fn add(&mut self, row: usize, col: usize, val: f64) {
        assert!(row < self.nrows && col < self.ncols, "triplet out of bounds");
        self.triplets.push(Triplet::new(row, col, val));
    }

    pub fn to_sparse(&self) -> Option<SparseColMat<usize, f64>> {
        SparseColMat::<usize, f64>::try_new_from_triplets(self.nrows, self.ncols, &self.triplets)
            .ok()
    }

    pub fn to_dense(&self) -> DMatrix<f64> {
        let mut a = DMatrix::zeros(self.nrows, self.ncols);
        for t in self.triplets.iter() {
            a[(t.row, t.col)] += t.val;
        }
        a
    }

    /// y = A x through the triplets
    pub fn apply(&self, x: &DVector<f64>) -> DVector<f64> {
        assert_eq!(x.len(), self.ncols);
        let mut y = DVector::zeros(self.nrows);
        for t in self.triplets.iter() {
            y[t.row] += t.val * x[t.col];
        }
        y
    }

    /// y = A^T x through the triplets
    pub fn apply_transpose(&self, x: &DVector<f64>) -> DVector<f64> {
        assert_eq!(x.len(), self.nrows);
        let mut y = DVector::zeros(self.ncols);
        for t in self.triplets.iter() {
            y[t.col] += t.val * x[t.row];
        }
        y
    }
}

/////////////////////////////////////////////////////////////////////////////////////////////
//                LINEAR SOLVER
/////////////////////////////////////////////////////////////////////////////////////////////

/// outcome of one linear solve; a failed factorization or a stagnated
/// iteration reports converged = false and a zero update, it never panics
#[derive(Debug, Clone)]
pub struct LinearSolveReport {
    pub converged: bool,
    pub iterations: usize,
    pub residual_norm: f64,
    pub method: LinearMethod,
}

pub struct LinearSolver {
    pub method: LinearMethod,
    pub tolerance: f64,
    pub max_iterations: usize,
}

impl LinearSolver {
    pub fn new(settings: &SolverSettings) -> LinearSolver {
        LinearSolver {
            method: settings.linear_method,
            tolerance: settings.linear_tol,
            max_iterations: settings.max_linear_iters,
        }
    }

    pub fn solve(&self, matrix: &GlobalMatrix, rhs: &DVector<f64>) -> (DVector<f64>, LinearSolveReport) {
        assert_eq!(matrix.nrows, matrix.ncols, "matrix must be square");
        assert_eq!(rhs.len(), matrix.nrows);
        let (x, converged, iterations) = match self.method {
            LinearMethod::Lu => self.solve_dense_lu(matrix, rhs),
            LinearMethod::SparseLu => self.solve_sparse_lu(matrix, rhs),
            LinearMethod::Gmres => self.solve_gmres(matrix, rhs),
        };
        let residual_norm = (matrix.apply(&x) - rhs).norm();
        let report = LinearSolveReport {
            converged,
            iterations,
            residual_norm,
            method: self.method,
        };
        (x, report)
    }

    fn solve_dense_lu(&self, matrix: &GlobalMatrix, rhs: &DVector<f64>) -> (DVector<f64>, bool, usize) {
        let a = matrix.to_dense();
        let lu = a.lu();
        match lu.solve(rhs) {
            Some(x) => (x, true, 1),
            None => {
                warn!("dense LU factorization failed, returning zero update");
                (DVector::zeros(rhs.len()), false, 0)
            }
        }
    }

    fn solve_sparse_lu(&self, matrix: &GlobalMatrix, rhs: &DVector<f64>) -> (DVector<f64>, bool, usize) {
        let a = match matrix.to_sparse() {
            Some(a) => a,
            None => {
                warn!("sparse matrix construction failed, returning zero update");
                return (DVector::zeros(rhs.len()), false, 0);
            }
        };
        match a.sp_lu() {
            Ok(lu) => {
                let b: Col<f64> = ColRef::from_slice(rhs.as_slice()).to_owned();
                let lhs: MatRef<f64> = b.as_mat();
                let res: Mat<f64> = lu.solve(lhs);
                let res_vec: Vec<f64> = res.row_iter().map(|x| x[0]).collect();
                (DVector::from_vec(res_vec), true, 1)
            }
            Err(_) => {
                warn!("sparse LU factorization failed, returning zero update");
                (DVector::zeros(rhs.len()), false, 0)
            }
        }
    }

    fn solve_gmres(&self, matrix: &GlobalMatrix, rhs: &DVector<f64>) -> (DVector<f64>, bool, usize) {
        let a = match matrix.to_sparse() {
            Some(a) => a,
            None => {
                warn!("sparse matrix construction failed, returning zero update");
                return (DVector::zeros(rhs.len()), false, 0);
            }
        };
        let jacobi_pre = JacobiPreconLinOp::new(a.as_ref());
        let b: Mat<f64> = Mat::from_fn(rhs.len(), 1, |i, _| rhs[i]);
        let mut x: Mat<f64> = Mat::zeros(rhs.len(), 1);
        let res = restarted_gmres(
            a.as_ref(),
            b.as_ref(),
            x.as_mut(),
            self.max_iterations,
            self.max_iterations,
            self.tolerance,
            Some(&jacobi_pre),
        );
        match res {
            Ok((_err, iters)) => {
                let res_vec: Vec<f64> = x.row_iter().map(|x| x[0]).collect();
                (DVector::from_vec(res_vec), true, iters)
            }
            Err(_) => {
                // fall back to the direct factorization
                warn!("gmres did not converge, falling back to sparse LU");
                self.solve_sparse_lu(matrix, rhs)
            }
        }
    }
}

/////////////////////////////////////////////////////////////////////////////////////////////
//                                     TESTS
/////////////////////////////////////////////////////////////////////////////////////////////
#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn diffusion_2x2() -> GlobalMatrix {
        let triplets = vec![
            Triplet::new(0, 0, 2.0),
            Triplet::new(0, 1, -1.0),
            Triplet::new(1, 0, -1.0),
            Triplet::new(1, 1, 2.0),
        ];
        GlobalMatrix::from_triplets(2, 2, triplets)
    }

    fn solver_with(method: LinearMethod) -> LinearSolver {
        let mut settings = SolverSettings::new();
        settings.linear_method = method;
        LinearSolver::new(&settings)
    }

    #[test]
    fn test_dense_lu() {
        let a = diffusion_2x2();
        let b = DVector::from_vec(vec![1.0, 1.0]);
        let (x, report) = solver_with(LinearMethod::Lu).solve(&a, &b);
        assert!(report.converged);
        assert_relative_eq!(x[0], 1.0, max_relative = 1e-12);
        assert_relative_eq!(x[1], 1.0, max_relative = 1e-12);
    }

    #[test]
    fn test_sparse_lu() {
        let a = diffusion_2x2();
        let b = DVector::from_vec(vec![0.0, 3.0]);
        let (x, report) = solver_with(LinearMethod::SparseLu).solve(&a, &b);
        assert!(report.converged);
        assert_relative_eq!(x[0], 1.0, max_relative = 1e-10);
        assert_relative_eq!(x[1], 2.0, max_relative = 1e-10);
    }

    #[test]
    fn test_gmres() {
        let a = diffusion_2x2();
        let b = DVector::from_vec(vec![1.0, 1.0]);
        let (x, report) = solver_with(LinearMethod::Gmres).solve(&a, &b);
        assert!(report.converged);
        assert_relative_eq!(x[0], 1.0, max_relative = 1e-6);
        assert_relative_eq!(x[1], 1.0, max_relative = 1e-6);
    }

    #[test]
    fn test_singular_matrix_is_not_fatal() {
        let triplets = vec![
            Triplet::new(0, 0, 1.0),
            Triplet::new(0, 1, 1.0),
            Triplet::new(1, 0, 1.0),
            Triplet::new(1, 1, 1.0),
        ];
        let a = GlobalMatrix::from_triplets(2, 2, triplets);
        let b = DVector::from_vec(vec![1.0, 2.0]);
        let (x, report) = solver_with(LinearMethod::Lu).solve(&a, &b);
        assert!(!report.converged);
        assert_eq!(x, DVector::zeros(2));
    }

    #[test]
    fn test_apply_and_transpose() {
        let mut a = GlobalMatrix::new(2, 3);
        a.add(0, 1, 2.0);
        a.add(1, 2, -1.0);
        a.add(0, 1, 1.0); // duplicate, summed on apply
        let x = DVector::from_vec(vec![1.0, 1.0, 1.0]);
        assert_eq!(a.apply(&x), DVector::from_vec(vec![3.0, -1.0]));
        let y = DVector::from_vec(vec![1.0, 1.0]);
        assert_eq!(a.apply_transpose(&y), DVector::from_vec(vec![0.0, 3.0, -1.0]));
    }
}
