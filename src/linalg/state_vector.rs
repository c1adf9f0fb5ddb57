use crate::linalg::dof_map::{DofMap, Exchange};
use nalgebra::DVector;

/// the overlapped state vectors carried through a nonlinear solve:
/// solution, its time derivative, the adjoint pair and the backward time
/// coupling of the adjoint march
#[derive(Debug, Clone)]
pub struct SolverState {
    pub u: DVector<f64>,
    pub u_dot: DVector<f64>,
    pub phi: DVector<f64>,
    pub phi_dot: DVector<f64>,
    /// weighted sum of the later adjoint states, filled by the transient
    /// driver before each adjoint solve; kernels apply M^T to it
    pub adj_coupling: DVector<f64>,
}

impl SolverState {
    pub fn new(map: &DofMap) -> SolverState {
        let n = map.num_overlapped();
        SolverState {
            u: DVector::zeros(n),
            u_dot: DVector::zeros(n),
            phi: DVector::zeros(n),
            phi_dot: DVector::zeros(n),
            adj_coupling: DVector::zeros(n),
        }
    }

    /// seed the solution from an owned-layout vector
    pub fn set_owned_solution(&mut self, exchange: &Exchange, owned: &DVector<f64>) {
        exchange.import(owned, &mut self.u);
    }

    pub fn set_owned_adjoint(&mut self, exchange: &Exchange, owned: &DVector<f64>) {
        exchange.import(owned, &mut self.phi);
    }

    pub fn owned_solution(&self, exchange: &Exchange) -> DVector<f64> {
        exchange.owned_view(&self.u)
    }

    pub fn owned_adjoint(&self, exchange: &Exchange) -> DVector<f64> {
        exchange.owned_view(&self.phi)
    }
}
