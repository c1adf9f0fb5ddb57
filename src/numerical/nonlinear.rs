use crate::Utils::settings::{NonlinearMethod, SolverSettings};
use crate::linalg::dof_map::{Comm, Exchange};
use crate::linalg::linear_solver::{GlobalMatrix, LinearSolver};
use crate::linalg::state_vector::SolverState;
use crate::numerical::assembly::{AssembleContext, Assembler, SeedMode};
use crate::numerical::params::ParameterSet;
use log::{info, warn};
use nalgebra::DVector;
use std::collections::HashMap;
use tabled::{builder::Builder, settings::Style};

/// residual norms below this are treated as an already converged start
const R0_FLOOR: f64 = 1.0e-14;

/////////////////////////////////////////////////////////////////////////////////////////////
//                CONVERGENCE STATUS
/////////////////////////////////////////////////////////////////////////////////////////////

/// outcome of a Newton solve; nonconvergence is a reportable state, not an
/// error
#[derive(Debug, Clone)]
pub struct ConvergenceStatus {
    pub converged: bool,
    /// number of residual passes (the final convergence check included)
    pub iterations: usize,
    pub initial_norm: f64,
    /// final scaled norm ||R||_inf / ||R_0||_inf
    pub final_norm: f64,
}

/////////////////////////////////////////////////////////////////////////////////////////////
//                NONLINEAR SOLVER
/////////////////////////////////////////////////////////////////////////////////////////////

pub struct NonlinearSolver {
    pub tolerance: f64,
    pub max_iterations: usize,
    pub method: NonlinearMethod,
    pub use_strong_dirichlet: bool,
    pub verbosity: usize,
    pub linear_solver: LinearSolver,
    calc_statistics: HashMap<String, usize>,
}

impl NonlinearSolver {
    pub fn new(settings: &SolverSettings) -> NonlinearSolver {
        settings.validate();
        NonlinearSolver {
            tolerance: settings.nonlinear_tol,
            max_iterations: settings.max_nonlinear_iters,
            method: settings.nonlinear_method,
            use_strong_dirichlet: settings.use_strong_dirichlet,
            verbosity: settings.verbosity,
            linear_solver: LinearSolver::new(settings),
            calc_statistics: HashMap::new(),
        }
    }

    /// Newton iteration on the assembled residual/Jacobian pair.
    ///
    /// Forward mode updates u and u_dot (u += du, u_dot += alpha * du);
    /// adjoint mode updates phi and phi_dot the same way and caps the pass
    /// count at 2 since the adjoint system is linear in phi.
    pub fn solve<A: Assembler>(
        &mut self,
        assembler: &mut A,
        exchange: &Exchange,
        comm: &dyn Comm,
        state: &mut SolverState,
        params: &ParameterSet,
        ctx: &AssembleContext,
    ) -> ConvergenceStatus {
        let n_owned = exchange.map.num_owned();
        if self.use_strong_dirichlet {
            for (lid, val) in assembler.dirichlet_values(ctx.time) {
                if ctx.is_adjoint {
                    state.phi[lid] = 0.0;
                } else {
                    state.u[lid] = val;
                }
            }
        }
        let maxiter = if ctx.is_adjoint {
            self.max_iterations.min(2)
        } else {
            self.max_iterations
        };
        let mut res_owned = DVector::zeros(n_owned);
        let mut cached_matrix: Option<GlobalMatrix> = None;
        let mut r0 = 0.0;
        let mut scaled = 1.0;
        let mut iterations = 0;
        let mut converged = false;
        while iterations < maxiter {
            let mut call_ctx = *ctx;
            call_ctx.num_active_params = params.num_active();
            let reuse_jacobian =
                self.method == NonlinearMethod::AndersonAccelerated && cached_matrix.is_some();
            call_ctx.seed = if reuse_jacobian {
                SeedMode::None
            } else {
                SeedMode::Solution
            };
            let system = assembler.assemble_jac_res(state, params, &call_ctx);
            let res_over = system.residual.column(0).into_owned();
            exchange.export_add(&res_over, &mut res_owned);
            let resnorm = comm.max(res_owned.amax());
            if iterations == 0 {
                r0 = resnorm;
                scaled = if r0 > R0_FLOOR { 1.0 } else { 0.0 };
            } else {
                scaled = if r0 > R0_FLOOR { resnorm / r0 } else { 0.0 };
            }
            iterations += 1;
            info!(
                "nonlinear iteration = {}, residual norm = {:e}, scaled norm = {:e}",
                iterations, resnorm, scaled
            );
            if scaled <= self.tolerance {
                converged = true;
                break;
            }
            if !reuse_jacobian {
                let owned_triplets = exchange.export_add_triplets(&system.jacobian);
                cached_matrix = Some(GlobalMatrix::from_triplets(n_owned, n_owned, owned_triplets));
            }
            let matrix = cached_matrix.as_ref().unwrap();
            let (du_owned, report) = self.linear_solver.solve(matrix, &(-&res_owned));
            if !report.converged {
                warn!(
                    "linear solver ({}) failed at nonlinear iteration {}, residual norm = {:e}",
                    report.method, iterations, report.residual_norm
                );
            }
            let mut du_over = DVector::zeros(exchange.map.num_overlapped());
            exchange.import(&du_owned, &mut du_over);
            if ctx.is_adjoint {
                state.phi += &du_over;
                state.phi_dot += ctx.alpha * &du_over;
            } else {
                state.u += &du_over;
                state.u_dot += ctx.alpha * &du_over;
            }
        }
        if !converged {
            warn!(
                "nonlinear solver did not converge in {} iterations, final scaled norm = {:e}",
                iterations, scaled
            );
        }
        self.calc_statistics
            .insert("number of iterations".to_string(), iterations);
        self.calc_statistics
            .insert("owned degrees of freedom".to_string(), n_owned);
        self.calc_statistics
            .insert("converged".to_string(), converged as usize);
        if self.verbosity > 1 {
            self.calc_statistics();
        }
        ConvergenceStatus {
            converged,
            iterations,
            initial_norm: r0,
            final_norm: scaled,
        }
    }

    fn calc_statistics(&self) {
        let stats = self.calc_statistics.clone();
        let mut table = Builder::from(stats).build();
        table.with(Style::modern_rounded());
        info!("\n \n NONLINEAR SOLVE STATISTICS \n \n {}", table.to_string());
    }
}
