use crate::linalg::dof_map::DofMap;
use crate::linalg::state_vector::SolverState;
use crate::numerical::objective::ObjectiveRecord;
use crate::numerical::params::ParameterSet;
use faer::sparse::Triplet;
use nalgebra::DMatrix;

/////////////////////////////////////////////////////////////////////////////////////////////
//                SEEDING AND CALL CONTEXT
/////////////////////////////////////////////////////////////////////////////////////////////

/// which derivative directions the assembly kernel seeds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeedMode {
    /// residual only
    None,
    /// residual plus the Jacobian with respect to the solution
    Solution,
    /// residual derivative columns with respect to the active scalar
    /// parameters
    ActiveParams,
    /// Jacobian with respect to the discretized parameter DOFs
    /// (param rows by solution columns)
    DiscretizedParams,
}

/// everything a kernel needs to know about the call, passed explicitly
/// instead of living in solver-global state
#[derive(Debug, Clone, Copy)]
pub struct AssembleContext {
    pub time: f64,
    /// time derivative weight: u_dot picks up alpha * du per Newton update
    pub alpha: f64,
    pub beta: f64,
    pub is_transient: bool,
    pub is_adjoint: bool,
    pub is_final_time: bool,
    pub num_active_params: usize,
    pub seed: SeedMode,
}

impl AssembleContext {
    pub fn steady(final_time: f64) -> AssembleContext {
        AssembleContext {
            time: final_time,
            alpha: 0.0,
            beta: 1.0,
            is_transient: false,
            is_adjoint: false,
            is_final_time: true,
            num_active_params: 0,
            seed: SeedMode::Solution,
        }
    }

    pub fn transient(time: f64, alpha: f64, is_final_time: bool) -> AssembleContext {
        AssembleContext {
            time,
            alpha,
            beta: 1.0,
            is_transient: true,
            is_adjoint: false,
            is_final_time,
            num_active_params: 0,
            seed: SeedMode::Solution,
        }
    }

    pub fn adjoint(mut self) -> AssembleContext {
        self.is_adjoint = true;
        self
    }

    pub fn with_seed(mut self, seed: SeedMode) -> AssembleContext {
        self.seed = seed;
        self
    }
}

/////////////////////////////////////////////////////////////////////////////////////////////
//                ASSEMBLED SYSTEM
/////////////////////////////////////////////////////////////////////////////////////////////

/// result of one assembly call, in the overlapped layout.
///
/// residual has one column for SeedMode::None/Solution and one column per
/// active parameter for SeedMode::ActiveParams. The Jacobian triplets are
/// indexed by overlapped-local ids: solution rows by solution columns for
/// SeedMode::Solution, parameter rows by solution columns for
/// SeedMode::DiscretizedParams.
pub struct AssembledSystem {
    pub residual: DMatrix<f64>,
    pub jacobian: Vec<Triplet<usize, usize, f64>>,
}

impl AssembledSystem {
    pub fn residual_only(residual: DMatrix<f64>) -> AssembledSystem {
        AssembledSystem {
            residual,
            jacobian: Vec::new(),
        }
    }
}

/////////////////////////////////////////////////////////////////////////////////////////////
//                ASSEMBLER SEAM
/////////////////////////////////////////////////////////////////////////////////////////////

/// Physics assembly kernels live behind this trait; the solvers never see
/// elements, basis functions or quadrature.
///
/// # Residual convention
///
/// assemble_jac_res returns the physics residual R(u, u_dot; p) and its
/// derivatives. The Newton solvers negate the right-hand side themselves,
/// so a linear problem K u = f is expressed as R = K u - f with Jacobian K.
///
/// In adjoint mode (ctx.is_adjoint) the kernel returns the adjoint residual
/// J^T phi - dObjective/du - M^T state.adj_coupling and the transposed
/// Jacobian J^T, evaluated at the forward state carried in
/// `state.u`/`state.u_dot` (M is the mass matrix dR/du_dot). The backward
/// coupling vector `adj_coupling` is the weighted sum of the later adjoint
/// states, precomputed by the transient driver per step, so the kernel
/// stays agnostic of the time integration order.
///
/// Rows constrained by a strong Dirichlet condition must carry an identity
/// diagonal and a zero residual; the solver pins the values before the
/// first pass. Kernels must call `DofMap::check_element_width` on each
/// element's DOF footprint before seeding derivative directions.
pub trait Assembler {
    fn solution_map(&self) -> &DofMap;

    /// combined map over all discretized parameter DOFs, when the problem
    /// carries discretized parameters
    fn param_map(&self) -> Option<&DofMap> {
        None
    }

    fn assemble_jac_res(
        &mut self,
        state: &SolverState,
        params: &ParameterSet,
        ctx: &AssembleContext,
    ) -> AssembledSystem;

    /// strong Dirichlet values as (overlapped-local id, value) pairs
    fn dirichlet_values(&self, _time: f64) -> Vec<(usize, f64)> {
        Vec::new()
    }

    /// objective contribution and its direct parameter partials at the
    /// given state
    fn objective(
        &mut self,
        _state: &SolverState,
        params: &ParameterSet,
        _ctx: &AssembleContext,
    ) -> ObjectiveRecord {
        ObjectiveRecord::empty(params.num_active())
    }
}
