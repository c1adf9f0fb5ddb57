//! numerical core: assembly seam, Newton solver, time integration,
//! objective and sensitivity machinery
/// residual/Jacobian assembly seam and the explicit call context
pub mod assembly;
/// Newton-type nonlinear solver
pub mod nonlinear;
/// objective evaluation with regularization of discretized parameters
pub mod objective;
/// parameter bookkeeping: classes, bounds, discretized fields
pub mod params;
/// discrete-adjoint gradient accumulation
pub mod sensitivity;
/// forward and adjoint transient drivers
pub mod transient;
/// trajectory matrices and keyed snapshot stores
pub mod trajectory;
