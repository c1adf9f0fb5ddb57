/// registry of sub-grid models keyed by macro element id
pub mod manager;
/// the local sub-grid problem: micro time stepping, micro adjoint, flux
/// condensation back to the macro residual
pub mod subgrid;
