//MIT License
#![allow(non_camel_case_types)]
#![allow(non_snake_case)]
/// different utility modules used throughout the project
pub mod Utils;
/// DOF maps, owned/overlapped exchange, linear solvers
pub mod linalg;
/// macro/sub-grid coupling: per-element sub-grid solves and flux exchange
pub mod multiscale;
/// nonlinear solver, time integration, objective and sensitivity machinery
pub mod numerical;
