//! distributed-style vector plumbing and linear solvers
/// owned/overlapped DOF maps, communicator trait and the exchange (export/import)
pub mod dof_map;
/// dense and sparse linear solvers with a status report instead of panics
pub mod linear_solver;
/// paired owned/overlapped solution vectors
pub mod state_vector;
