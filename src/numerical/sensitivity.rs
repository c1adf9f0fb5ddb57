use crate::Utils::logger::save_vector_to_csv;
use crate::Utils::settings::SolverSettings;
use crate::linalg::dof_map::{Comm, Exchange};
use crate::linalg::state_vector::SolverState;
use crate::numerical::assembly::{AssembleContext, Assembler, SeedMode};
use crate::numerical::objective::compute_objective;
use crate::numerical::params::ParameterSet;
use crate::numerical::trajectory::Trajectory;
use crate::numerical::transient::{bdf_alpha, bdf_u_dot};
use nalgebra::{DMatrix, DVector};
use std::io;

/// forward/adjoint column pairing of one accumulation step: forward column
/// timeiter+1 goes with adjoint column num_steps-timeiter
pub fn pair_indices(timeiter: usize, num_steps: usize) -> (usize, usize) {
    assert!(timeiter < num_steps);
    (timeiter + 1, num_steps - timeiter)
}

/////////////////////////////////////////////////////////////////////////////////////////////
//                SENSITIVITY ENGINE
/////////////////////////////////////////////////////////////////////////////////////////////

/// discrete-adjoint gradient accumulation.
///
/// Gradient layout: active scalar parameters first, then discretized DOFs
/// field by field. For an active parameter p the contribution of one step
/// is -sum_owned phi_i * dR_i/dp plus the direct objective partial; for a
/// discretized DOF the seeded Jacobian (param rows by solution columns) is
/// applied to the owned adjoint the same way.
pub struct SensitivityEngine {
    pub settings: SolverSettings,
}

impl SensitivityEngine {
    pub fn new(settings: SolverSettings) -> SensitivityEngine {
        SensitivityEngine { settings }
    }

    /// accumulate both the active and discretized contributions of one
    /// forward/adjoint state pair, plus the direct objective partials
    pub fn accumulate_step<A: Assembler>(
        &self,
        assembler: &mut A,
        exchange: &Exchange,
        comm: &dyn Comm,
        state: &SolverState,
        params: &ParameterSet,
        ctx: &AssembleContext,
        gradient: &mut DVector<f64>,
    ) {
        self.accumulate(
            assembler, exchange, comm, state, params, ctx, gradient, true, true,
        );
    }

    /// whole-trajectory driver for the active scalar parameters
    pub fn compute_sensitivities<A: Assembler>(
        &self,
        assembler: &mut A,
        exchange: &Exchange,
        comm: &dyn Comm,
        state: &mut SolverState,
        params: &ParameterSet,
        forward: &Trajectory,
        adjoint: &Trajectory,
    ) -> DVector<f64> {
        self.trajectory_sweep(
            assembler, exchange, comm, state, params, forward, adjoint, true, false,
        )
    }

    /// whole-trajectory driver for the discretized field parameters
    pub fn compute_discretized_sensitivities<A: Assembler>(
        &self,
        assembler: &mut A,
        exchange: &Exchange,
        comm: &dyn Comm,
        state: &mut SolverState,
        params: &ParameterSet,
        forward: &Trajectory,
        adjoint: &Trajectory,
    ) -> DVector<f64> {
        self.trajectory_sweep(
            assembler, exchange, comm, state, params, forward, adjoint, false, true,
        )
    }

    /// write the gradient next to the parameter names, csv counterpart of
    /// the classic sens.dat
    pub fn dump_gradient(
        &self,
        gradient: &DVector<f64>,
        params: &ParameterSet,
        filename: &str,
    ) -> io::Result<()> {
        save_vector_to_csv(gradient, &params.gradient_names(), filename)
    }

    fn trajectory_sweep<A: Assembler>(
        &self,
        assembler: &mut A,
        exchange: &Exchange,
        comm: &dyn Comm,
        state: &mut SolverState,
        params: &ParameterSet,
        forward: &Trajectory,
        adjoint: &Trajectory,
        do_active: bool,
        do_discretized: bool,
    ) -> DVector<f64> {
        let mut gradient = DVector::zeros(params.gradient_len());
        let num_steps = forward.num_steps();
        if num_steps == 0 {
            // steady pair
            exchange.import(&forward.column(0), &mut state.u);
            state.u_dot.fill(0.0);
            exchange.import(&adjoint.column(0), &mut state.phi);
            let ctx = AssembleContext::steady(self.settings.final_time);
            self.accumulate(
                assembler,
                exchange,
                comm,
                state,
                params,
                &ctx,
                &mut gradient,
                do_active,
                do_discretized,
            );
            return comm.sum_vec(&gradient);
        }
        assert_eq!(
            adjoint.num_steps(),
            num_steps,
            "forward and adjoint trajectories must have the same step count"
        );
        let dt = self.settings.delta_t();
        for timeiter in 0..num_steps {
            let (fcol, acol) = pair_indices(timeiter, num_steps);
            exchange.import(&forward.column(fcol), &mut state.u);
            let fstep = fcol - 1;
            let alpha = bdf_alpha(self.settings.time_order, fstep, dt);
            state.u_dot = bdf_u_dot(
                exchange,
                forward,
                fstep,
                self.settings.time_order,
                alpha,
                &state.u,
            );
            exchange.import(&adjoint.column(acol), &mut state.phi);
            let ctx =
                AssembleContext::transient(forward.times[fcol], alpha, fcol == num_steps);
            self.accumulate(
                assembler,
                exchange,
                comm,
                state,
                params,
                &ctx,
                &mut gradient,
                do_active,
                do_discretized,
            );
        }
        comm.sum_vec(&gradient)
    }

    fn accumulate<A: Assembler>(
        &self,
        assembler: &mut A,
        exchange: &Exchange,
        comm: &dyn Comm,
        state: &SolverState,
        params: &ParameterSet,
        ctx: &AssembleContext,
        gradient: &mut DVector<f64>,
        do_active: bool,
        do_discretized: bool,
    ) {
        let num_active = params.num_active();
        let a = state.owned_adjoint(exchange);
        if do_active && num_active > 0 {
            exchange.map.check_element_width(num_active);
            let mut call_ctx = *ctx;
            call_ctx.seed = SeedMode::ActiveParams;
            call_ctx.num_active_params = num_active;
            let system = assembler.assemble_jac_res(state, params, &call_ctx);
            assert_eq!(
                system.residual.ncols(),
                num_active,
                "seeded assembly must return one residual column per active parameter"
            );
            let mut res_owned = DMatrix::zeros(exchange.map.num_owned(), num_active);
            exchange.export_add_mat(&system.residual, &mut res_owned);
            for p in 0..num_active {
                gradient[p] -= a.dot(&res_owned.column(p));
            }
        }
        if do_discretized && !params.discretized.is_empty() {
            let mut call_ctx = *ctx;
            call_ctx.seed = SeedMode::DiscretizedParams;
            call_ctx.num_active_params = num_active;
            let system = assembler.assemble_jac_res(state, params, &call_ctx);
            let pmap = assembler
                .param_map()
                .expect("discretized parameters require a param map");
            assert_eq!(
                pmap.num_owned(),
                params.num_discretized_dofs(),
                "param map does not match the discretized parameter layout"
            );
            let smap = &exchange.map;
            for t in system.jacobian.iter() {
                let rgid = pmap.overlapped[t.row];
                let cgid = smap.overlapped[t.col];
                if let (Some(r), Some(c)) = (pmap.owned_local(rgid), smap.owned_local(cgid)) {
                    gradient[num_active + r] -= t.val * a[c];
                }
            }
        }
        // direct objective partials at this state
        let (_value, direct) = compute_objective(assembler, comm, state, params, ctx);
        if do_active {
            for p in 0..num_active {
                gradient[p] += direct[p];
            }
        }
        if do_discretized {
            for i in num_active..direct.len() {
                gradient[i] += direct[i];
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
    use crate::Utils::settings::{LinearMethod, SolverMode};
    use crate::linalg::dof_map::{DofMap, SerialComm};
    use crate::numerical::assembly::AssembledSystem;
    use crate::numerical::nonlinear::NonlinearSolver;
    use crate::numerical::objective::ObjectiveRecord;
    use crate::numerical::params::{ParameterClass, RegularizationSettings};
    use crate::numerical::transient::TransientDriver;
    use approx::assert_relative_eq;
    use faer::sparse::Triplet;

    #[test]
    fn test_pair_indices() {
        let pairs: Vec<(usize, usize)> = (0..3).map(|k| pair_indices(k, 3)).collect();
        assert_eq!(pairs, vec![(1, 3), (2, 2), (3, 1)]);
    }

    /////////////////////////////////////////////////////////////////////////////////////////
    // steady chain with an active scalar parameter: R_i = u_i - p,
    // objective 0.5 ||u||^2, so dJ/dp = 2 p
    /////////////////////////////////////////////////////////////////////////////////////////

    struct UniformSource {
        map: DofMap,
    }

    impl Assembler for UniformSource {
        fn solution_map(&self) -> &DofMap {
            &self.map
        }
        fn assemble_jac_res(
            &mut self,
            state: &SolverState,
            params: &ParameterSet,
            ctx: &AssembleContext,
        ) -> AssembledSystem {
            let n = self.map.num_overlapped();
            if ctx.seed == SeedMode::ActiveParams {
                return AssembledSystem::residual_only(DMatrix::from_element(n, 1, -1.0));
            }
            let p = params.get_params(ParameterClass::Active)[0];
            let mut jacobian = Vec::new();
            if ctx.seed == SeedMode::Solution {
                for i in 0..n {
                    jacobian.push(Triplet::new(i, i, 1.0));
                }
            }
            let residual = if ctx.is_adjoint {
                DMatrix::from_fn(n, 1, |i, _| state.phi[i] - state.u[i])
            } else {
                DMatrix::from_fn(n, 1, |i, _| state.u[i] - p)
            };
            AssembledSystem { residual, jacobian }
        }
        fn objective(
            &mut self,
            state: &SolverState,
            params: &ParameterSet,
            _ctx: &AssembleContext,
        ) -> ObjectiveRecord {
            let mut record = ObjectiveRecord::empty(params.num_active());
            record.value = 0.5 * state.u.norm_squared();
            record
        }
    }

    fn steady_settings() -> SolverSettings {
        let mut settings = SolverSettings::new();
        settings.mode = SolverMode::Steady;
        settings.nonlinear_tol = 1e-12;
        settings.linear_method = LinearMethod::Lu;
        settings
    }

    #[test]
    fn test_steady_active_gradient_matches_fd() {
        let p0 = 1.3;
        let run = |p: f64| -> (f64, DVector<f64>, Trajectory, Trajectory) {
            let mut assembler = UniformSource {
                map: DofMap::serial(2),
            };
            let exchange = Exchange::new(assembler.map.clone());
            let mut params = ParameterSet::new();
            params.add_scalar("source", p, ParameterClass::Active, -10.0, 10.0);
            let settings = steady_settings();
            let mut nonlinear = NonlinearSolver::new(&settings);
            let mut driver = TransientDriver::new(settings.clone());
            let mut state = SolverState::new(&assembler.map);
            let (ftraj, obj) = driver.forward_model(
                &mut assembler,
                &mut nonlinear,
                &exchange,
                &SerialComm,
                &mut state,
                &params,
                true,
                None,
                None,
            );
            let engine = SensitivityEngine::new(settings);
            let (atraj, grad) = driver.adjoint_model(
                &mut assembler,
                &mut nonlinear,
                &engine,
                &exchange,
                &SerialComm,
                &mut state,
                &params,
                &ftraj,
                None,
            );
            (obj, grad, ftraj, atraj)
        };
        let (obj, grad, _, _) = run(p0);
        assert_relative_eq!(obj, p0 * p0, max_relative = 1e-10);
        assert_relative_eq!(grad[0], 2.0 * p0, max_relative = 1e-10);
        let h = 1e-6;
        let (obj_plus, _, _, _) = run(p0 + h);
        let (obj_minus, _, _, _) = run(p0 - h);
        assert_relative_eq!(grad[0], (obj_plus - obj_minus) / (2.0 * h), max_relative = 1e-5);
    }

    #[test]
    fn test_steady_trajectory_driver_matches_inline_accumulation() {
        let p0 = 0.7;
        let mut assembler = UniformSource {
            map: DofMap::serial(2),
        };
        let exchange = Exchange::new(assembler.map.clone());
        let mut params = ParameterSet::new();
        params.add_scalar("source", p0, ParameterClass::Active, -10.0, 10.0);
        let settings = steady_settings();
        let mut nonlinear = NonlinearSolver::new(&settings);
        let mut driver = TransientDriver::new(settings.clone());
        let mut state = SolverState::new(&assembler.map);
        let (ftraj, _) = driver.forward_model(
            &mut assembler,
            &mut nonlinear,
            &exchange,
            &SerialComm,
            &mut state,
            &params,
            false,
            None,
            None,
        );
        let engine = SensitivityEngine::new(settings);
        let (atraj, grad) = driver.adjoint_model(
            &mut assembler,
            &mut nonlinear,
            &engine,
            &exchange,
            &SerialComm,
            &mut state,
            &params,
            &ftraj,
            None,
        );
        let grad2 = engine.compute_sensitivities(
            &mut assembler,
            &exchange,
            &SerialComm,
            &mut state,
            &params,
            &ftraj,
            &atraj,
        );
        assert_relative_eq!(grad[0], grad2[0], max_relative = 1e-12);
    }

    /////////////////////////////////////////////////////////////////////////////////////////
    // steady chain with a discretized field: R = u - B p,
    // objective 0.5 ||u||^2, so grad = B^T B p
    /////////////////////////////////////////////////////////////////////////////////////////

    struct FieldDriven {
        map: DofMap,
        pmap: DofMap,
        b: DMatrix<f64>,
    }

    impl Assembler for FieldDriven {
        fn solution_map(&self) -> &DofMap {
            &self.map
        }
        fn param_map(&self) -> Option<&DofMap> {
            Some(&self.pmap)
        }
        fn assemble_jac_res(
            &mut self,
            state: &SolverState,
            params: &ParameterSet,
            ctx: &AssembleContext,
        ) -> AssembledSystem {
            let n = self.map.num_overlapped();
            if ctx.seed == SeedMode::DiscretizedParams {
                let mut jacobian = Vec::new();
                for r in 0..self.pmap.num_overlapped() {
                    for c in 0..n {
                        jacobian.push(Triplet::new(r, c, -self.b[(c, r)]));
                    }
                }
                return AssembledSystem {
                    residual: DMatrix::zeros(n, 1),
                    jacobian,
                };
            }
            let mut jacobian = Vec::new();
            if ctx.seed == SeedMode::Solution {
                for i in 0..n {
                    jacobian.push(Triplet::new(i, i, 1.0));
                }
            }
            let residual = if ctx.is_adjoint {
                DMatrix::from_fn(n, 1, |i, _| state.phi[i] - state.u[i])
            } else {
                let bp = &self.b * &params.discretized[0].values;
                DMatrix::from_fn(n, 1, |i, _| state.u[i] - bp[i])
            };
            AssembledSystem { residual, jacobian }
        }
        fn objective(
            &mut self,
            state: &SolverState,
            params: &ParameterSet,
            _ctx: &AssembleContext,
        ) -> ObjectiveRecord {
            let mut record = ObjectiveRecord::empty(params.num_active());
            record.value = 0.5 * state.u.norm_squared();
            record
        }
    }

    #[test]
    fn test_steady_discretized_gradient() {
        let b = DMatrix::from_row_slice(2, 2, &[1.0, 0.5, 0.0, 1.0]);
        let p = DVector::from_vec(vec![0.4, -0.2]);
        let mut assembler = FieldDriven {
            map: DofMap::serial(2),
            pmap: DofMap::serial(2),
            b: b.clone(),
        };
        let exchange = Exchange::new(assembler.map.clone());
        let mut params = ParameterSet::new();
        params.add_discretized(
            "field",
            DofMap::serial(2),
            p.clone(),
            RegularizationSettings::none(),
            vec![],
        );
        let settings = steady_settings();
        let mut nonlinear = NonlinearSolver::new(&settings);
        let mut driver = TransientDriver::new(settings.clone());
        let mut state = SolverState::new(&assembler.map);
        let (ftraj, _) = driver.forward_model(
            &mut assembler,
            &mut nonlinear,
            &exchange,
            &SerialComm,
            &mut state,
            &params,
            false,
            None,
            None,
        );
        let engine = SensitivityEngine::new(settings);
        let (_, grad) = driver.adjoint_model(
            &mut assembler,
            &mut nonlinear,
            &engine,
            &exchange,
            &SerialComm,
            &mut state,
            &params,
            &ftraj,
            None,
        );
        let expected = b.transpose() * &b * &p;
        assert_relative_eq!(grad[0], expected[0], max_relative = 1e-10);
        assert_relative_eq!(grad[1], expected[1], max_relative = 1e-10);
    }

    /////////////////////////////////////////////////////////////////////////////////////////
    // transient chain: R = u_dot + u - p, objective 0.5 u(T)^2; the
    // backward-in-time coupling enters through the driver-filled
    // adj_coupling vector (M = 1 here)
    /////////////////////////////////////////////////////////////////////////////////////////

    struct DecayToSource {
        map: DofMap,
    }

    impl Assembler for DecayToSource {
        fn solution_map(&self) -> &DofMap {
            &self.map
        }
        fn assemble_jac_res(
            &mut self,
            state: &SolverState,
            params: &ParameterSet,
            ctx: &AssembleContext,
        ) -> AssembledSystem {
            if ctx.seed == SeedMode::ActiveParams {
                return AssembledSystem::residual_only(DMatrix::from_element(1, 1, -1.0));
            }
            let mut jacobian = Vec::new();
            if ctx.seed == SeedMode::Solution {
                jacobian.push(Triplet::new(0, 0, ctx.alpha + 1.0));
            }
            let residual = if ctx.is_adjoint {
                let dj_du = if ctx.is_final_time { state.u[0] } else { 0.0 };
                DMatrix::from_element(
                    1,
                    1,
                    (ctx.alpha + 1.0) * state.phi[0] - dj_du - state.adj_coupling[0],
                )
            } else {
                let p = params.get_params(ParameterClass::Active)[0];
                DMatrix::from_element(1, 1, state.u_dot[0] + state.u[0] - p)
            };
            AssembledSystem { residual, jacobian }
        }
        fn objective(
            &mut self,
            state: &SolverState,
            params: &ParameterSet,
            ctx: &AssembleContext,
        ) -> ObjectiveRecord {
            let mut record = ObjectiveRecord::empty(params.num_active());
            if ctx.is_final_time {
                record.value = 0.5 * state.u[0] * state.u[0];
            }
            record
        }
    }

    fn transient_run(
        p: f64,
        num_steps: usize,
        time_order: usize,
    ) -> (f64, DVector<f64>, Trajectory, Trajectory) {
        let mut assembler = DecayToSource {
            map: DofMap::serial(1),
        };
        let exchange = Exchange::new(assembler.map.clone());
        let mut params = ParameterSet::new();
        params.add_scalar("source", p, ParameterClass::Active, -10.0, 10.0);
        let mut settings = SolverSettings::new();
        settings.mode = SolverMode::Transient;
        settings.num_steps = num_steps;
        settings.time_order = time_order;
        settings.nonlinear_tol = 1e-13;
        settings.linear_method = LinearMethod::Lu;
        let mut nonlinear = NonlinearSolver::new(&settings);
        let mut driver = TransientDriver::new(settings.clone());
        let mut state = SolverState::new(&assembler.map);
        let (ftraj, obj) = driver.forward_model(
            &mut assembler,
            &mut nonlinear,
            &exchange,
            &SerialComm,
            &mut state,
            &params,
            true,
            None,
            None,
        );
        let engine = SensitivityEngine::new(settings);
        let (atraj, grad) = driver.adjoint_model(
            &mut assembler,
            &mut nonlinear,
            &engine,
            &exchange,
            &SerialComm,
            &mut state,
            &params,
            &ftraj,
            None,
        );
        (obj, grad, ftraj, atraj)
    }

    #[test]
    fn test_transient_gradient_matches_fd() {
        let p0 = 2.0;
        let (_, grad, _, _) = transient_run(p0, 4, 1);
        let h = 1e-6;
        let (obj_plus, _, _, _) = transient_run(p0 + h, 4, 1);
        let (obj_minus, _, _, _) = transient_run(p0 - h, 4, 1);
        let fd = (obj_plus - obj_minus) / (2.0 * h);
        assert_relative_eq!(grad[0], fd, max_relative = 1e-6);
    }

    #[test]
    fn test_bdf2_transient_gradient_matches_fd() {
        // the order-2 adjoint reaches back two steps through the coupling
        // vector; its gradient must still match the forward objective
        let p0 = 2.0;
        let (_, grad, _, _) = transient_run(p0, 4, 2);
        let h = 1e-6;
        let (obj_plus, _, _, _) = transient_run(p0 + h, 4, 2);
        let (obj_minus, _, _, _) = transient_run(p0 - h, 4, 2);
        let fd = (obj_plus - obj_minus) / (2.0 * h);
        assert_relative_eq!(grad[0], fd, max_relative = 1e-6);
    }

    #[test]
    fn test_transient_trajectory_shapes_and_error_estimate() {
        let (_, _, ftraj, atraj) = transient_run(1.0, 3, 1);
        assert_eq!(ftraj.num_columns(), 4);
        assert_eq!(atraj.num_columns(), 4);
        // converged forward states satisfy the step equations exactly, so
        // the adjoint-weighted residual estimate is zero
        let mut assembler = DecayToSource {
            map: DofMap::serial(1),
        };
        let exchange = Exchange::new(assembler.map.clone());
        let mut settings = SolverSettings::new();
        settings.mode = SolverMode::Transient;
        settings.num_steps = 3;
        let driver = TransientDriver::new(settings);
        let mut params = ParameterSet::new();
        params.add_scalar("source", 1.0, ParameterClass::Active, -10.0, 10.0);
        let mut state = SolverState::new(&assembler.map);
        let err = driver.error_estimate(
            &mut assembler,
            &exchange,
            &SerialComm,
            &mut state,
            &params,
            &ftraj,
            &atraj,
        );
        assert!(err.abs() < 1e-10);
    }

    #[test]
    #[should_panic(expected = "derivative seed capacity")]
    fn test_active_seed_capacity_is_enforced() {
        use crate::linalg::dof_map::MAX_SEED_DIRECTIONS;
        let mut assembler = UniformSource {
            map: DofMap::serial(2),
        };
        let exchange = Exchange::new(assembler.map.clone());
        let mut params = ParameterSet::new();
        for k in 0..MAX_SEED_DIRECTIONS + 1 {
            params.add_scalar(&format!("p{}", k), 0.0, ParameterClass::Active, -1.0, 1.0);
        }
        let state = SolverState::new(&assembler.map);
        let engine = SensitivityEngine::new(steady_settings());
        let mut gradient = DVector::zeros(params.gradient_len());
        let ctx = AssembleContext::steady(1.0).adjoint();
        engine.accumulate_step(
            &mut assembler,
            &exchange,
            &SerialComm,
            &state,
            &params,
            &ctx,
            &mut gradient,
        );
    }

    #[test]
    fn test_dump_gradient_csv() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sens.csv");
        let mut params = ParameterSet::new();
        params.add_scalar("kappa", 1.0, ParameterClass::Active, 0.0, 2.0);
        let settings = SolverSettings::new();
        let engine = SensitivityEngine::new(settings);
        let grad = DVector::from_vec(vec![0.25]);
        engine
            .dump_gradient(&grad, &params, path.to_str().unwrap())
            .unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("kappa,0.25"));
    }
}
