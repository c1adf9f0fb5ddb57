use crate::Utils::settings::{SolverMode, SolverSettings};
use crate::linalg::dof_map::{Comm, Exchange};
use crate::linalg::state_vector::SolverState;
use crate::numerical::assembly::{AssembleContext, Assembler, SeedMode};
use crate::numerical::nonlinear::NonlinearSolver;
use crate::numerical::objective::{add_regularization, compute_objective};
use crate::numerical::params::ParameterSet;
use crate::numerical::sensitivity::SensitivityEngine;
use crate::numerical::trajectory::Trajectory;
use log::{info, warn};
use nalgebra::DVector;

/////////////////////////////////////////////////////////////////////////////////////////////
//                HOOKS
/////////////////////////////////////////////////////////////////////////////////////////////

/// per-step cost readout for the multiscale load-balance diagnostic
pub trait CostReporter {
    fn local_cost(&mut self) -> f64;
}

/// callback invoked after every stored forward step, e.g. to trigger a
/// remesh of the external mesh; receives the owned solution and the step
pub type RemeshHook<'a> = &'a mut dyn FnMut(&DVector<f64>, usize);

/////////////////////////////////////////////////////////////////////////////////////////////
//                BDF RECONSTRUCTION
/////////////////////////////////////////////////////////////////////////////////////////////

/// time derivative weight of the implicit step: 1/dt for BDF-1, 1.5/dt for
/// BDF-2 (which falls back to BDF-1 on the first step)
pub fn bdf_alpha(time_order: usize, step: usize, dt: f64) -> f64 {
    if time_order == 2 && step > 0 {
        1.5 / dt
    } else {
        1.0 / dt
    }
}

/// rebuild the overlapped u_dot of forward step `step` from the current
/// overlapped u and the stored history columns
pub fn bdf_u_dot(
    exchange: &Exchange,
    forward: &Trajectory,
    step: usize,
    time_order: usize,
    alpha: f64,
    u_over: &DVector<f64>,
) -> DVector<f64> {
    let n_over = exchange.map.num_overlapped();
    let mut prev_over = DVector::zeros(n_over);
    exchange.import(&forward.column(step), &mut prev_over);
    if time_order == 2 && step > 0 {
        let mut prev2_over = DVector::zeros(n_over);
        exchange.import(&forward.column(step - 1), &mut prev2_over);
        alpha * u_over - alpha * (4.0 / 3.0) * prev_over + alpha * (1.0 / 3.0) * prev2_over
    } else {
        alpha * (u_over - prev_over)
    }
}

/////////////////////////////////////////////////////////////////////////////////////////////
//                TRANSIENT DRIVER
/////////////////////////////////////////////////////////////////////////////////////////////

pub struct TransientDriver {
    pub settings: SolverSettings,
    pub status: String,
    pub solve_times: Vec<f64>,
}

impl TransientDriver {
    pub fn new(settings: SolverSettings) -> TransientDriver {
        settings.validate();
        TransientDriver {
            settings,
            status: "created".to_string(),
            solve_times: Vec::new(),
        }
    }

    /// forward solve: a single Newton solve in steady mode, a BDF march in
    /// transient mode. Returns the forward trajectory and the accumulated
    /// objective value (0.0 when compute_objective_value is false).
    pub fn forward_model<A: Assembler>(
        &mut self,
        assembler: &mut A,
        nonlinear: &mut NonlinearSolver,
        exchange: &Exchange,
        comm: &dyn Comm,
        state: &mut SolverState,
        params: &ParameterSet,
        compute_objective_value: bool,
        mut cost_reporter: Option<&mut dyn CostReporter>,
        mut remesh: Option<RemeshHook>,
    ) -> (Trajectory, f64) {
        self.status = "running".to_string();
        self.solve_times.clear();
        let n_owned = exchange.map.num_owned();
        let mut objective = 0.0;
        let mut obj_gradient = DVector::zeros(params.gradient_len());
        if self.settings.mode == SolverMode::Steady {
            let ctx = AssembleContext::steady(self.settings.final_time);
            let status = nonlinear.solve(assembler, exchange, comm, state, params, &ctx);
            if !status.converged {
                warn!("steady forward solve did not converge");
            }
            let mut trajectory = Trajectory::steady(n_owned, self.settings.final_time);
            trajectory.set_column(0, &state.owned_solution(exchange));
            self.solve_times.push(self.settings.final_time);
            if compute_objective_value {
                let (val, _) = compute_objective(assembler, comm, state, params, &ctx);
                objective += val;
            }
            self.status = "finished".to_string();
            if compute_objective_value {
                add_regularization(params, &mut objective, &mut obj_gradient);
            }
            return (trajectory, objective);
        }
        let num_steps = self.settings.num_steps;
        let dt = self.settings.delta_t();
        let mut trajectory = Trajectory::forward(n_owned, num_steps, self.settings.final_time);
        trajectory.set_column(0, &state.owned_solution(exchange));
        let mut current_time = 0.0;
        for step in 0..num_steps {
            current_time += dt;
            let alpha = bdf_alpha(self.settings.time_order, step, dt);
            state.u_dot = bdf_u_dot(
                exchange,
                &trajectory,
                step,
                self.settings.time_order,
                alpha,
                &state.u,
            );
            let ctx = AssembleContext::transient(current_time, alpha, step + 1 == num_steps);
            let status = nonlinear.solve(assembler, exchange, comm, state, params, &ctx);
            if !status.converged {
                warn!(
                    "transient step {} at time {} did not converge (scaled norm = {:e})",
                    step + 1,
                    current_time,
                    status.final_norm
                );
            }
            let owned = state.owned_solution(exchange);
            trajectory.set_column(step + 1, &owned);
            self.solve_times.push(current_time);
            if compute_objective_value {
                let (val, _) = compute_objective(assembler, comm, state, params, &ctx);
                objective += val;
            }
            if let Some(reporter) = cost_reporter.as_deref_mut() {
                self.report_load_balance(reporter, comm, current_time);
            }
            if let Some(hook) = remesh.as_deref_mut() {
                hook(&owned, step + 1);
            }
        }
        if compute_objective_value {
            add_regularization(params, &mut objective, &mut obj_gradient);
        }
        self.status = "finished".to_string();
        (trajectory, objective)
    }

    /// adjoint solve: marches from the final time down to zero, loading
    /// the paired forward state at every step, filling the backward time
    /// coupling from the already computed adjoint columns and accumulating
    /// the parameter gradient. Returns the adjoint trajectory and the
    /// reduced gradient.
    pub fn adjoint_model<A: Assembler>(
        &mut self,
        assembler: &mut A,
        nonlinear: &mut NonlinearSolver,
        sensitivity: &SensitivityEngine,
        exchange: &Exchange,
        comm: &dyn Comm,
        state: &mut SolverState,
        params: &ParameterSet,
        forward: &Trajectory,
        mut cost_reporter: Option<&mut dyn CostReporter>,
    ) -> (Trajectory, DVector<f64>) {
        self.status = "running".to_string();
        let n_owned = exchange.map.num_owned();
        let mut gradient = DVector::zeros(params.gradient_len());
        state.phi.fill(0.0);
        state.adj_coupling.fill(0.0);
        if self.settings.mode == SolverMode::Steady {
            let ctx = AssembleContext::steady(self.settings.final_time).adjoint();
            let mut u_over = DVector::zeros(exchange.map.num_overlapped());
            exchange.import(&forward.column(forward.num_columns() - 1), &mut u_over);
            state.u = u_over;
            state.phi_dot.fill(0.0);
            let status = nonlinear.solve(assembler, exchange, comm, state, params, &ctx);
            if !status.converged {
                warn!("steady adjoint solve did not converge");
            }
            let mut adjoint = Trajectory::steady(n_owned, self.settings.final_time);
            adjoint.set_column(0, &state.owned_adjoint(exchange));
            sensitivity.accumulate_step(assembler, exchange, comm, state, params, &ctx, &mut gradient);
            let mut obj_value = 0.0;
            add_regularization(params, &mut obj_value, &mut gradient);
            self.status = "finished".to_string();
            return (adjoint, comm.sum_vec(&gradient));
        }
        let num_steps = self.settings.num_steps;
        assert_eq!(
            forward.num_steps(),
            num_steps,
            "forward trajectory does not match the configured step count"
        );
        let dt = self.settings.delta_t();
        let mut adjoint = Trajectory::adjoint(n_owned, num_steps, self.settings.final_time);
        let mut current_time = self.settings.final_time;
        for step in 0..num_steps {
            // forward column paired with this adjoint step
            let fcol = num_steps - step;
            let fstep = fcol - 1;
            let mut u_over = DVector::zeros(exchange.map.num_overlapped());
            exchange.import(&forward.column(fcol), &mut u_over);
            state.u = u_over;
            let alpha = bdf_alpha(self.settings.time_order, fstep, dt);
            state.u_dot = bdf_u_dot(
                exchange,
                forward,
                fstep,
                self.settings.time_order,
                alpha,
                &state.u,
            );
            state.phi_dot.fill(0.0);
            self.fill_adjoint_coupling(exchange, &adjoint, step, fcol, dt, state);
            let ctx = AssembleContext::transient(current_time, alpha, step == 0).adjoint();
            let status = nonlinear.solve(assembler, exchange, comm, state, params, &ctx);
            if !status.converged {
                warn!(
                    "adjoint step {} at time {} did not converge (scaled norm = {:e})",
                    step + 1,
                    current_time,
                    status.final_norm
                );
            }
            adjoint.set_column(step + 1, &state.owned_adjoint(exchange));
            sensitivity.accumulate_step(assembler, exchange, comm, state, params, &ctx, &mut gradient);
            if let Some(reporter) = cost_reporter.as_deref_mut() {
                self.report_load_balance(reporter, comm, current_time);
            }
            current_time -= dt;
        }
        let mut obj_value = 0.0;
        add_regularization(params, &mut obj_value, &mut gradient);
        self.status = "finished".to_string();
        (adjoint, comm.sum_vec(&gradient))
    }

    /// backward time coupling of adjoint step `step` (forward column
    /// `fcol`): the later forward steps reach back to u_fcol through their
    /// BDF stencils, so their adjoint states enter the current solve as
    /// w1 * phi_{k+1} (BDF-1: w1 = alpha; BDF-2: w1 = (4/3) alpha) minus
    /// (1/3) alpha * phi_{k+2} for BDF-2
    fn fill_adjoint_coupling(
        &self,
        exchange: &Exchange,
        adjoint: &Trajectory,
        step: usize,
        fcol: usize,
        dt: f64,
        state: &mut SolverState,
    ) {
        if step == 0 {
            state.adj_coupling.fill(0.0);
            return;
        }
        let a_next = bdf_alpha(self.settings.time_order, fcol, dt);
        let w1 = if self.settings.time_order == 2 {
            (4.0 / 3.0) * a_next
        } else {
            a_next
        };
        let mut coupling_owned = w1 * adjoint.column(step);
        if self.settings.time_order == 2 && step >= 2 {
            let a_next2 = bdf_alpha(self.settings.time_order, fcol + 1, dt);
            coupling_owned -= (1.0 / 3.0) * a_next2 * adjoint.column(step - 1);
        }
        exchange.import(&coupling_owned, &mut state.adj_coupling);
    }

    /// adjoint-weighted residual estimate of the discretization error over
    /// a forward/adjoint trajectory pair
    pub fn error_estimate<A: Assembler>(
        &self,
        assembler: &mut A,
        exchange: &Exchange,
        comm: &dyn Comm,
        state: &mut SolverState,
        params: &ParameterSet,
        forward: &Trajectory,
        adjoint: &Trajectory,
    ) -> f64 {
        let num_steps = forward.num_steps();
        let dt = self.settings.delta_t();
        let mut res_owned = DVector::zeros(exchange.map.num_owned());
        let mut error = 0.0;
        for step in 0..num_steps.max(1) {
            let fcol = if num_steps == 0 { 0 } else { step + 1 };
            let acol = if num_steps == 0 { 0 } else { num_steps - step };
            let mut u_over = DVector::zeros(exchange.map.num_overlapped());
            exchange.import(&forward.column(fcol), &mut u_over);
            state.u = u_over;
            let ctx = if num_steps == 0 {
                let mut c = AssembleContext::steady(self.settings.final_time);
                c.seed = SeedMode::None;
                state.u_dot.fill(0.0);
                c
            } else {
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
                let mut c =
                    AssembleContext::transient(forward.times[fcol], alpha, fcol == num_steps);
                c.seed = SeedMode::None;
                c
            };
            let system = assembler.assemble_jac_res(state, params, &ctx);
            let res_over = system.residual.column(0).into_owned();
            exchange.export_add(&res_over, &mut res_owned);
            error += adjoint.column(acol).dot(&res_owned);
        }
        comm.sum(error)
    }

    fn report_load_balance(&self, reporter: &mut dyn CostReporter, comm: &dyn Comm, time: f64) {
        let local = reporter.local_cost();
        let min = comm.min(local);
        let max = comm.max(local);
        let factor = if min > 0.0 { max / min } else { 1.0 };
        info!(
            "multiscale load balance at time {}: local cost = {}, factor = {}",
            time, local, factor
        );
    }
}
