use crate::numerical::trajectory::{TrajectoryError, TrajectoryStore};
use log::warn;
use nalgebra::{DMatrix, DVector};

/// residual floor below which a sub-grid start state counts as converged
const R0_FLOOR: f64 = 1.0e-14;
const TIME_MATCH_TOL: f64 = 1.0e-12;

/////////////////////////////////////////////////////////////////////////////////////////////
//                SUB-GRID ASSEMBLY SEAM
/////////////////////////////////////////////////////////////////////////////////////////////

/// local physics of one sub-grid problem. The model is dense and small:
/// residual R(u, u_dot; lambda) with Jacobian dR/du and mass dR/du_dot,
/// driven by the macro coupling value lambda, and condensed back to the
/// macro scale through the flux.
pub trait SubgridAssembler {
    fn num_dofs(&self) -> usize;

    /// width of the macro coupling: length of lambda and of the flux
    fn num_macro_dofs(&self) -> usize;

    fn num_active_params(&self) -> usize {
        0
    }

    /// residual, Jacobian dR/du and mass dR/du_dot at the given state
    fn assemble(
        &mut self,
        u: &DVector<f64>,
        u_dot: &DVector<f64>,
        lambda: &DVector<f64>,
        time: f64,
    ) -> (DVector<f64>, DMatrix<f64>, DMatrix<f64>);

    /// residual derivative columns with respect to the active parameters,
    /// num_dofs by num_active_params
    fn assemble_param_seeded(
        &mut self,
        _u: &DVector<f64>,
        _u_dot: &DVector<f64>,
        _lambda: &DVector<f64>,
        _time: f64,
    ) -> DMatrix<f64> {
        DMatrix::zeros(self.num_dofs(), self.num_active_params())
    }

    /// dR/dlambda, num_dofs by num_macro_dofs
    fn assemble_lambda_jac(
        &mut self,
        u: &DVector<f64>,
        u_dot: &DVector<f64>,
        lambda: &DVector<f64>,
        time: f64,
    ) -> DMatrix<f64>;

    /// right-hand side of the local adjoint problem, driven by the macro
    /// adjoint restricted to this element
    fn adjoint_source(
        &mut self,
        u: &DVector<f64>,
        lambda: &DVector<f64>,
        macro_phi: &DVector<f64>,
        time: f64,
    ) -> DVector<f64>;

    /// macro-scale flux of the current local state
    fn flux(&mut self, u: &DVector<f64>, lambda: &DVector<f64>, time: f64) -> DVector<f64>;

    fn flux_du(&mut self, u: &DVector<f64>, lambda: &DVector<f64>, time: f64) -> DMatrix<f64>;

    fn flux_dlambda(&mut self, u: &DVector<f64>, lambda: &DVector<f64>, time: f64)
    -> DMatrix<f64>;
}

/////////////////////////////////////////////////////////////////////////////////////////////
//                MACRO WORKSET
/////////////////////////////////////////////////////////////////////////////////////////////

/// flux contribution of one sub-grid solve to the macro element: the flux
/// itself and its total derivative with respect to lambda. An adjoint macro
/// assembly transposes the Jacobian block itself.
pub struct MacroWorkset {
    pub res: DVector<f64>,
    pub jac: DMatrix<f64>,
}

impl MacroWorkset {
    pub fn new(num_macro_dofs: usize) -> MacroWorkset {
        MacroWorkset {
            res: DVector::zeros(num_macro_dofs),
            jac: DMatrix::zeros(num_macro_dofs, num_macro_dofs),
        }
    }

    pub fn zero(&mut self) {
        self.res.fill(0.0);
        self.jac.fill(0.0);
    }
}

/////////////////////////////////////////////////////////////////////////////////////////////
//                SUB-GRID MODEL
/////////////////////////////////////////////////////////////////////////////////////////////

/// one registered sub-grid problem: the local assembler plus its own time
/// stepping and Newton policy. A macro time step is subcycled into
/// `time_steps` implicit Euler micro steps.
pub struct SubgridModel {
    pub assembler: Box<dyn SubgridAssembler + Send + Sync>,
    pub time_steps: usize,
    pub tolerance: f64,
    pub max_iterations: usize,
    pub final_time: f64,
    /// scaling applied to the incoming macro coupling value
    pub lambda_scale: f64,
}

impl SubgridModel {
    pub fn new(
        assembler: Box<dyn SubgridAssembler + Send + Sync>,
        time_steps: usize,
        final_time: f64,
    ) -> SubgridModel {
        assert!(time_steps > 0, "Number of time steps should be a positive number.");
        SubgridModel {
            assembler,
            time_steps,
            tolerance: 1e-6,
            max_iterations: 10,
            final_time,
            lambda_scale: 1.0,
        }
    }

    /// advance (or, in adjoint mode, retreat) the local problem over one
    /// macro step ending at `time`, condensing the flux into the workset.
    ///
    /// Forward mode stores the end state into `soln`; adjoint mode reads
    /// the forward states back, sweeps the local adjoint backwards through
    /// the micro steps, stores it into `adjsoln` and accumulates the local
    /// parameter gradient into `subgradient`. A missing snapshot is a hard
    /// error.
    pub fn solve(
        &mut self,
        key: usize,
        lambda: &DVector<f64>,
        macro_phi: &DVector<f64>,
        time: f64,
        macro_dt: f64,
        is_transient: bool,
        is_adjoint: bool,
        compute_jacobian: bool,
        compute_sens: bool,
        soln: &mut TrajectoryStore,
        adjsoln: &mut TrajectoryStore,
        workset: &mut MacroWorkset,
        subgradient: &mut DVector<f64>,
    ) -> Result<(), TrajectoryError> {
        let n = self.assembler.num_dofs();
        let m = self.assembler.num_macro_dofs();
        assert_eq!(lambda.len(), m, "coupling value does not match the macro width");
        subgradient.fill(0.0);
        let lam = lambda * self.lambda_scale;
        let at_final = (time - self.final_time).abs() < TIME_MATCH_TOL;

        if !is_transient {
            let u_start = soln.extract_last(key)?;
            let zero_dot = DVector::zeros(n);
            let u = if is_adjoint {
                // forward state of the steady pair was stored by the
                // forward pass
                soln.extract(key, time)?
            } else {
                self.micro_solve(&u_start, &zero_dot, &lam, time, 0.0)
            };
            let (_, jac, _) = self.assembler.assemble(&u, &zero_dot, &lam, time);
            let d_u = if compute_jacobian {
                let r_lam = self.assembler.assemble_lambda_jac(&u, &zero_dot, &lam, time);
                self.dense_solve_mat(&jac, &(-r_lam), time)
            } else {
                DMatrix::zeros(n, m)
            };
            self.update_flux(workset, &u, &lam, time, 1.0, &d_u, compute_jacobian);
            if is_adjoint {
                let rhs = self.assembler.adjoint_source(&u, &lam, macro_phi, time);
                let phi = self.dense_solve_vec(&jac.transpose(), &rhs, time);
                if compute_sens {
                    self.accumulate_sens(&u, &zero_dot, &lam, time, &phi, subgradient);
                }
                adjsoln.store(key, time, phi);
            } else {
                soln.store(key, time, u);
            }
            return Ok(());
        }

        // implicit Euler subcycle over the macro interval
        let micro_dt = macro_dt / self.time_steps as f64;
        let alpha = 1.0 / micro_dt;
        let fwt = 1.0 / self.time_steps as f64;
        let mut u_prev = soln.extract_previous(key, time)?;
        let mut states: Vec<(f64, DVector<f64>, DVector<f64>)> = Vec::new();
        for s in 0..self.time_steps {
            let t = time - macro_dt + (s + 1) as f64 * micro_dt;
            let u = self.micro_solve(&u_prev, &u_prev, &lam, t, alpha);
            states.push((t, u.clone(), u_prev.clone()));
            u_prev = u;
        }

        // flux condensation and the du/dlambda chain
        let mut d_u_prev = DMatrix::zeros(n, m);
        for (t, u, up) in states.iter() {
            let u_dot = alpha * (u - up);
            let (_, jac, mass) = self.assembler.assemble(u, &u_dot, &lam, *t);
            let a = &jac + alpha * &mass;
            let d_u = if compute_jacobian {
                let r_lam = self.assembler.assemble_lambda_jac(u, &u_dot, &lam, *t);
                let rhs = alpha * (&mass * &d_u_prev) - r_lam;
                self.dense_solve_mat(&a, &rhs, *t)
            } else {
                DMatrix::zeros(n, m)
            };
            self.update_flux(workset, u, &lam, *t, fwt, &d_u, compute_jacobian);
            d_u_prev = d_u;
        }

        if is_adjoint {
            let mut phi_next = if at_final {
                DVector::zeros(n)
            } else {
                adjsoln.extract_next(key, time)?
            };
            let mut phi = DVector::zeros(n);
            for (t, u, up) in states.iter().rev() {
                let u_dot = alpha * (u - up);
                let (_, jac, mass) = self.assembler.assemble(u, &u_dot, &lam, *t);
                let a = &jac + alpha * &mass;
                let rhs = self.assembler.adjoint_source(u, &lam, macro_phi, *t)
                    + alpha * (mass.transpose() * &phi_next);
                phi = self.dense_solve_vec(&a.transpose(), &rhs, *t);
                if compute_sens {
                    self.accumulate_sens(u, &u_dot, &lam, *t, &phi, subgradient);
                }
                phi_next = phi.clone();
            }
            adjsoln.store(key, time, phi);
        } else {
            let last = states.last().unwrap().1.clone();
            soln.store(key, time, last);
        }
        Ok(())
    }

    /// local Newton solve of R(u, alpha * (u - u_prev); lambda) = 0 with
    /// the same relative-residual policy as the macro solver; a stalled or
    /// singular iteration is logged and returns the last iterate
    fn micro_solve(
        &mut self,
        u_start: &DVector<f64>,
        u_prev: &DVector<f64>,
        lambda: &DVector<f64>,
        time: f64,
        alpha: f64,
    ) -> DVector<f64> {
        let mut u = u_start.clone();
        let mut r0 = 1.0;
        for iteration in 0..=self.max_iterations {
            let u_dot = alpha * (&u - u_prev);
            let (res, jac, mass) = self.assembler.assemble(&u, &u_dot, lambda, time);
            let resnorm = res.amax();
            let scaled = if iteration == 0 {
                r0 = resnorm;
                if r0 > R0_FLOOR { 1.0 } else { 0.0 }
            } else {
                resnorm / r0
            };
            if scaled < self.tolerance {
                return u;
            }
            if iteration == self.max_iterations {
                warn!(
                    "sub-grid solve at time {} stopped at scaled norm {:e} after {} iterations",
                    time, scaled, iteration
                );
                break;
            }
            let a = &jac + alpha * &mass;
            match a.lu().solve(&(-res)) {
                Some(du) => u += du,
                None => {
                    warn!("singular sub-grid Jacobian at time {}", time);
                    break;
                }
            }
        }
        u
    }

    fn update_flux(
        &mut self,
        workset: &mut MacroWorkset,
        u: &DVector<f64>,
        lambda: &DVector<f64>,
        time: f64,
        weight: f64,
        d_u: &DMatrix<f64>,
        compute_jacobian: bool,
    ) {
        workset.res += weight * self.assembler.flux(u, lambda, time);
        if compute_jacobian {
            let f_du = self.assembler.flux_du(u, lambda, time);
            let f_dlam = self.assembler.flux_dlambda(u, lambda, time);
            workset.jac += weight * self.lambda_scale * (f_dlam + f_du * d_u);
        }
    }

    fn accumulate_sens(
        &mut self,
        u: &DVector<f64>,
        u_dot: &DVector<f64>,
        lambda: &DVector<f64>,
        time: f64,
        phi: &DVector<f64>,
        subgradient: &mut DVector<f64>,
    ) {
        let num_active = self.assembler.num_active_params();
        if num_active == 0 {
            return;
        }
        assert_eq!(subgradient.len(), num_active);
        let res_p = self.assembler.assemble_param_seeded(u, u_dot, lambda, time);
        for p in 0..num_active {
            subgradient[p] -= phi.dot(&res_p.column(p).into_owned());
        }
    }

    fn dense_solve_vec(&self, a: &DMatrix<f64>, b: &DVector<f64>, time: f64) -> DVector<f64> {
        match a.clone().lu().solve(b) {
            Some(x) => x,
            None => {
                warn!("singular sub-grid system at time {}", time);
                DVector::zeros(b.len())
            }
        }
    }

    fn dense_solve_mat(&self, a: &DMatrix<f64>, b: &DMatrix<f64>, time: f64) -> DMatrix<f64> {
        match a.clone().lu().solve(b) {
            Some(x) => x,
            None => {
                warn!("singular sub-grid system at time {}", time);
                DMatrix::zeros(b.nrows(), b.ncols())
            }
        }
    }
}
