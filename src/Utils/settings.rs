use std::str::FromStr;
use strum_macros::{Display, EnumString};

/////////////////////////////////////////////////////////////////////////////////////////////
//                SOLVER OPTION ENUMS
/////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString, Display)]
pub enum SolverMode {
    #[strum(serialize = "steady-state", serialize = "steady")]
    Steady,
    #[strum(serialize = "transient")]
    Transient,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString, Display)]
pub enum NonlinearMethod {
    #[strum(serialize = "newton", serialize = "Newton")]
    Newton,
    /// Anderson-accelerated fixed point: the Jacobian is assembled once and
    /// reused on later iterations
    #[strum(serialize = "AA", serialize = "anderson")]
    AndersonAccelerated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString, Display)]
pub enum LinearMethod {
    #[strum(serialize = "lu")]
    Lu,
    #[strum(serialize = "sparse_lu", serialize = "klu")]
    SparseLu,
    #[strum(serialize = "gmres")]
    Gmres,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString, Display)]
pub enum RegularizationType {
    #[strum(serialize = "none")]
    None,
    #[strum(serialize = "L2", serialize = "l2")]
    L2,
    #[strum(serialize = "H1", serialize = "h1")]
    H1,
}

/////////////////////////////////////////////////////////////////////////////////////////////
//                SOLVER SETTINGS
/////////////////////////////////////////////////////////////////////////////////////////////

/// all tunables of the solution workflow with their defaults
#[derive(Debug, Clone)]
pub struct SolverSettings {
    pub mode: SolverMode,
    pub nonlinear_method: NonlinearMethod,
    pub linear_method: LinearMethod,
    pub nonlinear_tol: f64,      // tolerance on the scaled residual norm
    pub max_nonlinear_iters: usize,
    pub linear_tol: f64,
    pub max_linear_iters: usize,
    pub final_time: f64,
    pub num_steps: usize,
    pub time_order: usize,       // 1 or 2 (BDF order)
    pub use_strong_dirichlet: bool,
    pub verbosity: usize,
    pub loglevel: Option<String>,
}

impl SolverSettings {
    pub fn new() -> SolverSettings {
        SolverSettings {
            mode: SolverMode::Steady,
            nonlinear_method: NonlinearMethod::Newton,
            linear_method: LinearMethod::SparseLu,
            nonlinear_tol: 1e-6,
            max_nonlinear_iters: 10,
            linear_tol: 1e-7,
            max_linear_iters: 100,
            final_time: 1.0,
            num_steps: 1,
            time_order: 1,
            use_strong_dirichlet: true,
            verbosity: 0,
            loglevel: Some("info".to_string()),
        }
    }

    /// read settings from a TOML document; keys absent in the document keep
    /// their defaults
    pub fn from_toml_str(content: &str) -> Result<SolverSettings, Box<dyn std::error::Error>> {
        let table: toml::Table = toml::from_str(content)?;
        let mut settings = SolverSettings::new();
        let solver = match table.get("solver") {
            Some(v) => v,
            None => {
                settings.validate();
                return Ok(settings);
            }
        };
        if let Some(v) = solver.get("mode").and_then(|v| v.as_str()) {
            settings.mode = SolverMode::from_str(v)?;
        }
        if let Some(v) = solver.get("nonlinear_method").and_then(|v| v.as_str()) {
            settings.nonlinear_method = NonlinearMethod::from_str(v)?;
        }
        if let Some(v) = solver.get("linear_method").and_then(|v| v.as_str()) {
            settings.linear_method = LinearMethod::from_str(v)?;
        }
        if let Some(v) = solver.get("nonlinear_tol").and_then(|v| v.as_float()) {
            settings.nonlinear_tol = v;
        }
        if let Some(v) = solver.get("max_nonlinear_iters").and_then(|v| v.as_integer()) {
            settings.max_nonlinear_iters = v as usize;
        }
        if let Some(v) = solver.get("linear_tol").and_then(|v| v.as_float()) {
            settings.linear_tol = v;
        }
        if let Some(v) = solver.get("max_linear_iters").and_then(|v| v.as_integer()) {
            settings.max_linear_iters = v as usize;
        }
        if let Some(v) = solver.get("final_time").and_then(|v| v.as_float()) {
            settings.final_time = v;
        }
        if let Some(v) = solver.get("num_steps").and_then(|v| v.as_integer()) {
            settings.num_steps = v as usize;
        }
        if let Some(v) = solver.get("time_order").and_then(|v| v.as_integer()) {
            settings.time_order = v as usize;
        }
        if let Some(v) = solver.get("use_strong_dirichlet").and_then(|v| v.as_bool()) {
            settings.use_strong_dirichlet = v;
        }
        if let Some(v) = solver.get("verbosity").and_then(|v| v.as_integer()) {
            settings.verbosity = v as usize;
        }
        if let Some(v) = solver.get("loglevel").and_then(|v| v.as_str()) {
            settings.loglevel = Some(v.to_string());
        }
        settings.validate();
        Ok(settings)
    }

    pub fn validate(&self) {
        assert!(
            self.nonlinear_tol >= 0.0,
            "Nonlinear tolerance should be a non-negative number."
        );
        assert!(
            self.max_nonlinear_iters > 0,
            "Max nonlinear iterations should be a positive number."
        );
        assert!(
            self.linear_tol >= 0.0,
            "Linear tolerance should be a non-negative number."
        );
        assert!(
            self.time_order == 1 || self.time_order == 2,
            "Time integration order must be 1 or 2."
        );
        assert!(self.num_steps > 0, "Number of time steps should be a positive number.");
        assert!(self.final_time > 0.0, "Final time should be a positive number.");
    }

    pub fn set_solver_params(
        &mut self,
        loglevel: Option<String>,
        linear_method: Option<String>,
        nonlinear_tol: Option<f64>,
    ) {
        self.loglevel = if let Some(level) = loglevel {
            assert!(
                level == "debug"
                    || level == "info"
                    || level == "warn"
                    || level == "error"
                    || level == "off"
                    || level == "none",
                "loglevel must be debug, info, warn, error or off"
            );
            Some(level)
        } else {
            self.loglevel.clone()
        };
        self.linear_method = if let Some(method) = linear_method {
            LinearMethod::from_str(&method.to_lowercase())
                .expect("linear_method must be lu, sparse_lu or gmres")
        } else {
            self.linear_method
        };
        self.nonlinear_tol = if let Some(tol) = nonlinear_tol {
            assert!(tol >= 0.0, "Tolerance should be a non-negative number.");
            tol
        } else {
            self.nonlinear_tol
        };
    }

    pub fn delta_t(&self) -> f64 {
        self.final_time / self.num_steps as f64
    }
}
