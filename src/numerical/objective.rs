use crate::Utils::settings::RegularizationType;
use crate::linalg::dof_map::Comm;
use crate::linalg::state_vector::SolverState;
use crate::numerical::assembly::{AssembleContext, Assembler};
use crate::numerical::params::{DiscretizedParam, ParameterSet};
use itertools::Itertools;
use nalgebra::DVector;

/////////////////////////////////////////////////////////////////////////////////////////////
//                OBJECTIVE RECORD
/////////////////////////////////////////////////////////////////////////////////////////////

/// one evaluation of the objective: the (local) value plus its direct
/// parameter partials, before any reduction
pub struct ObjectiveRecord {
    pub value: f64,
    /// d objective / d active parameter, length num_active
    pub active_partials: DVector<f64>,
    /// (discretized field index, owned-local dof, partial)
    pub discretized_partials: Vec<(usize, usize, f64)>,
}

impl ObjectiveRecord {
    pub fn empty(num_active: usize) -> ObjectiveRecord {
        ObjectiveRecord {
            value: 0.0,
            active_partials: DVector::zeros(num_active),
            discretized_partials: Vec::new(),
        }
    }
}

/////////////////////////////////////////////////////////////////////////////////////////////
//                EVALUATION
/////////////////////////////////////////////////////////////////////////////////////////////

/// evaluate the objective at the given state; returns the reduced value
/// and the direct gradient contribution in the gradient layout (active
/// scalars first, then discretized DOFs). Regularization is NOT included
/// here, it is added once per optimization evaluation by
/// add_regularization.
pub fn compute_objective<A: Assembler>(
    assembler: &mut A,
    comm: &dyn Comm,
    state: &SolverState,
    params: &ParameterSet,
    ctx: &AssembleContext,
) -> (f64, DVector<f64>) {
    let record = assembler.objective(state, params, ctx);
    let mut gradient = DVector::zeros(params.gradient_len());
    for p in 0..params.num_active() {
        gradient[p] += record.active_partials[p];
    }
    for &(field, lid, partial) in record.discretized_partials.iter() {
        gradient[params.discretized_offset(field) + lid] += partial;
    }
    (comm.sum(record.value), gradient)
}

/// regularization value and gradient of one discretized field, over the
/// whole field or its boundary subset
pub fn regularization_value_and_gradient(param: &DiscretizedParam) -> (f64, DVector<f64>) {
    let n = param.values.len();
    let mut gradient = DVector::zeros(n);
    let c = param.regularization.constant;
    let dofs: Vec<usize> = if param.regularization.boundary_only {
        param.boundary_dofs.clone()
    } else {
        (0..n).collect()
    };
    let mut value = 0.0;
    match param.regularization.reg_type {
        RegularizationType::None => {}
        RegularizationType::L2 => {
            for &i in dofs.iter() {
                value += 0.5 * c * param.values[i] * param.values[i];
                gradient[i] += c * param.values[i];
            }
        }
        RegularizationType::H1 => {
            // squared differences of consecutive DOFs in the subset
            for (&i, &j) in dofs.iter().tuple_windows() {
                let d = param.values[j] - param.values[i];
                value += 0.5 * c * d * d;
                gradient[j] += c * d;
                gradient[i] -= c * d;
            }
        }
    }
    (value, gradient)
}

/// add the regularization terms of every discretized field into an
/// objective value and a gradient-layout vector
pub fn add_regularization(params: &ParameterSet, value: &mut f64, gradient: &mut DVector<f64>) {
    assert_eq!(gradient.len(), params.gradient_len());
    for (i, param) in params.discretized.iter().enumerate() {
        let (rv, rg) = regularization_value_and_gradient(param);
        *value += rv;
        let offset = params.discretized_offset(i);
        for j in 0..rg.len() {
            gradient[offset + j] += rg[j];
        }
    }
}

/////////////////////////////////////////////////////////////////////////////////////////////
//                                     TESTS
/////////////////////////////////////////////////////////////////////////////////////////////
#[cfg(test)]
mod tests {
    use super::*;
    use crate::Utils::settings::RegularizationType;
    use crate::linalg::dof_map::DofMap;
    use crate::numerical::params::RegularizationSettings;
    use approx::assert_relative_eq;

    fn field(values: Vec<f64>, reg: RegularizationSettings, boundary: Vec<usize>) -> DiscretizedParam {
        let n = values.len();
        DiscretizedParam {
            name: "field".to_string(),
            map: DofMap::serial(n),
            values: DVector::from_vec(values),
            regularization: reg,
            boundary_dofs: boundary,
        }
    }

    #[test]
    fn test_l2_regularization() {
        let reg = RegularizationSettings {
            reg_type: RegularizationType::L2,
            constant: 2.0,
            boundary_only: false,
        };
        let p = field(vec![1.0, -2.0], reg, vec![]);
        let (v, g) = regularization_value_and_gradient(&p);
        assert_relative_eq!(v, 5.0, max_relative = 1e-14);
        assert_eq!(g, DVector::from_vec(vec![2.0, -4.0]));
    }

    #[test]
    fn test_h1_regularization_gradient_matches_fd() {
        let reg = RegularizationSettings {
            reg_type: RegularizationType::H1,
            constant: 1.5,
            boundary_only: false,
        };
        let base = vec![0.3, -0.1, 0.7];
        let p = field(base.clone(), reg.clone(), vec![]);
        let (_, g) = regularization_value_and_gradient(&p);
        let h = 1e-6;
        for i in 0..3 {
            let mut plus = base.clone();
            plus[i] += h;
            let mut minus = base.clone();
            minus[i] -= h;
            let (vp, _) = regularization_value_and_gradient(&field(plus, reg.clone(), vec![]));
            let (vm, _) = regularization_value_and_gradient(&field(minus, reg.clone(), vec![]));
            assert_relative_eq!(g[i], (vp - vm) / (2.0 * h), max_relative = 1e-5);
        }
    }

    #[test]
    fn test_boundary_restricted_regularization() {
        let reg = RegularizationSettings {
            reg_type: RegularizationType::L2,
            constant: 1.0,
            boundary_only: true,
        };
        let p = field(vec![1.0, 5.0, 2.0], reg, vec![0, 2]);
        let (v, g) = regularization_value_and_gradient(&p);
        // the interior dof does not contribute
        assert_relative_eq!(v, 2.5, max_relative = 1e-14);
        assert_eq!(g[1], 0.0);
        assert_eq!(g[2], 2.0);
    }
}
