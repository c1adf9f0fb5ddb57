use crate::Utils::settings::RegularizationType;
use crate::linalg::dof_map::DofMap;
use csv::Writer;
use nalgebra::DVector;
use rand::Rng;
use std::fs::File;
use std::io;
use strum_macros::{Display, EnumString};

/////////////////////////////////////////////////////////////////////////////////////////////
//                PARAMETER CLASSES
/////////////////////////////////////////////////////////////////////////////////////////////

/// role of a parameter in the solve; only Active parameters enter the
/// gradient as scalars, Discretized parameters enter DOF by DOF
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumString, Display)]
pub enum ParameterClass {
    #[strum(serialize = "inactive")]
    Inactive,
    #[strum(serialize = "active")]
    Active,
    #[strum(serialize = "stochastic")]
    Stochastic,
    #[strum(serialize = "discrete")]
    Discrete,
    #[strum(serialize = "discretized")]
    Discretized,
}

#[derive(Debug, Clone)]
pub struct ScalarParam {
    pub name: String,
    pub class: ParameterClass,
    pub value: f64,
    pub lower_bound: f64,
    pub upper_bound: f64,
}

#[derive(Debug, Clone)]
pub struct RegularizationSettings {
    pub reg_type: RegularizationType,
    pub constant: f64,
    /// restrict the regularization to the boundary subset of the field
    pub boundary_only: bool,
}

impl RegularizationSettings {
    pub fn none() -> RegularizationSettings {
        RegularizationSettings {
            reg_type: RegularizationType::None,
            constant: 0.0,
            boundary_only: false,
        }
    }
}

/// a field parameter discretized on its own DOF map
#[derive(Debug, Clone)]
pub struct DiscretizedParam {
    pub name: String,
    pub map: DofMap,
    pub values: DVector<f64>, // owned layout
    pub regularization: RegularizationSettings,
    /// owned-local indices of the boundary subset (used when the
    /// regularization is boundary-restricted)
    pub boundary_dofs: Vec<usize>,
}

/////////////////////////////////////////////////////////////////////////////////////////////
//                PARAMETER SET
/////////////////////////////////////////////////////////////////////////////////////////////

pub struct ParameterSet {
    pub scalars: Vec<ScalarParam>,
    pub discretized: Vec<DiscretizedParam>,
}

impl ParameterSet {
    pub fn new() -> ParameterSet {
        ParameterSet {
            scalars: Vec::new(),
            discretized: Vec::new(),
        }
    }

    pub fn add_scalar(
        &mut self,
        name: &str,
        value: f64,
        class: ParameterClass,
        lower_bound: f64,
        upper_bound: f64,
    ) {
        assert!(
            class != ParameterClass::Discretized,
            "Discretized parameters must be added with add_discretized."
        );
        assert!(
            lower_bound <= upper_bound,
            "Lower bound should not exceed the upper bound."
        );
        self.scalars.push(ScalarParam {
            name: name.to_string(),
            class,
            value,
            lower_bound,
            upper_bound,
        });
    }

    pub fn add_discretized(
        &mut self,
        name: &str,
        map: DofMap,
        values: DVector<f64>,
        regularization: RegularizationSettings,
        boundary_dofs: Vec<usize>,
    ) {
        assert_eq!(
            values.len(),
            map.num_owned(),
            "Discretized parameter values must match the owned map size."
        );
        for &b in boundary_dofs.iter() {
            assert!(b < map.num_owned(), "boundary dof index out of range");
        }
        self.discretized.push(DiscretizedParam {
            name: name.to_string(),
            map,
            values,
            regularization,
            boundary_dofs,
        });
    }

    pub fn num_params(&self, class: ParameterClass) -> usize {
        if class == ParameterClass::Discretized {
            self.discretized.len()
        } else {
            self.scalars.iter().filter(|p| p.class == class).count()
        }
    }

    pub fn num_active(&self) -> usize {
        self.num_params(ParameterClass::Active)
    }

    /// total DOF count over all discretized fields (owned layout)
    pub fn num_discretized_dofs(&self) -> usize {
        self.discretized.iter().map(|p| p.map.num_owned()).sum()
    }

    /// gradient layout: active scalars first, then discretized DOFs field
    /// by field in registration order
    pub fn gradient_len(&self) -> usize {
        self.num_active() + self.num_discretized_dofs()
    }

    /// offset of a discretized field inside the gradient vector
    pub fn discretized_offset(&self, index: usize) -> usize {
        assert!(index < self.discretized.len(), "no such discretized parameter");
        self.num_active()
            + self.discretized[..index]
                .iter()
                .map(|p| p.map.num_owned())
                .sum::<usize>()
    }

    pub fn get_params(&self, class: ParameterClass) -> Vec<f64> {
        self.scalars
            .iter()
            .filter(|p| p.class == class)
            .map(|p| p.value)
            .collect()
    }

    pub fn get_param_names(&self, class: ParameterClass) -> Vec<String> {
        self.scalars
            .iter()
            .filter(|p| p.class == class)
            .map(|p| p.name.clone())
            .collect()
    }

    /// names matching the gradient layout
    pub fn gradient_names(&self) -> Vec<String> {
        let mut names = self.get_param_names(ParameterClass::Active);
        for p in self.discretized.iter() {
            for &gid in p.map.owned.iter() {
                names.push(format!("{}[{}]", p.name, gid));
            }
        }
        names
    }

    pub fn update_params(&mut self, values: &[f64], class: ParameterClass) {
        let n = self.num_params(class);
        assert_eq!(
            values.len(),
            n,
            "update_params got {} values for {} parameters of class {}",
            values.len(),
            n,
            class
        );
        let mut k = 0;
        for p in self.scalars.iter_mut() {
            if p.class == class {
                p.value = values[k];
                k += 1;
            }
        }
    }

    pub fn update_discretized(&mut self, name: &str, values: &DVector<f64>) {
        let param = self
            .discretized
            .iter_mut()
            .find(|p| p.name == name)
            .unwrap_or_else(|| panic!("no discretized parameter named {}", name));
        assert_eq!(values.len(), param.values.len());
        param.values = values.clone();
    }

    /// draw new values for every stochastic parameter, uniform in bounds
    pub fn sample_stochastic<R: Rng>(&mut self, rng: &mut R) {
        for p in self.scalars.iter_mut() {
            if p.class == ParameterClass::Stochastic {
                p.value = rng.random_range(p.lower_bound..=p.upper_bound);
            }
        }
    }

    /// stash the current scalar parameter values into a csv
    pub fn stash_params(&self, filename: &str) -> io::Result<()> {
        let file = File::create(filename)?;
        let mut writer = Writer::from_writer(file);
        writer.write_record(&["name", "class", "value"])?;
        for p in self.scalars.iter() {
            writer.write_record(&[p.name.clone(), p.class.to_string(), p.value.to_string()])?;
        }
        writer.flush()?;
        Ok(())
    }
}

/////////////////////////////////////////////////////////////////////////////////////////////
//                                     TESTS
/////////////////////////////////////////////////////////////////////////////////////////////
#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn set_with_two_fields() -> ParameterSet {
        let mut params = ParameterSet::new();
        params.add_scalar("kappa", 1.0, ParameterClass::Active, 0.0, 10.0);
        params.add_scalar("rho", 2.5, ParameterClass::Inactive, 0.0, 10.0);
        params.add_scalar("noise", 0.0, ParameterClass::Stochastic, -1.0, 1.0);
        params.add_discretized(
            "source",
            DofMap::serial(3),
            DVector::from_vec(vec![0.1, 0.2, 0.3]),
            RegularizationSettings::none(),
            vec![0, 2],
        );
        params
    }

    #[test]
    fn test_counting_and_layout() {
        let params = set_with_two_fields();
        assert_eq!(params.num_active(), 1);
        assert_eq!(params.num_params(ParameterClass::Inactive), 1);
        assert_eq!(params.num_discretized_dofs(), 3);
        assert_eq!(params.gradient_len(), 4);
        assert_eq!(params.discretized_offset(0), 1);
        let names = params.gradient_names();
        assert_eq!(names[0], "kappa");
        assert_eq!(names[1], "source[0]");
    }

    #[test]
    fn test_update_params() {
        let mut params = set_with_two_fields();
        params.update_params(&[3.0], ParameterClass::Active);
        assert_eq!(params.get_params(ParameterClass::Active), vec![3.0]);
        // inactive value untouched
        assert_eq!(params.get_params(ParameterClass::Inactive), vec![2.5]);
    }

    #[test]
    fn test_stochastic_sampling_respects_bounds() {
        let mut params = set_with_two_fields();
        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..10 {
            params.sample_stochastic(&mut rng);
            let v = params.get_params(ParameterClass::Stochastic)[0];
            assert!(v >= -1.0 && v <= 1.0);
        }
    }

    #[test]
    fn test_stash_params() {
        let params = set_with_two_fields();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("params.csv");
        params.stash_params(path.to_str().unwrap()).unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("kappa,active,1"));
    }

    #[test]
    #[should_panic(expected = "update_params got")]
    fn test_update_params_length_mismatch() {
        let mut params = set_with_two_fields();
        params.update_params(&[1.0, 2.0], ParameterClass::Active);
    }
}
