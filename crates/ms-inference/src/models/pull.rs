//! Pull terms: priors on a global parameter.

use ms_core::{Error, Model, ModelCore, Parameter, ParameterRegistry, Result};
use ms_prob::{log_exp, log_gaus};

/// Declare `target` as a shared parameter of `core`, which must already be
/// registered globally by some other model.
fn declare_target(core: &mut ModelCore, registry: &mut ParameterRegistry, target: &str) -> Result<()> {
    let full = core.global_name(target, true);
    if !registry.contains(&full) {
        return Err(Error::UnknownParameter(format!(
            "pull '{}' constrains '{}', which is not a registered global parameter",
            core.name(),
            full
        )));
    }
    core.add_parameter(registry, Parameter::new(target).global(true))?;
    Ok(())
}

/// Gaussian prior `N(centroid, sigma)` on a global parameter.
#[derive(Debug, Clone)]
pub struct GaussianPull {
    core: ModelCore,
    target: String,
    centroid: f64,
    sigma: f64,
}

impl GaussianPull {
    /// Pull named `name` on the global parameter `target` (bare name).
    pub fn new(name: impl Into<String>, target: impl Into<String>, centroid: f64, sigma: f64) -> Result<Self> {
        if !(sigma.is_finite() && sigma > 0.0) {
            return Err(Error::Validation(format!("gaussian pull needs sigma > 0, got {sigma}")));
        }
        Ok(Self { core: ModelCore::new(name, 1.0), target: target.into(), centroid, sigma })
    }

    /// Bare name of the constrained parameter.
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Mean of the prior.
    pub fn centroid(&self) -> f64 {
        self.centroid
    }

    /// Width of the prior.
    pub fn sigma(&self) -> f64 {
        self.sigma
    }
}

impl Model for GaussianPull {
    fn core(&self) -> &ModelCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut ModelCore {
        &mut self.core
    }

    fn declare_parameters(&mut self, registry: &mut ParameterRegistry) -> Result<()> {
        let target = self.target.clone();
        declare_target(&mut self.core, registry, &target)
    }

    fn nll(&self, params: &[f64]) -> Result<f64> {
        let x = self.core.value(params, 0)?;
        Ok(-log_gaus(x, self.centroid, self.sigma))
    }
}

/// Exponential prior on a global parameter.
///
/// The rate is chosen so that a fraction `quantile` of the probability lies
/// below `limit`: `a = -ln(1 - quantile) / (limit - offset)`.
#[derive(Debug, Clone)]
pub struct ExponentialPull {
    core: ModelCore,
    target: String,
    limit: f64,
    quantile: f64,
    offset: f64,
}

impl ExponentialPull {
    /// Pull named `name` on the global parameter `target` (bare name).
    pub fn new(
        name: impl Into<String>,
        target: impl Into<String>,
        limit: f64,
        quantile: f64,
        offset: f64,
    ) -> Result<Self> {
        if !(quantile > 0.0 && quantile < 1.0) {
            return Err(Error::Validation(format!("exponential pull needs 0 < quantile < 1, got {quantile}")));
        }
        if !(limit.is_finite() && offset.is_finite() && limit > offset) {
            return Err(Error::Validation(format!(
                "exponential pull needs limit > offset, got limit {limit} offset {offset}"
            )));
        }
        Ok(Self { core: ModelCore::new(name, 1.0), target: target.into(), limit, quantile, offset })
    }

    /// Bare name of the constrained parameter.
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Value below which `quantile` of the prior lies.
    pub fn limit(&self) -> f64 {
        self.limit
    }

    /// Probability mass below `limit`.
    pub fn quantile(&self) -> f64 {
        self.quantile
    }

    /// Start of the prior support.
    pub fn offset(&self) -> f64 {
        self.offset
    }
}

impl Model for ExponentialPull {
    fn core(&self) -> &ModelCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut ModelCore {
        &mut self.core
    }

    fn declare_parameters(&mut self, registry: &mut ParameterRegistry) -> Result<()> {
        let target = self.target.clone();
        declare_target(&mut self.core, registry, &target)
    }

    fn nll(&self, params: &[f64]) -> Result<f64> {
        let x = self.core.value(params, 0)?;
        Ok(-log_exp(x, self.limit, self.quantile, self.offset))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn registry_with_sig() -> ParameterRegistry {
        let mut reg = ParameterRegistry::new();
        reg.insert_if_absent(Parameter::with_range("global.sig", 0.0, 10.0).global(true));
        reg
    }

    #[test]
    fn test_gaussian_pull_nll() {
        let mut reg = registry_with_sig();
        let mut pull = GaussianPull::new("sig", "sig", 2.0, 0.5).unwrap();
        pull.declare_parameters(&mut reg).unwrap();
        assert_eq!(reg.len(), 1);
        pull.bind(&reg).unwrap();
        let at_centroid = pull.nll(&[2.0]).unwrap();
        let one_sigma = pull.nll(&[2.5]).unwrap();
        assert_relative_eq!(one_sigma - at_centroid, 0.5, epsilon = 1e-12);
    }

    #[test]
    fn test_exponential_pull_nll() {
        let mut reg = registry_with_sig();
        let mut pull = ExponentialPull::new("sig", "sig", 5.0, 0.9, 0.0).unwrap();
        pull.declare_parameters(&mut reg).unwrap();
        pull.bind(&reg).unwrap();
        let a = -(0.1f64).ln() / 5.0;
        assert_relative_eq!(pull.nll(&[1.0]).unwrap(), -(a.ln() - a), epsilon = 1e-12);
    }

    #[test]
    fn test_pull_needs_global_target() {
        let mut reg = ParameterRegistry::new();
        let mut pull = GaussianPull::new("bkg", "bkg", 1.0, 0.1).unwrap();
        assert!(matches!(pull.declare_parameters(&mut reg), Err(Error::UnknownParameter(_))));
    }

    #[test]
    fn test_invalid_pull_parameters() {
        assert!(GaussianPull::new("p", "x", 0.0, 0.0).is_err());
        assert!(ExponentialPull::new("p", "x", 1.0, 1.0, 0.0).is_err());
        assert!(ExponentialPull::new("p", "x", 1.0, 0.5, 2.0).is_err());
    }
}
