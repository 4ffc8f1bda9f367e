//! Model trait and parameter registration protocol.
//!
//! A model contributes one scalar negative log-likelihood term to the
//! objective. The shared bookkeeping (name, exposure, the list of bare
//! parameter names a model registered and where they live in the flat
//! parameter vector) is kept in [`ModelCore`], so the trait itself only
//! needs [`Model::nll`] plus the optional [`Model::declare_parameters`] hook.

use crate::registry::{ParameterRegistry, qualified_name};
use crate::{Error, Parameter, Result};

/// Statistical model contributing one NLL term.
pub trait Model {
    /// Shared model state.
    fn core(&self) -> &ModelCore;

    /// Mutable shared model state.
    fn core_mut(&mut self) -> &mut ModelCore;

    /// Model name, used to qualify its local parameters.
    fn name(&self) -> &str {
        self.core().name()
    }

    /// Register the model's parameters into `registry`.
    fn declare_parameters(&mut self, _registry: &mut ParameterRegistry) -> Result<()> {
        Ok(())
    }

    /// Resolve the model's parameters to columns of the flat vector.
    fn bind(&mut self, registry: &ParameterRegistry) -> Result<()> {
        self.core_mut().bind(registry)
    }

    /// Negative log-likelihood at the flat parameter vector `params`.
    fn nll(&self, params: &[f64]) -> Result<f64>;
}

/// Name, exposure and parameter bookkeeping shared by every model.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelCore {
    name: String,
    exposure: f64,
    local_names: Vec<String>,
    slots: Vec<usize>,
}

impl ModelCore {
    /// Create the core of model `name` with the given exposure.
    pub fn new(name: impl Into<String>, exposure: f64) -> Self {
        Self { name: name.into(), exposure, local_names: Vec::new(), slots: Vec::new() }
    }

    /// Model name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Exposure (rate to expected-count conversion).
    pub fn exposure(&self) -> f64 {
        self.exposure
    }

    /// Set the exposure.
    pub fn set_exposure(&mut self, exposure: f64) {
        self.exposure = exposure;
    }

    /// Bare names registered by this model, in registration order.
    pub fn local_names(&self) -> &[String] {
        &self.local_names
    }

    /// Fully-qualified name of `name` as declared by this model.
    pub fn global_name(&self, name: &str, global: bool) -> String {
        qualified_name(&self.name, name, global)
    }

    /// Register `par` (named by its bare name) into `registry`.
    ///
    /// Returns `Ok(false)` when this model already registered the bare name;
    /// the duplicate is dropped with a warning. A global name already present
    /// in the registry is shared, while an already-present local name is an
    /// [`Error::DuplicateParameter`].
    pub fn add_parameter(
        &mut self,
        registry: &mut ParameterRegistry,
        mut par: Parameter,
    ) -> Result<bool> {
        let bare = par.name().to_string();
        if self.local_names.iter().any(|n| *n == bare) {
            log::warn!("model '{}': parameter '{}' already registered, dropping duplicate", self.name, bare);
            return Ok(false);
        }

        let full = self.global_name(&bare, par.is_global());
        par.set_name(full.clone());
        if !registry.insert_if_absent(par) {
            let shared = registry.get(&full).is_some_and(|p| p.is_global());
            if !shared {
                return Err(Error::DuplicateParameter(full));
            }
        }

        self.local_names.push(bare);
        self.slots.clear();
        Ok(true)
    }

    /// Qualified registry key for the bare name `name`: `global.<name>` when
    /// registered, otherwise `<model>.<name>`.
    pub fn resolve(&self, registry: &ParameterRegistry, name: &str) -> Result<String> {
        let global = self.global_name(name, true);
        if registry.contains(&global) {
            return Ok(global);
        }
        let local = self.global_name(name, false);
        if registry.contains(&local) {
            return Ok(local);
        }
        Err(Error::UnknownParameter(format!("{} (model '{}')", name, self.name)))
    }

    /// Resolve every registered bare name to its column in the flat vector.
    pub fn bind(&mut self, registry: &ParameterRegistry) -> Result<()> {
        let mut slots = Vec::with_capacity(self.local_names.len());
        for name in &self.local_names {
            let full = self.resolve(registry, name)?;
            let idx = registry.index_of(&full).ok_or_else(|| Error::UnknownParameter(full.clone()))?;
            slots.push(idx);
        }
        self.slots = slots;
        Ok(())
    }

    /// Whether [`ModelCore::bind`] ran since the last registration.
    pub fn is_bound(&self) -> bool {
        self.slots.len() == self.local_names.len()
    }

    /// Columns of the local parameters, parallel to [`ModelCore::local_names`].
    pub fn slots(&self) -> &[usize] {
        &self.slots
    }

    /// Value of the `i`-th local parameter in `params`.
    pub fn value(&self, params: &[f64], i: usize) -> Result<f64> {
        let slot = *self.slots.get(i).ok_or_else(|| {
            Error::Computation(format!("model '{}' is not bound to the registry", self.name))
        })?;
        params.get(slot).copied().ok_or_else(|| {
            Error::Computation(format!(
                "parameter vector of length {} has no column {}",
                params.len(),
                slot
            ))
        })
    }

    /// Value of the local parameter called `name` in `params`.
    pub fn value_of(&self, params: &[f64], name: &str) -> Result<f64> {
        let i = self
            .local_names
            .iter()
            .position(|n| n == name)
            .ok_or_else(|| Error::UnknownParameter(format!("{} (model '{}')", name, self.name)))?;
        self.value(params, i)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    struct Constant {
        core: ModelCore,
    }

    impl Model for Constant {
        fn core(&self) -> &ModelCore {
            &self.core
        }

        fn core_mut(&mut self) -> &mut ModelCore {
            &mut self.core
        }

        fn nll(&self, params: &[f64]) -> Result<f64> {
            let x = self.core.value(params, 0)?;
            Ok(0.5 * x * x)
        }
    }

    #[test]
    fn test_global_parameter_is_shared() {
        let mut reg = ParameterRegistry::new();
        let mut a = ModelCore::new("ds1", 1.0);
        let mut b = ModelCore::new("ds2", 1.0);
        assert!(a.add_parameter(&mut reg, Parameter::with_range("sig", 0.0, 10.0).global(true)).unwrap());
        assert!(b.add_parameter(&mut reg, Parameter::with_range("sig", 0.0, 99.0).global(true)).unwrap());
        assert_eq!(reg.len(), 1);
        assert_eq!(a.resolve(&reg, "sig").unwrap(), "global.sig");
        assert_eq!(b.resolve(&reg, "sig").unwrap(), "global.sig");
        assert_eq!(reg.get("global.sig").unwrap().range_max(), 10.0);
    }

    #[test]
    fn test_duplicate_local_is_dropped() {
        let mut reg = ParameterRegistry::new();
        let mut a = ModelCore::new("ds1", 1.0);
        assert!(a.add_parameter(&mut reg, Parameter::new("bkg")).unwrap());
        assert!(!a.add_parameter(&mut reg, Parameter::new("bkg")).unwrap());
        assert_eq!(a.local_names(), ["bkg".to_string()]);
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn test_local_collision_across_models_fails() {
        let mut reg = ParameterRegistry::new();
        let mut a = ModelCore::new("ds1", 1.0);
        let mut b = ModelCore::new("ds1", 1.0);
        a.add_parameter(&mut reg, Parameter::new("bkg")).unwrap();
        let err = b.add_parameter(&mut reg, Parameter::new("bkg")).unwrap_err();
        assert!(matches!(err, Error::DuplicateParameter(ref n) if n == "ds1.bkg"));
        assert!(b.local_names().is_empty());
    }

    #[test]
    fn test_resolve_prefers_global() {
        let mut reg = ParameterRegistry::new();
        reg.insert_if_absent(Parameter::new("global.x"));
        reg.insert_if_absent(Parameter::new("m.x"));
        reg.insert_if_absent(Parameter::new("m.y"));
        let core = ModelCore::new("m", 1.0);
        assert_eq!(core.resolve(&reg, "x").unwrap(), "global.x");
        assert_eq!(core.resolve(&reg, "y").unwrap(), "m.y");
        assert!(matches!(core.resolve(&reg, "z"), Err(Error::UnknownParameter(_))));
    }

    #[test]
    fn test_bind_maps_columns() {
        let mut reg = ParameterRegistry::new();
        let mut model = Constant { core: ModelCore::new("m", 1.0) };
        model.core_mut().add_parameter(&mut reg, Parameter::new("z")).unwrap();
        reg.insert_if_absent(Parameter::new("a.first"));
        assert!(!model.core().is_bound());
        assert!(model.nll(&[0.0, 3.0]).is_err());

        model.bind(&reg).unwrap();
        assert_eq!(model.core().slots(), [1]);
        assert_relative_eq!(model.nll(&[0.0, 3.0]).unwrap(), 4.5);
        assert_relative_eq!(model.core().value_of(&[0.0, 3.0], "z").unwrap(), 3.0);
        assert!(model.nll(&[0.0]).is_err());
    }
}
