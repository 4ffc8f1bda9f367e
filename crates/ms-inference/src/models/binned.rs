//! Extended binned Poisson likelihood over a template composition.

use crate::composer::TemplateComposer;
use ms_core::{Error, Model, ModelCore, Parameter, ParameterRegistry, Result};
use ms_hist::Histogram;
use ms_prob::log_poisson;
use std::cell::{Ref, RefCell};
use std::collections::BTreeMap;

/// Binned likelihood of one dataset.
///
/// Each component parameter weights the template of the same bare name; the
/// expected counts in a cell are `exposure * sum_k w_k T_k(cell)`.
#[derive(Debug)]
pub struct BinnedLikelihoodModel {
    core: ModelCore,
    composer: RefCell<TemplateComposer>,
    dataset: Option<Histogram>,
    cells: Vec<usize>,
    pending: Vec<Parameter>,
}

impl BinnedLikelihoodModel {
    /// Create a model over `composer` with the given exposure.
    pub fn new(name: impl Into<String>, exposure: f64, composer: TemplateComposer) -> Self {
        Self {
            core: ModelCore::new(name, exposure),
            composer: RefCell::new(composer),
            dataset: None,
            cells: Vec::new(),
            pending: Vec::new(),
        }
    }

    /// Queue a component parameter for registration.
    ///
    /// The bare name of `par` must match a template of the composer.
    pub fn add_component(&mut self, par: Parameter) -> Result<()> {
        if !self.composer.borrow().has_template(par.name()) {
            return Err(Error::UnknownTemplate(format!(
                "{} (model '{}')",
                par.name(),
                self.core.name()
            )));
        }
        self.pending.push(par);
        Ok(())
    }

    /// Template composer.
    pub fn composer(&self) -> Ref<'_, TemplateComposer> {
        self.composer.borrow()
    }

    /// Mutable template composer.
    pub fn composer_mut(&mut self) -> &mut TemplateComposer {
        self.composer.get_mut()
    }

    /// Swap in a new composer, returning the previous one.
    ///
    /// The new composer must hold a template for every component and, when a
    /// dataset is installed, share its binning.
    pub fn replace_composer(&mut self, composer: TemplateComposer) -> Result<TemplateComposer> {
        let components = self
            .core
            .local_names()
            .iter()
            .map(String::as_str)
            .chain(self.pending.iter().map(Parameter::name));
        for name in components {
            if !composer.has_template(name) {
                return Err(Error::UnknownTemplate(format!("{} (model '{}')", name, self.core.name())));
            }
        }
        if let (Some(data), Some(first)) = (self.dataset.as_ref(), composer.template_names().next()) {
            composer.template(first)?.check_same_binning(data)?;
        }
        Ok(self.composer.replace(composer))
    }

    /// Observed counts, if set.
    pub fn dataset(&self) -> Option<&Histogram> {
        self.dataset.as_ref()
    }

    /// Install `data` as the observed counts, returning the previous dataset.
    ///
    /// The binning must match the templates. Cells outside the dataset's
    /// user ranges do not enter the likelihood.
    pub fn replace_dataset(&mut self, data: Histogram) -> Result<Option<Histogram>> {
        {
            let composer = self.composer.borrow();
            if let Some(first) = composer.template_names().next() {
                composer.template(first)?.check_same_binning(&data)?;
            }
        }
        self.cells = data.cell_indices(true);
        Ok(self.dataset.replace(data))
    }

    /// Exposure-weighted composition at the registry's best-fit values.
    ///
    /// With `component`, only that component contributes.
    pub fn best_fit_density(
        &self,
        registry: &ParameterRegistry,
        component: Option<&str>,
    ) -> Result<Histogram> {
        let mut composer = self.composer.borrow_mut();
        composer.reset_composition();
        for name in self.core.local_names() {
            if component.is_some_and(|c| c != name) {
                continue;
            }
            let full = self.core.resolve(registry, name)?;
            let par = registry.get(&full).ok_or_else(|| Error::UnknownParameter(full.clone()))?;
            composer.add_to_composition(name, self.core.exposure() * par.best_fit())?;
        }
        if let Some(c) = component {
            if !self.core.local_names().iter().any(|n| n == c) {
                return Err(Error::UnknownParameter(format!("{} (model '{}')", c, self.core.name())));
            }
        }
        let label = match component {
            Some(c) => format!("{}_{}", self.core.name(), c),
            None => self.core.name().to_string(),
        };
        composer.take_composition(&label)
    }

    /// Sample a dataset from the composition at `injected` values.
    ///
    /// Every component needs an injected value, keyed by bare name. The
    /// number of events is `sum_k injected_k * exposure`, Poisson-fluctuated
    /// when `poisson_fluctuation` is set. The result is named after the
    /// model and carries the templates' user ranges.
    pub fn draw_realization(
        &mut self,
        injected: &BTreeMap<String, f64>,
        poisson_fluctuation: bool,
    ) -> Result<Histogram> {
        let exposure = self.core.exposure();
        let composer = self.composer.get_mut();
        composer.reset_composition();
        let mut expected = 0.0;
        for name in self.core.local_names() {
            let value = *injected.get(name).ok_or_else(|| {
                Error::UnknownParameter(format!("no injected value for '{}' (model '{}')", name, self.core.name()))
            })?;
            composer.add_to_composition(name, value)?;
            expected += value * exposure;
        }
        let mut data = composer.draw_monte_carlo_realization(expected, poisson_fluctuation)?;
        composer.reset_composition();
        data.set_name(self.core.name());
        Ok(data)
    }
}

impl Model for BinnedLikelihoodModel {
    fn core(&self) -> &ModelCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut ModelCore {
        &mut self.core
    }

    fn declare_parameters(&mut self, registry: &mut ParameterRegistry) -> Result<()> {
        for par in std::mem::take(&mut self.pending) {
            self.core.add_parameter(registry, par)?;
        }
        Ok(())
    }

    fn nll(&self, params: &[f64]) -> Result<f64> {
        let data = self.dataset.as_ref().ok_or_else(|| {
            Error::Computation(format!("model '{}' has no dataset", self.core.name()))
        })?;

        let mut composer = self.composer.borrow_mut();
        composer.reset_composition();
        for (i, name) in self.core.local_names().iter().enumerate() {
            composer.add_to_composition(name, self.core.value(params, i)?)?;
        }
        let expected = composer.take_composition("expected")?;

        let exposure = self.core.exposure();
        let observed = data.contents();
        let rates = expected.contents();
        if rates.len() != observed.len() {
            return Err(Error::ShapeMismatch(format!(
                "model '{}': composition has {} cells, dataset {}",
                self.core.name(),
                rates.len(),
                observed.len()
            )));
        }
        let ll: f64 = self.cells.iter().map(|&c| log_poisson(observed[c], exposure * rates[c])).sum();
        Ok(-ll)
    }
}
