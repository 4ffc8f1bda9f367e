//! Likelihood terms composed by the minimizer.

mod binned;
mod pull;

pub use binned::BinnedLikelihoodModel;
pub use pull::{ExponentialPull, GaussianPull};

use ms_core::{Model, ModelCore, ParameterRegistry, Result};

/// Any model the minimizer can hold.
pub enum ModelKind {
    /// Binned Poisson likelihood of a dataset
    Binned(BinnedLikelihoodModel),
    /// Gaussian prior on a global parameter
    GaussPull(GaussianPull),
    /// Exponential prior on a global parameter
    ExpPull(ExponentialPull),
    /// User-defined model
    Custom(Box<dyn Model>),
}

impl std::fmt::Debug for ModelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ModelKind::Binned(m) => f.debug_tuple("Binned").field(m).finish(),
            ModelKind::GaussPull(m) => f.debug_tuple("GaussPull").field(m).finish(),
            ModelKind::ExpPull(m) => f.debug_tuple("ExpPull").field(m).finish(),
            ModelKind::Custom(m) => f.debug_tuple("Custom").field(&m.name()).finish(),
        }
    }
}

impl ModelKind {
    fn inner(&self) -> &dyn Model {
        match self {
            ModelKind::Binned(m) => m,
            ModelKind::GaussPull(m) => m,
            ModelKind::ExpPull(m) => m,
            ModelKind::Custom(m) => m.as_ref(),
        }
    }

    fn inner_mut(&mut self) -> &mut dyn Model {
        match self {
            ModelKind::Binned(m) => m,
            ModelKind::GaussPull(m) => m,
            ModelKind::ExpPull(m) => m,
            ModelKind::Custom(m) => m.as_mut(),
        }
    }

    /// The binned likelihood, if this is one.
    pub fn as_binned(&self) -> Option<&BinnedLikelihoodModel> {
        match self {
            ModelKind::Binned(m) => Some(m),
            _ => None,
        }
    }

    /// The binned likelihood, if this is one.
    pub fn as_binned_mut(&mut self) -> Option<&mut BinnedLikelihoodModel> {
        match self {
            ModelKind::Binned(m) => Some(m),
            _ => None,
        }
    }

    /// Whether this is a prior term.
    pub fn is_pull(&self) -> bool {
        matches!(self, ModelKind::GaussPull(_) | ModelKind::ExpPull(_))
    }
}

impl Model for ModelKind {
    fn core(&self) -> &ModelCore {
        self.inner().core()
    }

    fn core_mut(&mut self) -> &mut ModelCore {
        self.inner_mut().core_mut()
    }

    fn name(&self) -> &str {
        self.inner().name()
    }

    fn declare_parameters(&mut self, registry: &mut ParameterRegistry) -> Result<()> {
        self.inner_mut().declare_parameters(registry)
    }

    fn bind(&mut self, registry: &ParameterRegistry) -> Result<()> {
        self.inner_mut().bind(registry)
    }

    fn nll(&self, params: &[f64]) -> Result<f64> {
        self.inner().nll(params)
    }
}

impl From<BinnedLikelihoodModel> for ModelKind {
    fn from(m: BinnedLikelihoodModel) -> Self {
        ModelKind::Binned(m)
    }
}

impl From<GaussianPull> for ModelKind {
    fn from(m: GaussianPull) -> Self {
        ModelKind::GaussPull(m)
    }
}

impl From<ExponentialPull> for ModelKind {
    fn from(m: ExponentialPull) -> Self {
        ModelKind::ExpPull(m)
    }
}

impl From<Box<dyn Model>> for ModelKind {
    fn from(m: Box<dyn Model>) -> Self {
        ModelKind::Custom(m)
    }
}
