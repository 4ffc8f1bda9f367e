//! # ms-inference
//!
//! Binned maximum-likelihood fitting for mstats.
//!
//! This crate provides:
//! - template composition and Monte Carlo sampling ([`TemplateComposer`])
//! - likelihood terms: binned Poisson likelihoods and pull priors ([`ModelKind`])
//! - a stateful minimization engine over argmin ([`FitEngine`])
//! - joint minimization with incremental parameter synchronization ([`Minimizer`])
//! - profile likelihood scans ([`ProfileScanner`])
//! - the persisted per-fit result table ([`FitTable`])

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Persisted fit-result table.
pub mod artifacts;
/// Template library and working composition.
pub mod composer;
/// Stateful minimization engine.
pub mod engine;
/// Hessian and covariance estimation.
pub mod hesse;
/// Joint minimizer over a model list.
pub mod minimizer;
/// Likelihood terms.
pub mod models;
/// Generic numerical optimizers (L-BFGS, Nelder-Mead).
pub mod optimizer;
/// Profile likelihood scans.
pub mod profile_likelihood;

pub use artifacts::FitTable;
pub use composer::{CompositionState, TemplateComposer};
pub use engine::{EngineStats, FitEngine, MinimizationMethod};
pub use minimizer::{Minimizer, MinimizerStep, SyncSummary};
pub use models::{BinnedLikelihoodModel, ExponentialPull, GaussianPull, ModelKind};
pub use optimizer::{ObjectiveFunction, OptimizationResult, OptimizerConfig};
pub use profile_likelihood::{ProfileCurve, ProfilePoint, ProfileScanner, delta_nll_for_cl};
