//! # ms-core
//!
//! Core types for mstats.
//!
//! This crate hosts the pieces every other crate agrees on:
//! - the shared [`Error`] type
//! - [`Parameter`] and the [`ParameterRegistry`] shared by all models
//! - the [`Model`] trait and the [`ModelCore`] naming/registration protocol
//! - the serializable [`FitResult`]

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Error types.
pub mod error;
/// Fit parameters.
pub mod parameter;
/// Shared parameter registry.
pub mod registry;
/// Model trait and registration protocol.
pub mod traits;
/// Fit result types.
pub mod types;

pub use error::{Error, Result};
pub use parameter::{Parameter, ParameterKind};
pub use registry::{ParameterRegistry, SharedRegistry, qualified_name};
pub use traits::{Model, ModelCore};
pub use types::{FitResult, ParameterEstimate};

/// Crate version, shared by the CLI `--version` output.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
