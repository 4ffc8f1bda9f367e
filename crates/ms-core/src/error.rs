//! Error types for mstats

use thiserror::Error;

/// mstats error type
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// Computation error
    #[error("Computation error: {0}")]
    Computation(String),

    /// A parameter was looked up that no model registered
    #[error("Unknown parameter: {0}")]
    UnknownParameter(String),

    /// A non-global parameter was registered twice under the same qualified name
    #[error("Duplicate parameter: {0}")]
    DuplicateParameter(String),

    /// A template or histogram was requested that is not loaded
    #[error("Unknown template: {0}")]
    UnknownTemplate(String),

    /// Two binned objects do not share the same binning
    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),

    /// A minimizer was built without any model
    #[error("Minimizer requires at least one model")]
    EmptyModelList,
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
