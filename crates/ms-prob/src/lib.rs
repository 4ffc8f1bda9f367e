//! Log-density building blocks for mstats.
//!
//! Every function here returns a plain `f64`. Invalid inputs produce a
//! sentinel (`-inf` or `NaN`) instead of an error so that one pathological
//! bin degrades the aggregate likelihood without aborting a fit.

#![warn(missing_docs)]

pub mod exponential;
pub mod normal;
pub mod poisson;

pub use exponential::log_exp;
pub use normal::log_gaus;
pub use poisson::{GAUSSIAN_THRESHOLD, log_poisson};
