//! Poisson counting statistic.

use crate::normal::log_gaus;
use statrs::function::gamma::ln_gamma;

/// Expected count above which the Gaussian approximation replaces the
/// exact Poisson term.
pub const GAUSSIAN_THRESHOLD: f64 = 899.0;

/// Log-probability of observing `x` counts given the expectation `lambda`.
///
/// - `x < 0` or `lambda < 0`: `-inf`
/// - `lambda == 0`: `0` for `x == 0`, otherwise `-inf`
/// - `x == 0`: `-lambda`
/// - `lambda <= GAUSSIAN_THRESHOLD`: `x ln(lambda) - lambda - ln Γ(x+1)`
/// - otherwise `log_gaus(x, lambda, sqrt(lambda))`
///
/// `x` is a bin content and need not be an integer.
pub fn log_poisson(x: f64, lambda: f64) -> f64 {
    if lambda < 0.0 || x < 0.0 {
        return f64::NEG_INFINITY;
    }
    if lambda == 0.0 {
        return if x == 0.0 { 0.0 } else { f64::NEG_INFINITY };
    }
    if x == 0.0 {
        -lambda
    } else if lambda <= GAUSSIAN_THRESHOLD {
        x * lambda.ln() - lambda - ln_gamma(x + 1.0)
    } else {
        log_gaus(x, lambda, lambda.sqrt())
    }
}
