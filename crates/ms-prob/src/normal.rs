//! Normal distribution utilities.

/// Natural log of `sqrt(2π)`.
const LN_SQRT_2PI: f64 = 0.918_938_533_204_672_7;

/// Log-PDF of a Normal distribution `N(mean, sigma)` at `x`.
///
/// `log p(x) = -0.5 * ((x-mean)/sigma)^2 - ln(sigma) - ln(sqrt(2π))`
///
/// Returns `NaN` unless `sigma` is finite and strictly positive.
pub fn log_gaus(x: f64, mean: f64, sigma: f64) -> f64 {
    if !sigma.is_finite() || sigma <= 0.0 {
        return f64::NAN;
    }
    let z = (x - mean) / sigma;
    -0.5 * z * z - sigma.ln() - LN_SQRT_2PI
}
