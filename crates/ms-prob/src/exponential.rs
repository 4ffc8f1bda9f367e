//! Shifted exponential used for one-sided constraints.

/// Log-PDF of an exponential distribution starting at `offset` whose
/// cumulative probability at `limit` equals `quantile`.
///
/// The rate is `a = -ln(1 - quantile) / (limit - offset)` and
/// `log p(x) = ln(a) - a (x - offset)`.
///
/// Returns `NaN` unless `0 < quantile < 1`, `limit > offset` and `x >= offset`.
pub fn log_exp(x: f64, limit: f64, quantile: f64, offset: f64) -> f64 {
    if quantile.is_nan() || quantile <= 0.0 || quantile >= 1.0 {
        return f64::NAN;
    }
    if limit <= offset || x < offset {
        return f64::NAN;
    }
    let a = -(1.0 - quantile).ln() / (limit - offset);
    a.ln() - a * (x - offset)
}
