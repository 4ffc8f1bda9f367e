//! Common data types for mstats

use serde::{Deserialize, Serialize};
use std::fmt;

/// Post-fit estimate of one registry parameter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterEstimate {
    /// Fully-qualified parameter name
    pub name: String,
    /// Best-fit value
    pub value: f64,
    /// Uncertainty on the best-fit value
    pub error: f64,
    /// Whether the parameter was held fixed
    pub fixed: bool,
}

/// Fit result produced by the minimizer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FitResult {
    /// Status returned by the last minimizer call (0 = converged)
    pub status: i32,

    /// Negative log-likelihood at the minimum
    pub min_nll: f64,

    /// Estimated distance to the minimum
    pub edm: f64,

    /// Covariance quality (0 = not computed, 1 = approximate, 2 = forced
    /// positive-definite, 3 = accurate)
    pub cov_quality: i32,

    /// Number of minimizer calls that returned a non-zero status
    pub n_fails: usize,

    /// Estimates for every registry parameter, in column order
    pub parameters: Vec<ParameterEstimate>,
}

impl FitResult {
    /// Whether the last minimizer call converged.
    pub fn converged(&self) -> bool {
        self.status == 0
    }

    /// Estimate for the parameter called `name`.
    pub fn get(&self, name: &str) -> Option<&ParameterEstimate> {
        self.parameters.iter().find(|p| p.name == name)
    }

    /// Parameter names in column order.
    pub fn parameter_names(&self) -> Vec<&str> {
        self.parameters.iter().map(|p| p.name.as_str()).collect()
    }
}

impl fmt::Display for FitResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "FitResult(status={}, min_nll={:.6}, edm={:.3e}, cov_quality={}, n_fails={})",
            self.status, self.min_nll, self.edm, self.cov_quality, self.n_fails
        )?;
        for p in &self.parameters {
            write!(f, "  {:<32} {:>14.6} +- {:<12.6}", p.name, p.value, p.error)?;
            if p.fixed {
                write!(f, " (fixed)")?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> FitResult {
        FitResult {
            status: 0,
            min_nll: 3.5,
            edm: 1e-7,
            cov_quality: 3,
            n_fails: 0,
            parameters: vec![
                ParameterEstimate { name: "ds1.bkg".into(), value: 5.0, error: 2.2, fixed: false },
                ParameterEstimate { name: "global.sig".into(), value: 10.0, error: 3.1, fixed: true },
            ],
        }
    }

    #[test]
    fn test_fit_result_lookup() {
        let r = sample();
        assert!(r.converged());
        assert_eq!(r.get("global.sig").map(|p| p.value), Some(10.0));
        assert!(r.get("missing").is_none());
        assert_eq!(r.parameter_names(), vec!["ds1.bkg", "global.sig"]);
    }

    #[test]
    fn test_fit_result_json() {
        let r = sample();
        let json = serde_json::to_string(&r).unwrap();
        let back: FitResult = serde_json::from_str(&json).unwrap();
        assert_eq!(back, r);
        assert!(r.to_string().contains("(fixed)"));
    }
}
