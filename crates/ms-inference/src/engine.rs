//! Stateful numerical minimization engine.
//!
//! [`FitEngine`] keeps an indexed table of parameters (value, step, bounds,
//! fixed flag, error) that persists between calls, and runs one named
//! method at a time over the free subset. Bounded parameters are
//! minimized through the sine transformation of [`crate::optimizer`].

use crate::hesse::{Covariance, invert_hessian, numerical_hessian, projected_gradient};
use crate::optimizer::{Bound, LbfgsOptimizer, ObjectiveFunction, OptimizerConfig, SimplexOptimizer};
use ms_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Status of a converged call.
pub const STATUS_OK: i32 = 0;
/// Status of a call that hit the call limit or failed numerically.
pub const STATUS_FAILED: i32 = 4;

/// Named minimization method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum MinimizationMethod {
    /// Quasi-Newton minimization followed by a covariance estimate
    Migrad,
    /// Derivative-free simplex minimization
    Simplex,
    /// Migrad, falling back to Simplex then Migrad again on failure
    Minimize,
    /// Covariance estimate at the current point
    Hesse,
}

impl FromStr for MinimizationMethod {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "MIGRAD" | "MIG" => Ok(Self::Migrad),
            "SIMPLEX" | "SIM" => Ok(Self::Simplex),
            "MINIMIZE" | "MINI" => Ok(Self::Minimize),
            "HESSE" | "HES" => Ok(Self::Hesse),
            _ => Err(Error::Validation(format!("unknown minimization method '{s}'"))),
        }
    }
}

impl TryFrom<String> for MinimizationMethod {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<MinimizationMethod> for String {
    fn from(m: MinimizationMethod) -> Self {
        m.to_string()
    }
}

impl fmt::Display for MinimizationMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Migrad => "MIGRAD",
            Self::Simplex => "SIMPLEX",
            Self::Minimize => "MINIMIZE",
            Self::Hesse => "HESSE",
        };
        f.write_str(s)
    }
}

/// Summary statistics of the last engine call.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EngineStats {
    /// Objective at the current point
    pub fmin: f64,
    /// Estimated distance to the minimum
    pub edm: f64,
    /// Error definition
    pub up: f64,
    /// Number of free parameters
    pub n_free: usize,
    /// Number of defined parameters
    pub n_total: usize,
    /// Covariance quality (0 = none)
    pub cov_quality: i32,
    /// Objective evaluations in the last call
    pub n_calls: usize,
}

#[derive(Debug, Clone)]
struct EngineParameter {
    name: String,
    value: f64,
    step: f64,
    bound: Bound,
    fixed: bool,
    error: f64,
}

/// Indexed parameter table plus the minimization methods acting on it.
#[derive(Debug, Clone)]
pub struct FitEngine {
    params: Vec<EngineParameter>,
    up: f64,
    print_level: i32,
    stats: EngineStats,
}

/// Objective restricted to the free parameters.
struct FreeObjective<'a> {
    objective: &'a dyn ObjectiveFunction,
    full: Vec<f64>,
    free: &'a [usize],
}

impl FreeObjective<'_> {
    fn expand(&self, free_values: &[f64]) -> Vec<f64> {
        let mut full = self.full.clone();
        for (&i, &v) in self.free.iter().zip(free_values) {
            full[i] = v;
        }
        full
    }
}

impl ObjectiveFunction for FreeObjective<'_> {
    fn eval(&self, params: &[f64]) -> Result<f64> {
        let v = self.objective.eval(&self.expand(params))?;
        // Non-finite values act as a wall for the solvers.
        Ok(if v.is_nan() { f64::INFINITY } else { v })
    }
}

impl Default for FitEngine {
    fn default() -> Self {
        Self::new(0.5)
    }
}

impl FitEngine {
    /// Empty engine with error definition `up` (0.5 for a negative log-likelihood).
    pub fn new(up: f64) -> Self {
        Self {
            params: Vec::new(),
            up,
            print_level: 0,
            stats: EngineStats {
                fmin: f64::NAN,
                edm: f64::NAN,
                up,
                n_free: 0,
                n_total: 0,
                cov_quality: 0,
                n_calls: 0,
            },
        }
    }

    /// Set the error definition.
    pub fn set_error_def(&mut self, up: f64) {
        self.up = up;
        self.stats.up = up;
    }

    /// Error definition.
    pub fn error_def(&self) -> f64 {
        self.up
    }

    /// Set the verbosity of [`FitEngine::execute`] (`<= 0` is silent).
    pub fn set_print_level(&mut self, level: i32) {
        self.print_level = level;
    }

    /// Verbosity.
    pub fn print_level(&self) -> i32 {
        self.print_level
    }

    /// Number of defined parameters.
    pub fn n_parameters(&self) -> usize {
        self.params.len()
    }

    /// Drop parameters from `len` on.
    pub fn truncate(&mut self, len: usize) {
        self.params.truncate(len);
    }

    /// Define (or redefine) parameter `index` as free.
    ///
    /// `min == max == 0` means unbounded. `index` may be at most the current
    /// number of parameters.
    pub fn define_parameter(
        &mut self,
        index: usize,
        name: &str,
        start: f64,
        step: f64,
        min: f64,
        max: f64,
    ) -> Result<()> {
        if index > self.params.len() {
            return Err(Error::Validation(format!(
                "cannot define parameter {index} with only {} defined",
                self.params.len()
            )));
        }
        let bound = if min == 0.0 && max == 0.0 {
            None
        } else if min < max {
            Some((min, max))
        } else {
            return Err(Error::Validation(format!("parameter '{name}': invalid bounds [{min}, {max}]")));
        };
        let value = match bound {
            Some((lo, hi)) => start.clamp(lo, hi),
            None => start,
        };
        let step = if step > 0.0 { step } else { 0.1 * value.abs().max(1.0) };
        let par = EngineParameter { name: name.to_string(), value, step, bound, fixed: false, error: step };
        if index == self.params.len() {
            self.params.push(par);
        } else {
            self.params[index] = par;
        }
        Ok(())
    }

    fn slot_mut(&mut self, index: usize) -> Result<&mut EngineParameter> {
        let n = self.params.len();
        self.params
            .get_mut(index)
            .ok_or_else(|| Error::Validation(format!("parameter {index} is not defined ({n} defined)")))
    }

    /// Hold parameter `index` at its current value.
    pub fn fix(&mut self, index: usize) -> Result<()> {
        self.slot_mut(index)?.fixed = true;
        Ok(())
    }

    /// Let parameter `index` float again.
    pub fn release(&mut self, index: usize) -> Result<()> {
        self.slot_mut(index)?.fixed = false;
        Ok(())
    }

    /// Set the current value of parameter `index`.
    pub fn set_value(&mut self, index: usize, value: f64) -> Result<()> {
        let par = self.slot_mut(index)?;
        par.value = match par.bound {
            Some((lo, hi)) => value.clamp(lo, hi),
            None => value,
        };
        Ok(())
    }

    /// Whether parameter `index` is fixed.
    pub fn is_fixed(&self, index: usize) -> bool {
        self.params.get(index).is_some_and(|p| p.fixed)
    }

    /// Current value and error of parameter `index`. Fixed parameters
    /// report a zero error.
    pub fn parameter(&self, index: usize) -> Result<(f64, f64)> {
        let par = self
            .params
            .get(index)
            .ok_or_else(|| Error::Validation(format!("parameter {index} is not defined")))?;
        Ok((par.value, if par.fixed { 0.0 } else { par.error }))
    }

    /// Name of parameter `index`.
    pub fn parameter_name(&self, index: usize) -> Option<&str> {
        self.params.get(index).map(|p| p.name.as_str())
    }

    /// Statistics of the last call.
    pub fn stats(&self) -> EngineStats {
        self.stats
    }

    /// Reinstate statistics saved from an earlier call, keeping the current
    /// error definition.
    pub(crate) fn restore_stats(&mut self, stats: EngineStats) {
        self.stats = EngineStats { up: self.up, ..stats };
    }

    /// Run `method` on `objective` with at most about `max_calls` objective
    /// evaluations and tolerance `tolerance`.
    ///
    /// The convergence target is an estimated distance to the minimum below
    /// `0.001 * tolerance * up`. Returns [`STATUS_OK`] or [`STATUS_FAILED`];
    /// numerical failures are reported through the status, not as errors.
    pub fn execute(
        &mut self,
        method: MinimizationMethod,
        max_calls: usize,
        tolerance: f64,
        objective: &dyn ObjectiveFunction,
    ) -> Result<i32> {
        if !(tolerance.is_finite() && tolerance > 0.0) {
            return Err(Error::Validation(format!("invalid tolerance {tolerance}")));
        }
        let status = match method {
            MinimizationMethod::Migrad => self.migrad(max_calls, tolerance, objective),
            MinimizationMethod::Simplex => self.simplex(max_calls, tolerance, objective),
            MinimizationMethod::Hesse => self.hesse(objective),
            MinimizationMethod::Minimize => {
                let status = self.migrad(max_calls, tolerance, objective);
                if status == STATUS_OK {
                    status
                } else {
                    log::info!("MIGRAD failed, trying SIMPLEX then MIGRAD");
                    self.simplex(max_calls, tolerance, objective);
                    self.migrad(max_calls, tolerance, objective)
                }
            }
        };
        if self.print_level > 0 {
            log::info!(
                "{method}: status {status}, fmin {:.6}, edm {:.3e}, {} free of {}",
                self.stats.fmin,
                self.stats.edm,
                self.stats.n_free,
                self.stats.n_total
            );
        }
        Ok(status)
    }

    fn free_indices(&self) -> Vec<usize> {
        (0..self.params.len()).filter(|&i| !self.params[i].fixed).collect()
    }

    fn full_values(&self) -> Vec<f64> {
        self.params.iter().map(|p| p.value).collect()
    }

    fn edm_target(&self, tolerance: f64) -> f64 {
        0.001 * tolerance * self.up
    }

    fn begin_call(&mut self, free: &[usize]) {
        self.stats.n_free = free.len();
        self.stats.n_total = self.params.len();
        self.stats.n_calls = 0;
    }

    /// Evaluate the objective with nothing to minimize.
    fn evaluate_only(&mut self, objective: &dyn ObjectiveFunction) -> i32 {
        match objective.eval(&self.full_values()) {
            Ok(f) if f.is_finite() => {
                self.stats.fmin = f;
                self.stats.edm = 0.0;
                self.stats.n_calls = 1;
                STATUS_OK
            }
            Ok(f) => {
                self.stats.fmin = f;
                STATUS_FAILED
            }
            Err(e) => {
                log::warn!("objective evaluation failed: {}", e);
                STATUS_FAILED
            }
        }
    }

    fn max_iterations(max_calls: usize, n_free: usize) -> u64 {
        (max_calls / (2 * n_free + 2)).max(1) as u64
    }

    fn migrad(&mut self, max_calls: usize, tolerance: f64, objective: &dyn ObjectiveFunction) -> i32 {
        let free = self.free_indices();
        self.begin_call(&free);
        if free.is_empty() {
            return self.evaluate_only(objective);
        }

        let problem = FreeObjective { objective, full: self.full_values(), free: &free };
        let init: Vec<f64> = free.iter().map(|&i| self.params[i].value).collect();
        let bounds: Vec<Bound> = free.iter().map(|&i| self.params[i].bound).collect();

        let config = OptimizerConfig {
            max_iter: Self::max_iterations(max_calls, free.len()),
            tol: (0.1 * self.edm_target(tolerance)).max(1e-10),
            m: 10,
        };
        let result = match LbfgsOptimizer::new(config).minimize(&problem, &init, &bounds) {
            Ok(r) => r,
            Err(e) => {
                log::warn!("MIGRAD: {}", e);
                return STATUS_FAILED;
            }
        };
        self.stats.n_calls = result.n_fev;
        for (&i, &v) in free.iter().zip(&result.parameters) {
            self.params[i].value = v;
        }
        if !result.fval.is_finite() {
            log::warn!("MIGRAD ended at a non-finite objective value");
            self.stats.fmin = result.fval;
            return STATUS_FAILED;
        }
        self.stats.fmin = result.fval;

        let status = self.update_covariance(&problem, &free, &result.parameters, &bounds);
        let edm_ok = self.stats.edm.is_finite() && self.stats.edm <= self.edm_target(tolerance);
        if status == STATUS_OK && (result.converged || edm_ok) {
            STATUS_OK
        } else {
            log::debug!("MIGRAD: {} (edm {:.3e})", result.message, self.stats.edm);
            STATUS_FAILED
        }
    }

    fn simplex(&mut self, max_calls: usize, tolerance: f64, objective: &dyn ObjectiveFunction) -> i32 {
        let free = self.free_indices();
        self.begin_call(&free);
        if free.is_empty() {
            return self.evaluate_only(objective);
        }

        let problem = FreeObjective { objective, full: self.full_values(), free: &free };
        let init: Vec<f64> = free.iter().map(|&i| self.params[i].value).collect();
        let steps: Vec<f64> = free.iter().map(|&i| self.params[i].step).collect();
        let bounds: Vec<Bound> = free.iter().map(|&i| self.params[i].bound).collect();

        let config = OptimizerConfig { max_iter: max_calls.max(1) as u64, tol: self.edm_target(tolerance), m: 0 };
        let result = match SimplexOptimizer::new(config).minimize(&problem, &init, &steps, &bounds) {
            Ok(r) => r,
            Err(e) => {
                log::warn!("SIMPLEX: {}", e);
                return STATUS_FAILED;
            }
        };
        self.stats.n_calls = result.n_fev;
        for (&i, &v) in free.iter().zip(&result.parameters) {
            self.params[i].value = v;
        }
        self.stats.fmin = result.fval;

        // Distance estimate from the current errors; no covariance is computed.
        self.stats.edm = match projected_gradient(&problem, &result.parameters, &bounds) {
            Ok(g) => 0.5 * g.iter().zip(&free).map(|(gi, &i)| (gi * self.params[i].error).powi(2)).sum::<f64>(),
            Err(_) => f64::NAN,
        };

        if result.converged && result.fval.is_finite() { STATUS_OK } else { STATUS_FAILED }
    }

    fn hesse(&mut self, objective: &dyn ObjectiveFunction) -> i32 {
        let free = self.free_indices();
        self.begin_call(&free);
        if free.is_empty() {
            return self.evaluate_only(objective);
        }
        let problem = FreeObjective { objective, full: self.full_values(), free: &free };
        let x: Vec<f64> = free.iter().map(|&i| self.params[i].value).collect();
        let bounds: Vec<Bound> = free.iter().map(|&i| self.params[i].bound).collect();
        match problem.eval(&x) {
            Ok(f) => self.stats.fmin = f,
            Err(e) => {
                log::warn!("HESSE: {}", e);
                return STATUS_FAILED;
            }
        }
        self.update_covariance(&problem, &free, &x, &bounds)
    }

    /// Recompute the covariance, errors and EDM at `x` (free coordinates).
    fn update_covariance(
        &mut self,
        problem: &FreeObjective<'_>,
        free: &[usize],
        x: &[f64],
        bounds: &[Bound],
    ) -> i32 {
        let hessian = match numerical_hessian(problem, x, bounds) {
            Ok(h) => h,
            Err(e) => {
                log::warn!("HESSE: {}", e);
                self.stats.cov_quality = 0;
                self.stats.edm = f64::NAN;
                return STATUS_FAILED;
            }
        };
        let cov: Covariance = invert_hessian(&hessian);
        for (&i, err) in free.iter().zip(cov.errors(self.up)) {
            self.params[i].error = err;
        }
        self.stats.cov_quality = cov.quality;
        self.stats.edm = match projected_gradient(problem, x, bounds) {
            Ok(g) => cov.edm(&g),
            Err(_) => f64::NAN,
        };
        STATUS_OK
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    // NLL of a two-bin Poisson counting experiment with counts (10, 5).
    struct TwoBins;

    impl ObjectiveFunction for TwoBins {
        fn eval(&self, p: &[f64]) -> Result<f64> {
            Ok(-(ms_prob::log_poisson(10.0, p[0]) + ms_prob::log_poisson(5.0, p[1])))
        }
    }

    fn engine() -> FitEngine {
        let mut e = FitEngine::new(0.5);
        e.define_parameter(0, "a", 50.0, 1.0, 0.0, 100.0).unwrap();
        e.define_parameter(1, "b", 50.0, 1.0, 0.0, 100.0).unwrap();
        e
    }

    #[test]
    fn test_method_names() {
        assert_eq!("migrad".parse::<MinimizationMethod>().unwrap(), MinimizationMethod::Migrad);
        assert_eq!("Simplex".parse::<MinimizationMethod>().unwrap(), MinimizationMethod::Simplex);
        assert_eq!("HESSE".parse::<MinimizationMethod>().unwrap(), MinimizationMethod::Hesse);
        assert_eq!(MinimizationMethod::Minimize.to_string(), "MINIMIZE");
        assert!("newton".parse::<MinimizationMethod>().is_err());
    }

    #[test]
    fn test_migrad_recovers_counts_and_errors() {
        let mut e = engine();
        let status = e.execute(MinimizationMethod::Migrad, 10_000, 0.1, &TwoBins).unwrap();
        assert_eq!(status, STATUS_OK);
        let (a, ea) = e.parameter(0).unwrap();
        let (b, eb) = e.parameter(1).unwrap();
        assert_relative_eq!(a, 10.0, epsilon = 1e-2);
        assert_relative_eq!(b, 5.0, epsilon = 1e-2);
        assert_relative_eq!(ea, 10f64.sqrt(), epsilon = 1e-2);
        assert_relative_eq!(eb, 5f64.sqrt(), epsilon = 1e-2);
        let stats = e.stats();
        assert_eq!(stats.n_free, 2);
        assert_eq!(stats.cov_quality, 3);
        assert!(stats.edm < 1e-3);
    }

    #[test]
    fn test_fixed_parameter_is_untouched() {
        let mut e = engine();
        e.set_value(1, 7.0).unwrap();
        e.fix(1).unwrap();
        e.execute(MinimizationMethod::Migrad, 10_000, 0.1, &TwoBins).unwrap();
        assert_eq!(e.parameter(1).unwrap(), (7.0, 0.0));
        assert_relative_eq!(e.parameter(0).unwrap().0, 10.0, epsilon = 1e-2);
        assert_eq!(e.stats().n_free, 1);
        e.release(1).unwrap();
        assert!(!e.is_fixed(1));
    }

    #[test]
    fn test_simplex_then_hesse() {
        let mut e = engine();
        let status = e.execute(MinimizationMethod::Simplex, 10_000, 0.01, &TwoBins).unwrap();
        assert_eq!(status, STATUS_OK);
        assert_relative_eq!(e.parameter(0).unwrap().0, 10.0, epsilon = 0.05);
        e.execute(MinimizationMethod::Hesse, 0, 0.1, &TwoBins).unwrap();
        assert_relative_eq!(e.parameter(1).unwrap().1, 5f64.sqrt(), epsilon = 0.05);
    }

    #[test]
    fn test_all_fixed_evaluates_only() {
        let mut e = engine();
        e.fix(0).unwrap();
        e.fix(1).unwrap();
        let status = e.execute(MinimizationMethod::Minimize, 100, 0.1, &TwoBins).unwrap();
        assert_eq!(status, STATUS_OK);
        assert_relative_eq!(e.stats().fmin, TwoBins.eval(&[50.0, 50.0]).unwrap());
    }

    #[test]
    fn test_define_rules() {
        let mut e = FitEngine::default();
        assert!(e.define_parameter(1, "x", 0.0, 0.1, 0.0, 0.0).is_err());
        e.define_parameter(0, "x", 5.0, 0.0, 0.0, 0.0).unwrap();
        assert_eq!(e.parameter_name(0), Some("x"));
        assert!(e.define_parameter(0, "x", 0.0, 0.1, 2.0, 1.0).is_err());
        e.define_parameter(0, "x", 9.0, 0.1, 0.0, 4.0).unwrap();
        assert_eq!(e.parameter(0).unwrap().0, 4.0);
        assert!(e.fix(3).is_err());
        assert!(e.execute(MinimizationMethod::Migrad, 10, 0.0, &TwoBins).is_err());
    }
}
