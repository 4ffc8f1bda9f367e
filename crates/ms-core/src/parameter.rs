//! Fit parameters.
//!
//! A [`Parameter`] carries everything the minimizer needs to define one
//! column of the flat parameter vector (start value, step, bounds, fixed
//! flag) plus the slots the minimizer writes back after a fit.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Physical role of a parameter. Informational only; it does not change fitting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParameterKind {
    /// No role assigned
    #[default]
    Undefined,
    /// Parameter of interest
    Poi,
    /// Nuisance parameter
    Nuisance,
    /// External input
    Input,
}

impl fmt::Display for ParameterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ParameterKind::Undefined => "undefined",
            ParameterKind::Poi => "poi",
            ParameterKind::Nuisance => "nuisance",
            ParameterKind::Input => "input",
        };
        f.write_str(s)
    }
}

/// A named, optionally range-bounded scalar fit quantity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    name: String,
    kind: ParameterKind,
    range_min: Option<f64>,
    range_max: Option<f64>,
    start_value: Option<f64>,
    start_step: Option<f64>,
    fixed: bool,
    global: bool,
    best_fit: f64,
    best_fit_error: f64,
    lower_limit: f64,
    upper_limit: f64,
}

impl Parameter {
    /// Create a free, local parameter with no range and no start value.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ParameterKind::Undefined,
            range_min: None,
            range_max: None,
            start_value: None,
            start_step: None,
            fixed: false,
            global: false,
            best_fit: 0.0,
            best_fit_error: 0.0,
            lower_limit: 0.0,
            upper_limit: 0.0,
        }
    }

    /// Create a parameter bounded to `[min, max]`.
    pub fn with_range(name: impl Into<String>, min: f64, max: f64) -> Self {
        let mut p = Self::new(name);
        p.set_range(min, max);
        p
    }

    /// Parameter name (bare before registration, fully qualified after).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Rename the parameter.
    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    /// Physical role.
    pub fn kind(&self) -> ParameterKind {
        self.kind
    }

    /// Set the physical role.
    pub fn set_kind(&mut self, kind: ParameterKind) {
        self.kind = kind;
    }

    /// Whether the parameter is a parameter of interest.
    pub fn is_poi(&self) -> bool {
        self.kind == ParameterKind::Poi
    }

    /// Whether the parameter is a nuisance parameter.
    pub fn is_nuisance(&self) -> bool {
        self.kind == ParameterKind::Nuisance
    }

    /// Whether the parameter is an external input.
    pub fn is_input(&self) -> bool {
        self.kind == ParameterKind::Input
    }

    /// Whether the parameter is shared across models.
    pub fn is_global(&self) -> bool {
        self.global
    }

    /// Mark the parameter as shared across models (or private).
    pub fn set_global(&mut self, global: bool) {
        self.global = global;
    }

    /// Builder form of [`Parameter::set_global`].
    pub fn global(mut self, global: bool) -> Self {
        self.global = global;
        self
    }

    /// Whether the parameter is held constant during minimization.
    pub fn is_fixed(&self) -> bool {
        self.fixed
    }

    /// Set the fixed flag without touching the start value.
    pub fn set_fixed(&mut self, fixed: bool) {
        self.fixed = fixed;
    }

    /// Fix the parameter at `value`. The start value becomes `value`.
    pub fn fix_to(&mut self, value: f64) {
        self.fixed = true;
        self.set_start_value(value);
    }

    /// Release a fixed parameter.
    pub fn release(&mut self) {
        self.fixed = false;
    }

    /// Set the lower range edge.
    pub fn set_range_min(&mut self, min: f64) {
        self.range_min = Some(min);
    }

    /// Set the upper range edge.
    pub fn set_range_max(&mut self, max: f64) {
        self.range_max = Some(max);
    }

    /// Set both range edges.
    pub fn set_range(&mut self, min: f64, max: f64) {
        self.range_min = Some(min);
        self.range_max = Some(max);
    }

    /// Remove both range edges.
    pub fn clear_range(&mut self) {
        self.range_min = None;
        self.range_max = None;
    }

    /// Whether the lower edge is set.
    pub fn is_range_min_set(&self) -> bool {
        self.range_min.is_some()
    }

    /// Whether the upper edge is set.
    pub fn is_range_max_set(&self) -> bool {
        self.range_max.is_some()
    }

    /// Whether both edges are set.
    pub fn is_range_set(&self) -> bool {
        self.range_min.is_some() && self.range_max.is_some()
    }

    /// Lower range edge, 0 when unset.
    pub fn range_min(&self) -> f64 {
        self.range_min.unwrap_or(0.0)
    }

    /// Upper range edge, 0 when unset.
    pub fn range_max(&self) -> f64 {
        self.range_max.unwrap_or(0.0)
    }

    /// `range_max - range_min`.
    pub fn range_width(&self) -> f64 {
        self.range_max() - self.range_min()
    }

    /// Set the fit start value.
    pub fn set_start_value(&mut self, value: f64) {
        self.start_value = Some(value);
    }

    /// Whether an explicit start value was set.
    pub fn is_start_value_set(&self) -> bool {
        self.start_value.is_some()
    }

    /// Fit start value; the range midpoint when none was set.
    pub fn start_value(&self) -> f64 {
        self.start_value.unwrap_or_else(|| 0.5 * (self.range_min() + self.range_max()))
    }

    /// Set the initial step. Zero restores the default.
    pub fn set_start_step(&mut self, step: f64) {
        self.start_step = if step != 0.0 { Some(step) } else { None };
    }

    /// Initial step; one hundredth of the range width when none was set.
    ///
    /// Parameters without a usable range fall back to a tenth of the start
    /// value magnitude (at least 0.1).
    pub fn start_step(&self) -> f64 {
        if let Some(step) = self.start_step {
            return step;
        }
        let width = self.range_width();
        if width > 0.0 { width / 100.0 } else { 0.1 * self.start_value().abs().max(1.0) }
    }

    /// Whether `value` sits exactly on one of the range edges.
    pub fn is_at_limit(&self, value: f64) -> bool {
        self.is_range_set() && (value == self.range_min() || value == self.range_max())
    }

    /// Store the best-fit value and its uncertainty.
    pub fn set_fit_result(&mut self, value: f64, error: f64) {
        self.best_fit = value;
        self.best_fit_error = error;
    }

    /// Best-fit value.
    pub fn best_fit(&self) -> f64 {
        self.best_fit
    }

    /// Best-fit uncertainty.
    pub fn best_fit_error(&self) -> f64 {
        self.best_fit_error
    }

    /// Store a post-fit interval.
    pub fn set_fit_limits(&mut self, lower: f64, upper: f64) {
        self.lower_limit = lower;
        self.upper_limit = upper;
    }

    /// Lower edge of the post-fit interval.
    pub fn lower_limit(&self) -> f64 {
        self.lower_limit
    }

    /// Upper edge of the post-fit interval.
    pub fn upper_limit(&self) -> f64 {
        self.upper_limit
    }

    /// Zero every fit-result slot.
    pub fn reset_fit_result(&mut self) {
        self.best_fit = 0.0;
        self.best_fit_error = 0.0;
        self.lower_limit = 0.0;
        self.upper_limit = 0.0;
    }
}

impl fmt::Display for Parameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [ {} : {}", self.name, self.kind, if self.global { "global" } else { "local" })?;
        if self.fixed {
            write!(f, " : fixed")?;
        }
        write!(
            f,
            " ] [ best value {} +- {} ] [ interval {} , {} ]",
            self.best_fit, self.best_fit_error, self.lower_limit, self.upper_limit
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_start_value_defaults_to_midpoint() {
        let p = Parameter::with_range("rate", 2.0, 10.0);
        assert!(!p.is_start_value_set());
        assert_relative_eq!(p.start_value(), 6.0);
    }

    #[test]
    fn test_start_step_defaults_to_range_fraction() {
        let mut p = Parameter::with_range("rate", 0.0, 50.0);
        assert_relative_eq!(p.start_step(), 0.5);
        p.set_start_step(0.2);
        assert_relative_eq!(p.start_step(), 0.2);
        p.set_start_step(0.0);
        assert_relative_eq!(p.start_step(), 0.5);
    }

    #[test]
    fn test_start_step_without_range() {
        let mut p = Parameter::new("offset");
        p.set_start_value(-30.0);
        assert_relative_eq!(p.start_step(), 3.0);
    }

    #[test]
    fn test_fix_to_sets_start_value() {
        let mut p = Parameter::with_range("bkg", 0.0, 100.0);
        p.fix_to(42.0);
        assert!(p.is_fixed());
        assert_relative_eq!(p.start_value(), 42.0);
        p.release();
        assert!(!p.is_fixed());
        assert_relative_eq!(p.start_value(), 42.0);
    }

    #[test]
    fn test_unset_range_reads_zero() {
        let mut p = Parameter::new("x");
        assert!(!p.is_range_set());
        assert_eq!(p.range_min(), 0.0);
        assert_eq!(p.range_max(), 0.0);
        p.set_range_max(3.0);
        assert!(p.is_range_max_set());
        assert!(!p.is_range_set());
    }

    #[test]
    fn test_is_at_limit() {
        let p = Parameter::with_range("x", -1.0, 1.0);
        assert!(p.is_at_limit(-1.0));
        assert!(p.is_at_limit(1.0));
        assert!(!p.is_at_limit(0.5));
        assert!(!Parameter::new("y").is_at_limit(0.0));
    }

    #[test]
    fn test_summary_line() {
        let mut p = Parameter::with_range("global.sig", 0.0, 10.0).global(true);
        p.set_kind(ParameterKind::Poi);
        p.fix_to(1.0);
        p.set_fit_result(1.0, 0.25);
        let s = p.to_string();
        assert!(s.starts_with("global.sig [ poi : global : fixed ]"));
        assert!(s.contains("best value 1 +- 0.25"));
    }
}
