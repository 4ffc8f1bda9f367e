//! Profile likelihood scans.
//!
//! A profile fixes one parameter at a sequence of trial values around its
//! best fit and re-minimizes all the others at each of them. The resulting
//! curve is shifted so that its lowest point sits at zero.

use crate::minimizer::{Minimizer, MinimizerStep};
use ms_core::{Error, Parameter, Result};
use serde::{Deserialize, Serialize};
use statrs::distribution::{ChiSquared, ContinuousCDF};

/// Single point in a profile likelihood scan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfilePoint {
    /// Trial value of the profiled parameter.
    pub value: f64,
    /// Minimized NLL at `value`, relative to the scan minimum.
    pub delta_nll: f64,
    /// Status of the last minimizer step at this point.
    pub status: i32,
}

/// Profile likelihood curve of one parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileCurve {
    /// Fully-qualified name of the profiled parameter.
    pub parameter: String,
    /// Lowest NLL seen during the scan.
    pub min_nll: f64,
    /// Points sorted by value.
    pub points: Vec<ProfilePoint>,
}

impl ProfileCurve {
    /// Smallest and largest scanned values with `delta_nll <= level`.
    pub fn interval(&self, level: f64) -> Option<(f64, f64)> {
        let inside = self.points.iter().filter(|p| p.delta_nll <= level).map(|p| p.value);
        let lo = inside.clone().fold(f64::INFINITY, f64::min);
        let hi = inside.fold(f64::NEG_INFINITY, f64::max);
        if lo <= hi { Some((lo, hi)) } else { None }
    }
}

/// Scan cut-off for confidence level `cl`: the chi-square quantile with one
/// degree of freedom.
pub fn delta_nll_for_cl(cl: f64) -> Result<f64> {
    if !(cl > 0.0 && cl < 1.0) {
        return Err(Error::Validation(format!("confidence level must be in (0, 1), got {cl}")));
    }
    let chi2 = ChiSquared::new(1.0).map_err(|e| Error::Computation(e.to_string()))?;
    Ok(chi2.inverse_cdf(cl))
}

/// Runs profile scans with a fixed minimization-step sequence.
pub struct ProfileScanner<'a> {
    minimizer: &'a mut Minimizer,
    steps: &'a [MinimizerStep],
}

impl<'a> ProfileScanner<'a> {
    /// Scanner re-minimizing with `steps` at every trial value.
    pub fn new(minimizer: &'a mut Minimizer, steps: &'a [MinimizerStep]) -> Self {
        Self { minimizer, steps }
    }

    /// Profile the parameter `target` until the NLL rises by more than
    /// `delta_nll` on both sides, with `n_points` steps per two best-fit
    /// errors.
    ///
    /// The registry is restored afterwards: best-fit values and errors of
    /// every parameter and the full state of `target`. The minimizer's
    /// status, failure count and engine statistics are restored too, so
    /// [`Minimizer::fit_result`] still describes the fit.
    pub fn profile(&mut self, target: &str, delta_nll: f64, n_points: usize) -> Result<ProfileCurve> {
        if n_points == 0 {
            return Err(Error::Validation("profile needs at least one point".to_string()));
        }
        let registry = self.minimizer.registry();
        let (saved, target_saved) = {
            let reg = registry.borrow();
            let target_saved =
                reg.get(target).cloned().ok_or_else(|| Error::UnknownParameter(target.to_string()))?;
            let saved: Vec<(f64, f64)> = reg.iter().map(|p| (p.best_fit(), p.best_fit_error())).collect();
            (saved, target_saved)
        };

        let best = target_saved.best_fit();
        let step = 2.0 * target_saved.best_fit_error() / n_points as f64;
        if !(step.is_finite() && step > 0.0) {
            return Err(Error::Computation(format!(
                "cannot profile '{}': best-fit error {} gives no step",
                target,
                target_saved.best_fit_error()
            )));
        }

        let fit_state = self.minimizer.fit_state();
        let result = self.scan(target, &target_saved, best, step, delta_nll, n_points);
        self.minimizer.restore_fit_state(fit_state);

        {
            let mut reg = registry.borrow_mut();
            for (par, &(value, error)) in reg.iter_mut().zip(&saved) {
                par.set_fit_result(value, error);
            }
            if let Some(par) = reg.get_mut(target) {
                *par = target_saved;
            }
        }

        let (mut points, min_nll) = result?;
        for p in points.iter_mut() {
            p.delta_nll -= min_nll;
        }
        points.sort_by(|a, b| a.value.total_cmp(&b.value));
        Ok(ProfileCurve { parameter: target.to_string(), min_nll, points })
    }

    /// Profile every parameter that is not fixed.
    pub fn profile_all(&mut self, delta_nll: f64, n_points: usize) -> Result<Vec<ProfileCurve>> {
        let names: Vec<String> = self
            .minimizer
            .registry()
            .borrow()
            .iter()
            .filter(|p| !p.is_fixed())
            .map(|p| p.name().to_string())
            .collect();
        let mut curves = Vec::with_capacity(names.len());
        for name in names {
            curves.push(self.profile(&name, delta_nll, n_points)?);
        }
        Ok(curves)
    }

    /// Walk right then left from `best`; returns raw points and the minimum.
    fn scan(
        &mut self,
        target: &str,
        par: &Parameter,
        best: f64,
        step: f64,
        delta_nll: f64,
        n_points: usize,
    ) -> Result<(Vec<ProfilePoint>, f64)> {
        let mut points = Vec::new();
        let mut abs_min = f64::INFINITY;
        let cap = 10 * n_points as i64;

        for direction in [1i64, -1] {
            self.minimizer.sync_fit_parameters(true)?;
            let mut counter: i64 = if direction > 0 { 0 } else { -1 };
            loop {
                let value = best + counter as f64 * step;
                if !self.scan_point(target, par, value, delta_nll, &mut points, &mut abs_min)? {
                    break;
                }
                if counter.abs() >= cap {
                    break;
                }
                counter += direction;
            }
        }
        Ok((points, abs_min))
    }

    /// Minimize at `value`; false once outside the range or past the cut-off.
    fn scan_point(
        &mut self,
        target: &str,
        par: &Parameter,
        value: f64,
        delta_nll: f64,
        points: &mut Vec<ProfilePoint>,
        abs_min: &mut f64,
    ) -> Result<bool> {
        if (par.is_range_min_set() && value < par.range_min())
            || (par.is_range_max_set() && value > par.range_max())
        {
            return Ok(false);
        }
        self.minimizer
            .registry()
            .borrow_mut()
            .get_mut(target)
            .ok_or_else(|| Error::UnknownParameter(target.to_string()))?
            .fix_to(value);

        let status = self.minimizer.minimize_steps(self.steps)?;
        let nll = self.minimizer.min_nll();
        points.push(ProfilePoint { value, delta_nll: nll, status });
        if nll < *abs_min {
            *abs_min = nll;
        }
        if status != 0 {
            log::warn!("profile of '{}': minimizer status {} at {}", target, status, value);
        }
        Ok(nll - *abs_min <= delta_nll)
    }
}
