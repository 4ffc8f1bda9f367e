//! Template composition.
//!
//! A [`TemplateComposer`] owns a library of named, immutable templates and
//! one working accumulator. Weighted templates are added into the
//! accumulator, then [`TemplateComposer::take_composition`] hands out an
//! independent copy and zeroes the accumulator again. The same buffer serves
//! the likelihood hot path, best-fit densities and Monte Carlo generation.

use ms_core::{Error, Result};
use ms_hist::{Histogram, HistogramFile};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, Poisson};
use std::collections::BTreeMap;
use std::path::Path;

/// State of the working accumulator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompositionState {
    /// No template was ever added; the accumulator has no binning yet.
    Unset,
    /// Accumulator materialized and all-zero.
    Idle,
    /// At least one template was added since the last reset or take.
    Accumulating,
}

/// Library of templates plus the working composed density.
pub struct TemplateComposer {
    name: String,
    templates: BTreeMap<String, Histogram>,
    working: Option<Histogram>,
    state: CompositionState,
    rng: StdRng,
}

impl std::fmt::Debug for TemplateComposer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TemplateComposer")
            .field("name", &self.name)
            .field("templates", &self.templates.keys().collect::<Vec<_>>())
            .field("state", &self.state)
            .finish()
    }
}

impl TemplateComposer {
    /// Empty composer with an entropy-seeded generator.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            templates: BTreeMap::new(),
            working: None,
            state: CompositionState::Unset,
            rng: StdRng::from_entropy(),
        }
    }

    /// Composer name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Reseed the generator used for Monte Carlo realizations.
    pub fn set_seed(&mut self, seed: u64) {
        self.rng = StdRng::seed_from_u64(seed);
    }

    /// Add `hist` to the library under `name`.
    ///
    /// Fails if `name` is taken or if the binning differs from the templates
    /// already loaded.
    pub fn load_template(&mut self, name: impl Into<String>, mut hist: Histogram) -> Result<()> {
        let name = name.into();
        if self.templates.contains_key(&name) {
            return Err(Error::Validation(format!(
                "template '{}' already loaded in '{}'",
                name, self.name
            )));
        }
        if let Some(first) = self.templates.values().next() {
            first.check_same_binning(&hist)?;
        }
        hist.set_name(name.clone());
        log::debug!("{}: loaded template '{}' ({} cells)", self.name, name, hist.n_cells());
        self.templates.insert(name, hist);
        Ok(())
    }

    /// Load histogram `hist_name` from the JSON file at `path` as template
    /// `name`, optionally projected onto the ordered axes `projection`.
    pub fn load_template_from_file(
        &mut self,
        path: impl AsRef<Path>,
        hist_name: &str,
        name: &str,
        projection: Option<&[usize]>,
    ) -> Result<()> {
        let file = HistogramFile::read(path)?;
        let hist = file.get(hist_name)?;
        let hist = match projection {
            Some(dims) => hist.projection(dims, name)?,
            None => hist.clone(),
        };
        self.load_template(name, hist)
    }

    /// Template `name`.
    pub fn template(&self, name: &str) -> Result<&Histogram> {
        self.templates.get(name).ok_or_else(|| Error::UnknownTemplate(format!("{} in '{}'", name, self.name)))
    }

    /// Whether template `name` is loaded.
    pub fn has_template(&self, name: &str) -> bool {
        self.templates.contains_key(name)
    }

    /// Loaded template names.
    pub fn template_names(&self) -> impl Iterator<Item = &str> {
        self.templates.keys().map(String::as_str)
    }

    /// Scale every template to unit integral.
    pub fn normalize(&mut self, respect_range: bool) -> Result<()> {
        for hist in self.templates.values_mut() {
            hist.normalize(respect_range)?;
        }
        Ok(())
    }

    /// Restrict axis `dim` of every template to `[min, max]`.
    ///
    /// Templates without that axis are left untouched.
    pub fn set_range_user(&mut self, min: f64, max: f64, dim: usize) -> Result<()> {
        for hist in self.templates.values_mut().chain(self.working.as_mut()) {
            if dim < hist.n_dims() {
                hist.set_range_user(dim, min, max)?;
            }
        }
        Ok(())
    }

    /// Merge `ngroup[d]` adjacent bins along every axis `d` of every template.
    ///
    /// Discards the working accumulator since its binning no longer matches.
    pub fn rebin(&mut self, ngroup: &[usize]) -> Result<()> {
        let mut rebinned = BTreeMap::new();
        for (name, hist) in &self.templates {
            rebinned.insert(name.clone(), hist.rebinned(ngroup)?);
        }
        self.templates = rebinned;
        self.working = None;
        self.state = CompositionState::Unset;
        Ok(())
    }

    /// Current accumulator state.
    pub fn state(&self) -> CompositionState {
        self.state
    }

    /// Add `weight * template[name]` into the accumulator.
    pub fn add_to_composition(&mut self, name: &str, weight: f64) -> Result<()> {
        let template = self
            .templates
            .get(name)
            .ok_or_else(|| Error::UnknownTemplate(format!("{} in '{}'", name, self.name)))?;
        let working = self.working.get_or_insert_with(|| template.zeros_like("composition"));
        working.add_scaled(template, weight)?;
        self.state = CompositionState::Accumulating;
        Ok(())
    }

    /// Copy of the accumulator labelled `label`; the accumulator is zeroed.
    ///
    /// Taking twice without adding in between yields an all-zero density.
    pub fn take_composition(&mut self, label: &str) -> Result<Histogram> {
        let working = self.working.as_mut().ok_or_else(|| {
            Error::Computation(format!("'{}': nothing was ever composed", self.name))
        })?;
        let mut out = working.clone();
        out.set_name(label);
        working.reset();
        self.state = CompositionState::Idle;
        Ok(out)
    }

    /// Zero the accumulator in place, keeping its binning.
    pub fn reset_composition(&mut self) {
        if let Some(w) = self.working.as_mut() {
            w.reset();
            self.state = CompositionState::Idle;
        }
    }

    /// Sample a synthetic dataset from the accumulator.
    ///
    /// The accumulator is read as an un-normalized rate map and is left
    /// untouched. The number of events is `expected` truncated to an
    /// integer, or a Poisson draw with mean `expected` when
    /// `poisson_fluctuation` is set. Events are drawn over every regular bin,
    /// ignoring user ranges; the returned counts keep the accumulator's
    /// binning and ranges.
    pub fn draw_monte_carlo_realization(
        &mut self,
        expected: f64,
        poisson_fluctuation: bool,
    ) -> Result<Histogram> {
        let working = self.working.as_ref().ok_or_else(|| {
            Error::Computation(format!("'{}': nothing was composed to sample from", self.name))
        })?;
        if !(expected.is_finite() && expected >= 0.0) {
            return Err(Error::Validation(format!("invalid expected count {expected}")));
        }

        let n_events = if poisson_fluctuation && expected > 0.0 {
            let pois = Poisson::new(expected)
                .map_err(|e| Error::Computation(format!("Poisson({expected}): {e}")))?;
            pois.sample(&mut self.rng) as u64
        } else {
            expected as u64
        };

        let mut realization = working.zeros_like("realization");
        if n_events == 0 {
            return Ok(realization);
        }
        let sampler = working.sampler().ok_or_else(|| {
            Error::Computation(format!("'{}': composed density has no positive bin", self.name))
        })?;
        for _ in 0..n_events {
            let point = sampler.sample(&mut self.rng);
            realization.fill(&point, 1.0)?;
        }
        log::debug!("{}: drew {} events (expected {})", self.name, n_events, expected);
        Ok(realization)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ms_hist::Axis;

    fn two_bin(name: &str, a: f64, b: f64) -> Histogram {
        let mut h = Histogram::new(name, vec![Axis::uniform(2, 0.0, 2.0).unwrap()]).unwrap();
        h.set_bin_content(&[1], a).unwrap();
        h.set_bin_content(&[2], b).unwrap();
        h
    }

    fn composer() -> TemplateComposer {
        let mut c = TemplateComposer::new("ds");
        c.load_template("A", two_bin("x", 1.0, 0.0)).unwrap();
        c.load_template("B", two_bin("y", 0.0, 1.0)).unwrap();
        c
    }

    #[test]
    fn test_load_rejects_duplicates_and_shapes() {
        let mut c = composer();
        assert!(c.load_template("A", two_bin("z", 1.0, 1.0)).is_err());
        let other = Histogram::new("o", vec![Axis::uniform(3, 0.0, 2.0).unwrap()]).unwrap();
        assert!(matches!(c.load_template("C", other), Err(Error::ShapeMismatch(_))));
        assert_eq!(c.template("A").unwrap().name(), "A");
        assert!(matches!(c.template("Z"), Err(Error::UnknownTemplate(_))));
    }

    #[test]
    fn test_compose_take_consumes_once() {
        let mut c = composer();
        assert_eq!(c.state(), CompositionState::Unset);
        assert!(c.take_composition("x").is_err());

        c.add_to_composition("A", 10.0).unwrap();
        c.add_to_composition("B", 5.0).unwrap();
        assert_eq!(c.state(), CompositionState::Accumulating);

        let first = c.take_composition("expected").unwrap();
        assert_eq!(first.name(), "expected");
        assert_relative_eq!(first.bin_content(&[1]).unwrap(), 10.0);
        assert_relative_eq!(first.bin_content(&[2]).unwrap(), 5.0);
        assert_eq!(c.state(), CompositionState::Idle);

        let second = c.take_composition("again").unwrap();
        assert!(second.contents().iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_reset_composition() {
        let mut c = composer();
        c.reset_composition();
        assert_eq!(c.state(), CompositionState::Unset);
        c.add_to_composition("A", 3.0).unwrap();
        c.reset_composition();
        assert_eq!(c.state(), CompositionState::Idle);
        c.add_to_composition("B", 2.0).unwrap();
        let h = c.take_composition("h").unwrap();
        assert_eq!(h.bin_content(&[1]).unwrap(), 0.0);
        assert_eq!(h.bin_content(&[2]).unwrap(), 2.0);
        assert!(c.add_to_composition("missing", 1.0).is_err());
    }

    #[test]
    fn test_monte_carlo_without_fluctuation() {
        let mut c = composer();
        c.set_seed(42);
        c.add_to_composition("A", 30.0).unwrap();
        c.add_to_composition("B", 10.0).unwrap();
        let data = c.draw_monte_carlo_realization(40.7, false).unwrap();
        assert_relative_eq!(data.integral(false), 40.0);
        // accumulator is left for the caller
        assert_eq!(c.state(), CompositionState::Accumulating);
        assert!(data.bin_content(&[1]).unwrap() > data.bin_content(&[2]).unwrap());
        assert_eq!(data.bin_content(&[0]).unwrap(), 0.0);
        assert_eq!(data.bin_content(&[3]).unwrap(), 0.0);
    }

    #[test]
    fn test_monte_carlo_is_reproducible() {
        let draw = || {
            let mut c = composer();
            c.set_seed(7);
            c.add_to_composition("A", 50.0).unwrap();
            c.add_to_composition("B", 50.0).unwrap();
            c.draw_monte_carlo_realization(100.0, true).unwrap()
        };
        assert_eq!(draw(), draw());
    }

    #[test]
    fn test_monte_carlo_requires_composition() {
        let mut c = composer();
        assert!(c.draw_monte_carlo_realization(10.0, false).is_err());
        c.add_to_composition("A", 0.0).unwrap();
        assert!(c.draw_monte_carlo_realization(10.0, false).is_err());
        assert_eq!(c.draw_monte_carlo_realization(0.0, true).unwrap().integral(false), 0.0);
    }

    #[test]
    fn test_rebin_and_normalize() {
        let mut c = TemplateComposer::new("ds");
        let mut h = Histogram::new("t", vec![Axis::uniform(4, 0.0, 4.0).unwrap()]).unwrap();
        for b in 1..=4 {
            h.set_bin_content(&[b], 1.0).unwrap();
        }
        c.load_template("T", h).unwrap();
        c.add_to_composition("T", 1.0).unwrap();
        c.rebin(&[2]).unwrap();
        assert_eq!(c.state(), CompositionState::Unset);
        assert_eq!(c.template("T").unwrap().axis(0).unwrap().n_bins(), 2);

        c.set_range_user(0.0, 2.0, 0).unwrap();
        c.normalize(true).unwrap();
        assert_relative_eq!(c.template("T").unwrap().integral(true), 1.0, epsilon = 1e-12);
        assert_relative_eq!(c.template("T").unwrap().integral(false), 2.0, epsilon = 1e-12);
    }
}
