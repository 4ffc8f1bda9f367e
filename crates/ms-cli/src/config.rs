//! Analysis configuration (JSON) parsing + semantic validation.
//!
//! One config drives template loading, data generation, the minimizer step
//! sequence and the output location. Object order matters for datasets,
//! components and minimizer steps, so those maps keep document order.

use anyhow::{Result, bail};
use ms_inference::{MinimizationMethod, MinimizerStep};
use serde::de::{Deserializer, MapAccess, Visitor};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

/// Environment variable prefixed to every template file path.
pub const PDF_DIR_ENV: &str = "MSTATS_PDF_DIR";

/// JSON object that keeps its keys in document order.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderedMap<T>(Vec<(String, T)>);

impl<T> Default for OrderedMap<T> {
    fn default() -> Self {
        Self(Vec::new())
    }
}

impl<T> OrderedMap<T> {
    pub fn iter(&self) -> impl Iterator<Item = (&str, &T)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn get(&self, key: &str) -> Option<&T> {
        self.0.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

struct OrderedMapVisitor<T>(PhantomData<T>);

impl<'de, T: Deserialize<'de>> Visitor<'de> for OrderedMapVisitor<T> {
    type Value = OrderedMap<T>;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a JSON object")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> std::result::Result<Self::Value, A::Error> {
        let mut entries: Vec<(String, T)> = Vec::with_capacity(access.size_hint().unwrap_or(0));
        while let Some((key, value)) = access.next_entry::<String, T>()? {
            if entries.iter().any(|(k, _)| *k == key) {
                return Err(serde::de::Error::custom(format!("duplicate key '{key}'")));
            }
            entries.push((key, value));
        }
        Ok(OrderedMap(entries))
    }
}

impl<'de, T: Deserialize<'de>> Deserialize<'de> for OrderedMap<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        deserializer.deserialize_map(OrderedMapVisitor(PhantomData))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisConfig {
    pub fitting_model: FittingModel,
    /// Pulls may also sit at the top level.
    #[serde(default)]
    pub pulls: OrderedMap<PullConfig>,
    #[serde(rename = "MinimizerSteps")]
    pub minimizer_steps: OrderedMap<StepConfig>,
    #[serde(rename = "MC", default)]
    pub mc: Option<McConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FittingModel {
    pub data_sets: OrderedMap<DataSetConfig>,
    #[serde(default)]
    pub pulls: OrderedMap<PullConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataSetConfig {
    pub exposure: f64,
    pub components: OrderedMap<ComponentConfig>,
    #[serde(default)]
    pub project_on_axis: Option<Vec<usize>>,
    #[serde(default)]
    pub axis: OrderedMap<AxisConfig>,
    #[serde(default, rename = "normalizePDFInUserRange")]
    pub normalize_pdf_in_user_range: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentConfig {
    #[serde(default)]
    pub global: bool,
    pub ref_val: f64,
    pub range: [f64; 2],
    /// 0 means range width / 100.
    #[serde(default)]
    pub fit_step: f64,
    /// `[file, histogram name]`.
    pub pdf: [String; 2],
    #[serde(default)]
    pub inj_val: f64,
    #[allow(dead_code)]
    #[serde(default)]
    pub color: i32,
    #[serde(default)]
    pub fixed: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AxisConfig {
    #[serde(default)]
    pub range: Option<[f64; 2]>,
    #[serde(default)]
    pub rebin: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum PullConfig {
    Gauss {
        centroid: f64,
        sigma: f64,
    },
    Exp {
        limit: f64,
        quantile: f64,
        #[serde(default)]
        offset: f64,
    },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepConfig {
    pub method: MinimizationMethod,
    #[serde(default)]
    pub reset_minuit: bool,
    pub max_call: f64,
    /// Misspelled in the config format.
    pub tollerance: f64,
    #[serde(default)]
    pub verbosity: i32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct McConfig {
    pub realizations: usize,
    #[serde(default)]
    pub seed: u64,
    #[serde(default)]
    pub enable_poisson_fluctuations: bool,
    #[serde(default)]
    pub output_file: Option<String>,
}

impl AnalysisConfig {
    /// Parse and validate the config at `path`.
    pub fn read(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("cannot read config {}: {}", path.display(), e))?;
        let config: AnalysisConfig = serde_json::from_str(&text)
            .map_err(|e| anyhow::anyhow!("invalid config {}: {}", path.display(), e))?;
        config.validate()?;
        Ok(config)
    }

    /// Every pull, `fittingModel.pulls` first.
    pub fn all_pulls(&self) -> impl Iterator<Item = (&str, &PullConfig)> {
        self.fitting_model.pulls.iter().chain(self.pulls.iter())
    }

    /// Minimizer step sequence in config order.
    pub fn steps(&self) -> Vec<MinimizerStep> {
        self.minimizer_steps
            .iter()
            .map(|(name, s)| MinimizerStep {
                name: name.to_string(),
                method: s.method,
                reset: s.reset_minuit,
                max_calls: s.max_call as usize,
                tolerance: s.tollerance,
                verbosity: s.verbosity,
            })
            .collect()
    }

    /// Injected values of the components of dataset `name`.
    pub fn injected_values(&self, name: &str) -> Result<BTreeMap<String, f64>> {
        let Some(ds) = self.fitting_model.data_sets.get(name) else {
            bail!("dataset '{name}' is not configured");
        };
        Ok(ds.components.iter().map(|(c, cfg)| (c.to_string(), cfg.inj_val)).collect())
    }

    /// Where results go when no `--output` is given: `MC.outputFile`, else
    /// the config path with `.json` replaced by `.results.json`.
    pub fn default_output(&self, config_path: &Path) -> PathBuf {
        if let Some(file) = self.mc.as_ref().and_then(|mc| mc.output_file.as_ref()) {
            return PathBuf::from(file);
        }
        let stem = config_path.file_stem().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default();
        config_path.with_file_name(format!("{stem}.results.json"))
    }

    pub fn validate(&self) -> Result<()> {
        let data_sets = &self.fitting_model.data_sets;
        if data_sets.is_empty() {
            bail!("fittingModel.dataSets must not be empty");
        }
        let mut globals: Vec<&str> = Vec::new();
        for (ds_name, ds) in data_sets.iter() {
            if !(ds.exposure.is_finite() && ds.exposure > 0.0) {
                bail!("dataset '{ds_name}': exposure must be > 0");
            }
            if ds.components.is_empty() {
                bail!("dataset '{ds_name}': components must not be empty");
            }
            if let Some(dims) = &ds.project_on_axis {
                if dims.is_empty() {
                    bail!("dataset '{ds_name}': projectOnAxis must not be empty");
                }
            }
            for (axis, cfg) in ds.axis.iter() {
                if axis.parse::<usize>().is_err() {
                    bail!("dataset '{ds_name}': axis key '{axis}' is not an axis index");
                }
                if let Some([lo, hi]) = cfg.range {
                    if !(lo < hi) {
                        bail!("dataset '{ds_name}': axis {axis} range must satisfy min < max");
                    }
                }
                if cfg.rebin == Some(0) {
                    bail!("dataset '{ds_name}': axis {axis} rebin must be >= 1");
                }
            }
            for (c_name, c) in ds.components.iter() {
                let [lo, hi] = c.range;
                if !(lo < hi) {
                    bail!("dataset '{ds_name}', component '{c_name}': range must satisfy min < max");
                }
                if c.pdf.iter().any(|s| s.is_empty()) {
                    bail!("dataset '{ds_name}', component '{c_name}': pdf needs [file, histogram]");
                }
                if c.fit_step < 0.0 {
                    bail!("dataset '{ds_name}', component '{c_name}': fitStep must be >= 0");
                }
                if c.global {
                    globals.push(c_name);
                }
            }
        }

        for (name, _) in self.pulls.iter() {
            if self.fitting_model.pulls.get(name).is_some() {
                bail!("pull '{name}' is defined both in fittingModel.pulls and at the top level");
            }
        }
        for (name, pull) in self.all_pulls() {
            match *pull {
                PullConfig::Gauss { sigma, .. } => {
                    if !(sigma > 0.0) {
                        bail!("pull '{name}': sigma must be > 0");
                    }
                }
                PullConfig::Exp { limit, quantile, offset } => {
                    if !(quantile > 0.0 && quantile < 1.0) {
                        bail!("pull '{name}': quantile must be in (0, 1)");
                    }
                    if !(limit > offset) {
                        bail!("pull '{name}': limit must be > offset");
                    }
                }
            }
            if !globals.contains(&name) {
                bail!("pull '{name}': target must be a global component of some dataset");
            }
        }

        if self.minimizer_steps.is_empty() {
            bail!("MinimizerSteps must not be empty");
        }
        for (name, step) in self.minimizer_steps.iter() {
            if !(step.max_call >= 1.0) {
                bail!("minimizer step '{name}': maxCall must be > 0");
            }
            if !(step.tollerance > 0.0) {
                bail!("minimizer step '{name}': tollerance must be > 0");
            }
        }

        if let Some(mc) = &self.mc {
            if mc.realizations == 0 {
                bail!("MC.realizations must be > 0");
            }
        }
        Ok(())
    }
}

impl DataSetConfig {
    /// Per-axis rebin factors for a histogram with `n_dims` axes.
    pub fn rebin_factors(&self, n_dims: usize) -> Result<Vec<usize>> {
        let mut factors = vec![1usize; n_dims];
        for (axis, cfg) in self.axis.iter() {
            let Some(factor) = cfg.rebin else { continue };
            let idx: usize = axis.parse()?;
            if idx >= n_dims {
                bail!("axis {idx} out of range for {n_dims}-dimensional templates");
            }
            factors[idx] = factor;
        }
        Ok(factors)
    }

    /// User ranges as `(axis, min, max)`.
    pub fn ranges(&self) -> Result<Vec<(usize, f64, f64)>> {
        let mut out = Vec::new();
        for (axis, cfg) in self.axis.iter() {
            if let Some([lo, hi]) = cfg.range {
                out.push((axis.parse()?, lo, hi));
            }
        }
        Ok(out)
    }
}

/// Resolve a template file path: prefixed by `MSTATS_PDF_DIR` when set,
/// otherwise relative paths are taken from the config directory.
pub fn resolve_pdf_path(file: &str, config_dir: &Path) -> PathBuf {
    match std::env::var(PDF_DIR_ENV) {
        Ok(dir) if !dir.is_empty() => Path::new(&dir).join(file),
        _ => {
            let p = Path::new(file);
            if p.is_absolute() { p.to_path_buf() } else { config_dir.join(p) }
        }
    }
}
