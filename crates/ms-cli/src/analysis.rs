//! Analysis assembly: config -> models -> minimizer, plus datasets from
//! file or Monte Carlo.

use anyhow::{Context, Result, bail};
use ms_core::{Model, Parameter, ParameterRegistry, SharedRegistry};
use ms_hist::{Histogram, HistogramFile};
use ms_inference::{
    BinnedLikelihoodModel, ExponentialPull, GaussianPull, Minimizer, MinimizerStep, ModelKind,
    ProfileCurve, TemplateComposer,
};
use serde_json::json;
use std::path::Path;

use crate::config::{AnalysisConfig, DataSetConfig, PullConfig, resolve_pdf_path};

/// Minimizer over every configured dataset and pull, with its step sequence.
pub struct Analysis {
    pub registry: SharedRegistry,
    pub minimizer: Minimizer,
    pub steps: Vec<MinimizerStep>,
}

/// Build one binned model per dataset and one pull model per pull, then
/// synchronize the engine once.
pub fn initialize_analysis(config: &AnalysisConfig, config_dir: &Path) -> Result<Analysis> {
    let mut models: Vec<ModelKind> = Vec::new();

    for (ds_name, ds) in config.fitting_model.data_sets.iter() {
        let composer = build_composer(ds_name, ds, config, config_dir)?;
        let mut model = BinnedLikelihoodModel::new(ds_name, ds.exposure, composer);
        for (c_name, c) in ds.components.iter() {
            let mut par = Parameter::with_range(c_name, c.range[0], c.range[1]).global(c.global);
            par.set_start_value(c.ref_val);
            if c.fit_step != 0.0 {
                par.set_start_step(c.fit_step);
            }
            par.set_fixed(c.fixed);
            model.add_component(par).with_context(|| format!("dataset '{ds_name}'"))?;
        }
        models.push(model.into());
    }

    for (name, pull) in config.all_pulls() {
        let model: ModelKind = match *pull {
            PullConfig::Gauss { centroid, sigma } => GaussianPull::new(name, name, centroid, sigma)?.into(),
            PullConfig::Exp { limit, quantile, offset } => {
                ExponentialPull::new(name, name, limit, quantile, offset)?.into()
            }
        };
        models.push(model);
    }

    let registry = ParameterRegistry::shared();
    let mut minimizer = Minimizer::new(registry.clone(), models)?;
    minimizer.initialize_engine(0, 0.5);
    minimizer.sync_fit_parameters(false)?;
    tracing::info!(
        models = minimizer.models().len(),
        parameters = registry.borrow().len(),
        "analysis initialized"
    );
    Ok(Analysis { registry, minimizer, steps: config.steps() })
}

fn build_composer(
    ds_name: &str,
    ds: &DataSetConfig,
    config: &AnalysisConfig,
    config_dir: &Path,
) -> Result<TemplateComposer> {
    let mut composer = TemplateComposer::new(ds_name);
    if let Some(mc) = &config.mc {
        composer.set_seed(mc.seed);
    }

    for (c_name, c) in ds.components.iter() {
        let path = resolve_pdf_path(&c.pdf[0], config_dir);
        composer
            .load_template_from_file(&path, &c.pdf[1], c_name, ds.project_on_axis.as_deref())
            .with_context(|| format!("dataset '{ds_name}': loading '{}' from {}", c.pdf[1], path.display()))?;
    }

    if !ds.axis.is_empty() {
        let n_dims = first_template(&composer)?.n_dims();
        let factors = ds.rebin_factors(n_dims)?;
        if factors.iter().any(|&f| f != 1) {
            composer.rebin(&factors)?;
        }
        for (axis, lo, hi) in ds.ranges()? {
            composer.set_range_user(lo, hi, axis)?;
        }
    }

    if let Some(in_range) = ds.normalize_pdf_in_user_range {
        composer.normalize(in_range)?;
    }
    Ok(composer)
}

fn first_template(composer: &TemplateComposer) -> Result<&Histogram> {
    let Some(name) = composer.template_names().next() else {
        bail!("'{}' has no templates", composer.name());
    };
    Ok(composer.template(name)?)
}

/// Bring an external dataset onto the template binning: project and rebin
/// it as the templates were unless it already matches, then take over the
/// templates' user ranges.
fn conform_dataset(mut data: Histogram, ds: &DataSetConfig, template: &Histogram) -> Result<Histogram> {
    if !data.same_binning(template) {
        if let Some(dims) = &ds.project_on_axis {
            data = data.projection(dims, data.name().to_string())?;
        }
        let factors = ds.rebin_factors(data.n_dims())?;
        if factors.iter().any(|&f| f != 1) {
            data = data.rebinned(&factors)?;
        }
    }
    data.copy_ranges_from(template)?;
    Ok(data)
}

/// Install data read from `path`: each binned model takes the histogram
/// named after it.
pub fn dataset_from_file(analysis: &mut Analysis, config: &AnalysisConfig, path: &Path) -> Result<()> {
    tracing::info!(path = %path.display(), "loading input data");
    let file = HistogramFile::read(path)?;
    for model in analysis.minimizer.models_mut() {
        let Some(binned) = model.as_binned_mut() else { continue };
        let name = binned.core().name().to_string();
        let Some(ds) = config.fitting_model.data_sets.get(&name) else {
            bail!("dataset '{name}' is not configured");
        };
        let hist = file.get(&name).with_context(|| format!("data histogram for '{name}' not found"))?;
        let data = {
            let composer = binned.composer();
            let template = first_template(&composer)?;
            conform_dataset(hist.clone(), ds, template)?
        };
        binned.replace_dataset(data)?;
    }
    Ok(())
}

/// Draw a fresh dataset for every binned model at the configured injected
/// values; returns the generated histograms.
pub fn dataset_from_mc(analysis: &mut Analysis, config: &AnalysisConfig) -> Result<Vec<Histogram>> {
    let Some(mc) = &config.mc else {
        bail!("an MC block is required to generate data");
    };
    let mut generated = Vec::new();
    for model in analysis.minimizer.models_mut() {
        let Some(binned) = model.as_binned_mut() else { continue };
        let injected = config.injected_values(binned.core().name())?;
        let data = binned.draw_realization(&injected, mc.enable_poisson_fluctuations)?;
        binned.replace_dataset(data.clone())?;
        generated.push(data);
    }
    Ok(generated)
}

/// Best-fit densities of every binned model: the total and one entry per
/// component.
pub fn best_fit_densities(analysis: &Analysis) -> Result<serde_json::Value> {
    let registry = analysis.registry.borrow();
    let mut out = serde_json::Map::new();
    for model in analysis.minimizer.models() {
        let Some(binned) = model.as_binned() else { continue };
        let mut components = serde_json::Map::new();
        for name in binned.core().local_names() {
            let density = binned.best_fit_density(&registry, Some(name.as_str()))?;
            components.insert(name.clone(), serde_json::to_value(density)?);
        }
        let total = binned.best_fit_density(&registry, None)?;
        out.insert(
            binned.core().name().to_string(),
            json!({
                "total": total,
                "components": components,
                "data": binned.dataset(),
            }),
        );
    }
    Ok(serde_json::Value::Object(out))
}

/// Summary of profile curves with the interval at `delta_nll`.
pub fn profiles_json(curves: &[ProfileCurve], delta_nll: f64) -> serde_json::Value {
    let entries: Vec<serde_json::Value> = curves
        .iter()
        .map(|c| {
            let interval = c.interval(delta_nll).map(|(lo, hi)| vec![lo, hi]);
            json!({
                "parameter": c.parameter,
                "min_nll": c.min_nll,
                "interval": interval,
                "points": c.points,
            })
        })
        .collect();
    serde_json::Value::Array(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ms_hist::Axis;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn tmp_dir() -> std::path::PathBuf {
        let nanos = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_nanos();
        let dir = std::env::temp_dir().join(format!("mstats_analysis_{}_{}", std::process::id(), nanos));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn hist(name: &str, contents: &[f64]) -> Histogram {
        let n = contents.len();
        let mut h = Histogram::new(name, vec![Axis::uniform(n, 0.0, n as f64).unwrap()]).unwrap();
        for (i, &c) in contents.iter().enumerate() {
            h.set_bin_content(&[i + 1], c).unwrap();
        }
        h
    }

    fn write_templates(dir: &Path) {
        let mut file = HistogramFile::new();
        file.insert(hist("a", &[0.5, 0.5, 0.0, 0.0]));
        file.insert(hist("b", &[0.0, 0.0, 0.5, 0.5]));
        file.write(dir.join("templates.json")).unwrap();

        let mut data = HistogramFile::new();
        data.insert(hist("ds", &[6.0, 4.0, 3.0, 2.0]));
        data.write(dir.join("data.json")).unwrap();
    }

    fn config(extra_axis: &str) -> AnalysisConfig {
        let text = format!(
            r#"{{
            "fittingModel": {{
                "dataSets": {{
                    "ds": {{
                        "exposure": 1.0,
                        "components": {{
                            "A": {{ "global": true, "refVal": 5, "range": [0, 100], "fitStep": 0,
                                    "pdf": ["templates.json", "a"], "injVal": 30, "fixed": false }},
                            "B": {{ "global": false, "refVal": 5, "range": [0, 100], "fitStep": 0,
                                    "pdf": ["templates.json", "b"], "injVal": 10, "fixed": false }}
                        }}
                        {extra_axis}
                    }}
                }},
                "pulls": {{ "A": {{ "type": "gauss", "centroid": 10, "sigma": 3 }} }}
            }},
            "MinimizerSteps": {{
                "migrad": {{ "method": "MIGRAD", "resetMinuit": false, "maxCall": 10000, "tollerance": 0.1, "verbosity": 0 }}
            }},
            "MC": {{ "realizations": 1, "seed": 3, "enablePoissonFluctuations": false }}
        }}"#
        );
        let config: AnalysisConfig = serde_json::from_str(&text).unwrap();
        config.validate().unwrap();
        config
    }

    #[test]
    fn test_initialize_registers_everything() {
        let dir = tmp_dir();
        write_templates(&dir);
        let analysis = initialize_analysis(&config(""), &dir).unwrap();

        assert_eq!(analysis.minimizer.models().len(), 2);
        let reg = analysis.registry.borrow();
        assert_eq!(reg.names(), vec!["ds.B", "global.A"]);
        let a = reg.get("global.A").unwrap();
        assert_relative_eq!(a.start_value(), 5.0);
        assert_relative_eq!(a.start_step(), 1.0);
        assert!(a.is_global());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_rebin_and_range_apply_to_templates_and_data() {
        let dir = tmp_dir();
        write_templates(&dir);
        let config = config(r#", "axis": { "0": { "rebin": 2, "range": [0, 2] } }"#);
        let mut analysis = initialize_analysis(&config, &dir).unwrap();

        {
            let binned = analysis.minimizer.model("ds").unwrap().as_binned().unwrap();
            let composer = binned.composer();
            let a = composer.template("A").unwrap();
            assert_eq!(a.axes()[0].n_bins(), 2);
            assert_eq!(a.axes()[0].range(), (1, 1));
        }

        dataset_from_file(&mut analysis, &config, &dir.join("data.json")).unwrap();
        let binned = analysis.minimizer.model("ds").unwrap().as_binned().unwrap();
        let data = binned.dataset().unwrap();
        assert_eq!(data.axes()[0].n_bins(), 2);
        assert_relative_eq!(data.integral(true), 10.0);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_monte_carlo_data_follow_injection() {
        let dir = tmp_dir();
        write_templates(&dir);
        let config = config("");
        let mut analysis = initialize_analysis(&config, &dir).unwrap();
        let generated = dataset_from_mc(&mut analysis, &config).unwrap();
        assert_eq!(generated.len(), 1);
        assert_eq!(generated[0].name(), "ds");
        assert_relative_eq!(generated[0].integral(false), 40.0);

        let steps = analysis.steps.clone();
        assert_eq!(analysis.minimizer.minimize_steps(&steps).unwrap(), 0);
        // The pull at 10 drags A below what the A bins alone would give.
        let observed_a = generated[0].bin_content(&[1]).unwrap() + generated[0].bin_content(&[2]).unwrap();
        let a = analysis.registry.borrow().get("global.A").unwrap().best_fit();
        assert!(a > 10.0 && a < observed_a, "A = {a}, observed {observed_a}");

        let densities = best_fit_densities(&analysis).unwrap();
        assert!(densities["ds"]["components"]["A"].is_object());
        assert!(densities["ds"]["total"].is_object());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_missing_template_histogram_fails() {
        let dir = tmp_dir();
        write_templates(&dir);
        let mut file = HistogramFile::new();
        file.insert(hist("a", &[0.5, 0.5, 0.0, 0.0]));
        file.write(dir.join("templates.json")).unwrap();
        assert!(initialize_analysis(&config(""), &dir).is_err());
        std::fs::remove_dir_all(&dir).ok();
    }
}
