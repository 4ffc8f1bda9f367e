//! mstats CLI

use anyhow::Result;
use clap::{Parser, Subcommand};
use ms_hist::HistogramFile;
use ms_inference::{FitTable, ProfileScanner, delta_nll_for_cl};
use std::path::{Path, PathBuf};

mod analysis;
mod config;

use analysis::{
    Analysis, best_fit_densities, dataset_from_file, dataset_from_mc, initialize_analysis,
    profiles_json,
};
use config::AnalysisConfig;

#[derive(Parser)]
#[command(name = "mstats")]
#[command(about = "mstats - binned maximum-likelihood fits of template compositions")]
#[command(version)]
struct Cli {
    /// Log verbosity level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "warn")]
    log_level: tracing::Level,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fit external data or one Monte Carlo realization
    Fit {
        /// Analysis config (JSON)
        config: PathBuf,

        /// Histogram file with one data histogram per dataset. Without it,
        /// data are generated from the MC block.
        #[arg(long)]
        data: Option<PathBuf>,

        /// Output file for the report (pretty JSON). Defaults to
        /// `MC.outputFile`, then `<config>.results.json`.
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Profile every free parameter after the fit.
        #[arg(long)]
        profiles: bool,

        /// Profile steps per two best-fit errors
        #[arg(long, default_value = "10")]
        profile_points: usize,

        /// Confidence level setting the profile cut-off
        #[arg(long, default_value = "0.95")]
        profile_cl: f64,
    },

    /// Fit every Monte Carlo realization and append one row per fit to a
    /// result table
    Batch {
        /// Analysis config (JSON)
        config: PathBuf,

        /// Fit this histogram file once instead of generating data.
        #[arg(long)]
        data: Option<PathBuf>,

        /// Output file for the result table. Defaults to `MC.outputFile`,
        /// then `<config>.results.json`.
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Append to an existing table with the same columns.
        #[arg(long)]
        append: bool,

        /// Profile every free parameter after each fit.
        #[arg(long)]
        profiles: bool,

        /// Profile steps per two best-fit errors
        #[arg(long, default_value = "10")]
        profile_points: usize,

        /// Confidence level setting the profile cut-off
        #[arg(long, default_value = "0.95")]
        profile_cl: f64,

        /// Also write every generated dataset to `<output>-datasets.json`.
        #[arg(long)]
        store_datasets: bool,
    },
}

struct ProfileOptions {
    enabled: bool,
    points: usize,
    cl: f64,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt().with_max_level(cli.log_level).with_target(false).init();

    match cli.command {
        Commands::Fit { config, data, output, profiles, profile_points, profile_cl } => cmd_fit(
            &config,
            data.as_ref(),
            output.as_ref(),
            &ProfileOptions { enabled: profiles, points: profile_points, cl: profile_cl },
        ),
        Commands::Batch {
            config,
            data,
            output,
            append,
            profiles,
            profile_points,
            profile_cl,
            store_datasets,
        } => cmd_batch(
            &config,
            data.as_ref(),
            output.as_ref(),
            append,
            &ProfileOptions { enabled: profiles, points: profile_points, cl: profile_cl },
            store_datasets,
        ),
    }
}

fn load(config_path: &Path) -> Result<(AnalysisConfig, Analysis)> {
    let config = AnalysisConfig::read(config_path)?;
    tracing::info!(
        path = %config_path.display(),
        datasets = config.fitting_model.data_sets.len(),
        "config loaded"
    );
    let config_dir = config_path.parent().unwrap_or_else(|| Path::new("."));
    let analysis = initialize_analysis(&config, config_dir)?;
    Ok((config, analysis))
}

fn run_profiles(analysis: &mut Analysis, options: &ProfileOptions) -> Result<Option<serde_json::Value>> {
    if !options.enabled {
        return Ok(None);
    }
    let delta = delta_nll_for_cl(options.cl)?;
    let steps = analysis.steps.clone();
    let curves = ProfileScanner::new(&mut analysis.minimizer, &steps).profile_all(delta, options.points)?;
    tracing::info!(parameters = curves.len(), delta_nll = delta, "profiles complete");
    Ok(Some(profiles_json(&curves, delta)))
}

fn cmd_fit(
    config_path: &Path,
    data: Option<&PathBuf>,
    output: Option<&PathBuf>,
    profiles: &ProfileOptions,
) -> Result<()> {
    let (config, mut analysis) = load(config_path)?;
    match data {
        Some(path) => dataset_from_file(&mut analysis, &config, path)?,
        None => {
            dataset_from_mc(&mut analysis, &config)?;
        }
    }

    let steps = analysis.steps.clone();
    let status = analysis.minimizer.minimize_steps(&steps)?;
    let result = analysis.minimizer.fit_result();
    tracing::info!(nll = result.min_nll, status, edm = result.edm, "fit complete");
    print!("{result}");

    let profiles = run_profiles(&mut analysis, profiles)?;
    let output_json = serde_json::json!({
        "fit": result,
        "converged": result.converged(),
        "densities": best_fit_densities(&analysis)?,
        "profiles": profiles,
    });

    let path = output.cloned().unwrap_or_else(|| config.default_output(config_path));
    write_json(&path, output_json)?;
    tracing::info!(path = %path.display(), "report written");
    Ok(())
}

fn cmd_batch(
    config_path: &Path,
    data: Option<&PathBuf>,
    output: Option<&PathBuf>,
    append: bool,
    profiles: &ProfileOptions,
    store_datasets: bool,
) -> Result<()> {
    let (config, mut analysis) = load(config_path)?;
    let realizations = match data {
        Some(path) => {
            dataset_from_file(&mut analysis, &config, path)?;
            1
        }
        None => match &config.mc {
            Some(mc) => mc.realizations,
            None => anyhow::bail!("batch without --data needs an MC block"),
        },
    };

    let path = output.cloned().unwrap_or_else(|| config.default_output(config_path));
    let names = analysis.registry.borrow().names();
    let mut table = FitTable::open_or_create(&path, &names, append)?;
    let mut stored = HistogramFile::new();
    let mut all_profiles = Vec::new();
    let steps = analysis.steps.clone();

    for i in 0..realizations {
        if data.is_none() {
            for mut hist in dataset_from_mc(&mut analysis, &config)? {
                if store_datasets {
                    hist.set_name(format!("{}_{}", hist.name(), i));
                    stored.insert(hist);
                }
            }
        }
        let status = analysis.minimizer.minimize_steps(&steps)?;
        let result = analysis.minimizer.fit_result();
        table.append(&result)?;
        tracing::info!(realization = i, status, nll = result.min_nll, "realization processed");

        if let Some(curves) = run_profiles(&mut analysis, profiles)? {
            all_profiles.push(serde_json::json!({ "realization": i, "profiles": curves }));
        }
    }

    table.write(&path)?;
    tracing::info!(rows = table.len(), path = %path.display(), "fit table written");
    println!("{} fits, {} failed minimizer calls; table: {}", realizations, analysis.minimizer.n_fails(), path.display());

    if store_datasets && !stored.is_empty() {
        let datasets_path = sibling(&path, "datasets");
        stored.write(&datasets_path)?;
        tracing::info!(count = stored.len(), path = %datasets_path.display(), "datasets written");
    }
    if profiles.enabled {
        write_json(&sibling(&path, "profiles"), serde_json::Value::Array(all_profiles))?;
    }
    Ok(())
}

/// `<dir>/<stem>-<suffix>.json` next to `path`.
fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let stem = path.file_stem().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default();
    path.with_file_name(format!("{stem}-{suffix}.json"))
}

fn write_json(path: &Path, value: serde_json::Value) -> Result<()> {
    std::fs::write(path, serde_json::to_string_pretty(&value)?)?;
    Ok(())
}
