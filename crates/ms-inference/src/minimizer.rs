//! Joint minimization of a set of models over a shared parameter registry.
//!
//! The [`Minimizer`] owns the models and a [`FitEngine`]. Before every
//! minimization it diffs the registry against the snapshot taken at the
//! previous synchronization and forwards only what changed (new
//! definitions, fixing, releasing, new start values), so the engine's
//! internal state survives between steps of a fit sequence.

use crate::engine::{EngineStats, FitEngine, MinimizationMethod, STATUS_OK};
use crate::models::ModelKind;
use crate::optimizer::ObjectiveFunction;
use ms_core::{
    Error, FitResult, Model, Parameter, ParameterEstimate, ParameterRegistry, Result, SharedRegistry,
};
use serde::{Deserialize, Serialize};
use std::fmt;

/// One step of a minimization sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MinimizerStep {
    /// Label used in logs
    pub name: String,
    /// Method to run
    pub method: MinimizationMethod,
    /// Redefine every free parameter from the registry before running
    pub reset: bool,
    /// Call budget
    pub max_calls: usize,
    /// Convergence tolerance
    pub tolerance: f64,
    /// Engine verbosity
    pub verbosity: i32,
}

impl Default for MinimizerStep {
    fn default() -> Self {
        Self {
            name: "migrad".to_string(),
            method: MinimizationMethod::Migrad,
            reset: false,
            max_calls: 10_000,
            tolerance: 0.1,
            verbosity: 0,
        }
    }
}

/// What one synchronization forwarded to the engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncSummary {
    /// Parameters (re)defined
    pub defined: usize,
    /// Parameters newly fixed
    pub fixed: usize,
    /// Parameters released
    pub released: usize,
    /// Fixed parameters moved to a new value
    pub values_set: usize,
}

/// Sum of the models' negative log-likelihoods.
struct JointObjective<'a> {
    models: &'a [ModelKind],
}

impl ObjectiveFunction for JointObjective<'_> {
    fn eval(&self, params: &[f64]) -> Result<f64> {
        let mut total = 0.0;
        for m in self.models {
            total += m.nll(params)?;
        }
        Ok(total)
    }
}

/// Outcome of the last fit as reported by [`Minimizer::fit_result`].
#[derive(Debug, Clone, Copy)]
pub(crate) struct FitState {
    status: i32,
    n_fails: usize,
    stats: Option<EngineStats>,
}

/// Minimizer over a list of models sharing one registry.
#[derive(Debug)]
pub struct Minimizer {
    registry: SharedRegistry,
    models: Vec<ModelKind>,
    engine: Option<FitEngine>,
    snapshot: ParameterRegistry,
    force_full_sync: bool,
    print_level: i32,
    error_def: f64,
    status: i32,
    n_fails: usize,
}

fn bounds_of(par: &Parameter) -> (f64, f64) {
    if par.is_range_set() { (par.range_min(), par.range_max()) } else { (0.0, 0.0) }
}

fn definition_changed(old: &Parameter, new: &Parameter) -> bool {
    old.start_value() != new.start_value()
        || old.start_step() != new.start_step()
        || bounds_of(old) != bounds_of(new)
}

impl Minimizer {
    /// Create a minimizer over `models`, registering their parameters.
    pub fn new(registry: SharedRegistry, models: Vec<ModelKind>) -> Result<Self> {
        if models.is_empty() {
            return Err(Error::EmptyModelList);
        }
        let mut minimizer = Self {
            registry,
            models: Vec::with_capacity(models.len()),
            engine: None,
            snapshot: ParameterRegistry::new(),
            force_full_sync: true,
            print_level: 0,
            error_def: 0.5,
            status: -1,
            n_fails: 0,
        };
        for m in models {
            minimizer.add_model(m)?;
        }
        Ok(minimizer)
    }

    /// Register `model`'s parameters and add it to the objective.
    pub fn add_model(&mut self, mut model: ModelKind) -> Result<()> {
        model.declare_parameters(&mut self.registry.borrow_mut())?;
        self.models.push(model);
        Ok(())
    }

    /// Start from a fresh engine; the next synchronization defines every
    /// parameter.
    pub fn initialize_engine(&mut self, print_level: i32, error_def: f64) {
        let mut engine = FitEngine::new(error_def);
        engine.set_print_level(print_level);
        self.engine = Some(engine);
        self.print_level = print_level;
        self.error_def = error_def;
        self.force_full_sync = true;
    }

    /// Set the engine verbosity.
    pub fn set_print_level(&mut self, level: i32) {
        self.print_level = level;
        if let Some(engine) = self.engine.as_mut() {
            engine.set_print_level(level);
        }
    }

    /// Set the error definition (0.5 for a negative log-likelihood).
    pub fn set_error_def(&mut self, up: f64) {
        self.error_def = up;
        if let Some(engine) = self.engine.as_mut() {
            engine.set_error_def(up);
        }
    }

    /// Forward registry changes since the last synchronization to the engine.
    ///
    /// With `reset`, every free parameter is redefined from its start value.
    pub fn sync_fit_parameters(&mut self, reset: bool) -> Result<SyncSummary> {
        if self.engine.is_none() {
            self.initialize_engine(self.print_level, self.error_def);
        }
        let registry = self.registry.borrow();
        let force = self.force_full_sync || registry.names() != self.snapshot.names();
        let mut summary = SyncSummary::default();

        let engine = self.engine.get_or_insert_with(|| FitEngine::new(self.error_def));
        if force {
            engine.truncate(registry.len());
        }

        for (d, par) in registry.iter().enumerate() {
            let previous = if force { None } else { self.snapshot.get(par.name()) };
            let (rmin, rmax) = bounds_of(par);
            match previous {
                None => {
                    engine.define_parameter(d, par.name(), par.start_value(), par.start_step(), rmin, rmax)?;
                    summary.defined += 1;
                    if par.is_fixed() {
                        engine.fix(d)?;
                        summary.fixed += 1;
                    }
                }
                Some(old) if par.is_fixed() => {
                    if old.start_value() != par.start_value() {
                        engine.set_value(d, par.start_value())?;
                        summary.values_set += 1;
                    }
                    if !old.is_fixed() {
                        engine.fix(d)?;
                        summary.fixed += 1;
                    }
                }
                Some(old) => {
                    if old.is_fixed() {
                        engine.release(d)?;
                        summary.released += 1;
                    }
                    if reset || definition_changed(old, par) {
                        engine.define_parameter(d, par.name(), par.start_value(), par.start_step(), rmin, rmax)?;
                        summary.defined += 1;
                    }
                }
            }
        }

        for m in self.models.iter_mut() {
            m.bind(&registry)?;
        }

        if self.print_level > 0 {
            log::debug!(
                "sync: {} defined, {} fixed, {} released, {} values set",
                summary.defined,
                summary.fixed,
                summary.released,
                summary.values_set
            );
        }
        self.snapshot = registry.clone();
        drop(registry);
        self.force_full_sync = false;
        Ok(summary)
    }

    /// Synchronize, run `method` and write the results back to the registry.
    pub fn minimize(
        &mut self,
        method: MinimizationMethod,
        reset: bool,
        max_calls: usize,
        tolerance: f64,
    ) -> Result<i32> {
        self.sync_fit_parameters(reset)?;
        let engine = self
            .engine
            .as_mut()
            .ok_or_else(|| Error::Computation("minimization engine is not initialized".to_string()))?;
        let objective = JointObjective { models: &self.models };
        let status = engine.execute(method, max_calls, tolerance, &objective)?;
        self.status = status;
        if status != STATUS_OK {
            self.n_fails += 1;
        }

        let mut registry = self.registry.borrow_mut();
        for (d, par) in registry.iter_mut().enumerate() {
            let (value, error) = engine.parameter(d)?;
            par.set_fit_result(value, error);
        }
        Ok(status)
    }

    /// Run `steps` in order; returns the status of the last one.
    pub fn minimize_steps(&mut self, steps: &[MinimizerStep]) -> Result<i32> {
        let mut status = self.status;
        for step in steps {
            self.set_print_level(step.verbosity);
            log::debug!("minimizer step '{}' ({})", step.name, step.method);
            status = self.minimize(step.method, step.reset, step.max_calls, step.tolerance)?;
        }
        if status != STATUS_OK {
            log::warn!("minimization ended with status {}", status);
        }
        Ok(status)
    }

    /// Status of the last engine call (-1 before any).
    pub fn status(&self) -> i32 {
        self.status
    }

    /// Number of engine calls that did not converge.
    pub fn n_fails(&self) -> usize {
        self.n_fails
    }

    pub(crate) fn fit_state(&self) -> FitState {
        FitState { status: self.status, n_fails: self.n_fails, stats: self.stats() }
    }

    /// Put back the status, failure count and engine statistics of `state`.
    pub(crate) fn restore_fit_state(&mut self, state: FitState) {
        self.status = state.status;
        self.n_fails = state.n_fails;
        if let (Some(engine), Some(stats)) = (self.engine.as_mut(), state.stats) {
            engine.restore_stats(stats);
        }
    }

    /// Engine statistics of the last call.
    pub fn stats(&self) -> Option<EngineStats> {
        self.engine.as_ref().map(FitEngine::stats)
    }

    /// Objective value at the last minimum.
    pub fn min_nll(&self) -> f64 {
        self.stats().map_or(f64::NAN, |s| s.fmin)
    }

    /// Estimated distance to the minimum after the last call.
    pub fn edm(&self) -> f64 {
        self.stats().map_or(f64::NAN, |s| s.edm)
    }

    /// Covariance quality after the last call.
    pub fn cov_quality(&self) -> i32 {
        self.stats().map_or(0, |s| s.cov_quality)
    }

    /// Snapshot of the current results.
    pub fn fit_result(&self) -> FitResult {
        let registry = self.registry.borrow();
        FitResult {
            status: self.status,
            min_nll: self.min_nll(),
            edm: self.edm(),
            cov_quality: self.cov_quality(),
            n_fails: self.n_fails,
            parameters: registry
                .iter()
                .map(|p| ParameterEstimate {
                    name: p.name().to_string(),
                    value: p.best_fit(),
                    error: p.best_fit_error(),
                    fixed: p.is_fixed(),
                })
                .collect(),
        }
    }

    /// Shared parameter registry.
    pub fn registry(&self) -> SharedRegistry {
        self.registry.clone()
    }

    /// Models in the objective.
    pub fn models(&self) -> &[ModelKind] {
        &self.models
    }

    /// Models in the objective.
    pub fn models_mut(&mut self) -> &mut [ModelKind] {
        &mut self.models
    }

    /// Model called `name`.
    pub fn model(&self, name: &str) -> Option<&ModelKind> {
        self.models.iter().find(|m| m.name() == name)
    }

    /// Model called `name`.
    pub fn model_mut(&mut self, name: &str) -> Option<&mut ModelKind> {
        self.models.iter_mut().find(|m| m.name() == name)
    }
}

impl fmt::Display for Minimizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Minimizer: {} models, status {}, {} failed calls", self.models.len(), self.status, self.n_fails)?;
        for par in self.registry.borrow().iter() {
            writeln!(f, "  {}", par)?;
        }
        Ok(())
    }
}
