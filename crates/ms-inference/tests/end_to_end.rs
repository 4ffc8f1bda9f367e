//! End-to-end fits through the public API.

use approx::assert_relative_eq;
use ms_core::{Model, Parameter, ParameterRegistry, SharedRegistry};
use ms_hist::{Axis, Histogram};
use ms_inference::{
    BinnedLikelihoodModel, FitTable, GaussianPull, MinimizationMethod, Minimizer, MinimizerStep,
    ModelKind, ProfileScanner, TemplateComposer,
};
use ms_prob::log_poisson;
use std::collections::BTreeMap;

fn hist(name: &str, contents: &[f64]) -> Histogram {
    let mut h = Histogram::new(name, vec![Axis::uniform(contents.len(), 0.0, contents.len() as f64).unwrap()])
        .unwrap();
    for (i, &c) in contents.iter().enumerate() {
        h.set_bin_content(&[i + 1], c).unwrap();
    }
    h
}

/// Templates `A` (all in bin 1) and `B` (all in bin 2), components with
/// range [0, 100].
fn two_component_model(name: &str, data: &[f64], global_a: bool) -> BinnedLikelihoodModel {
    let mut composer = TemplateComposer::new(name);
    composer.load_template("A", hist("A", &[1.0, 0.0])).unwrap();
    composer.load_template("B", hist("B", &[0.0, 1.0])).unwrap();
    let mut model = BinnedLikelihoodModel::new(name, 1.0, composer);
    model.add_component(Parameter::with_range("A", 0.0, 100.0).global(global_a)).unwrap();
    model.add_component(Parameter::with_range("B", 0.0, 100.0)).unwrap();
    model.replace_dataset(hist(name, data)).unwrap();
    model
}

fn steps() -> Vec<MinimizerStep> {
    vec![
        MinimizerStep { name: "simplex".into(), method: MinimizationMethod::Simplex, ..Default::default() },
        MinimizerStep { name: "migrad".into(), method: MinimizationMethod::Migrad, ..Default::default() },
    ]
}

fn fit(registry: &SharedRegistry, models: Vec<ModelKind>) -> Minimizer {
    let mut minimizer = Minimizer::new(registry.clone(), models).unwrap();
    minimizer.initialize_engine(0, 0.5);
    let status = minimizer.minimize_steps(&steps()).unwrap();
    assert_eq!(status, 0);
    minimizer
}

#[test]
fn two_bin_fit_recovers_counts() {
    let registry = ParameterRegistry::shared();
    let minimizer = fit(&registry, vec![two_component_model("ds", &[10.0, 5.0], false).into()]);

    let reg = registry.borrow();
    let a = reg.get("ds.A").unwrap();
    let b = reg.get("ds.B").unwrap();
    assert_relative_eq!(a.best_fit(), 10.0, epsilon = 1e-2);
    assert_relative_eq!(b.best_fit(), 5.0, epsilon = 1e-2);
    assert_relative_eq!(a.best_fit_error(), 10f64.sqrt(), epsilon = 1e-2);

    let saturated = -(log_poisson(10.0, 10.0) + log_poisson(5.0, 5.0));
    assert_relative_eq!(minimizer.min_nll(), saturated, epsilon = 1e-6);
    assert_eq!(minimizer.n_fails(), 0);
}

#[test]
fn single_bin_nll_matches_closed_form() {
    let mut composer = TemplateComposer::new("one");
    composer.load_template("s", hist("s", &[1.0])).unwrap();
    let mut model = BinnedLikelihoodModel::new("one", 1.0, composer);
    model.add_component(Parameter::with_range("s", 0.0, 50.0)).unwrap();
    model.replace_dataset(hist("one", &[10.0])).unwrap();

    let mut registry = ParameterRegistry::new();
    model.declare_parameters(&mut registry).unwrap();
    model.bind(&registry).unwrap();

    let expected = -(10.0 * 10f64.ln() - 10.0 - statrs::function::gamma::ln_gamma(11.0));
    assert_relative_eq!(model.nll(&[10.0]).unwrap(), expected, epsilon = 1e-10);
}

#[test]
fn global_parameter_is_shared_across_datasets() {
    let registry = ParameterRegistry::shared();
    let minimizer = fit(
        &registry,
        vec![
            two_component_model("ds1", &[10.0, 5.0], true).into(),
            two_component_model("ds2", &[20.0, 3.0], true).into(),
        ],
    );

    let reg = registry.borrow();
    assert_eq!(reg.names(), vec!["ds1.B", "ds2.B", "global.A"]);
    // Both datasets pull on the same A: the joint estimate is the mean count.
    assert_relative_eq!(reg.get("global.A").unwrap().best_fit(), 15.0, epsilon = 1e-2);
    assert_relative_eq!(reg.get("ds1.B").unwrap().best_fit(), 5.0, epsilon = 1e-2);
    assert_relative_eq!(reg.get("ds2.B").unwrap().best_fit(), 3.0, epsilon = 1e-2);

    for m in minimizer.models() {
        let binned = m.as_binned().unwrap();
        assert_eq!(binned.core().resolve(&reg, "A").unwrap(), "global.A");
    }
}

#[test]
fn narrow_gaussian_pull_dominates() {
    let registry = ParameterRegistry::shared();
    let pull = GaussianPull::new("A", "A", 25.0, 1e-2).unwrap();
    fit(&registry, vec![two_component_model("ds", &[10.0, 5.0], true).into(), pull.into()]);

    let reg = registry.borrow();
    assert_relative_eq!(reg.get("global.A").unwrap().best_fit(), 25.0, epsilon = 1e-2);
    assert_relative_eq!(reg.get("ds.B").unwrap().best_fit(), 5.0, epsilon = 1e-2);
}

#[test]
fn profile_restores_registry() {
    let registry = ParameterRegistry::shared();
    let mut minimizer = fit(&registry, vec![two_component_model("ds", &[10.0, 5.0], false).into()]);
    let before: Vec<(f64, f64, bool)> =
        registry.borrow().iter().map(|p| (p.best_fit(), p.best_fit_error(), p.is_fixed())).collect();

    let steps = steps();
    let curve = ProfileScanner::new(&mut minimizer, &steps).profile("ds.A", 0.5, 5).unwrap();

    let after: Vec<(f64, f64, bool)> =
        registry.borrow().iter().map(|p| (p.best_fit(), p.best_fit_error(), p.is_fixed())).collect();
    assert_eq!(before, after);

    // The curve starts at zero near the best fit and crosses the cut-off on
    // both sides.
    assert!(curve.points.windows(2).all(|w| w[0].value < w[1].value));
    let lowest = curve.points.iter().map(|p| p.delta_nll).fold(f64::INFINITY, f64::min);
    assert_relative_eq!(lowest, 0.0, epsilon = 1e-12);
    assert!(curve.points.first().unwrap().delta_nll > 0.5);
    assert!(curve.points.last().unwrap().delta_nll > 0.5);

    let (lo, hi) = curve.interval(0.5).unwrap();
    assert!(lo < 10.0 && hi > 10.0);
}

#[test]
fn profile_keeps_fit_outcome() {
    let registry = ParameterRegistry::shared();
    let mut minimizer = fit(&registry, vec![two_component_model("ds", &[10.0, 5.0], false).into()]);
    let before = minimizer.fit_result();
    let stats_before = minimizer.stats().unwrap();

    let steps = steps();
    let curves = ProfileScanner::new(&mut minimizer, &steps).profile_all(2.0, 6).unwrap();
    assert_eq!(curves.len(), 2);

    assert_eq!(minimizer.fit_result(), before);
    assert_eq!(minimizer.stats().unwrap(), stats_before);
    assert_eq!(minimizer.n_fails(), before.n_fails);
    assert_relative_eq!(minimizer.min_nll(), curves[0].min_nll, epsilon = 1e-3);
}

#[test]
fn fit_table_rows_follow_registry() {
    let registry = ParameterRegistry::shared();
    let minimizer = fit(&registry, vec![two_component_model("ds", &[10.0, 5.0], false).into()]);

    let mut table = FitTable::from_registry(&registry.borrow());
    table.append(&minimizer.fit_result()).unwrap();
    assert_eq!(table.columns(), &["minuitStatus", "absNLLMin", "ds.A", "ds.AErr", "ds.B", "ds.BErr"]);
    let a = table.column("ds.A").unwrap();
    assert_relative_eq!(a[0], 10.0, epsilon = 1e-2);
}

#[test]
fn monte_carlo_dataset_fits_back() {
    let registry = ParameterRegistry::shared();
    let mut model = two_component_model("mc", &[0.0, 0.0], false);
    model.composer_mut().set_seed(42);
    let injected: BTreeMap<String, f64> =
        [("A".to_string(), 80.0), ("B".to_string(), 20.0)].into_iter().collect();
    let data = model.draw_realization(&injected, false).unwrap();
    assert_relative_eq!(data.integral(false), 100.0);
    model.replace_dataset(data.clone()).unwrap();

    let minimizer = fit(&registry, vec![model.into()]);
    let reg = registry.borrow();
    assert_relative_eq!(reg.get("mc.A").unwrap().best_fit(), data.bin_content(&[1]).unwrap(), epsilon = 1e-1);
    assert!(minimizer.fit_result().converged());
}
