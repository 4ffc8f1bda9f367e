//! Optimization algorithms
//!
//! Wrappers around the argmin solvers used by [`crate::engine::FitEngine`]:
//! L-BFGS with a More-Thuente line search for gradient-based minimization
//! and Nelder-Mead for derivative-free minimization.
//!
//! Box constraints are handled with the MINUIT sine transformation: a
//! parameter bounded to `[lo, hi]` is minimized over an unbounded internal
//! variable `t` with `x = lo + (hi - lo) (sin t + 1) / 2`, so the solvers
//! never evaluate the objective outside its bounds.

use argmin::core::{CostFunction, Executor, Gradient, State, TerminationReason, TerminationStatus};
use argmin::solver::linesearch::MoreThuenteLineSearch;
use argmin::solver::neldermead::NelderMead;
use argmin::solver::quasinewton::LBFGS;
use ms_core::Result;
use std::cell::Cell;
use std::fmt;

/// Objective function trait for optimization
pub trait ObjectiveFunction {
    /// Evaluate function at given parameters
    fn eval(&self, params: &[f64]) -> Result<f64>;

    /// Compute gradient at given parameters (numerical if not overridden)
    fn gradient(&self, params: &[f64]) -> Result<Vec<f64>> {
        let n = params.len();
        let mut grad = vec![0.0; n];
        let mut work = params.to_vec();

        for i in 0..n {
            let eps = 1e-8 * params[i].abs().max(1.0);

            work[i] = params[i] + eps;
            let f_plus = self.eval(&work)?;
            work[i] = params[i] - eps;
            let f_minus = self.eval(&work)?;
            work[i] = params[i];

            grad[i] = (f_plus - f_minus) / (2.0 * eps);
        }

        Ok(grad)
    }
}

/// Bounds of one parameter; `None` means unbounded.
pub type Bound = Option<(f64, f64)>;

/// Map an internal value to the external, bounded one.
pub fn to_external(t: f64, bound: Bound) -> f64 {
    match bound {
        Some((lo, hi)) => lo + 0.5 * (hi - lo) * (t.sin() + 1.0),
        None => t,
    }
}

/// Map an external value to the internal, unbounded one.
pub fn to_internal(x: f64, bound: Bound) -> f64 {
    match bound {
        Some((lo, hi)) => {
            let s = (2.0 * (x - lo) / (hi - lo) - 1.0).clamp(-1.0, 1.0);
            s.asin()
        }
        None => x,
    }
}

/// Internal step corresponding to the external step `step` at `x`.
pub fn internal_step(x: f64, step: f64, bound: Bound) -> f64 {
    match bound {
        Some((lo, hi)) => {
            let t = to_internal(x, bound);
            let dxdt = 0.5 * (hi - lo) * t.cos();
            if dxdt.abs() > 1e-3 * step.abs() { (step / dxdt).clamp(-1.0, 1.0) } else { 0.1 }
        }
        None => step,
    }
}

/// Clamp `params` into their bounds.
pub fn clamp_params(params: &[f64], bounds: &[Bound]) -> Vec<f64> {
    params
        .iter()
        .zip(bounds.iter())
        .map(|(&v, b)| match b {
            Some((lo, hi)) => v.clamp(*lo, *hi),
            None => v,
        })
        .collect()
}

/// Configuration for the optimizers
#[derive(Debug, Clone)]
pub struct OptimizerConfig {
    /// Maximum number of iterations
    pub max_iter: u64,
    /// Convergence tolerance: gradient norm for L-BFGS, spread of the
    /// simplex values for Nelder-Mead
    pub tol: f64,
    /// Number of corrections to approximate inverse Hessian
    pub m: usize,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self { max_iter: 1000, tol: 1e-6, m: 10 }
    }
}

/// Result of optimization
#[derive(Debug, Clone)]
pub struct OptimizationResult {
    /// Best-fit parameters
    pub parameters: Vec<f64>,
    /// Function value at minimum
    pub fval: f64,
    /// Number of iterations
    pub n_iter: u64,
    /// Number of objective evaluations
    pub n_fev: usize,
    /// Convergence status
    pub converged: bool,
    /// Termination message
    pub message: String,
}

impl fmt::Display for OptimizationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "OptimizationResult(fval={:.6}, n_iter={}, n_fev={}, converged={})",
            self.fval, self.n_iter, self.n_fev, self.converged
        )
    }
}

/// Objective seen by argmin: internal variables, counted evaluations.
struct ArgminProblem<'a> {
    objective: &'a dyn ObjectiveFunction,
    bounds: &'a [Bound],
    n_fev: Cell<usize>,
}

impl ArgminProblem<'_> {
    fn external(&self, internal: &[f64]) -> Vec<f64> {
        internal.iter().zip(self.bounds).map(|(&t, &b)| to_external(t, b)).collect()
    }

    fn eval_internal(&self, internal: &[f64]) -> Result<f64> {
        self.n_fev.set(self.n_fev.get() + 1);
        self.objective.eval(&self.external(internal))
    }
}

impl ObjectiveFunction for ArgminProblem<'_> {
    fn eval(&self, params: &[f64]) -> Result<f64> {
        self.eval_internal(params)
    }
}

impl CostFunction for ArgminProblem<'_> {
    type Param = Vec<f64>;
    type Output = f64;

    fn cost(&self, params: &Self::Param) -> std::result::Result<Self::Output, argmin::core::Error> {
        self.eval_internal(params).map_err(|e| argmin::core::Error::msg(e.to_string()))
    }
}

impl Gradient for ArgminProblem<'_> {
    type Param = Vec<f64>;
    type Gradient = Vec<f64>;

    fn gradient(
        &self,
        params: &Self::Param,
    ) -> std::result::Result<Self::Gradient, argmin::core::Error> {
        ObjectiveFunction::gradient(self, params).map_err(|e| argmin::core::Error::msg(e.to_string()))
    }
}

fn check_lengths(init: &[f64], bounds: &[Bound]) -> Result<()> {
    if init.len() != bounds.len() {
        return Err(ms_core::Error::Validation(format!(
            "Parameter and bounds length mismatch: {} != {}",
            init.len(),
            bounds.len()
        )));
    }
    Ok(())
}

fn is_converged(termination: &TerminationStatus) -> bool {
    matches!(
        termination,
        TerminationStatus::Terminated(TerminationReason::SolverConverged)
            | TerminationStatus::Terminated(TerminationReason::TargetCostReached)
    )
}

/// Bounded L-BFGS optimizer
pub struct LbfgsOptimizer {
    config: OptimizerConfig,
}

impl LbfgsOptimizer {
    /// Create new L-BFGS optimizer with given configuration
    pub fn new(config: OptimizerConfig) -> Self {
        Self { config }
    }

    /// Minimize `objective` starting from `init` within `bounds`.
    pub fn minimize(
        &self,
        objective: &dyn ObjectiveFunction,
        init: &[f64],
        bounds: &[Bound],
    ) -> Result<OptimizationResult> {
        check_lengths(init, bounds)?;
        let init_internal: Vec<f64> = clamp_params(init, bounds)
            .iter()
            .zip(bounds)
            .map(|(&x, &b)| to_internal(x, b))
            .collect();

        let problem = ArgminProblem { objective, bounds, n_fev: Cell::new(0) };

        let linesearch = MoreThuenteLineSearch::new();
        let tol_cost = if self.config.tol == 0.0 { 0.0 } else { (0.1 * self.config.tol).max(1e-12) };
        let solver = LBFGS::new(linesearch, self.config.m)
            .with_tolerance_grad(self.config.tol)
            .map_err(|e| {
                ms_core::Error::Validation(format!("Invalid optimizer configuration (tol): {e}"))
            })?;
        let solver = solver.with_tolerance_cost(tol_cost).map_err(|e| {
            ms_core::Error::Validation(format!("Invalid optimizer configuration (tol_cost): {e}"))
        })?;

        let res = Executor::new(problem, solver)
            .configure(|state| state.param(init_internal).max_iters(self.config.max_iter))
            .run()
            .map_err(|e| ms_core::Error::Computation(format!("L-BFGS failed: {}", e)))?;

        let state = res.state();
        let best_internal = state
            .get_best_param()
            .ok_or_else(|| ms_core::Error::Computation("No best parameters found".to_string()))?;
        let external: Vec<f64> =
            best_internal.iter().zip(bounds).map(|(&t, &b)| to_external(t, b)).collect();
        let parameters = clamp_params(&external, bounds);
        let termination = state.get_termination_status();

        Ok(OptimizationResult {
            parameters,
            fval: state.get_best_cost(),
            n_iter: state.get_iter(),
            n_fev: res.problem.problem.as_ref().map_or(0, |p| p.n_fev.get()),
            converged: is_converged(termination),
            message: termination.to_string(),
        })
    }
}

impl Default for LbfgsOptimizer {
    fn default() -> Self {
        Self::new(OptimizerConfig::default())
    }
}

/// Nelder-Mead simplex optimizer
pub struct SimplexOptimizer {
    config: OptimizerConfig,
}

impl SimplexOptimizer {
    /// Create new simplex optimizer with given configuration
    pub fn new(config: OptimizerConfig) -> Self {
        Self { config }
    }

    /// Minimize `objective` starting from `init`, building the initial
    /// simplex from `steps`.
    pub fn minimize(
        &self,
        objective: &dyn ObjectiveFunction,
        init: &[f64],
        steps: &[f64],
        bounds: &[Bound],
    ) -> Result<OptimizationResult> {
        check_lengths(init, bounds)?;
        if steps.len() != init.len() {
            return Err(ms_core::Error::Validation(format!(
                "Parameter and step length mismatch: {} != {}",
                init.len(),
                steps.len()
            )));
        }
        let init = clamp_params(init, bounds);
        let origin: Vec<f64> = init.iter().zip(bounds).map(|(&x, &b)| to_internal(x, b)).collect();

        let mut vertices = vec![origin.clone()];
        for i in 0..origin.len() {
            let mut v = origin.clone();
            let dt = internal_step(init[i], steps[i], bounds[i]);
            v[i] += if dt != 0.0 { dt } else { 0.1 };
            vertices.push(v);
        }

        let problem = ArgminProblem { objective, bounds, n_fev: Cell::new(0) };
        let solver = NelderMead::new(vertices).with_sd_tolerance(self.config.tol).map_err(|e| {
            ms_core::Error::Validation(format!("Invalid optimizer configuration (sd_tol): {e}"))
        })?;

        let res = Executor::new(problem, solver)
            .configure(|state| state.max_iters(self.config.max_iter))
            .run()
            .map_err(|e| ms_core::Error::Computation(format!("Simplex failed: {}", e)))?;

        let state = res.state();
        let best_internal = state
            .get_best_param()
            .ok_or_else(|| ms_core::Error::Computation("No best parameters found".to_string()))?;
        let external: Vec<f64> =
            best_internal.iter().zip(bounds).map(|(&t, &b)| to_external(t, b)).collect();
        let parameters = clamp_params(&external, bounds);
        let termination = state.get_termination_status();

        Ok(OptimizationResult {
            parameters,
            fval: state.get_best_cost(),
            n_iter: state.get_iter(),
            n_fev: res.problem.problem.as_ref().map_or(0, |p| p.n_fev.get()),
            converged: is_converged(termination),
            message: termination.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    // f(x, y) = (x - 2)^2 + (y - 3)^2, minimum at (2, 3)
    struct QuadraticFunction;

    impl ObjectiveFunction for QuadraticFunction {
        fn eval(&self, params: &[f64]) -> Result<f64> {
            Ok((params[0] - 2.0).powi(2) + (params[1] - 3.0).powi(2))
        }
    }

    // Poisson NLL of one bin with 10 observed counts; +inf below zero
    struct PoissonBin;

    impl ObjectiveFunction for PoissonBin {
        fn eval(&self, params: &[f64]) -> Result<f64> {
            Ok(-ms_prob::log_poisson(10.0, params[0]))
        }
    }

    #[test]
    fn test_transform_round_trip() {
        let b = Some((0.0, 50.0));
        for x in [0.0, 0.3, 25.0, 49.9, 50.0] {
            assert_relative_eq!(to_external(to_internal(x, b), b), x, epsilon = 1e-9);
        }
        assert_eq!(to_internal(3.0, None), 3.0);
        for t in [-10.0, 0.0, 2.0, 100.0] {
            let x = to_external(t, b);
            assert!((0.0..=50.0).contains(&x));
        }
    }

    #[test]
    fn test_lbfgs_quadratic() {
        let optimizer = LbfgsOptimizer::new(OptimizerConfig { max_iter: 100, tol: 1e-8, m: 10 });
        let result = optimizer.minimize(&QuadraticFunction, &[0.0, 0.0], &[None, None]).unwrap();
        assert!(result.converged, "{}", result);
        assert_relative_eq!(result.parameters[0], 2.0, epsilon = 1e-4);
        assert_relative_eq!(result.parameters[1], 3.0, epsilon = 1e-4);
        assert_relative_eq!(result.fval, 0.0, epsilon = 1e-6);
        assert!(result.n_fev > 0);
    }

    #[test]
    fn test_lbfgs_with_bounds() {
        // Constrained optimum at x=3 (lower edge), y=2 (upper edge)
        let optimizer = LbfgsOptimizer::new(OptimizerConfig { max_iter: 500, tol: 1e-8, m: 10 });
        let bounds = [Some((3.0, 5.0)), Some((1.0, 2.0))];
        let result = optimizer.minimize(&QuadraticFunction, &[4.0, 1.5], &bounds).unwrap();
        assert_relative_eq!(result.parameters[0], 3.0, epsilon = 1e-3);
        assert_relative_eq!(result.parameters[1], 2.0, epsilon = 1e-3);
    }

    #[test]
    fn test_lbfgs_never_leaves_bounds() {
        // The quasi-Newton step from 50 overshoots far below zero.
        let optimizer = LbfgsOptimizer::new(OptimizerConfig { max_iter: 200, tol: 1e-8, m: 10 });
        let result = optimizer.minimize(&PoissonBin, &[50.0], &[Some((0.0, 100.0))]).unwrap();
        assert!(result.fval.is_finite());
        assert_relative_eq!(result.parameters[0], 10.0, epsilon = 1e-3);
    }

    #[test]
    fn test_simplex_quadratic() {
        let optimizer = SimplexOptimizer::new(OptimizerConfig { max_iter: 2000, tol: 1e-12, m: 0 });
        let result = optimizer
            .minimize(&QuadraticFunction, &[0.0, 0.0], &[0.5, 0.5], &[None, None])
            .unwrap();
        assert!(result.converged, "{}", result);
        assert_relative_eq!(result.parameters[0], 2.0, epsilon = 1e-3);
        assert_relative_eq!(result.parameters[1], 3.0, epsilon = 1e-3);
    }

    #[test]
    fn test_simplex_with_bounds() {
        let optimizer = SimplexOptimizer::new(OptimizerConfig { max_iter: 2000, tol: 1e-12, m: 0 });
        let result =
            optimizer.minimize(&PoissonBin, &[50.0], &[1.0], &[Some((0.0, 100.0))]).unwrap();
        assert_relative_eq!(result.parameters[0], 10.0, epsilon = 1e-2);
    }

    #[test]
    fn test_length_mismatch() {
        let optimizer = LbfgsOptimizer::default();
        assert!(optimizer.minimize(&QuadraticFunction, &[0.0, 0.0], &[None]).is_err());
    }
}
