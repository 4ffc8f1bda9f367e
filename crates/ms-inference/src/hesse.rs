//! Numerical second derivatives and covariance estimation.

use crate::optimizer::{Bound, ObjectiveFunction};
use ms_core::{Error, Result};
use nalgebra::{DMatrix, DVector};

/// Covariance matrix with its quality flag.
#[derive(Debug, Clone)]
pub struct Covariance {
    /// Inverse Hessian of the objective
    pub matrix: DMatrix<f64>,
    /// 3 = accurate, 2 = forced positive-definite, 1 = diagonal approximation
    pub quality: i32,
}

impl Covariance {
    /// Estimated distance to the minimum, `g^T V g / 2`.
    pub fn edm(&self, gradient: &[f64]) -> f64 {
        let g = DVector::from_column_slice(gradient);
        0.5 * g.dot(&(&self.matrix * &g))
    }

    /// Standard deviations `sqrt(2 up V_ii)`.
    pub fn errors(&self, up: f64) -> Vec<f64> {
        (0..self.matrix.nrows()).map(|i| (2.0 * up * self.matrix[(i, i)]).max(0.0).sqrt()).collect()
    }
}

fn hessian_step(x: f64, bound: Bound) -> f64 {
    let h = 1e-4 * x.abs().max(1.0);
    match bound {
        Some((lo, hi)) => h.min(0.25 * (hi - lo)),
        None => h,
    }
}

/// Finite-difference Hessian of `objective` at `x`.
///
/// Coordinates closer than one step to a bound are shifted inward so the
/// stencil stays inside the allowed region.
pub fn numerical_hessian(objective: &dyn ObjectiveFunction, x: &[f64], bounds: &[Bound]) -> Result<DMatrix<f64>> {
    let n = x.len();
    let steps: Vec<f64> = x.iter().zip(bounds).map(|(&v, &b)| hessian_step(v, b)).collect();
    let center: Vec<f64> = x
        .iter()
        .zip(bounds)
        .zip(&steps)
        .map(|((&v, &b), &h)| match b {
            Some((lo, hi)) => v.clamp(lo + h, hi - h),
            None => v,
        })
        .collect();

    let f0 = objective.eval(&center)?;
    let mut work = center.clone();
    let mut eval_at = |shifts: &[(usize, f64)]| -> Result<f64> {
        for &(i, d) in shifts {
            work[i] = center[i] + d;
        }
        let f = objective.eval(&work);
        for &(i, _) in shifts {
            work[i] = center[i];
        }
        f
    };

    let mut hessian = DMatrix::zeros(n, n);
    for i in 0..n {
        let hi = steps[i];
        let fp = eval_at(&[(i, hi)])?;
        let fm = eval_at(&[(i, -hi)])?;
        hessian[(i, i)] = (fp - 2.0 * f0 + fm) / (hi * hi);

        for j in 0..i {
            let hj = steps[j];
            let fpp = eval_at(&[(i, hi), (j, hj)])?;
            let fpm = eval_at(&[(i, hi), (j, -hj)])?;
            let fmp = eval_at(&[(i, -hi), (j, hj)])?;
            let fmm = eval_at(&[(i, -hi), (j, -hj)])?;
            let hij = (fpp - fpm - fmp + fmm) / (4.0 * hi * hj);
            hessian[(i, j)] = hij;
            hessian[(j, i)] = hij;
        }
    }

    if hessian.iter().any(|v| !v.is_finite()) {
        return Err(Error::Computation("Hessian has non-finite entries".to_string()));
    }
    Ok(hessian)
}

/// Gradient at `x` with one-sided differences next to a bound, projected so
/// that components pushing out of an active bound vanish.
pub fn projected_gradient(objective: &dyn ObjectiveFunction, x: &[f64], bounds: &[Bound]) -> Result<Vec<f64>> {
    let f0 = objective.eval(x)?;
    let mut work = x.to_vec();
    let mut grad = vec![0.0; x.len()];

    for i in 0..x.len() {
        let eps = 1e-8 * x[i].abs().max(1.0);
        let (lo, hi) = bounds[i].unwrap_or((f64::NEG_INFINITY, f64::INFINITY));

        let g = if x[i] - eps < lo {
            work[i] = x[i] + eps;
            let fp = objective.eval(&work)?;
            (fp - f0) / eps
        } else if x[i] + eps > hi {
            work[i] = x[i] - eps;
            let fm = objective.eval(&work)?;
            (f0 - fm) / eps
        } else {
            work[i] = x[i] + eps;
            let fp = objective.eval(&work)?;
            work[i] = x[i] - eps;
            let fm = objective.eval(&work)?;
            (fp - fm) / (2.0 * eps)
        };
        work[i] = x[i];

        let at_lower = x[i] - lo <= eps;
        let at_upper = hi - x[i] <= eps;
        grad[i] = if (at_lower && g > 0.0) || (at_upper && g < 0.0) { 0.0 } else { g };
    }

    Ok(grad)
}

/// Invert a Hessian into a covariance matrix.
///
/// A plain Cholesky solve gives quality 3. Otherwise the diagonal is damped
/// until Cholesky succeeds, falling back to LU (quality 2), and finally to
/// the inverse diagonal (quality 1).
pub fn invert_hessian(hessian: &DMatrix<f64>) -> Covariance {
    let n = hessian.nrows();
    let identity = DMatrix::identity(n, n);

    if let Some(chol) = nalgebra::linalg::Cholesky::new(hessian.clone()) {
        return Covariance { matrix: chol.solve(&identity), quality: 3 };
    }

    let diag_scale = (0..n).map(|i| hessian[(i, i)].abs()).fold(0.0_f64, f64::max).max(1.0);
    let mut h_damped = hessian.clone();
    let mut damping = 0.0_f64;
    let max_attempts = 10;

    for attempt in 0..max_attempts {
        let next_damping = if damping == 0.0 { diag_scale * 1e-9 } else { damping * 10.0 };
        let add = next_damping - damping;
        for i in 0..n {
            h_damped[(i, i)] += add;
        }
        damping = next_damping;

        if let Some(chol) = nalgebra::linalg::Cholesky::new(h_damped.clone()) {
            log::debug!("Hessian made positive-definite with damping {:.3e} (attempt {})", damping, attempt + 1);
            return Covariance { matrix: chol.solve(&identity), quality: 2 };
        }
    }

    if let Some(cov) = h_damped.clone().lu().try_inverse() {
        if (0..n).all(|i| cov[(i, i)].is_finite() && cov[(i, i)] > 0.0) {
            return Covariance { matrix: cov, quality: 2 };
        }
    }

    log::warn!("Hessian is not invertible, using its diagonal");
    let mut matrix = DMatrix::zeros(n, n);
    for i in 0..n {
        matrix[(i, i)] = 1.0 / hessian[(i, i)].abs().max(1e-12);
    }
    Covariance { matrix, quality: 1 }
}
