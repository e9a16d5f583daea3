//! Log densities used when scoring latent variables.

use crate::cholesky::CholeskyFactor;
use crate::errors::{ReparamError, Result};
use crate::linalg::{solve_triangular_vec, Triangular};
use linfa::Float;
use ndarray::{Array1, ArrayBase, Data, Ix1};

/// A log-likelihood `log p(y | f)` of some data given latent values `f`
pub trait LogLikelihood<F: Float> {
    /// Log-likelihood value at latent values `f`
    fn log_likelihood(&self, f: &Array1<F>) -> F;
}

impl<F: Float, T> LogLikelihood<F> for T
where
    T: Fn(&Array1<F>) -> F,
{
    fn log_likelihood(&self, f: &Array1<F>) -> F {
        self(f)
    }
}

fn half_log_two_pi<F: Float>() -> F {
    F::cast(0.5 * (2. * std::f64::consts::PI).ln())
}

/// Log density of independent standard normal variables evaluated at `eta`
pub fn std_normal_lpdf<F: Float>(eta: &ArrayBase<impl Data<Elem = F>, Ix1>) -> F {
    let n = F::cast(eta.len());
    -F::cast(0.5) * eta.dot(eta) - n * half_log_two_pi()
}

/// Log density of `N(mu, L.Lt)` evaluated at `y` given the Cholesky factor `L`
pub fn multi_normal_cholesky_lpdf<F: Float>(
    y: &ArrayBase<impl Data<Elem = F>, Ix1>,
    mu: &ArrayBase<impl Data<Elem = F>, Ix1>,
    chol: &CholeskyFactor<F>,
) -> Result<F> {
    if y.len() != mu.len() || y.len() != chol.dim() {
        return Err(ReparamError::DimensionMismatch {
            op: "multi_normal_cholesky_lpdf",
            left: (y.len(), 1),
            right: (chol.dim(), mu.len()),
        });
    }
    let z = solve_triangular_vec(chol.l(), &(y - mu), Triangular::Lower, chol.pivot_tol())?;
    let log_det_l = chol.l().diag().mapv(|v| v.ln()).sum();
    Ok(std_normal_lpdf(&z) - log_det_l)
}
