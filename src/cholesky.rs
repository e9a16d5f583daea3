//! Stabilized Cholesky factorization of symmetric positive (semi-)definite matrices.
//!
//! Gram matrices built from smooth kernels are positive semi-definite in exact
//! arithmetic but are frequently ill-conditioned (near duplicated covariates,
//! long length scales). The [`CholeskyFactorizer`] first attempts a plain
//! factorization, then retries once with a small diagonal jitter
//! (a.k.a. nugget) and reports [`ReparamError::NotPositiveDefinite`] if the
//! repaired matrix still cannot be factorized.

use crate::errors::{ReparamError, Result};
use crate::linalg::{
    add_diagonal_jitter, as_f64, check_square, default_pivot_tol, solve_triangular,
    solve_triangular_vec, Triangular,
};
use linfa::Float;
use linfa_linalg::{cholesky::*, LinalgError};
use log::{debug, warn};
use ndarray::{Array1, Array2, ArrayBase, Data, Ix1, Ix2};
use ndarray_stats::QuantileExt;
#[cfg(feature = "serializable")]
use serde::{Deserialize, Serialize};

/// Default relative jitter used to repair a failed factorization
pub const DEFAULT_JITTER: f64 = 1e-8;

/// Lower triangular factor `L` of a symmetric matrix `Σ` such that `L.Lt = Σ + jitter.I`
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(
    feature = "serializable",
    derive(Serialize, Deserialize),
    serde(bound(deserialize = "F: Deserialize<'de>"))
)]
pub struct CholeskyFactor<F: Float> {
    /// Lower triangular factor
    l: Array2<F>,
    /// Diagonal jitter applied to get a valid factorization (zero if none)
    jitter: F,
    /// Pivot tolerance used when solving against the factor
    pivot_tol: F,
}

impl<F: Float> CholeskyFactor<F> {
    /// Lower triangular factor `L`
    pub fn l(&self) -> &Array2<F> {
        &self.l
    }

    /// Consumes the factor and returns `L`
    pub fn into_l(self) -> Array2<F> {
        self.l
    }

    /// Size of the factorized matrix
    pub fn dim(&self) -> usize {
        self.l.nrows()
    }

    /// Diagonal jitter added before the successful factorization
    pub fn jitter(&self) -> F {
        self.jitter
    }

    /// Pivot tolerance used by triangular solves against `L`
    pub fn pivot_tol(&self) -> F {
        self.pivot_tol
    }

    /// Recomputes `L.Lt`, ie. the (possibly jittered) factorized matrix
    pub fn reconstruct(&self) -> Array2<F> {
        self.l.dot(&self.l.t())
    }

    /// Computes `L.z` for a single vector `z`
    pub fn mul_vec(&self, z: &ArrayBase<impl Data<Elem = F>, Ix1>) -> Result<Array1<F>> {
        crate::linalg::multiply_vec(&self.l, z)
    }

    /// Computes `L.z` for a (n, k) matrix `z` of k column vectors
    pub fn mul(&self, z: &ArrayBase<impl Data<Elem = F>, Ix2>) -> Result<Array2<F>> {
        crate::linalg::multiply(&self.l, z)
    }

    /// Solves `L.x = b` by forward substitution
    pub fn solve_lower(&self, b: &ArrayBase<impl Data<Elem = F>, Ix2>) -> Result<Array2<F>> {
        solve_triangular(&self.l, b, Triangular::Lower, self.pivot_tol)
    }

    /// Solves `Σ.x = b` through `L` then `Lt` triangular solves
    pub fn solve(&self, b: &ArrayBase<impl Data<Elem = F>, Ix2>) -> Result<Array2<F>> {
        let v = self.solve_lower(b)?;
        solve_triangular(&self.l.t(), &v, Triangular::Upper, self.pivot_tol)
    }

    /// Solves `Σ.x = b` for a single right hand side
    pub fn solve_vec(&self, b: &ArrayBase<impl Data<Elem = F>, Ix1>) -> Result<Array1<F>> {
        let v = solve_triangular_vec(&self.l, b, Triangular::Lower, self.pivot_tol)?;
        solve_triangular_vec(&self.l.t(), &v, Triangular::Upper, self.pivot_tol)
    }

    /// Log-determinant of `Σ`, ie. twice the sum of the logs of `L` diagonal
    pub fn log_det(&self) -> F {
        self.l.diag().mapv(|v| v.ln()).sum() * F::cast(2.)
    }
}

/// Cholesky factorization with a single jitter repair attempt
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub struct CholeskyFactorizer<F: Float> {
    jitter: F,
    pivot_tol: F,
}

impl<F: Float> Default for CholeskyFactorizer<F> {
    fn default() -> Self {
        CholeskyFactorizer {
            jitter: F::cast(DEFAULT_JITTER),
            pivot_tol: default_pivot_tol(),
        }
    }
}

impl<F: Float> CholeskyFactorizer<F> {
    /// Constructor with default jitter and pivot tolerance
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the relative jitter used on retry.
    ///
    /// The absolute value added to the diagonal is `jitter * max|Σii|`, or `jitter`
    /// when the diagonal is zero.
    pub fn jitter(mut self, jitter: F) -> Self {
        self.jitter = jitter;
        self
    }

    /// Set the tolerance used by triangular solves against the produced factors
    pub fn pivot_tol(mut self, pivot_tol: F) -> Self {
        self.pivot_tol = pivot_tol;
        self
    }

    /// Get relative repair jitter
    pub fn get_jitter(&self) -> F {
        self.jitter
    }

    /// Get pivot tolerance
    pub fn get_pivot_tol(&self) -> F {
        self.pivot_tol
    }

    /// Factorize the symmetric matrix `sigma` as `L.Lt`.
    ///
    /// When the plain factorization hits a non-positive pivot, it is retried once
    /// on `sigma + eps.I`. If that fails too [`ReparamError::NotPositiveDefinite`] is returned.
    pub fn factor(&self, sigma: &ArrayBase<impl Data<Elem = F>, Ix2>) -> Result<CholeskyFactor<F>> {
        check_square("cholesky", sigma)?;
        let n = sigma.nrows();
        if n == 0 {
            return Ok(CholeskyFactor {
                l: Array2::zeros((0, 0)),
                jitter: F::zero(),
                pivot_tol: self.pivot_tol,
            });
        }
        if sigma.iter().any(|v| !v.is_finite()) {
            return Err(ReparamError::InvalidValueError(format!(
                "cannot factorize a ({n}x{n}) matrix with non finite entries"
            )));
        }
        let scale = *sigma
            .diag()
            .mapv(num_traits::Float::abs)
            .max()
            .map_err(|e| ReparamError::InvalidValueError(e.to_string()))?;
        let scale = if scale > F::zero() { scale } else { F::one() };
        let sym_tol = F::epsilon().sqrt() * scale.max(F::one());
        for i in 0..n {
            for j in 0..i {
                if num_traits::Float::abs(sigma[[i, j]] - sigma[[j, i]]) > sym_tol {
                    return Err(ReparamError::InvalidValueError(format!(
                        "cannot factorize a non symmetric matrix: Σ[{i}, {j}] = {} != Σ[{j}, {i}] = {}",
                        sigma[[i, j]],
                        sigma[[j, i]]
                    )));
                }
            }
        }

        if let Some(l) = try_cholesky(sigma)? {
            debug!("Cholesky factorization ({n}x{n}) succeeded without jitter");
            return Ok(CholeskyFactor {
                l,
                jitter: F::zero(),
                pivot_tol: self.pivot_tol,
            });
        }

        let eps = self.jitter * scale;
        warn!("Cholesky factorization ({n}x{n}) failed, retry with diagonal jitter {eps:e}");
        let repaired = add_diagonal_jitter(sigma, eps)?;
        match try_cholesky(&repaired)? {
            Some(l) => Ok(CholeskyFactor {
                l,
                jitter: eps,
                pivot_tol: self.pivot_tol,
            }),
            None => Err(ReparamError::NotPositiveDefinite {
                dim: n,
                jitter: as_f64(eps),
            }),
        }
    }
}

/// Returns `None` when a computed pivot is not strictly positive
fn try_cholesky<F: Float>(sigma: &ArrayBase<impl Data<Elem = F>, Ix2>) -> Result<Option<Array2<F>>> {
    let mut l = match sigma.cholesky() {
        Ok(l) => l,
        Err(LinalgError::NotPositiveDefinite) => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    if l.diag().iter().any(|v| !(*v > F::zero() && v.is_finite())) {
        return Ok(None);
    }
    let n = l.nrows();
    for i in 0..n {
        for j in (i + 1)..n {
            l[[i, j]] = F::zero();
        }
    }
    Ok(Some(l))
}
