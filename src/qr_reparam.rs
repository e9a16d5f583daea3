//! Scaled thin QR reparameterization of a linear regression.
//!
//! Given a (N, M) design matrix `X`, the linear predictor `mu = X.beta + alpha` is
//! rewritten as `mu = Q*.beta~ + alpha` with `X = Q*.R*`, `Q* = Q.N` and `R* = R/N`
//! where `Q.R` is the thin QR decomposition of `X`. The columns of `Q*` are
//! orthogonal, so the posterior of the transformed coefficients `beta~ = R*.beta`
//! is much less correlated than the one of `beta`, and the `N` scaling keeps
//! `beta~` on a unit-like scale whatever the natural units of the covariates.
//!
//! Coefficients sampled on the `beta~` scale are mapped back with
//! [`QrReparam::to_original`], a back substitution against `R*`.
//!
//! # Centering
//!
//! Decorrelation is complete only when the covariates are centered. [`center`]
//! is provided as an explicit preprocessing step, it is never applied
//! automatically because it changes the meaning of the intercept: a model
//! fitted on centered covariates `Xc = X - means` has an intercept `alpha`
//! which corresponds to `alpha - means.beta` on the uncentered scale
//! (see [`original_intercept`]).
//!
//! # Example
//!
//! ```
//! use egobox_reparam::QrReparam;
//! use ndarray::array;
//!
//! let x = array![[1., 1.], [2., 4.], [3., 9.], [4., 16.]];
//! let qr = QrReparam::factor(&x).expect("full rank design");
//!
//! let beta = array![0.5, -2.];
//! let beta_tilde = qr.to_transformed(&beta).unwrap();
//! let back = qr.to_original(&beta_tilde).unwrap();
//! assert!((&back - &beta).mapv(f64::abs).sum() < 1e-10);
//! ```

use crate::errors::{ReparamError, Result};
use crate::linalg::{
    as_f64, default_pivot_tol, inverse_triangular, multiply_vec, solve_triangular,
    solve_triangular_vec, Triangular,
};
use linfa::{Float, ParamGuard};
use linfa_linalg::qr::*;
use log::debug;
use ndarray::{s, Array1, Array2, ArrayBase, Axis, Data, Ix1, Ix2};
#[cfg(feature = "serializable")]
use serde::{Deserialize, Serialize};

/// Default relative tolerance on `|R[k, k]| / ||X[.., k]||` under which the design
/// matrix is considered rank deficient
pub const DEFAULT_RANK_TOL: f64 = 1e-10;

/// A set of validated QR reparameterization parameters.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub struct QrReparamValidParams<F: Float> {
    /// Relative rank deficiency tolerance
    rank_tol: F,
    /// Pivot tolerance used by back substitutions against R
    pivot_tol: F,
}

impl<F: Float> Default for QrReparamValidParams<F> {
    fn default() -> Self {
        QrReparamValidParams {
            rank_tol: F::cast(DEFAULT_RANK_TOL),
            pivot_tol: default_pivot_tol(),
        }
    }
}

impl<F: Float> QrReparamValidParams<F> {
    /// Get relative rank deficiency tolerance
    pub fn rank_tol(&self) -> F {
        self.rank_tol
    }

    /// Get pivot tolerance
    pub fn pivot_tol(&self) -> F {
        self.pivot_tol
    }

    /// Computes the scaled thin QR decomposition of the (N, M) design matrix `x`.
    ///
    /// Fails with [`ReparamError::DimensionMismatch`] when N < M and with
    /// [`ReparamError::RankDeficient`] when the columns of `x` are not linearly independent.
    pub fn factor(&self, x: &ArrayBase<impl Data<Elem = F>, Ix2>) -> Result<QrReparam<F>> {
        let (n, m) = x.dim();
        if m == 0 || n < m {
            return Err(ReparamError::DimensionMismatch {
                op: "qr",
                left: (n, m),
                right: (m, m),
            });
        }
        if x.iter().any(|v| !v.is_finite()) {
            return Err(ReparamError::InvalidValueError(
                "design matrix has non finite entries".to_string(),
            ));
        }

        let norms = x.map_axis(Axis(0), |col| num_traits::Float::sqrt(col.dot(&col)));
        let (q, r) = x.to_owned().qr()?.into_decomp();
        let mut q = q.slice(s![.., ..m]).to_owned();
        let mut r = r.slice(s![..m, ..m]).to_owned();

        // positive diagonal for R, Q columns flipped accordingly
        for k in 0..m {
            r.row_mut(k).slice_mut(s![..k]).fill(F::zero());
            if r[[k, k]] < F::zero() {
                r.row_mut(k).mapv_inplace(|v| -v);
                q.column_mut(k).mapv_inplace(|v| -v);
            }
        }

        // |R[k, k]| is the norm of the part of column k not spanned by the previous ones
        for (column, (&pivot, &norm)) in r.diag().iter().zip(norms.iter()).enumerate() {
            let pivot = num_traits::Float::abs(pivot);
            let tol = self.rank_tol * norm;
            if norm == F::zero() || !(pivot > tol) {
                return Err(ReparamError::RankDeficient {
                    column,
                    pivot: as_f64(pivot),
                    tol: as_f64(tol),
                });
            }
        }

        let scale = F::cast(n);
        q.mapv_inplace(|v| v * scale);
        r.mapv_inplace(|v| v / scale);
        debug!("QR reparameterization of a ({n}x{m}) design matrix");

        Ok(QrReparam {
            q,
            r,
            n_obs: n,
            pivot_tol: self.pivot_tol,
        })
    }
}

/// The set of parameters that can be specified for the computation of a [`QrReparam`].
#[derive(Clone, Copy, Debug, PartialEq, Default)]
pub struct QrReparamParams<F: Float>(QrReparamValidParams<F>);

impl<F: Float> QrReparamParams<F> {
    /// Constructor with default tolerances
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the relative rank deficiency tolerance, should be in ]0, 1[
    pub fn rank_tol(mut self, rank_tol: F) -> Self {
        self.0.rank_tol = rank_tol;
        self
    }

    /// Set the pivot tolerance of back substitutions against R
    pub fn pivot_tol(mut self, pivot_tol: F) -> Self {
        self.0.pivot_tol = pivot_tol;
        self
    }
}

impl<F: Float> ParamGuard for QrReparamParams<F> {
    type Checked = QrReparamValidParams<F>;
    type Error = ReparamError;

    fn check_ref(&self) -> Result<&Self::Checked> {
        if !(self.0.rank_tol > F::zero() && self.0.rank_tol < F::one()) {
            return Err(ReparamError::InvalidValueError(format!(
                "`rank_tol` should be in ]0, 1[, got {}",
                self.0.rank_tol
            )));
        }
        if !(self.0.pivot_tol >= F::zero()) {
            return Err(ReparamError::InvalidValueError(format!(
                "`pivot_tol` should be positive, got {}",
                self.0.pivot_tol
            )));
        }
        Ok(&self.0)
    }

    fn check(self) -> Result<Self::Checked> {
        self.check_ref()?;
        Ok(self.0)
    }
}

/// Scaled thin QR decomposition `X = Q*.R*` of a design matrix, with
/// `Q*t.Q* = N^2.I` and `R*` upper triangular with a positive diagonal.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(
    feature = "serializable",
    derive(Serialize, Deserialize),
    serde(bound(deserialize = "F: Deserialize<'de>"))
)]
pub struct QrReparam<F: Float> {
    /// Scaled orthogonal factor (N, M)
    q: Array2<F>,
    /// Scaled upper triangular factor (M, M)
    r: Array2<F>,
    /// Number of observations N
    n_obs: usize,
    /// Pivot tolerance used by back substitutions against R
    pivot_tol: F,
}

impl<F: Float> QrReparam<F> {
    /// QR reparameterization parameters constructor
    pub fn params() -> QrReparamParams<F> {
        QrReparamParams::new()
    }

    /// Factor the design matrix `x` with default tolerances
    pub fn factor(x: &ArrayBase<impl Data<Elem = F>, Ix2>) -> Result<Self> {
        QrReparamValidParams::default().factor(x)
    }

    /// Design matrix to use in place of `X` in the linear predictor, ie. `Q*`
    pub fn forward_design(&self) -> &Array2<F> {
        &self.q
    }

    /// Scaled upper triangular factor `R*`
    pub fn r(&self) -> &Array2<F> {
        &self.r
    }

    /// Number of observations N
    pub fn n_obs(&self) -> usize {
        self.n_obs
    }

    /// Number of regression coefficients M
    pub fn n_coefs(&self) -> usize {
        self.r.nrows()
    }

    /// Returns `beta~ = R*.beta`
    pub fn to_transformed(&self, beta: &ArrayBase<impl Data<Elem = F>, Ix1>) -> Result<Array1<F>> {
        multiply_vec(&self.r, beta)
    }

    /// Returns `beta = R*^-1.beta~` by back substitution
    pub fn to_original(
        &self,
        beta_tilde: &ArrayBase<impl Data<Elem = F>, Ix1>,
    ) -> Result<Array1<F>> {
        solve_triangular_vec(&self.r, beta_tilde, Triangular::Upper, self.pivot_tol)
    }

    /// Maps every draw of `beta~` given as rows of a (n_draws, M) matrix back to
    /// the original coefficient scale, returned as a (n_draws, M) matrix.
    pub fn to_original_draws(
        &self,
        draws: &ArrayBase<impl Data<Elem = F>, Ix2>,
    ) -> Result<Array2<F>> {
        if draws.ncols() != self.n_coefs() {
            return Err(ReparamError::DimensionMismatch {
                op: "to_original_draws",
                left: self.r.dim(),
                right: draws.dim(),
            });
        }
        let beta = solve_triangular(&self.r, &draws.t(), Triangular::Upper, self.pivot_tol)?;
        Ok(beta.reversed_axes())
    }

    /// Linear predictor `mu = Q*.beta~ + alpha`
    pub fn linear_predictor(
        &self,
        beta_tilde: &ArrayBase<impl Data<Elem = F>, Ix1>,
        alpha: F,
    ) -> Result<Array1<F>> {
        Ok(multiply_vec(&self.q, beta_tilde)? + alpha)
    }

    /// Inverse of `R*` computed by back substitution
    pub fn r_inverse(&self) -> Result<Array2<F>> {
        inverse_triangular(&self.r, Triangular::Upper, self.pivot_tol)
    }
}

/// Centers the columns of the design matrix `x` on their empirical means.
///
/// Returns the centered matrix and the column means. Fitting on centered
/// covariates changes the interpretation of the intercept, see [`original_intercept`].
pub fn center<F: Float>(x: &ArrayBase<impl Data<Elem = F>, Ix2>) -> (Array2<F>, Array1<F>) {
    let means = x
        .mean_axis(Axis(0))
        .unwrap_or_else(|| Array1::zeros(x.ncols()));
    (x - &means, means)
}

/// Intercept on the uncentered scale `alpha - means.beta` given the intercept `alpha`
/// and coefficients `beta` of a model fitted on covariates centered with `means`.
pub fn original_intercept<F: Float>(
    alpha: F,
    means: &ArrayBase<impl Data<Elem = F>, Ix1>,
    beta: &ArrayBase<impl Data<Elem = F>, Ix1>,
) -> Result<F> {
    if means.len() != beta.len() {
        return Err(ReparamError::DimensionMismatch {
            op: "original_intercept",
            left: (1, means.len()),
            right: (beta.len(), 1),
        });
    }
    Ok(alpha - means.dot(beta))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{array, Array};

    fn quadratic_design() -> Array2<f64> {
        array![[1., 1.], [2., 4.], [3., 9.], [4., 16.]]
    }

    #[test]
    fn test_quadratic_design_factors() {
        let x = quadratic_design();
        let qr = QrReparam::factor(&x).unwrap();
        let r = qr.r();
        assert_eq!(r.dim(), (2, 2));
        assert_eq!(r[[1, 0]], 0.);
        assert!(r[[0, 0]] > 0.);
        assert!(r[[1, 1]] > 0.);
        assert_eq!(qr.forward_design().dim(), (4, 2));
        assert_eq!(qr.n_obs(), 4);
        assert_eq!(qr.n_coefs(), 2);

        // Q*.R* reproduces X
        assert_abs_diff_eq!(qr.forward_design().dot(r), x, epsilon = 1e-10);

        // Q*t.Q* = N^2.I
        let qtq = qr.forward_design().t().dot(qr.forward_design());
        assert_abs_diff_eq!(qtq, Array2::<f64>::eye(2) * 16., epsilon = 1e-10);
    }

    #[test]
    fn test_round_trip() {
        let qr = QrReparam::factor(&quadratic_design()).unwrap();
        for beta in [array![0., 0.], array![1., -1.], array![-3.5, 0.25], array![1e3, 7.]] {
            let beta_tilde = qr.to_transformed(&beta).unwrap();
            let back = qr.to_original(&beta_tilde).unwrap();
            assert_abs_diff_eq!(back, beta, epsilon = 1e-9 * (1. + beta[0].abs()));
        }
    }

    #[test]
    fn test_linear_predictor_invariant() {
        let x = quadratic_design();
        let qr = QrReparam::factor(&x).unwrap();
        let beta = array![0.7, -0.2];
        let beta_tilde = qr.to_transformed(&beta).unwrap();
        let mu = qr.linear_predictor(&beta_tilde, 1.5).unwrap();
        assert_abs_diff_eq!(mu, x.dot(&beta) + 1.5, epsilon = 1e-10);
    }

    #[test]
    fn test_draws_inverse() {
        let qr = QrReparam::factor(&quadratic_design()).unwrap();
        let draws = array![[1., 2.], [-0.5, 0.3], [4., -1.]];
        let betas = qr.to_original_draws(&draws).unwrap();
        assert_eq!(betas.dim(), (3, 2));
        for (row, draw) in betas.rows().into_iter().zip(draws.rows()) {
            assert_abs_diff_eq!(row, qr.to_original(&draw).unwrap(), epsilon = 1e-12);
        }
        assert!(qr.to_original_draws(&Array2::<f64>::zeros((2, 3))).is_err());
    }

    #[test]
    fn test_r_inverse() {
        let qr = QrReparam::factor(&quadratic_design()).unwrap();
        let inv = qr.r_inverse().unwrap();
        assert_abs_diff_eq!(qr.r().dot(&inv), Array2::<f64>::eye(2), epsilon = 1e-10);
    }

    #[test]
    fn test_rank_deficient() {
        let x = array![[1., 1.], [2., 2.], [3., 3.], [4., 4.]];
        match QrReparam::factor(&x) {
            Err(ReparamError::RankDeficient { column, .. }) => assert_eq!(column, 1),
            other => panic!("expected rank deficiency, got {other:?}"),
        }
        let zeros = Array2::<f64>::zeros((3, 1));
        assert!(matches!(
            QrReparam::factor(&zeros),
            Err(ReparamError::RankDeficient { .. })
        ));
    }

    #[test]
    fn test_rank_independent_of_column_scale() {
        let x = Array2::from_shape_fn((4, 2), |(i, j)| {
            let k = (i + 1) as f64;
            if j == 0 {
                1e-13 * k
            } else {
                k * k
            }
        });
        let qr = QrReparam::factor(&x).unwrap();
        let beta = array![3e12, -0.5];
        let beta_tilde = qr.to_transformed(&beta).unwrap();
        assert_abs_diff_eq!(
            qr.forward_design().dot(&beta_tilde),
            x.dot(&beta),
            epsilon = 1e-8
        );

        let x = array![[1e8, 1e-3], [2e8, 2e-3], [3e8, 3e-3], [4e8, 4e-3]];
        match QrReparam::factor(&x) {
            Err(ReparamError::RankDeficient { column, .. }) => assert_eq!(column, 1),
            other => panic!("expected rank deficiency, got {other:?}"),
        }
    }

    #[test]
    fn test_not_enough_observations() {
        let x = array![[1., 2., 3.]];
        assert!(matches!(
            QrReparam::factor(&x),
            Err(ReparamError::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn test_params_guard() {
        assert!(QrReparam::<f64>::params().rank_tol(0.).check().is_err());
        assert!(QrReparam::<f64>::params().rank_tol(2.).check().is_err());
        assert!(QrReparam::<f64>::params().pivot_tol(-1.).check().is_err());
        let params = QrReparam::<f64>::params().rank_tol(1e-6).check().unwrap();
        assert_eq!(params.rank_tol(), 1e-6);
        assert!(params.factor(&quadratic_design()).is_ok());
    }

    #[test]
    fn test_centering_and_intercept() {
        let x = quadratic_design();
        let (xc, means) = center(&x);
        assert_abs_diff_eq!(means, array![2.5, 7.5], epsilon = 1e-12);
        assert_abs_diff_eq!(xc.sum_axis(Axis(0)), array![0., 0.], epsilon = 1e-12);

        // same predictor with centered covariates and shifted intercept
        let beta = array![0.3, 1.2];
        let alpha_c = 2.;
        let alpha = original_intercept(alpha_c, &means, &beta).unwrap();
        assert_abs_diff_eq!(xc.dot(&beta) + alpha_c, x.dot(&beta) + alpha, epsilon = 1e-12);
        assert!(original_intercept(alpha_c, &means, &array![1.]).is_err());
    }

    #[test]
    fn test_centering_decorrelates() {
        // a centered column is orthogonal to the intercept column
        let x = Array::linspace(10f64, 20., 11).insert_axis(Axis(1));
        let (xc, _) = center(&x);
        let qr = QrReparam::factor(&xc).unwrap();
        let q = qr.forward_design();
        assert_abs_diff_eq!(q.sum(), 0., epsilon = 1e-8);
        let qr_raw = QrReparam::factor(&x).unwrap();
        assert!(qr_raw.forward_design().sum().abs() > 1.);
    }
}
