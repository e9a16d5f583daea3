//! A module for covariance models (kernels) used to build GP Gram matrices.
//!
//! The following stationary covariance models are implemented, `d` being the
//! euclidean distance between two covariate points:
//! * squared exponential: `alpha^2 * exp(-d^2 / rho^2)`,
//! * absolute exponential: `alpha^2 * exp(-d / rho)`,
//! * matern 3/2: `alpha^2 * (1 + sqrt(3) d / rho) * exp(-sqrt(3) d / rho)`,
//! * matern 5/2: `alpha^2 * (1 + sqrt(5) d / rho + 5 d^2 / (3 rho^2)) * exp(-sqrt(5) d / rho)`,
//!
//! plus a white noise term `sigma^2 * [x1 == x2]`.
//!
//! Covariance models can be composed with [`CovarianceModel::sum`] and
//! [`CovarianceModel::product`], the result being a covariance model as well.

use crate::errors::{ReparamError, Result};
use linfa::Float;
use ndarray::{Array2, ArrayBase, Data, Ix1, Ix2, Zip};
use paste::paste;
#[cfg(feature = "serializable")]
use serde::{Deserialize, Serialize};
use std::fmt;

/// A trait for covariance functions `k(x1, x2)` over covariate points
pub trait CovarianceModel<F: Float>: Clone + fmt::Display + Send + Sync {
    /// Covariance between two covariate points given as (nx,) vectors.
    ///
    /// *Panics* if `x1` and `x2` have not the same number of components
    fn value(
        &self,
        x1: &ArrayBase<impl Data<Elem = F>, Ix1>,
        x2: &ArrayBase<impl Data<Elem = F>, Ix1>,
    ) -> F;

    /// Flat list of the hyperparameters, used to identify a kernel configuration
    fn hyperparameters(&self) -> Vec<F>;

    /// Validate hyperparameters
    fn check(&self) -> Result<()> {
        Ok(())
    }

    /// Gram matrix `K[i, j] = k(x_i, x_j)` over points given as a (n, nx) matrix.
    ///
    /// Only the upper triangle is evaluated, the lower one is mirrored so that
    /// the result is exactly symmetric.
    fn gram(&self, xs: &ArrayBase<impl Data<Elem = F>, Ix2>) -> Result<Array2<F>> {
        self.check()?;
        let xs = xs.view();
        let n = xs.nrows();
        let mut gram = Array2::<F>::zeros((n, n));
        Zip::indexed(gram.rows_mut()).par_for_each(|i, mut row| {
            let xi = xs.row(i);
            for j in i..n {
                row[j] = self.value(&xi, &xs.row(j));
            }
        });
        for i in 1..n {
            for j in 0..i {
                gram[[i, j]] = gram[[j, i]];
            }
        }
        Ok(gram)
    }

    /// Cross covariance matrix `K[i, j] = k(x_i, y_j)` between (n, nx) points `xs`
    /// and (m, nx) points `ys`.
    fn cross_gram(
        &self,
        xs: &ArrayBase<impl Data<Elem = F>, Ix2>,
        ys: &ArrayBase<impl Data<Elem = F>, Ix2>,
    ) -> Result<Array2<F>> {
        self.check()?;
        if xs.ncols() != ys.ncols() {
            return Err(ReparamError::DimensionMismatch {
                op: "cross_gram",
                left: xs.dim(),
                right: ys.dim(),
            });
        }
        let (xs, ys) = (xs.view(), ys.view());
        let mut cross = Array2::<F>::zeros((xs.nrows(), ys.nrows()));
        Zip::from(cross.rows_mut())
            .and(xs.rows())
            .par_for_each(|mut row, xi| {
                Zip::from(&mut row)
                    .and(ys.rows())
                    .for_each(|k, yj| *k = self.value(&xi, &yj));
            });
        Ok(cross)
    }

    /// Sum of two covariance models
    fn sum<K: CovarianceModel<F>>(self, other: K) -> SumCov<Self, K>
    where
        Self: Sized,
    {
        SumCov(self, other)
    }

    /// Product of two covariance models
    fn product<K: CovarianceModel<F>>(self, other: K) -> ProductCov<Self, K>
    where
        Self: Sized,
    {
        ProductCov(self, other)
    }
}

/// Squared euclidean distance between two points
///
/// *Panics* if `x1` and `x2` have not the same number of components
pub fn squared_distance<F: Float>(
    x1: &ArrayBase<impl Data<Elem = F>, Ix1>,
    x2: &ArrayBase<impl Data<Elem = F>, Ix1>,
) -> F {
    assert!(x1.len() == x2.len());
    let mut d2 = F::zero();
    Zip::from(x1).and(x2).for_each(|&a, &b| d2 += (a - b) * (a - b));
    d2
}

fn check_alpha_rho<F: Float>(name: &str, alpha: F, rho: F) -> Result<()> {
    if !alpha.is_finite() || alpha < F::zero() {
        return Err(ReparamError::InvalidValueError(format!(
            "{name}: marginal scale alpha should be positive and finite, got {alpha}"
        )));
    }
    if !rho.is_finite() || rho <= F::zero() {
        return Err(ReparamError::InvalidValueError(format!(
            "{name}: length scale rho should be strictly positive and finite, got {rho}"
        )));
    }
    Ok(())
}

macro_rules! declare_stationary_cov {
    ($kernel:ident, $doc:literal) => {
        paste! {
            #[doc = $doc]
            #[derive(Clone, Copy, Debug, PartialEq)]
            #[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
            pub struct [<$kernel Cov>]<F: Float> {
                alpha: F,
                rho: F,
            }

            impl<F: Float> [<$kernel Cov>]<F> {
                /// Constructor given marginal scale `alpha` and length scale `rho`
                pub fn new(alpha: F, rho: F) -> Self {
                    Self { alpha, rho }
                }

                /// Marginal scale
                pub fn alpha(&self) -> F {
                    self.alpha
                }

                /// Length scale
                pub fn rho(&self) -> F {
                    self.rho
                }
            }

            impl<F: Float> fmt::Display for [<$kernel Cov>]<F> {
                fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                    write!(f, "{}(alpha={}, rho={})", stringify!($kernel), self.alpha, self.rho)
                }
            }
        }
    };
}

declare_stationary_cov!(SquaredExponential, "Squared exponential (a.k.a. exponentiated quadratic) covariance");
declare_stationary_cov!(AbsoluteExponential, "Absolute exponential covariance");
declare_stationary_cov!(Matern32, "Matern 3/2 covariance");
declare_stationary_cov!(Matern52, "Matern 5/2 covariance");

impl<F: Float> CovarianceModel<F> for SquaredExponentialCov<F> {
    /// alpha^2 * exp(-|x1 - x2|^2 / rho^2)
    fn value(
        &self,
        x1: &ArrayBase<impl Data<Elem = F>, Ix1>,
        x2: &ArrayBase<impl Data<Elem = F>, Ix1>,
    ) -> F {
        let d2 = squared_distance(x1, x2);
        self.alpha * self.alpha * F::exp(-d2 / (self.rho * self.rho))
    }

    fn hyperparameters(&self) -> Vec<F> {
        vec![self.alpha, self.rho]
    }

    fn check(&self) -> Result<()> {
        check_alpha_rho("SquaredExponential", self.alpha, self.rho)
    }
}

impl<F: Float> CovarianceModel<F> for AbsoluteExponentialCov<F> {
    fn value(
        &self,
        x1: &ArrayBase<impl Data<Elem = F>, Ix1>,
        x2: &ArrayBase<impl Data<Elem = F>, Ix1>,
    ) -> F {
        let d = squared_distance(x1, x2).sqrt();
        self.alpha * self.alpha * F::exp(-d / self.rho)
    }

    fn hyperparameters(&self) -> Vec<F> {
        vec![self.alpha, self.rho]
    }

    fn check(&self) -> Result<()> {
        check_alpha_rho("AbsoluteExponential", self.alpha, self.rho)
    }
}

impl<F: Float> CovarianceModel<F> for Matern32Cov<F> {
    fn value(
        &self,
        x1: &ArrayBase<impl Data<Elem = F>, Ix1>,
        x2: &ArrayBase<impl Data<Elem = F>, Ix1>,
    ) -> F {
        let r = F::cast(3.).sqrt() * squared_distance(x1, x2).sqrt() / self.rho;
        self.alpha * self.alpha * (F::one() + r) * F::exp(-r)
    }

    fn hyperparameters(&self) -> Vec<F> {
        vec![self.alpha, self.rho]
    }

    fn check(&self) -> Result<()> {
        check_alpha_rho("Matern32", self.alpha, self.rho)
    }
}

impl<F: Float> CovarianceModel<F> for Matern52Cov<F> {
    fn value(
        &self,
        x1: &ArrayBase<impl Data<Elem = F>, Ix1>,
        x2: &ArrayBase<impl Data<Elem = F>, Ix1>,
    ) -> F {
        let r = F::cast(5.).sqrt() * squared_distance(x1, x2).sqrt() / self.rho;
        self.alpha * self.alpha * (F::one() + r + r * r / F::cast(3.)) * F::exp(-r)
    }

    fn hyperparameters(&self) -> Vec<F> {
        vec![self.alpha, self.rho]
    }

    fn check(&self) -> Result<()> {
        check_alpha_rho("Matern52", self.alpha, self.rho)
    }
}

/// White noise covariance `sigma^2` between identical points, zero otherwise
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub struct WhiteNoiseCov<F: Float> {
    sigma: F,
}

impl<F: Float> WhiteNoiseCov<F> {
    /// Constructor given the noise standard deviation
    pub fn new(sigma: F) -> Self {
        Self { sigma }
    }

    /// Noise standard deviation
    pub fn sigma(&self) -> F {
        self.sigma
    }
}

impl<F: Float> fmt::Display for WhiteNoiseCov<F> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "WhiteNoise(sigma={})", self.sigma)
    }
}

impl<F: Float> CovarianceModel<F> for WhiteNoiseCov<F> {
    fn value(
        &self,
        x1: &ArrayBase<impl Data<Elem = F>, Ix1>,
        x2: &ArrayBase<impl Data<Elem = F>, Ix1>,
    ) -> F {
        assert!(x1.len() == x2.len());
        if x1.iter().zip(x2.iter()).all(|(a, b)| a == b) {
            self.sigma * self.sigma
        } else {
            F::zero()
        }
    }

    fn hyperparameters(&self) -> Vec<F> {
        vec![self.sigma]
    }

    fn check(&self) -> Result<()> {
        if !self.sigma.is_finite() || self.sigma < F::zero() {
            return Err(ReparamError::InvalidValueError(format!(
                "WhiteNoise: sigma should be positive and finite, got {}",
                self.sigma
            )));
        }
        Ok(())
    }
}

/// Sum `k1 + k2` of two covariance models
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub struct SumCov<K1, K2>(pub K1, pub K2);

impl<K1: fmt::Display, K2: fmt::Display> fmt::Display for SumCov<K1, K2> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "({} + {})", self.0, self.1)
    }
}

impl<F: Float, K1: CovarianceModel<F>, K2: CovarianceModel<F>> CovarianceModel<F>
    for SumCov<K1, K2>
{
    fn value(
        &self,
        x1: &ArrayBase<impl Data<Elem = F>, Ix1>,
        x2: &ArrayBase<impl Data<Elem = F>, Ix1>,
    ) -> F {
        self.0.value(x1, x2) + self.1.value(x1, x2)
    }

    fn hyperparameters(&self) -> Vec<F> {
        let mut hp = self.0.hyperparameters();
        hp.extend(self.1.hyperparameters());
        hp
    }

    fn check(&self) -> Result<()> {
        self.0.check()?;
        self.1.check()
    }
}

/// Product `k1 * k2` of two covariance models
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub struct ProductCov<K1, K2>(pub K1, pub K2);

impl<K1: fmt::Display, K2: fmt::Display> fmt::Display for ProductCov<K1, K2> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "({} * {})", self.0, self.1)
    }
}

impl<F: Float, K1: CovarianceModel<F>, K2: CovarianceModel<F>> CovarianceModel<F>
    for ProductCov<K1, K2>
{
    fn value(
        &self,
        x1: &ArrayBase<impl Data<Elem = F>, Ix1>,
        x2: &ArrayBase<impl Data<Elem = F>, Ix1>,
    ) -> F {
        self.0.value(x1, x2) * self.1.value(x1, x2)
    }

    fn hyperparameters(&self) -> Vec<F> {
        let mut hp = self.0.hyperparameters();
        hp.extend(self.1.hyperparameters());
        hp
    }

    fn check(&self) -> Result<()> {
        self.0.check()?;
        self.1.check()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cholesky::CholeskyFactorizer;
    use crate::linalg::add_diagonal_jitter;
    use approx::assert_abs_diff_eq;
    use ndarray::{array, Array, Axis};

    #[test]
    fn test_squared_exponential_values() {
        let k = SquaredExponentialCov::new(3., 5.5);
        assert_abs_diff_eq!(k.value(&array![0.], &array![0.]), 9.0, epsilon = 1e-15);
        assert_abs_diff_eq!(k.value(&array![0.], &array![1e3]), 0.0, epsilon = 1e-12);
        let expected = 9. * f64::exp(-4. / (5.5 * 5.5));
        assert_abs_diff_eq!(k.value(&array![1.], &array![3.]), expected, epsilon = 1e-14);
        assert_eq!(k.to_string(), "SquaredExponential(alpha=3, rho=5.5)");
    }

    #[test]
    fn test_vector_covariates() {
        let k = SquaredExponentialCov::new(1., 1.);
        let v = k.value(&array![0., 0.], &array![1., 1.]);
        assert_abs_diff_eq!(v, f64::exp(-2.), epsilon = 1e-15);
    }

    macro_rules! test_stationary_cov {
        ($kernel:ident) => {
            paste! {
                #[test]
                fn [<test_ $kernel:snake _properties>]() {
                    let k = [<$kernel Cov>]::new(2., 1.5);
                    // alpha^2 at zero distance
                    assert_abs_diff_eq!(k.value(&array![0.3], &array![0.3]), 4., epsilon = 1e-14);
                    // vanishes at infinity
                    assert_abs_diff_eq!(k.value(&array![0.], &array![1e4]), 0., epsilon = 1e-10);
                    // decreasing with distance
                    let near = k.value(&array![0.], &array![0.5]);
                    let far = k.value(&array![0.], &array![1.5]);
                    assert!(near > far);
                    // symmetric
                    assert_eq!(
                        k.value(&array![0.2], &array![1.7]),
                        k.value(&array![1.7], &array![0.2])
                    );

                    let xs = Array::linspace(0., 3., 7).insert_axis(Axis(1));
                    let gram = k.gram(&xs).unwrap();
                    assert_eq!(gram, gram.t());
                    let jittered = add_diagonal_jitter(&gram, 1e-10).unwrap();
                    assert!(CholeskyFactorizer::new().factor(&jittered).is_ok());

                    let bad = [<$kernel Cov>]::new(2., -1.);
                    assert!(matches!(bad.gram(&xs), Err(ReparamError::InvalidValueError(_))));
                }
            }
        };
    }

    test_stationary_cov!(SquaredExponential);
    test_stationary_cov!(AbsoluteExponential);
    test_stationary_cov!(Matern32);
    test_stationary_cov!(Matern52);

    #[test]
    fn test_gram_three_points() {
        let k = SquaredExponentialCov::new(3., 5.5);
        let xs = array![[-1.], [0.5], [2.]];
        let gram = k.gram(&xs).unwrap();
        for i in 0..3 {
            assert_abs_diff_eq!(gram[[i, i]], 9., epsilon = 1e-14);
            for j in 0..3 {
                assert_eq!(gram[[i, j]], gram[[j, i]]);
            }
        }
        let jittered = add_diagonal_jitter(&gram, 1e-10).unwrap();
        let chol = CholeskyFactorizer::new().factor(&jittered).unwrap();
        assert_abs_diff_eq!(chol.reconstruct(), jittered, epsilon = 1e-10);
    }

    #[test]
    fn test_cross_gram() {
        let k = Matern32Cov::new(1., 2.);
        let xs = array![[0.], [1.], [2.]];
        let ys = array![[1.], [5.]];
        let cross = k.cross_gram(&xs, &ys).unwrap();
        assert_eq!(cross.dim(), (3, 2));
        assert_abs_diff_eq!(cross[[1, 0]], 1., epsilon = 1e-15);
        assert_abs_diff_eq!(cross[[0, 1]], k.value(&array![0.], &array![5.]), epsilon = 1e-15);
        assert!(matches!(
            k.cross_gram(&xs, &array![[1., 2.]]),
            Err(ReparamError::DimensionMismatch { .. })
        ));
        // gram is the cross covariance of a set with itself
        assert_abs_diff_eq!(k.cross_gram(&xs, &xs).unwrap(), k.gram(&xs).unwrap(), epsilon = 1e-15);
    }

    #[test]
    fn test_white_noise() {
        let k = WhiteNoiseCov::new(0.5);
        assert_eq!(k.value(&array![1., 2.], &array![1., 2.]), 0.25);
        assert_eq!(k.value(&array![1., 2.], &array![1., 2.5]), 0.);
        assert!(WhiteNoiseCov::new(-1.).check().is_err());
    }

    #[test]
    fn test_composition() {
        let se = SquaredExponentialCov::new(2., 1.);
        let noise = WhiteNoiseCov::new(0.1);
        let k = se.sum(noise);
        assert_abs_diff_eq!(k.value(&array![0.], &array![0.]), 4.01, epsilon = 1e-14);
        assert_abs_diff_eq!(
            k.value(&array![0.], &array![1.]),
            se.value(&array![0.], &array![1.]),
            epsilon = 1e-15
        );
        assert_eq!(k.hyperparameters(), vec![2., 1., 0.1]);

        let se_matern = se.product(Matern52Cov::new(1., 3.));
        let v = se_matern.value(&array![0.], &array![1.]);
        let expected = se.value(&array![0.], &array![1.])
            * Matern52Cov::new(1., 3.).value(&array![0.], &array![1.]);
        assert_abs_diff_eq!(v, expected, epsilon = 1e-15);
        assert_eq!(
            se_matern.to_string(),
            "(SquaredExponential(alpha=2, rho=1) * Matern52(alpha=1, rho=3))"
        );

        // compositions of valid kernels stay positive semi-definite
        let xs = Array::linspace(0., 5., 10).insert_axis(Axis(1));
        let nested = se_matern.sum(AbsoluteExponentialCov::new(0.5, 2.));
        let gram = add_diagonal_jitter(&nested.gram(&xs).unwrap(), 1e-10).unwrap();
        assert!(CholeskyFactorizer::new().factor(&gram).is_ok());

        let invalid = se.sum(SquaredExponentialCov::new(1., 0.));
        assert!(invalid.check().is_err());
    }
}
