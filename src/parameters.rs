use crate::algorithm::GaussianProcessEngine;
use crate::cholesky::DEFAULT_JITTER;
use crate::covariance_models::CovarianceModel;
use crate::errors::{ReparamError, Result};
use crate::linalg::default_pivot_tol;
use linfa::{Float, ParamGuard};

/// Default nugget added to Gram matrix diagonals before factorization
pub const DEFAULT_NUGGET: f64 = 1e-10;

#[derive(Clone, Debug)]
/// The set of parameters that can be specified for the execution of
/// the [GP engine](GaussianProcessEngine).
pub struct GpEngineParams<F: Float, K: CovarianceModel<F>>(pub(crate) GaussianProcessEngine<F, K>);

impl<F: Float, K: CovarianceModel<F>> GpEngineParams<F, K> {
    /// A constructor for GP engine parameters given a covariance model
    pub fn new(kernel: K) -> GpEngineParams<F, K> {
        Self(GaussianProcessEngine {
            kernel,
            noise: F::zero(),
            nugget: F::cast(DEFAULT_NUGGET),
            jitter: F::cast(DEFAULT_JITTER),
            pivot_tol: default_pivot_tol(),
        })
    }

    /// Set covariance model.
    pub fn kernel(mut self, kernel: K) -> Self {
        self.0.kernel = kernel;
        self
    }

    /// Set measurement noise standard deviation `sigma` used in conjugate conditioning.
    pub fn noise(mut self, noise: F) -> Self {
        self.0.noise = noise;
        self
    }

    /// Set nugget.
    ///
    /// Nugget is always added to Gram matrix diagonals to improve numerical stability
    pub fn nugget(mut self, nugget: F) -> Self {
        self.0.nugget = nugget;
        self
    }

    /// Set the relative jitter used when a Cholesky factorization has to be repaired
    pub fn jitter(mut self, jitter: F) -> Self {
        self.0.jitter = jitter;
        self
    }

    /// Set the tolerance under which a triangular pivot is considered zero
    pub fn pivot_tol(mut self, pivot_tol: F) -> Self {
        self.0.pivot_tol = pivot_tol;
        self
    }
}

impl<F: Float, K: CovarianceModel<F>> From<GaussianProcessEngine<F, K>> for GpEngineParams<F, K> {
    fn from(valid: GaussianProcessEngine<F, K>) -> Self {
        GpEngineParams(valid)
    }
}

impl<F: Float, K: CovarianceModel<F>> ParamGuard for GpEngineParams<F, K> {
    type Checked = GaussianProcessEngine<F, K>;
    type Error = ReparamError;

    fn check_ref(&self) -> Result<&Self::Checked> {
        self.0.kernel.check()?;
        let positive = |name: &str, v: F| {
            if v.is_finite() && v >= F::zero() {
                Ok(())
            } else {
                Err(ReparamError::InvalidValueError(format!(
                    "`{name}` should be positive and finite, got {v}"
                )))
            }
        };
        positive("noise", self.0.noise)?;
        positive("nugget", self.0.nugget)?;
        positive("pivot_tol", self.0.pivot_tol)?;
        if !(self.0.jitter.is_finite() && self.0.jitter > F::zero()) {
            return Err(ReparamError::InvalidValueError(format!(
                "`jitter` should be strictly positive, got {}",
                self.0.jitter
            )));
        }
        Ok(&self.0)
    }

    fn check(self) -> Result<Self::Checked> {
        self.check_ref()?;
        Ok(self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::covariance_models::{SquaredExponentialCov, WhiteNoiseCov};

    #[test]
    fn test_default_params() {
        let engine = GpEngineParams::new(SquaredExponentialCov::new(1., 1.))
            .check()
            .unwrap();
        assert_eq!(engine.noise(), 0.);
        assert_eq!(engine.nugget(), 1e-10);
        assert_eq!(engine.jitter(), 1e-8);
        assert_eq!(engine.pivot_tol(), 100. * f64::EPSILON);
    }

    #[test]
    fn test_invalid_params() {
        let kernel = SquaredExponentialCov::new(1., 1.);
        assert!(GpEngineParams::new(kernel).noise(-0.1).check().is_err());
        assert!(GpEngineParams::new(kernel).nugget(f64::NAN).check().is_err());
        assert!(GpEngineParams::new(kernel).jitter(0.).check().is_err());
        assert!(GpEngineParams::new(kernel).pivot_tol(-1.).check().is_err());
        assert!(GpEngineParams::new(SquaredExponentialCov::new(1., 0.))
            .check()
            .is_err());
        assert!(GpEngineParams::new(WhiteNoiseCov::new(1.))
            .kernel(WhiteNoiseCov::new(-1.))
            .check()
            .is_err());
    }

    #[test]
    fn test_params_round_trip() {
        let engine = GpEngineParams::new(SquaredExponentialCov::new(2., 3.))
            .noise(0.5)
            .check()
            .unwrap();
        let params = GpEngineParams::from(engine).nugget(1e-9);
        let engine = params.check().unwrap();
        assert_eq!(engine.noise(), 0.5);
        assert_eq!(engine.nugget(), 1e-9);
        assert_eq!(engine.kernel().rho(), 3.);
    }
}
