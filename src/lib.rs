//! This library implements numerical reparameterizations commonly used to make
//! Bayesian regression and [Gaussian Process](https://en.wikipedia.org/wiki/Gaussian_process)
//! models easier to sample from:
//!
//! * the scaled thin QR reparameterization of a linear predictor which turns
//!   correlated regression coefficients into nearly independent ones,
//!   see [QrReparam] and the [qr_reparam] module,
//! * Gaussian process prior simulation, conjugate conditioning on noisy
//!   observations and the non-centered latent parameterization `f = mu + L.eta`,
//!   see [GaussianProcessEngine] parameterized by [GpEngineParams].
//!
//! Both rely on a stabilized Cholesky factorization ([CholeskyFactorizer]) which
//! repairs ill-conditioned Gram matrices with a diagonal jitter, and on shape
//! checked [linalg] primitives. Gram matrix factors can be shared between
//! concurrent evaluations through a [CholeskyCache].
//!
//! All computations are generic over the float type `F` (`f32` or `f64`).
//! Random draws are never generated internally: standard normal variables are
//! supplied by the caller, [sampling] provides helpers to draw them from a
//! seeded generator.
#![warn(missing_docs)]
#![warn(rustdoc::broken_intra_doc_links)]
mod algorithm;
mod cache;
mod cholesky;
pub mod covariance_models;
pub mod density;
mod errors;
pub mod linalg;
mod parameters;
pub mod qr_reparam;
pub mod sampling;

pub use algorithm::*;
pub use cache::CholeskyCache;
pub use cholesky::*;
pub use covariance_models::{
    AbsoluteExponentialCov, CovarianceModel, Matern32Cov, Matern52Cov, ProductCov,
    SquaredExponentialCov, SumCov, WhiteNoiseCov,
};
pub use errors::*;
pub use parameters::*;
pub use qr_reparam::{center, original_intercept, QrReparam, QrReparamParams};
