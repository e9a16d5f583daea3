use thiserror::Error;

/// A result type for reparameterization and GP covariance computations
pub type Result<T> = std::result::Result<T, ReparamError>;

/// An error when using the [linear algebra](crate::linalg) primitives, the
/// [QR reparameterization](crate::QrReparam) or the [GP engine](crate::GaussianProcessEngine)
#[derive(Error, Debug)]
pub enum ReparamError {
    /// When operand shapes are incompatible
    #[error("Dimension mismatch in {op}: {left:?} vs {right:?}")]
    DimensionMismatch {
        /// Name of the failing operation
        op: &'static str,
        /// Shape of the left operand
        left: (usize, usize),
        /// Shape of the right operand
        right: (usize, usize),
    },
    /// When design matrix columns are not linearly independent
    #[error("Rank deficient design matrix: |R[{column}, {column}]| = {pivot:e} <= {tol:e}")]
    RankDeficient {
        /// Index of the offending column
        column: usize,
        /// Magnitude of the offending R diagonal entry
        pivot: f64,
        /// Tolerance the pivot was compared against
        tol: f64,
    },
    /// When a triangular solve hits a near-zero pivot
    #[error("Singular triangular matrix: |T[{index}, {index}]| = {pivot:e} <= {tol:e}")]
    SingularMatrix {
        /// Index of the offending diagonal entry
        index: usize,
        /// Magnitude of the offending diagonal entry
        pivot: f64,
        /// Tolerance the pivot was compared against
        tol: f64,
    },
    /// When a symmetric matrix fails Cholesky factorization even after jitter repair
    #[error(
        "Matrix ({dim}x{dim}) is not positive definite even with jitter {jitter:e}: \
         check hyperparameters (length scale) or duplicated covariates"
    )]
    NotPositiveDefinite {
        /// Matrix size
        dim: usize,
        /// Last diagonal jitter tried
        jitter: f64,
    },
    /// When error due to a bad value
    #[error("InvalidValue error: {0}")]
    InvalidValueError(String),
    #[error(transparent)]
    /// When linear algebra computation fails
    LinalgError(#[from] linfa_linalg::LinalgError),
    /// When a linfa error occurs
    #[error(transparent)]
    LinfaError(#[from] linfa::error::Error),
}
