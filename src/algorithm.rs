use crate::cache::CholeskyCache;
use crate::cholesky::{CholeskyFactor, CholeskyFactorizer};
use crate::covariance_models::CovarianceModel;
use crate::density::{multi_normal_cholesky_lpdf, std_normal_lpdf, LogLikelihood};
use crate::errors::{ReparamError, Result};
use crate::linalg::{add_diagonal_jitter, multiply, solve_triangular, solve_triangular_vec, Triangular};
use crate::parameters::GpEngineParams;
use linfa::prelude::{DatasetBase, Fit, Float};
use log::debug;
use ndarray::{Array1, Array2, ArrayBase, Axis, Data, Ix1, Ix2};
use rayon::prelude::*;
use std::sync::Arc;

#[cfg(feature = "serializable")]
use serde::{Deserialize, Serialize};

/// A model producing observations `y` from latent function values `f`.
///
/// Any `FnMut(&Array1<F>) -> Array1<F>` closure is an observation model,
/// typically drawing noisy values from an external random generator.
pub trait ObservationModel<F: Float> {
    /// Observations given latent values `f`
    fn observe(&mut self, f: &Array1<F>) -> Array1<F>;
}

impl<F: Float, T> ObservationModel<F> for T
where
    T: FnMut(&Array1<F>) -> Array1<F>,
{
    fn observe(&mut self, f: &Array1<F>) -> Array1<F> {
        self(f)
    }
}

/// Gaussian process engine
///
/// The engine holds a covariance model `k` and the numerical settings used to
/// factorize Gram matrices. It provides three ways to use a GP prior
/// `f ~ GP(0, k)` evaluated at a finite set of covariates `x`:
///
/// * prior simulation: `f = L.z` where `L.Lt = K(x, x) + nugget.I` and `z ~ N(0, I)`,
/// * conjugate conditioning on noisy observations `y = f(x) + e`, `e ~ N(0, sigma^2)`,
///   with the posterior at new points `x'` given by
///   ```text
///   mean = K(x', x).(K(x, x) + sigma^2.I)^-1.y
///   cov  = K(x', x') - K(x', x).(K(x, x) + sigma^2.I)^-1.K(x, x')
///   ```
///   computed through triangular solves against the Cholesky factor,
/// * non-centered latent parameterization: `f = mu + L.eta` with `eta ~ N(0, I)`
///   which removes the dependence between the latent values and the kernel
///   hyperparameters in hierarchical models.
///
/// # Example
///
/// ```no_run
/// use egobox_reparam::{GaussianProcessEngine, SquaredExponentialCov};
/// use linfa::prelude::*;
/// use ndarray::array;
///
/// let x = array![[-1.], [0.], [1.5]];
/// let y = array![0.5, -0.2, 1.1];
///
/// let posterior = GaussianProcessEngine::params(SquaredExponentialCov::new(1., 2.))
///     .noise(0.1)
///     .fit(&DatasetBase::new(x, y))
///     .expect("GP posterior");
/// let pred = posterior.predict(&array![[0.5], [2.]]).expect("prediction");
/// println!("mean = {}, variance = {}", pred.mean(), pred.variance());
/// ```
#[derive(Clone, Debug)]
#[cfg_attr(
    feature = "serializable",
    derive(Serialize, Deserialize),
    serde(bound(
        serialize = "F: Serialize, K: Serialize",
        deserialize = "F: Deserialize<'de>, K: Deserialize<'de>"
    ))
)]
pub struct GaussianProcessEngine<F: Float, K: CovarianceModel<F>> {
    /// Covariance model
    pub(crate) kernel: K,
    /// Measurement noise standard deviation
    pub(crate) noise: F,
    /// Diagonal term added to every Gram matrix
    pub(crate) nugget: F,
    /// Relative jitter used to repair a failed factorization
    pub(crate) jitter: F,
    /// Tolerance for triangular pivots
    pub(crate) pivot_tol: F,
}

impl<F: Float, K: CovarianceModel<F>> GaussianProcessEngine<F, K> {
    /// Gp engine parameters constructor
    pub fn params(kernel: K) -> GpEngineParams<F, K> {
        GpEngineParams::new(kernel)
    }

    /// Covariance model
    pub fn kernel(&self) -> &K {
        &self.kernel
    }

    /// Measurement noise standard deviation
    pub fn noise(&self) -> F {
        self.noise
    }

    /// Nugget
    pub fn nugget(&self) -> F {
        self.nugget
    }

    /// Relative repair jitter
    pub fn jitter(&self) -> F {
        self.jitter
    }

    /// Pivot tolerance
    pub fn pivot_tol(&self) -> F {
        self.pivot_tol
    }

    /// Cholesky factorizer configured with the engine settings
    pub fn factorizer(&self) -> CholeskyFactorizer<F> {
        CholeskyFactorizer::new()
            .jitter(self.jitter)
            .pivot_tol(self.pivot_tol)
    }

    /// Prior covariance `K(x, x) + nugget.I` at (n, nx) covariates `xs`
    pub fn prior_covariance(&self, xs: &ArrayBase<impl Data<Elem = F>, Ix2>) -> Result<Array2<F>> {
        add_diagonal_jitter(&self.kernel.gram(xs)?, self.nugget)
    }

    /// Cholesky factor of the prior covariance at covariates `xs`
    pub fn prior_cholesky(
        &self,
        xs: &ArrayBase<impl Data<Elem = F>, Ix2>,
    ) -> Result<CholeskyFactor<F>> {
        self.factorizer().factor(&self.prior_covariance(xs)?)
    }

    /// Same as [`GaussianProcessEngine::prior_cholesky`] but the factor is looked up
    /// in (or stored into) `cache`, keyed by kernel hyperparameters, nugget and covariates
    pub fn prior_cholesky_cached(
        &self,
        cache: &CholeskyCache<F>,
        xs: &ArrayBase<impl Data<Elem = F>, Ix2>,
    ) -> Result<Arc<CholeskyFactor<F>>> {
        cache.get_or_factor(&self.kernel, xs, self.nugget, &self.factorizer())
    }

    /// Draws from the GP prior at covariates `xs`.
    ///
    /// `z` is a (n, n_draws) matrix of standard normal values supplied by the caller
    /// (see [`crate::sampling::standard_normal`]), the result `L.z` is (n, n_draws).
    pub fn sample_prior(
        &self,
        xs: &ArrayBase<impl Data<Elem = F>, Ix2>,
        z: &ArrayBase<impl Data<Elem = F>, Ix2>,
    ) -> Result<Array2<F>> {
        let chol = self.prior_cholesky(xs)?;
        debug!(
            "Sample {} prior draws of {} at {} points",
            z.ncols(),
            self.kernel,
            xs.nrows()
        );
        chol.mul(z)
    }

    /// Simulates one latent draw `f = L.z` and the observations `y` produced
    /// by `obs_model` from `f`.
    pub fn simulate<O: ObservationModel<F>>(
        &self,
        xs: &ArrayBase<impl Data<Elem = F>, Ix2>,
        z: &ArrayBase<impl Data<Elem = F>, Ix1>,
        obs_model: &mut O,
    ) -> Result<PriorSimulation<F>> {
        let f = self.prior_cholesky(xs)?.mul_vec(z)?;
        let y = obs_model.observe(&f);
        Ok(PriorSimulation { f, y })
    }

    /// Non-centered parameterization `f = mean + L.eta` of the GP latent at covariates `xs`
    pub fn non_centered(
        &self,
        xs: &ArrayBase<impl Data<Elem = F>, Ix2>,
        mean: &ArrayBase<impl Data<Elem = F>, Ix1>,
    ) -> Result<NonCenteredLatent<F>> {
        let chol = self.prior_cholesky(xs)?;
        NonCenteredLatent::new(mean.to_owned(), Arc::new(chol))
    }

    /// Same as [`GaussianProcessEngine::non_centered`] using a shared factorization cache
    pub fn non_centered_cached(
        &self,
        cache: &CholeskyCache<F>,
        xs: &ArrayBase<impl Data<Elem = F>, Ix2>,
        mean: &ArrayBase<impl Data<Elem = F>, Ix1>,
    ) -> Result<NonCenteredLatent<F>> {
        let chol = self.prior_cholesky_cached(cache, xs)?;
        NonCenteredLatent::new(mean.to_owned(), chol)
    }

    /// Conditions the prior on observations `y_obs` at `x_obs` and predicts at `x_pred`
    pub fn condition(
        &self,
        x_obs: &ArrayBase<impl Data<Elem = F>, Ix2>,
        y_obs: &ArrayBase<impl Data<Elem = F>, Ix1>,
        x_pred: &ArrayBase<impl Data<Elem = F>, Ix2>,
    ) -> Result<PosteriorPrediction<F>> {
        let dataset = DatasetBase::new(x_obs.to_owned(), y_obs.to_owned());
        self.fit(&dataset)?.predict(x_pred)
    }
}

impl<F: Float, K: CovarianceModel<F>, D: Data<Elem = F>>
    Fit<ArrayBase<D, Ix2>, ArrayBase<D, Ix1>, ReparamError> for GaussianProcessEngine<F, K>
{
    type Object = GaussianProcessPosterior<F, K>;

    /// Factorizes the observed covariance `K(x, x) + (sigma^2 + nugget).I`
    /// where `x` and `y` are given as dataset (records, targets).
    fn fit(
        &self,
        dataset: &DatasetBase<ArrayBase<D, Ix2>, ArrayBase<D, Ix1>>,
    ) -> Result<Self::Object> {
        let x_obs = &dataset.records;
        let y_obs = &dataset.targets;
        if x_obs.nrows() != y_obs.len() {
            return Err(ReparamError::DimensionMismatch {
                op: "fit",
                left: x_obs.dim(),
                right: (y_obs.len(), 1),
            });
        }
        if y_obs.iter().any(|v| !v.is_finite()) {
            return Err(ReparamError::InvalidValueError(
                "observations should be finite".to_string(),
            ));
        }

        let n = x_obs.nrows();
        let sigma2 = self.noise * self.noise;
        let k_oo = add_diagonal_jitter(&self.kernel.gram(x_obs)?, sigma2 + self.nugget)?;
        let chol = self.factorizer().factor(&k_oo)?;
        let alpha = if n == 0 {
            Array1::zeros(0)
        } else {
            chol.solve_vec(y_obs)?
        };
        debug!(
            "GP posterior of {} conditioned on {n} observations (sigma = {})",
            self.kernel, self.noise
        );
        Ok(GaussianProcessPosterior {
            engine: self.clone(),
            x_obs: x_obs.to_owned(),
            chol,
            alpha,
        })
    }
}

/// Result of a prior simulation
#[derive(Clone, Debug, PartialEq)]
pub struct PriorSimulation<F: Float> {
    /// Latent function values at covariates
    pub f: Array1<F>,
    /// Observations produced from `f`
    pub y: Array1<F>,
}

/// GP conditioned on observations, result of fitting a [`GaussianProcessEngine`]
#[derive(Clone, Debug)]
pub struct GaussianProcessPosterior<F: Float, K: CovarianceModel<F>> {
    engine: GaussianProcessEngine<F, K>,
    /// Observed covariates
    x_obs: Array2<F>,
    /// Cholesky factor of the observed covariance
    chol: CholeskyFactor<F>,
    /// `(K(x, x) + sigma^2.I)^-1.y`
    alpha: Array1<F>,
}

impl<F: Float, K: CovarianceModel<F>> GaussianProcessPosterior<F, K> {
    /// Engine used to compute this posterior
    pub fn engine(&self) -> &GaussianProcessEngine<F, K> {
        &self.engine
    }

    /// Observed covariates
    pub fn x_obs(&self) -> &Array2<F> {
        &self.x_obs
    }

    /// Number of observations
    pub fn n_obs(&self) -> usize {
        self.x_obs.nrows()
    }

    /// Cholesky factor of the observed covariance
    pub fn cholesky(&self) -> &CholeskyFactor<F> {
        &self.chol
    }

    /// Posterior mean and covariance of the latent function at (n', nx) points `x_pred`.
    ///
    /// No predictive point gives an empty prediction.
    pub fn predict(
        &self,
        x_pred: &ArrayBase<impl Data<Elem = F>, Ix2>,
    ) -> Result<PosteriorPrediction<F>> {
        if x_pred.nrows() == 0 {
            return Ok(PosteriorPrediction::empty());
        }
        if x_pred.ncols() != self.x_obs.ncols() {
            return Err(ReparamError::DimensionMismatch {
                op: "predict",
                left: x_pred.dim(),
                right: self.x_obs.dim(),
            });
        }
        let k_pp = self.engine.kernel.gram(x_pred)?;
        if self.n_obs() == 0 {
            return Ok(PosteriorPrediction {
                mean: Array1::zeros(x_pred.nrows()),
                cov: k_pp,
            });
        }

        let k_po = self.engine.kernel.cross_gram(x_pred, &self.x_obs)?;
        let mean = k_po.dot(&self.alpha);
        let v = self.chol.solve_lower(&k_po.t())?;
        let cov = k_pp - v.t().dot(&v);
        // enforce exact symmetry lost in the subtraction
        let cov = (&cov + &cov.t()).mapv(|c| c * F::cast(0.5));
        Ok(PosteriorPrediction { mean, cov })
    }

    /// Posterior predictive distribution of new observations at `x_pred`,
    /// ie. latent posterior with measurement noise variance added to the diagonal
    pub fn predict_observed(
        &self,
        x_pred: &ArrayBase<impl Data<Elem = F>, Ix2>,
    ) -> Result<PosteriorPrediction<F>> {
        let mut pred = self.predict(x_pred)?;
        let sigma2 = self.engine.noise * self.engine.noise;
        pred.cov.diag_mut().mapv_inplace(|v| v + sigma2);
        Ok(pred)
    }
}

/// Gaussian posterior at predictive points
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(
    feature = "serializable",
    derive(Serialize, Deserialize),
    serde(bound(deserialize = "F: Deserialize<'de>"))
)]
pub struct PosteriorPrediction<F: Float> {
    mean: Array1<F>,
    cov: Array2<F>,
}

impl<F: Float> PosteriorPrediction<F> {
    fn empty() -> Self {
        PosteriorPrediction {
            mean: Array1::zeros(0),
            cov: Array2::zeros((0, 0)),
        }
    }

    /// Posterior mean (n',)
    pub fn mean(&self) -> &Array1<F> {
        &self.mean
    }

    /// Posterior covariance (n', n')
    pub fn cov(&self) -> &Array2<F> {
        &self.cov
    }

    /// Consumes the prediction, returns (mean, cov)
    pub fn into_parts(self) -> (Array1<F>, Array2<F>) {
        (self.mean, self.cov)
    }

    /// Number of predictive points
    pub fn len(&self) -> usize {
        self.mean.len()
    }

    /// Whether there is no predictive point
    pub fn is_empty(&self) -> bool {
        self.mean.is_empty()
    }

    /// Posterior variances, negative round-off values being clamped to zero
    pub fn variance(&self) -> Array1<F> {
        self.cov.diag().mapv(|v| v.max(F::zero()))
    }

    /// Draws from the posterior given a (n', n_draws) matrix `z` of standard normal values.
    ///
    /// The posterior covariance is typically only semi-definite near observed
    /// points, `factorizer` jitter repair is used in that case.
    pub fn sample(
        &self,
        z: &ArrayBase<impl Data<Elem = F>, Ix2>,
        factorizer: &CholeskyFactorizer<F>,
    ) -> Result<Array2<F>> {
        let chol = factorizer.factor(&self.cov)?;
        let mut draws = chol.mul(z)?;
        draws += &self.mean.view().insert_axis(Axis(1));
        Ok(draws)
    }
}

/// Non-centered parameterization `f = mean + L.eta` of a GP latent
///
/// Sampling `eta` from independent standard normals instead of sampling `f`
/// directly breaks the posterior coupling between `f` and the covariance
/// hyperparameters. The Cholesky factor is shared (`Arc`) so that it can come
/// from a [`CholeskyCache`].
#[derive(Clone, Debug)]
pub struct NonCenteredLatent<F: Float> {
    mean: Array1<F>,
    chol: Arc<CholeskyFactor<F>>,
}

impl<F: Float> NonCenteredLatent<F> {
    /// Constructor given the latent `mean` and the prior covariance factor
    pub fn new(mean: Array1<F>, chol: Arc<CholeskyFactor<F>>) -> Result<Self> {
        if mean.len() != chol.dim() {
            return Err(ReparamError::DimensionMismatch {
                op: "non_centered",
                left: (mean.len(), 1),
                right: (chol.dim(), chol.dim()),
            });
        }
        Ok(NonCenteredLatent { mean, chol })
    }

    /// Latent dimension
    pub fn dim(&self) -> usize {
        self.mean.len()
    }

    /// Latent mean
    pub fn mean(&self) -> &Array1<F> {
        &self.mean
    }

    /// Prior covariance factor
    pub fn cholesky(&self) -> &CholeskyFactor<F> {
        &self.chol
    }

    fn check_len(&self, op: &'static str, len: usize) -> Result<()> {
        if len != self.dim() {
            return Err(ReparamError::DimensionMismatch {
                op,
                left: (len, 1),
                right: (self.dim(), 1),
            });
        }
        Ok(())
    }

    fn check_draws(&self, op: &'static str, draws: (usize, usize)) -> Result<()> {
        if draws.1 != self.dim() {
            return Err(ReparamError::DimensionMismatch {
                op,
                left: draws,
                right: (self.dim(), 1),
            });
        }
        Ok(())
    }

    /// Latent values `f = mean + L.eta`
    pub fn forward(&self, eta: &ArrayBase<impl Data<Elem = F>, Ix1>) -> Result<Array1<F>> {
        self.check_len("forward", eta.len())?;
        Ok(&self.mean + &self.chol.mul_vec(eta)?)
    }

    /// Standardized values `eta = L^-1.(f - mean)`
    pub fn to_standard(&self, f: &ArrayBase<impl Data<Elem = F>, Ix1>) -> Result<Array1<F>> {
        self.check_len("to_standard", f.len())?;
        solve_triangular_vec(
            self.chol.l(),
            &(f - &self.mean),
            Triangular::Lower,
            self.chol.pivot_tol(),
        )
    }

    /// Latent draws from a (n_draws, n) matrix of standardized draws, one draw per row
    pub fn to_latent_draws(&self, etas: &ArrayBase<impl Data<Elem = F>, Ix2>) -> Result<Array2<F>> {
        self.check_draws("to_latent_draws", etas.dim())?;
        Ok(multiply(etas, &self.chol.l().t())? + &self.mean)
    }

    /// Standardized draws from a (n_draws, n) matrix of latent draws, one draw per row
    pub fn to_standard_draws(&self, fs: &ArrayBase<impl Data<Elem = F>, Ix2>) -> Result<Array2<F>> {
        self.check_draws("to_standard_draws", fs.dim())?;
        let centered = fs - &self.mean;
        let etas = solve_triangular(
            self.chol.l(),
            &centered.t(),
            Triangular::Lower,
            self.chol.pivot_tol(),
        )?;
        Ok(etas.reversed_axes())
    }

    /// Unnormalized log posterior density in the standardized space:
    /// `log N(eta | 0, I) + log p(y | f(eta))`
    pub fn log_density<L: LogLikelihood<F>>(
        &self,
        eta: &ArrayBase<impl Data<Elem = F>, Ix1>,
        log_lik: &L,
    ) -> Result<F> {
        let f = self.forward(eta)?;
        Ok(std_normal_lpdf(eta) + log_lik.log_likelihood(&f))
    }

    /// [`NonCenteredLatent::log_density`] evaluated in parallel for each row of `etas`
    pub fn log_density_draws<L: LogLikelihood<F> + Sync>(
        &self,
        etas: &ArrayBase<impl Data<Elem = F>, Ix2>,
        log_lik: &L,
    ) -> Result<Array1<F>> {
        self.check_draws("log_density_draws", etas.dim())?;
        let etas = etas.view();
        let values = (0..etas.nrows())
            .into_par_iter()
            .map(|i| self.log_density(&etas.row(i), log_lik))
            .collect::<Result<Vec<F>>>()?;
        Ok(Array1::from(values))
    }

    /// Prior log density of latent values `f` under `N(mean, L.Lt)`
    pub fn log_prior(&self, f: &ArrayBase<impl Data<Elem = F>, Ix1>) -> Result<F> {
        multi_normal_cholesky_lpdf(f, &self.mean, &self.chol)
    }
}
