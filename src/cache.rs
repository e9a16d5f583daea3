//! Memoization of Cholesky factorizations of Gram matrices.
//!
//! Factorization is the O(n^3) step of every GP computation and is often
//! recomputed identically across repeated evaluations of an inference loop.
//! [`CholeskyCache`] keys factors by (covariance model structure and hyperparameters,
//! covariate set, factorizer settings) and guarantees at most one factorization
//! per key under concurrent access: callers racing on the same key block on a per-key slot while the first one
//! computes, then share the same read-only factor.

use crate::cholesky::{CholeskyFactor, CholeskyFactorizer};
use crate::covariance_models::CovarianceModel;
use crate::errors::{ReparamError, Result};
use crate::linalg::{add_diagonal_jitter, as_f64};
use linfa::Float;
use log::debug;
use ndarray::{ArrayBase, Data, Ix2};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Identifies a Cholesky factor by the kernel structure and the bit patterns
/// of its numerical inputs
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct CacheKey {
    /// Kernel description, distinguishes kernel types and compositions
    kernel: String,
    hyperparameters: Vec<u64>,
    nugget: u64,
    jitter: u64,
    pivot_tol: u64,
    shape: (usize, usize),
    covariates: Vec<u64>,
}

impl CacheKey {
    fn new<F: Float, K: CovarianceModel<F>>(
        kernel: &K,
        nugget: F,
        factorizer: &CholeskyFactorizer<F>,
        xs: &ArrayBase<impl Data<Elem = F>, Ix2>,
    ) -> Self {
        let bits = |v: F| as_f64(v).to_bits();
        CacheKey {
            kernel: kernel.to_string(),
            hyperparameters: kernel.hyperparameters().into_iter().map(bits).collect(),
            nugget: bits(nugget),
            jitter: bits(factorizer.get_jitter()),
            pivot_tol: bits(factorizer.get_pivot_tol()),
            shape: xs.dim(),
            covariates: xs.iter().map(|v| bits(*v)).collect(),
        }
    }
}

type Slot<F> = Arc<Mutex<Option<Arc<CholeskyFactor<F>>>>>;

/// Thread safe cache of Gram matrix Cholesky factors
#[derive(Debug)]
pub struct CholeskyCache<F: Float> {
    slots: Mutex<HashMap<CacheKey, Slot<F>>>,
    n_factorizations: AtomicUsize,
}

impl<F: Float> Default for CholeskyCache<F> {
    fn default() -> Self {
        CholeskyCache {
            slots: Mutex::new(HashMap::new()),
            n_factorizations: AtomicUsize::new(0),
        }
    }
}

impl<F: Float> CholeskyCache<F> {
    /// Empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of factorizations actually computed by this cache
    pub fn n_factorizations(&self) -> usize {
        self.n_factorizations.load(Ordering::SeqCst)
    }

    /// Number of cached factors, including the ones being computed
    pub fn len(&self) -> usize {
        self.slots.lock().map(|slots| slots.len()).unwrap_or(0)
    }

    /// Whether no factor is cached
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every cached factor
    pub fn clear(&self) {
        if let Ok(mut slots) = self.slots.lock() {
            slots.clear();
        }
    }

    /// Returns the Cholesky factor of `kernel.gram(xs) + nugget.I`, computing it
    /// with `factorizer` only if no factor is cached for the same kernel,
    /// nugget, factorizer settings and covariates.
    ///
    /// A failed factorization is not cached, the error is returned to the caller.
    pub fn get_or_factor<K: CovarianceModel<F>>(
        &self,
        kernel: &K,
        xs: &ArrayBase<impl Data<Elem = F>, Ix2>,
        nugget: F,
        factorizer: &CholeskyFactorizer<F>,
    ) -> Result<Arc<CholeskyFactor<F>>> {
        let key = CacheKey::new(kernel, nugget, factorizer, xs);
        let slot = {
            let mut slots = self.slots.lock().map_err(|_| poisoned())?;
            Arc::clone(slots.entry(key.clone()).or_default())
        };
        if let Some(chol) = slot.lock().map_err(|_| poisoned())?.as_ref() {
            debug!("Cholesky cache hit for {kernel} on {} points", xs.nrows());
            return Ok(Arc::clone(chol));
        }

        // gram is built on the rayon pool: never hold the slot lock across it
        let gram = match kernel
            .gram(xs)
            .and_then(|gram| add_diagonal_jitter(&gram, nugget))
        {
            Ok(gram) => gram,
            Err(err) => {
                self.forget(&key, &slot);
                return Err(err);
            }
        };

        let chol = {
            let mut entry = slot.lock().map_err(|_| poisoned())?;
            if let Some(chol) = entry.as_ref() {
                return Ok(Arc::clone(chol));
            }
            debug!("Cholesky cache miss for {kernel} on {} points", xs.nrows());
            self.n_factorizations.fetch_add(1, Ordering::SeqCst);
            factorizer.factor(&gram).map(|chol| {
                let chol = Arc::new(chol);
                *entry = Some(Arc::clone(&chol));
                chol
            })
        };
        if chol.is_err() {
            self.forget(&key, &slot);
        }
        chol
    }

    /// Removes the slot of `key` if it is still the empty `slot`
    fn forget(&self, key: &CacheKey, slot: &Slot<F>) {
        if let Ok(mut slots) = self.slots.lock() {
            let unfilled = slots.get(key).is_some_and(|current| {
                Arc::ptr_eq(current, slot)
                    && current.lock().map(|s| s.is_none()).unwrap_or(true)
            });
            if unfilled {
                slots.remove(key);
            }
        }
    }
}

fn poisoned() -> ReparamError {
    ReparamError::InvalidValueError("Cholesky cache lock poisoned".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::covariance_models::{Matern52Cov, SquaredExponentialCov};
    use approx::assert_abs_diff_eq;
    use ndarray::{array, Array, Axis};
    use rayon::prelude::*;

    #[test]
    fn test_cache_hit() {
        let cache = CholeskyCache::new();
        let kernel = SquaredExponentialCov::new(1., 2.);
        let xs = array![[0.], [1.], [2.5]];
        let factorizer = CholeskyFactorizer::new();
        let c1 = cache.get_or_factor(&kernel, &xs, 1e-10, &factorizer).unwrap();
        let c2 = cache.get_or_factor(&kernel, &xs.view(), 1e-10, &factorizer).unwrap();
        assert!(Arc::ptr_eq(&c1, &c2));
        assert_eq!(cache.n_factorizations(), 1);
        assert_eq!(cache.len(), 1);

        let other = SquaredExponentialCov::new(1., 3.);
        cache.get_or_factor(&other, &xs, 1e-10, &factorizer).unwrap();
        cache.get_or_factor(&kernel, &xs, 1e-9, &factorizer).unwrap();
        assert_eq!(cache.n_factorizations(), 3);

        cache.clear();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_cache_concurrent_single_factorization() {
        let cache = CholeskyCache::new();
        let kernel = SquaredExponentialCov::new(2., 1.5);
        let xs = Array::linspace(0., 10., 50).insert_axis(Axis(1));
        let factorizer = CholeskyFactorizer::new();
        let factors: Vec<_> = (0..16)
            .into_par_iter()
            .map(|_| cache.get_or_factor(&kernel, &xs, 1e-10, &factorizer).unwrap())
            .collect();
        assert_eq!(cache.n_factorizations(), 1);
        assert!(factors.iter().all(|c| Arc::ptr_eq(c, &factors[0])));
    }

    #[test]
    fn test_cache_does_not_keep_failures() {
        let cache = CholeskyCache::new();
        let kernel = SquaredExponentialCov::new(1., -1.);
        let xs = array![[0.], [1.]];
        let factorizer = CholeskyFactorizer::new();
        assert!(cache.get_or_factor(&kernel, &xs, 0., &factorizer).is_err());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_cache_distinguishes_kernel_structure() {
        let cache = CholeskyCache::new();
        let xs = array![[0.], [1.], [2.5], [4.]];
        let factorizer = CholeskyFactorizer::new();
        let se = SquaredExponentialCov::new(1., 2.);
        let matern = Matern52Cov::new(1., 2.);
        assert_eq!(se.hyperparameters(), matern.hyperparameters());

        let c_se = cache.get_or_factor(&se, &xs, 1e-10, &factorizer).unwrap();
        let c_matern = cache
            .get_or_factor(&matern, &xs, 1e-10, &factorizer)
            .unwrap();
        assert!(!Arc::ptr_eq(&c_se, &c_matern));
        assert_eq!(cache.n_factorizations(), 2);
        let expected = factorizer
            .factor(&add_diagonal_jitter(&matern.gram(&xs).unwrap(), 1e-10).unwrap())
            .unwrap();
        assert_abs_diff_eq!(*c_matern.l(), *expected.l(), epsilon = 1e-14);

        let c_sum = cache
            .get_or_factor(&se.sum(matern), &xs, 1e-10, &factorizer)
            .unwrap();
        let c_product = cache
            .get_or_factor(&se.product(matern), &xs, 1e-10, &factorizer)
            .unwrap();
        assert!(!Arc::ptr_eq(&c_sum, &c_product));
        assert_eq!(cache.n_factorizations(), 4);
    }

    #[test]
    fn test_cache_distinguishes_factorizer_settings() {
        let cache = CholeskyCache::new();
        let kernel = SquaredExponentialCov::new(1., 2.);
        let xs = array![[0.], [1.], [2.5]];
        let c1 = cache
            .get_or_factor(&kernel, &xs, 1e-10, &CholeskyFactorizer::new())
            .unwrap();
        let c2 = cache
            .get_or_factor(&kernel, &xs, 1e-10, &CholeskyFactorizer::new().jitter(1e-3))
            .unwrap();
        assert!(!Arc::ptr_eq(&c1, &c2));
        assert_eq!(c2.jitter(), 0.);
        assert_eq!(cache.n_factorizations(), 2);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_cache_drops_failed_slot_then_recovers() {
        let cache = CholeskyCache::new();
        let xs = array![[0.], [1.]];
        let factorizer = CholeskyFactorizer::new();
        let kernel = SquaredExponentialCov::new(1., 1.);
        // negative nugget makes the Gram matrix indefinite
        assert!(matches!(
            cache.get_or_factor(&kernel, &xs, -4., &factorizer),
            Err(ReparamError::NotPositiveDefinite { .. })
        ));
        assert_eq!(cache.len(), 0);
        assert_eq!(cache.n_factorizations(), 1);

        cache.get_or_factor(&kernel, &xs, 0., &factorizer).unwrap();
        assert_eq!(cache.len(), 1);
    }
}
