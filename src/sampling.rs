//! Standard normal draws supplied to prior simulation and posterior sampling.

use linfa::Float;
use ndarray::{Array1, Array2};
use ndarray_rand::rand::Rng;
use ndarray_rand::rand_distr::StandardNormal;
use ndarray_rand::RandomExt;

/// Draws a (n, n_draws) matrix of independent standard normal values,
/// each column being suitable as a `z` argument of prior simulation.
pub fn standard_normal<F: Float, R: Rng + ?Sized>(rng: &mut R, shape: (usize, usize)) -> Array2<F> {
    Array2::<f64>::random_using(shape, StandardNormal, rng).mapv(F::cast)
}

/// Draws a single vector of `n` independent standard normal values
pub fn standard_normal_vec<F: Float, R: Rng + ?Sized>(rng: &mut R, n: usize) -> Array1<F> {
    Array1::<f64>::random_using(n, StandardNormal, rng).mapv(F::cast)
}
