//! Dense linear algebra primitives shared by the reparameterizations.
//!
//! These are thin, shape-checked wrappers around [ndarray] products and
//! [linfa_linalg] triangular solves. Failures are reported as
//! [`ReparamError`] values carrying operand shapes or the offending pivot,
//! never as panics.

use crate::errors::{ReparamError, Result};
use linfa::Float;
use linfa_linalg::triangular::*;
use ndarray::{Array1, Array2, ArrayBase, Axis, Data, Ix1, Ix2};
#[cfg(feature = "serializable")]
use serde::{Deserialize, Serialize};

/// Side of a triangular matrix holding the non-zero entries
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub enum Triangular {
    /// Lower triangular, solved by forward substitution
    Lower,
    /// Upper triangular, solved by back substitution
    Upper,
}

impl Triangular {
    fn uplo(self) -> UPLO {
        match self {
            Triangular::Lower => UPLO::Lower,
            Triangular::Upper => UPLO::Upper,
        }
    }
}

/// Default tolerance under which a triangular pivot is considered zero
pub fn default_pivot_tol<F: Float>() -> F {
    F::cast(100.) * F::epsilon()
}

pub(crate) fn as_f64<F: Float>(v: F) -> f64 {
    v.to_f64().unwrap_or(f64::NAN)
}

pub(crate) fn check_square<F: Float>(
    op: &'static str,
    a: &ArrayBase<impl Data<Elem = F>, Ix2>,
) -> Result<()> {
    if a.nrows() != a.ncols() {
        return Err(ReparamError::DimensionMismatch {
            op,
            left: a.dim(),
            right: (a.ncols(), a.nrows()),
        });
    }
    Ok(())
}

/// Returns the transpose of `a` as an owned matrix
pub fn transpose<F: Float>(a: &ArrayBase<impl Data<Elem = F>, Ix2>) -> Array2<F> {
    a.t().to_owned()
}

/// Computes the matrix product `a . b`
pub fn multiply<F: Float>(
    a: &ArrayBase<impl Data<Elem = F>, Ix2>,
    b: &ArrayBase<impl Data<Elem = F>, Ix2>,
) -> Result<Array2<F>> {
    if a.ncols() != b.nrows() {
        return Err(ReparamError::DimensionMismatch {
            op: "multiply",
            left: a.dim(),
            right: b.dim(),
        });
    }
    Ok(a.dot(b))
}

/// Computes the matrix-vector product `a . x`
pub fn multiply_vec<F: Float>(
    a: &ArrayBase<impl Data<Elem = F>, Ix2>,
    x: &ArrayBase<impl Data<Elem = F>, Ix1>,
) -> Result<Array1<F>> {
    if a.ncols() != x.len() {
        return Err(ReparamError::DimensionMismatch {
            op: "multiply_vec",
            left: a.dim(),
            right: (x.len(), 1),
        });
    }
    Ok(a.dot(x))
}

/// Solves `t . x = b` for a square triangular `t` and a (k, nrhs) right hand side `b`.
///
/// Only the `side` triangle of `t` is read. Fails with [`ReparamError::SingularMatrix`]
/// when a diagonal entry of `t` is within `tol` of zero.
pub fn solve_triangular<F: Float>(
    t: &ArrayBase<impl Data<Elem = F>, Ix2>,
    b: &ArrayBase<impl Data<Elem = F>, Ix2>,
    side: Triangular,
    tol: F,
) -> Result<Array2<F>> {
    check_square("solve_triangular", t)?;
    if t.nrows() != b.nrows() {
        return Err(ReparamError::DimensionMismatch {
            op: "solve_triangular",
            left: t.dim(),
            right: b.dim(),
        });
    }
    for (index, &pivot) in t.diag().iter().enumerate() {
        let pivot = num_traits::Float::abs(pivot);
        if !(pivot > tol) {
            return Err(ReparamError::SingularMatrix {
                index,
                pivot: as_f64(pivot),
                tol: as_f64(tol),
            });
        }
    }
    Ok(t.solve_triangular(b, side.uplo())?)
}

/// Solves `t . x = b` for a single right hand side vector `b`.
///
/// See [`solve_triangular`].
pub fn solve_triangular_vec<F: Float>(
    t: &ArrayBase<impl Data<Elem = F>, Ix2>,
    b: &ArrayBase<impl Data<Elem = F>, Ix1>,
    side: Triangular,
    tol: F,
) -> Result<Array1<F>> {
    let rhs = b.to_owned().insert_axis(Axis(1));
    let x = solve_triangular(t, &rhs, side, tol)?;
    Ok(x.remove_axis(Axis(1)))
}

/// Inverts a triangular matrix by substitution against the identity.
pub fn inverse_triangular<F: Float>(
    t: &ArrayBase<impl Data<Elem = F>, Ix2>,
    side: Triangular,
    tol: F,
) -> Result<Array2<F>> {
    check_square("inverse_triangular", t)?;
    let eye = Array2::<F>::eye(t.nrows());
    let inv = solve_triangular(t, &eye, side, tol)?;
    // substitution may leave round-off garbage in the structurally zero triangle
    let n = inv.nrows();
    Ok(Array2::from_shape_fn((n, n), |(i, j)| match side {
        Triangular::Lower if j > i => F::zero(),
        Triangular::Upper if j < i => F::zero(),
        _ => inv[[i, j]],
    }))
}

/// Returns a copy of the square matrix `a` with `eps` added to every diagonal entry.
pub fn add_diagonal_jitter<F: Float>(
    a: &ArrayBase<impl Data<Elem = F>, Ix2>,
    eps: F,
) -> Result<Array2<F>> {
    check_square("add_diagonal_jitter", a)?;
    let mut res = a.to_owned();
    res.diag_mut().mapv_inplace(|v| v + eps);
    Ok(res)
}
