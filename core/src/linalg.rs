//! Linear algebra helpers for covariance square roots and innovation inverses.
//!
//! Public API:
//!     pub fn symmetrize(m: &DMatrix<f64>) -> DMatrix<f64>
//!     pub fn cholesky_lower(p: &DMatrix<f64>) -> Result<DMatrix<f64>, FilterError>
//!     pub fn spd_inverse(a: &DMatrix<f64>) -> Result<DMatrix<f64>, FilterError>
//!
//! The UKF needs a lower-triangular square root of the augmented covariance to spread its sigma
//! points. A covariance that is not positive definite means the filter has already diverged, so
//! there is no jitter or eigenvalue flooring here: the failure is reported and the tick is
//! rejected.

use crate::FilterError;

use nalgebra::DMatrix;
use nalgebra::linalg::Cholesky;

/// Symmetrize a matrix: P ← 0.5 (P + Pᵀ)
///
/// Simple matrix symmetrization function that reduces round-off errors associated
/// with floating point arithmetic.
///
/// # Arguments
/// * `m` - the matrix to symmetrize
///
/// # Returns
/// A symmetrized version of the input matrix.
#[inline]
pub fn symmetrize(m: &DMatrix<f64>) -> DMatrix<f64> {
    0.5 * (m + m.transpose())
}

/// Lower Cholesky factor `L` such that `P = L Lᵀ`.
///
/// The input is symmetrized before factoring. Returns [FilterError::NotPositiveDefinite] if the
/// matrix is not square or the decomposition fails.
pub fn cholesky_lower(p: &DMatrix<f64>) -> Result<DMatrix<f64>, FilterError> {
    if !p.is_square() {
        return Err(FilterError::NotPositiveDefinite);
    }
    let l = Cholesky::new(symmetrize(p))
        .map(|ch| ch.l())
        .ok_or(FilterError::NotPositiveDefinite)?;
    // Semi-definite input can factor with a zero pivot; the sigma points would then be degenerate.
    if l.diagonal().iter().all(|d| d.is_finite() && *d > 0.0) {
        Ok(l)
    } else {
        Err(FilterError::NotPositiveDefinite)
    }
}

/// Inverse of a symmetric positive definite matrix (an innovation covariance `S`).
///
/// Uses the Cholesky inverse when possible and falls back to a general LU inverse for matrices that
/// are invertible but drifted out of positive definiteness.
pub fn spd_inverse(a: &DMatrix<f64>) -> Result<DMatrix<f64>, FilterError> {
    if !a.is_square() {
        return Err(FilterError::SingularMatrix);
    }
    let a_sym = symmetrize(a);
    if let Some(ch) = Cholesky::new(a_sym.clone()) {
        let inverse = ch.inverse();
        if inverse.iter().all(|v| v.is_finite()) {
            return Ok(inverse);
        }
    }
    a_sym.try_inverse().ok_or(FilterError::SingularMatrix)
}

/* =============================== Tests ==================================== */
