//! Cholesky helpers shared by the likelihood engine and the proposal
//! adaptation.

use faer::linalg::solvers::Llt;
use faer::{Mat, Side};
use thiserror::Error;

/// A symmetric matrix failed its Cholesky factorization even after a
/// diagonal jitter was added.
#[derive(Error, Debug, Clone)]
#[error("matrix is not positive definite (jitter {jitter:e} did not help)")]
pub struct NonPositiveDefiniteError {
    pub jitter: f64,
}

/// Cholesky factorization with one diagonal-jitter retry.
///
/// The retry adds `rel_jitter` times the mean absolute diagonal to every
/// diagonal entry; if the factorization still fails the matrix is reported
/// as non-positive-definite.
pub(crate) fn cholesky_with_jitter(
    mat: &Mat<f64>,
    rel_jitter: f64,
) -> Result<Llt<f64>, NonPositiveDefiniteError> {
    debug_assert_eq!(mat.nrows(), mat.ncols());
    if let Ok(f) = Llt::new(mat.as_ref(), Side::Lower) {
        return Ok(f);
    }
    let n = mat.nrows();
    let mean_diag = (0..n).map(|i| mat[(i, i)].abs()).sum::<f64>() / n.max(1) as f64;
    let jitter = rel_jitter * mean_diag.max(f64::MIN_POSITIVE);
    let mut bumped = mat.clone();
    for i in 0..n {
        bumped[(i, i)] += jitter;
    }
    Llt::new(bumped.as_ref(), Side::Lower).map_err(|_| NonPositiveDefiniteError { jitter })
}

/// `ln det` of the factored matrix, from the diagonal of its Cholesky factor.
pub(crate) fn log_det(llt: &Llt<f64>) -> f64 {
    let l = llt.L();
    2.0 * (0..l.nrows()).map(|i| l[(i, i)].ln()).sum::<f64>()
}
