//! Gaussian state distributions
//!
//! This module provides the mean/covariance pair the filter recursion
//! maintains, with dynamic dimensions taken from the model at run time.

use nalgebra::{DMatrix, DVector, RealField};

use crate::{EstimationError, Result};

// ============================================================================
// Gaussian State
// ============================================================================

/// A Gaussian state distribution with mean and covariance.
///
/// Every predict/correct step of the filter preserves the invariants that the
/// covariance is square, symmetric and positive semi-definite.
#[derive(Debug, Clone, PartialEq)]
pub struct GaussianState<T: RealField> {
    /// State estimate mean
    pub mean: DVector<T>,
    /// State estimate covariance
    pub covariance: DMatrix<T>,
}

impl<T: RealField + Copy> GaussianState<T> {
    /// Creates a new Gaussian state distribution.
    ///
    /// Fails with [`EstimationError::ShapeMismatch`] if the covariance is not
    /// square with the same dimension as the mean.
    pub fn new(mean: DVector<T>, covariance: DMatrix<T>) -> Result<Self> {
        let n = mean.len();
        if covariance.nrows() != n {
            return Err(EstimationError::ShapeMismatch {
                what: "covariance rows",
                expected: n,
                actual: covariance.nrows(),
            });
        }
        if covariance.ncols() != n {
            return Err(EstimationError::ShapeMismatch {
                what: "covariance columns",
                expected: n,
                actual: covariance.ncols(),
            });
        }
        Ok(Self { mean, covariance })
    }

    /// Creates a state with diagonal covariance.
    pub fn with_diagonal_covariance(mean: DVector<T>, diagonal: &DVector<T>) -> Result<Self> {
        let cov = DMatrix::from_diagonal(diagonal);
        Self::new(mean, cov)
    }

    /// Returns the state dimension.
    #[inline]
    pub fn dim(&self) -> usize {
        self.mean.len()
    }

    /// Returns the trace of the covariance matrix (sum of variances).
    #[inline]
    pub fn uncertainty(&self) -> T {
        self.covariance.trace()
    }
}

// ============================================================================
// Symmetry helpers
// ============================================================================

/// Replaces a nominally-symmetric matrix with its symmetric part.
///
/// The covariance update `Px - K Py Kᵗ` is symmetric in exact arithmetic but
/// accumulates asymmetric rounding; the filter re-symmetrizes after every
/// correction.
pub fn symmetrize<T: RealField + Copy>(m: &DMatrix<T>) -> DMatrix<T> {
    let half = T::from_subset(&0.5);
    let mt = m.transpose();
    (m + mt) * half
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gaussian_state_creation() {
        let mean = DVector::from_vec(vec![0.0, 0.0, 1.0, 0.0]);
        let cov = DMatrix::<f64>::identity(4, 4);

        let gs = GaussianState::new(mean, cov).unwrap();
        assert_eq!(gs.dim(), 4);
        assert!((gs.uncertainty() - 4.0).abs() < 1e-10);
    }

    #[test]
    fn test_gaussian_state_shape_mismatch() {
        let mean = DVector::from_vec(vec![0.0, 0.0]);
        let cov = DMatrix::<f64>::identity(3, 3);

        let err = GaussianState::new(mean, cov).unwrap_err();
        assert!(matches!(err, EstimationError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_symmetrize() {
        let m = DMatrix::<f64>::from_row_slice(2, 2, &[1.0, 2.0, 4.0, 3.0]);
        let s = symmetrize(&m);
        assert!((s[(0, 1)] - 3.0).abs() < 1e-12);
        assert!((s[(1, 0)] - 3.0).abs() < 1e-12);
        assert!((s[(0, 0)] - 1.0).abs() < 1e-12);
    }
}
