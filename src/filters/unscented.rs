//! Unscented transform with derivative propagation
//!
//! The unscented transform approximates the distribution of `f(z)` for
//! `z ~ N(mean, cov)` by propagating a deterministic set of sigma points
//! through `f` and recovering weighted statistics. This module provides the
//! transform together with the exact derivatives of its outputs with respect
//! to a parameter batch, given derivatives of its inputs and of `f`.
//!
//! # Sigma Point Selection
//!
//! For input dimension `n` and center weight parameter `κ` (with `n + κ ≠ 0`):
//! - deviations `±Sᵢ` for the rows `Sᵢ` of a square root of `(n+κ)·cov`,
//!   each with weight `0.5/(n+κ)`
//! - an optional center point at the mean with weight `κ/(n+κ)` when `κ ≠ 0`
//!
//! giving `2n` points for `κ = 0` and `2n + 1` otherwise; the weights sum
//! to one.
//!
//! # Square Roots
//!
//! The square-root method is a configuration-time choice from a closed set:
//! Cholesky (differentiable) or SVD (value-only). Derivative propagation is
//! linear in the square-root derivative, so only the Cholesky variant
//! supports the `*_diff` entry points.

use core::str::FromStr;

use nalgebra::{DMatrix, DVector, RealField};

use crate::linalg::DifferentiableCholesky;
use crate::{EstimationError, Result};

// ============================================================================
// Square-root variants
// ============================================================================

/// Matrix square-root method used to generate sigma-point deviations.
///
/// Produces `S` with `SᵗS = Q` for a symmetric positive (semi-)definite `Q`.
/// The factorization work object is owned by the caller so that the Cholesky
/// variant can retain the intermediates its derivative needs.
pub trait CovarianceSqrt<T: RealField + Copy> {
    /// Computes a square root of `q`.
    fn sqrt(&self, fac: &mut DifferentiableCholesky<T>, q: &DMatrix<T>) -> Result<DMatrix<T>>;

    /// Returns true if [`sqrt_diff`](Self::sqrt_diff) is available.
    fn supports_gradients(&self) -> bool {
        false
    }

    /// Derivative of the square root for a batch of directions `dq`.
    ///
    /// Must be called after [`sqrt`](Self::sqrt) on the same work object.
    fn sqrt_diff(
        &self,
        fac: &mut DifferentiableCholesky<T>,
        dq: &[DMatrix<T>],
    ) -> Result<Vec<DMatrix<T>>> {
        let _ = (fac, dq);
        Err(EstimationError::InvalidConfiguration(
            "the configured square-root variant does not support gradients",
        ))
    }
}

/// Cholesky square root; supports exact derivative propagation.
#[derive(Debug, Clone, Copy, Default)]
pub struct CholeskySqrt;

impl<T: RealField + Copy> CovarianceSqrt<T> for CholeskySqrt {
    fn sqrt(&self, fac: &mut DifferentiableCholesky<T>, q: &DMatrix<T>) -> Result<DMatrix<T>> {
        fac.decompose(q)
    }

    fn supports_gradients(&self) -> bool {
        true
    }

    fn sqrt_diff(
        &self,
        fac: &mut DifferentiableCholesky<T>,
        dq: &[DMatrix<T>],
    ) -> Result<Vec<DMatrix<T>>> {
        fac.diff(dq)
    }
}

/// Singular-value-decomposition square root, `S = (U·diag(√σ))ᵗ`.
///
/// More tolerant of near-singular covariances than Cholesky, but value-only:
/// requesting gradients with this variant is rejected at configuration time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SvdSqrt;

impl<T: RealField + Copy> CovarianceSqrt<T> for SvdSqrt {
    fn sqrt(&self, _fac: &mut DifferentiableCholesky<T>, q: &DMatrix<T>) -> Result<DMatrix<T>> {
        let n = q.nrows();
        let svd = q.clone().svd(true, false);
        let u = svd.u.ok_or(EstimationError::NotPositiveDefinite)?;
        let mut s = DMatrix::<T>::zeros(n, n);
        for i in 0..n {
            let root = svd.singular_values[i].sqrt();
            for j in 0..n {
                s[(i, j)] = u[(j, i)] * root;
            }
        }
        Ok(s)
    }
}

/// Configuration-time selection of the square-root variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SqrtMethod {
    /// Cholesky factorization (differentiable)
    #[default]
    Cholesky,
    /// Singular value decomposition (value-only)
    Svd,
}

impl FromStr for SqrtMethod {
    type Err = EstimationError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "cholesky" => Ok(SqrtMethod::Cholesky),
            "svd" => Ok(SqrtMethod::Svd),
            _ => Err(EstimationError::InvalidConfiguration(
                "unrecognized square-root variant name",
            )),
        }
    }
}

// ============================================================================
// Transform work record
// ============================================================================

/// Working set of one unscented transform application.
///
/// Created per predict/correct step around the input distribution, populated
/// by the value calls and read back by the matching derivative calls; the
/// derivative entry points require the value entry points to have run first
/// on the same record.
#[derive(Debug, Clone)]
pub struct UtWork<T: RealField> {
    /// Input mean
    pub input_mean: DVector<T>,
    /// Input covariance
    pub input_cov: DMatrix<T>,
    pub(crate) chol: DifferentiableCholesky<T>,
    pub(crate) in_sigma: Vec<DVector<T>>,
    pub(crate) in_dev: Vec<DVector<T>>,
    pub(crate) out_sigma: Vec<DVector<T>>,
    pub(crate) out_dev: Vec<DVector<T>>,
    pub(crate) out_mean: Option<DVector<T>>,
    pub(crate) in_dev_dq: Vec<DMatrix<T>>,
    pub(crate) in_sigma_dq: Vec<DMatrix<T>>,
    pub(crate) out_dev_dq: Vec<DMatrix<T>>,
}

impl<T: RealField + Copy> UtWork<T> {
    /// Creates a work record around the given input distribution.
    pub fn new(input_mean: DVector<T>, input_cov: DMatrix<T>) -> Self {
        Self {
            input_mean,
            input_cov,
            chol: DifferentiableCholesky::new(),
            in_sigma: Vec::new(),
            in_dev: Vec::new(),
            out_sigma: Vec::new(),
            out_dev: Vec::new(),
            out_mean: None,
            in_dev_dq: Vec::new(),
            in_sigma_dq: Vec::new(),
            out_dev_dq: Vec::new(),
        }
    }

    /// Input sigma points generated by the last value call.
    pub fn sigma_points(&self) -> &[DVector<T>] {
        &self.in_sigma
    }
}

// ============================================================================
// Unscented transform
// ============================================================================

/// The unscented transform for a fixed input dimension and center weight.
#[derive(Debug, Clone)]
pub struct UnscentedTransform<T: RealField, R> {
    n: usize,
    kappa: T,
    nsigma: usize,
    weights: Vec<T>,
    sqrt: R,
}

impl<T: RealField + Copy, R: CovarianceSqrt<T>> UnscentedTransform<T, R> {
    /// Creates a transform for `n` inputs with center weight parameter
    /// `kappa`.
    ///
    /// Fails with [`EstimationError::InvalidConfiguration`] if `n + κ = 0`,
    /// which would make the weights undefined.
    pub fn new(n: usize, kappa: T, sqrt: R) -> Result<Self> {
        let n_t = T::from_subset(&(n as f64));
        if n_t + kappa == T::zero() {
            return Err(EstimationError::InvalidConfiguration(
                "n + kappa must be nonzero",
            ));
        }

        let center = kappa != T::zero();
        let nsigma = 2 * n + usize::from(center);
        let half = T::from_subset(&0.5);
        let mut weights = vec![half / (n_t + kappa); nsigma];
        if center {
            weights[nsigma - 1] = kappa / (n_t + kappa);
        }

        Ok(Self {
            n,
            kappa,
            nsigma,
            weights,
            sqrt,
        })
    }

    /// Number of sigma points.
    #[inline]
    pub fn nsigma(&self) -> usize {
        self.nsigma
    }

    /// Sigma-point weights (they sum to one).
    #[inline]
    pub fn weights(&self) -> &[T] {
        &self.weights
    }

    /// Returns true if the configured square root supports gradients.
    pub fn supports_gradients(&self) -> bool {
        self.sqrt.supports_gradients()
    }

    /// Generates sigma points and deviations around the work record's input
    /// distribution.
    pub fn sigma_points(&self, work: &mut UtWork<T>) -> Result<()> {
        let n_t = T::from_subset(&(self.n as f64));
        let scaled = &work.input_cov * (n_t + self.kappa);
        let s = self.sqrt.sqrt(&mut work.chol, &scaled)?;

        work.in_dev.clear();
        for i in 0..self.n {
            work.in_dev.push(s.row(i).transpose());
        }
        for i in 0..self.n {
            let neg = -&work.in_dev[i];
            work.in_dev.push(neg);
        }
        if self.nsigma > 2 * self.n {
            work.in_dev.push(DVector::zeros(self.n));
        }

        work.in_sigma = work
            .in_dev
            .iter()
            .map(|dev| dev + &work.input_mean)
            .collect();
        Ok(())
    }

    /// Applies `f` to the sigma points and recovers the weighted output mean
    /// and covariance.
    pub fn transform<F>(&self, work: &mut UtWork<T>, mut f: F) -> Result<(DVector<T>, DMatrix<T>)>
    where
        F: FnMut(&DVector<T>) -> DVector<T>,
    {
        self.sigma_points(work)?;

        let out_sigma: Vec<DVector<T>> = work.in_sigma.iter().map(|x| f(x)).collect();
        let no = out_sigma[0].len();

        let mut mean = DVector::<T>::zeros(no);
        for (o, &w) in out_sigma.iter().zip(&self.weights) {
            mean += o * w;
        }

        let out_dev: Vec<DVector<T>> = out_sigma.iter().map(|o| o - &mean).collect();
        let mut cov = DMatrix::<T>::zeros(no, no);
        for (dev, &w) in out_dev.iter().zip(&self.weights) {
            cov += dev * dev.transpose() * w;
        }

        work.out_sigma = out_sigma;
        work.out_dev = out_dev;
        work.out_mean = Some(mean.clone());
        Ok((mean, cov))
    }

    /// Weighted cross-covariance between input and output deviations of the
    /// last [`transform`](Self::transform).
    pub fn crosscov(&self, work: &UtWork<T>) -> DMatrix<T> {
        let no = work.out_dev[0].len();
        let mut pio = DMatrix::<T>::zeros(self.n, no);
        for ((idev, odev), &w) in work.in_dev.iter().zip(&work.out_dev).zip(&self.weights) {
            pio += idev * odev.transpose() * w;
        }
        pio
    }

    /// Propagates input-derivative batches to sigma-point derivatives.
    ///
    /// `di_dq` is `nq × n` (parameter index first); `dpi_dq` holds one
    /// symmetric `n × n` matrix per parameter direction. The sigma-point
    /// derivative is linear in the square-root derivative.
    pub fn sigma_points_diff(
        &self,
        work: &mut UtWork<T>,
        di_dq: &DMatrix<T>,
        dpi_dq: &[DMatrix<T>],
    ) -> Result<()> {
        let n_t = T::from_subset(&(self.n as f64));
        let scale = n_t + self.kappa;
        let scaled_dq: Vec<DMatrix<T>> = dpi_dq.iter().map(|m| m * scale).collect();
        let ds = self.sqrt.sqrt_diff(&mut work.chol, &scaled_dq)?;
        let nq = di_dq.nrows();

        work.in_dev_dq.clear();
        for i in 0..self.n {
            // deviation i is row i of the square root, so its derivative in
            // direction a is row i of ds[a]
            let ddev = DMatrix::from_fn(nq, self.n, |a, c| ds[a][(i, c)]);
            work.in_dev_dq.push(ddev);
        }
        for i in 0..self.n {
            let neg = -&work.in_dev_dq[i];
            work.in_dev_dq.push(neg);
        }
        if self.nsigma > 2 * self.n {
            work.in_dev_dq.push(DMatrix::zeros(nq, self.n));
        }

        work.in_sigma_dq = work.in_dev_dq.iter().map(|ddev| ddev + di_dq).collect();
        Ok(())
    }

    /// Propagates derivatives through the transform.
    ///
    /// `df_dq(x)` is `nq × no` and `df_dx(x)` is `n × no`, both in gradient
    /// layout (input index first). Returns the derivative of the output mean
    /// (`nq × no`) and of the output covariance (one `no × no` matrix per
    /// direction), by the product rule on the weighted sums of
    /// [`transform`](Self::transform).
    ///
    /// # Panics
    /// Panics if called without a preceding `transform` on the same record.
    pub fn transform_diff<Fq, Fx>(
        &self,
        work: &mut UtWork<T>,
        mut df_dq: Fq,
        mut df_dx: Fx,
        di_dq: &DMatrix<T>,
        dpi_dq: &[DMatrix<T>],
    ) -> Result<(DMatrix<T>, Vec<DMatrix<T>>)>
    where
        Fq: FnMut(&DVector<T>) -> DMatrix<T>,
        Fx: FnMut(&DVector<T>) -> DMatrix<T>,
    {
        assert!(
            work.out_mean.is_some(),
            "transform_diff requires a preceding transform on the same work record"
        );
        self.sigma_points_diff(work, di_dq, dpi_dq)?;

        let nq = di_dq.nrows();
        let no = work.out_dev[0].len();

        // total derivative of each output sigma point: explicit parameter
        // dependence plus the chain through the input sigma point
        let total_dq: Vec<DMatrix<T>> = work
            .in_sigma
            .iter()
            .zip(&work.in_sigma_dq)
            .map(|(x, dx)| df_dq(x) + dx * df_dx(x))
            .collect();

        let mut do_dq = DMatrix::<T>::zeros(nq, no);
        for (d, &w) in total_dq.iter().zip(&self.weights) {
            do_dq += d * w;
        }

        let out_dev_dq: Vec<DMatrix<T>> = total_dq.iter().map(|d| d - &do_dq).collect();

        let mut dpo_dq: Vec<DMatrix<T>> = (0..nq).map(|_| DMatrix::zeros(no, no)).collect();
        for ((odev, ddev), &w) in work.out_dev.iter().zip(&out_dev_dq).zip(&self.weights) {
            for (a, dpo) in dpo_dq.iter_mut().enumerate() {
                *dpo += odev * ddev.row(a) * w;
            }
        }
        for dpo in dpo_dq.iter_mut() {
            let t = dpo.transpose();
            *dpo += t;
        }

        work.out_dev_dq = out_dev_dq;
        Ok((do_dq, dpo_dq))
    }

    /// Derivative of the cross-covariance, by the product rule on
    /// [`crosscov`](Self::crosscov).
    ///
    /// # Panics
    /// Panics if called without a preceding `transform_diff` on the same
    /// record.
    pub fn crosscov_diff(&self, work: &UtWork<T>) -> Vec<DMatrix<T>> {
        assert!(
            !work.out_dev_dq.is_empty(),
            "crosscov_diff requires a preceding transform_diff on the same work record"
        );
        let nq = work.out_dev_dq[0].nrows();
        let no = work.out_dev[0].len();

        let mut dpio_dq: Vec<DMatrix<T>> = (0..nq).map(|_| DMatrix::zeros(self.n, no)).collect();
        for s in 0..self.nsigma {
            let w = self.weights[s];
            for (a, dpio) in dpio_dq.iter_mut().enumerate() {
                *dpio += work.in_dev_dq[s].row(a).transpose() * work.out_dev[s].transpose() * w;
                *dpio += &work.in_dev[s] * work.out_dev_dq[s].row(a) * w;
            }
        }
        dpio_dq
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn test_cov3() -> DMatrix<f64> {
        DMatrix::from_row_slice(3, 3, &[2.0, 0.3, 0.1, 0.3, 1.5, -0.2, 0.1, -0.2, 1.0])
    }

    #[test]
    fn test_weights_sum_to_one_without_center() {
        let ut = UnscentedTransform::new(4, 0.0, CholeskySqrt).unwrap();
        assert_eq!(ut.nsigma(), 8);
        let sum: f64 = ut.weights().iter().sum();
        assert_relative_eq!(sum, 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_weights_sum_to_one_with_center() {
        let ut = UnscentedTransform::new(3, 1.5, CholeskySqrt).unwrap();
        assert_eq!(ut.nsigma(), 7);
        let sum: f64 = ut.weights().iter().sum();
        assert_relative_eq!(sum, 1.0, epsilon = 1e-12);
        assert_relative_eq!(ut.weights()[6], 1.5 / 4.5, epsilon = 1e-12);
    }

    #[test]
    fn test_degenerate_kappa_rejected() {
        let err = UnscentedTransform::new(2, -2.0, CholeskySqrt).unwrap_err();
        assert!(matches!(err, EstimationError::InvalidConfiguration(_)));
    }

    #[test]
    fn test_sigma_points_symmetric_about_mean() {
        let mean = DVector::from_vec(vec![1.0, -2.0, 0.5]);
        let ut = UnscentedTransform::new(3, 0.0, CholeskySqrt).unwrap();
        let mut work = UtWork::new(mean.clone(), test_cov3());
        ut.sigma_points(&mut work).unwrap();

        for i in 0..3 {
            let plus = &work.sigma_points()[i] - &mean;
            let minus = &work.sigma_points()[i + 3] - &mean;
            assert_relative_eq!(plus, -minus, epsilon = 1e-12);
            assert!(plus.norm() > 0.0);
        }
    }

    fn affine_propagation_case<R: CovarianceSqrt<f64>>(sqrt: R) {
        let a = DMatrix::from_row_slice(2, 3, &[1.0, -0.5, 2.0, 0.7, 0.2, -1.0]);
        let b = DVector::from_vec(vec![0.3, -0.8]);
        let mean = DVector::from_vec(vec![1.0, 2.0, -1.0]);
        let cov = test_cov3();

        let ut = UnscentedTransform::new(3, 0.0, sqrt).unwrap();
        let mut work = UtWork::new(mean.clone(), cov.clone());
        let (o, po) = ut.transform(&mut work, |x| &a * x + &b).unwrap();

        assert_relative_eq!(o, &a * &mean + &b, epsilon = 1e-9);
        assert_relative_eq!(po, &a * &cov * a.transpose(), epsilon = 1e-9);

        let pio = ut.crosscov(&work);
        assert_relative_eq!(pio, &cov * a.transpose(), epsilon = 1e-9);
    }

    #[test]
    fn test_affine_map_exact_cholesky() {
        affine_propagation_case(CholeskySqrt);
    }

    #[test]
    fn test_affine_map_exact_svd() {
        affine_propagation_case(SvdSqrt);
    }

    #[test]
    fn test_affine_map_exact_with_center_point() {
        let a = DMatrix::from_row_slice(3, 3, &[1.0, 0.1, 0.0, 0.0, 1.0, 0.1, 0.2, 0.0, 1.0]);
        let mean = DVector::from_vec(vec![0.5, -0.5, 1.5]);
        let cov = test_cov3();

        let ut = UnscentedTransform::new(3, 2.0, CholeskySqrt).unwrap();
        let mut work = UtWork::new(mean.clone(), cov.clone());
        let (o, po) = ut.transform(&mut work, |x| &a * x).unwrap();

        assert_relative_eq!(o, &a * &mean, epsilon = 1e-9);
        assert_relative_eq!(po, &a * &cov * a.transpose(), epsilon = 1e-9);
    }

    #[test]
    fn test_svd_rejects_gradients() {
        let ut = UnscentedTransform::new(2, 0.0, SvdSqrt).unwrap();
        assert!(!ut.supports_gradients());

        let mut work = UtWork::new(DVector::zeros(2), DMatrix::identity(2, 2));
        ut.transform(&mut work, |x| x.clone()).unwrap();
        let di = DMatrix::zeros(1, 2);
        let dpi = vec![DMatrix::zeros(2, 2)];
        let err = ut.sigma_points_diff(&mut work, &di, &dpi).unwrap_err();
        assert!(matches!(err, EstimationError::InvalidConfiguration(_)));
    }

    /// For an affine map the derivative propagation is exact: with
    /// `f(z) = Az`, `do/dq = (di/dq)·Aᵗ` and `dPo/dq = A·(dPi/dq)·Aᵗ`.
    #[test]
    fn test_transform_diff_affine_exact() {
        let a = DMatrix::from_row_slice(2, 3, &[1.0, -0.5, 2.0, 0.7, 0.2, -1.0]);
        let mean = DVector::from_vec(vec![1.0, 2.0, -1.0]);
        let cov = test_cov3();

        // two arbitrary parameter directions
        let di_dq = DMatrix::from_row_slice(2, 3, &[0.5, 0.0, -1.0, 0.2, 0.3, 0.4]);
        let dpi_dq = vec![
            DMatrix::from_row_slice(3, 3, &[0.4, 0.1, 0.0, 0.1, -0.2, 0.3, 0.0, 0.3, 0.6]),
            DMatrix::from_row_slice(3, 3, &[-0.1, 0.2, 0.2, 0.2, 0.5, 0.0, 0.2, 0.0, -0.3]),
        ];

        let ut = UnscentedTransform::new(3, 0.0, CholeskySqrt).unwrap();
        let mut work = UtWork::new(mean, cov.clone());
        ut.transform(&mut work, |x| &a * x).unwrap();

        let at = a.transpose();
        let (do_dq, dpo_dq) = ut
            .transform_diff(
                &mut work,
                |_| DMatrix::zeros(2, 2),
                |_| at.clone(),
                &di_dq,
                &dpi_dq,
            )
            .unwrap();

        assert_relative_eq!(do_dq, &di_dq * a.transpose(), epsilon = 1e-9);
        for i in 0..2 {
            assert_relative_eq!(dpo_dq[i], &a * &dpi_dq[i] * a.transpose(), epsilon = 1e-9);
        }

        let dpio_dq = ut.crosscov_diff(&work);
        for i in 0..2 {
            assert_relative_eq!(dpio_dq[i], &dpi_dq[i] * a.transpose(), epsilon = 1e-9);
        }
    }

    #[test]
    fn test_sqrt_method_from_str() {
        assert_eq!("cholesky".parse::<SqrtMethod>().unwrap(), SqrtMethod::Cholesky);
        assert_eq!("svd".parse::<SqrtMethod>().unwrap(), SqrtMethod::Svd);
        assert!("qr".parse::<SqrtMethod>().is_err());
    }
}
