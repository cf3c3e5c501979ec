//! Common test helpers for filter integration tests

#![allow(dead_code)]

use kalgrad::models::{SensitivityModel, StateSpaceModel};
use kalgrad::pem::ParametricModel;
use kalgrad::types::measurement::MaskedMeasurement;
use kalgrad::Result;
use nalgebra::{DMatrix, DVector};

// ============================================================================
// Scalar random walk
// ============================================================================

/// Scalar random walk x' = x + w, y = x + v, with q = [qvar, rvar].
///
/// Linear and Gaussian, so the UKF is exact and the closed-form Kalman
/// recursion below is the reference.
pub struct RandomWalkModel {
    pub qvar: f64,
    pub rvar: f64,
}

impl StateSpaceModel<f64> for RandomWalkModel {
    fn nx(&self) -> usize {
        1
    }
    fn ny(&self) -> usize {
        1
    }
    fn drift(&self, _k: usize, x: &DVector<f64>) -> DVector<f64> {
        x.clone()
    }
    fn process_noise(&self, _k: usize, _x: &DVector<f64>) -> DMatrix<f64> {
        DMatrix::from_element(1, 1, self.qvar)
    }
    fn observe(&self, _k: usize, x: &DVector<f64>) -> DVector<f64> {
        x.clone()
    }
    fn measurement_noise(&self) -> DMatrix<f64> {
        DMatrix::from_element(1, 1, self.rvar)
    }
}

impl SensitivityModel<f64> for RandomWalkModel {
    fn nq(&self) -> usize {
        2
    }
    fn drift_dx(&self, _k: usize, _x: &DVector<f64>) -> DMatrix<f64> {
        DMatrix::from_element(1, 1, 1.0)
    }
    fn drift_dq(&self, _k: usize, _x: &DVector<f64>) -> DMatrix<f64> {
        DMatrix::zeros(2, 1)
    }
    fn process_noise_dx(&self, _k: usize, _x: &DVector<f64>) -> Vec<DMatrix<f64>> {
        vec![DMatrix::zeros(1, 1)]
    }
    fn process_noise_dq(&self, _k: usize, _x: &DVector<f64>) -> Vec<DMatrix<f64>> {
        vec![DMatrix::from_element(1, 1, 1.0), DMatrix::zeros(1, 1)]
    }
    fn observe_dx(&self, _k: usize, _x: &DVector<f64>) -> DMatrix<f64> {
        DMatrix::from_element(1, 1, 1.0)
    }
    fn observe_dq(&self, _k: usize, _x: &DVector<f64>) -> DMatrix<f64> {
        DMatrix::zeros(2, 1)
    }
    fn measurement_noise_dq(&self) -> Vec<DMatrix<f64>> {
        vec![DMatrix::zeros(1, 1), DMatrix::from_element(1, 1, 1.0)]
    }
}

/// Closed-form Kalman recursion for the scalar random walk, in the same
/// correct-then-predict order as the filter driver.
///
/// Returns the filtered means, filtered variances, and the accumulated
/// log-likelihood (without the 2π normalization, matching the filter).
pub fn scalar_kalman_reference(
    x0: f64,
    p0: f64,
    qvar: f64,
    rvar: f64,
    ys: &[f64],
) -> (Vec<f64>, Vec<f64>, f64) {
    let n = ys.len();
    let mut x = x0;
    let mut p = p0;
    let mut loglik = 0.0;
    let mut means = Vec::with_capacity(n);
    let mut vars = Vec::with_capacity(n);

    for (step, &y) in ys.iter().enumerate() {
        let py = p + rvar;
        let e = y - x;
        let gain = p / py;
        x += gain * e;
        p -= gain * gain * py;
        loglik -= 0.5 * e * e / py + 0.5 * py.ln();

        means.push(x);
        vars.push(p);

        if step + 1 < n {
            p += qvar;
        }
    }
    (means, vars, loglik)
}

// ============================================================================
// Two-state linear-Gaussian system
// ============================================================================

/// Two-state linear-Gaussian system with q = [a, b, qvar, rvar]:
///
/// x' = [[a, 0.1], [0, b]]·x + w,  w ~ N(0, qvar·I)
/// y  = x₁ + v,                    v ~ N(0, rvar)
///
/// The UKF is exact here, so the propagated likelihood gradient can be
/// checked against finite differences of the merit.
pub struct TwoStateModel {
    pub a: f64,
    pub b: f64,
    pub qvar: f64,
    pub rvar: f64,
}

impl TwoStateModel {
    fn transition(&self) -> DMatrix<f64> {
        DMatrix::from_row_slice(2, 2, &[self.a, 0.1, 0.0, self.b])
    }
}

impl StateSpaceModel<f64> for TwoStateModel {
    fn nx(&self) -> usize {
        2
    }
    fn ny(&self) -> usize {
        1
    }
    fn drift(&self, _k: usize, x: &DVector<f64>) -> DVector<f64> {
        self.transition() * x
    }
    fn process_noise(&self, _k: usize, _x: &DVector<f64>) -> DMatrix<f64> {
        DMatrix::identity(2, 2) * self.qvar
    }
    fn observe(&self, _k: usize, x: &DVector<f64>) -> DVector<f64> {
        DVector::from_vec(vec![x[0]])
    }
    fn measurement_noise(&self) -> DMatrix<f64> {
        DMatrix::from_element(1, 1, self.rvar)
    }
}

impl SensitivityModel<f64> for TwoStateModel {
    fn nq(&self) -> usize {
        4
    }
    fn drift_dx(&self, _k: usize, _x: &DVector<f64>) -> DMatrix<f64> {
        // gradient layout: element (i, j) is ∂f_j/∂x_i
        self.transition().transpose()
    }
    fn drift_dq(&self, _k: usize, x: &DVector<f64>) -> DMatrix<f64> {
        let mut d = DMatrix::zeros(4, 2);
        d[(0, 0)] = x[0];
        d[(1, 1)] = x[1];
        d
    }
    fn process_noise_dx(&self, _k: usize, _x: &DVector<f64>) -> Vec<DMatrix<f64>> {
        vec![DMatrix::zeros(2, 2); 2]
    }
    fn process_noise_dq(&self, _k: usize, _x: &DVector<f64>) -> Vec<DMatrix<f64>> {
        vec![
            DMatrix::zeros(2, 2),
            DMatrix::zeros(2, 2),
            DMatrix::identity(2, 2),
            DMatrix::zeros(2, 2),
        ]
    }
    fn observe_dx(&self, _k: usize, _x: &DVector<f64>) -> DMatrix<f64> {
        DMatrix::from_column_slice(2, 1, &[1.0, 0.0])
    }
    fn observe_dq(&self, _k: usize, _x: &DVector<f64>) -> DMatrix<f64> {
        DMatrix::zeros(4, 1)
    }
    fn measurement_noise_dq(&self) -> Vec<DMatrix<f64>> {
        let mut batch = vec![DMatrix::zeros(1, 1); 4];
        batch[3] = DMatrix::from_element(1, 1, 1.0);
        batch
    }
}

/// The two-state family over q = [a, b, qvar, rvar].
pub struct TwoStateFamily;

impl ParametricModel<f64> for TwoStateFamily {
    type Model = TwoStateModel;

    fn nq(&self) -> usize {
        4
    }

    fn build(&self, q: &DVector<f64>) -> Result<TwoStateModel> {
        Ok(TwoStateModel {
            a: q[0],
            b: q[1],
            qvar: q[2],
            rvar: q[3],
        })
    }
}

// ============================================================================
// Duplicated-channel observer
// ============================================================================

/// Random walk observed twice: y = [x, x] + v with independent channel
/// noise. Masking one channel must reproduce the single-channel filter.
pub struct TwoChannelModel {
    pub qvar: f64,
    pub rvar: [f64; 2],
}

impl StateSpaceModel<f64> for TwoChannelModel {
    fn nx(&self) -> usize {
        1
    }
    fn ny(&self) -> usize {
        2
    }
    fn drift(&self, _k: usize, x: &DVector<f64>) -> DVector<f64> {
        x.clone()
    }
    fn process_noise(&self, _k: usize, _x: &DVector<f64>) -> DMatrix<f64> {
        DMatrix::from_element(1, 1, self.qvar)
    }
    fn observe(&self, _k: usize, x: &DVector<f64>) -> DVector<f64> {
        DVector::from_vec(vec![x[0], x[0]])
    }
    fn measurement_noise(&self) -> DMatrix<f64> {
        DMatrix::from_diagonal(&DVector::from_vec(vec![self.rvar[0], self.rvar[1]]))
    }
}

impl SensitivityModel<f64> for TwoChannelModel {
    fn nq(&self) -> usize {
        1
    }
    fn drift_dx(&self, _k: usize, _x: &DVector<f64>) -> DMatrix<f64> {
        DMatrix::from_element(1, 1, 1.0)
    }
    fn drift_dq(&self, _k: usize, _x: &DVector<f64>) -> DMatrix<f64> {
        DMatrix::zeros(1, 1)
    }
    fn process_noise_dx(&self, _k: usize, _x: &DVector<f64>) -> Vec<DMatrix<f64>> {
        vec![DMatrix::zeros(1, 1)]
    }
    fn process_noise_dq(&self, _k: usize, _x: &DVector<f64>) -> Vec<DMatrix<f64>> {
        vec![DMatrix::from_element(1, 1, 1.0)]
    }
    fn observe_dx(&self, _k: usize, _x: &DVector<f64>) -> DMatrix<f64> {
        DMatrix::from_row_slice(1, 2, &[1.0, 1.0])
    }
    fn observe_dq(&self, _k: usize, _x: &DVector<f64>) -> DMatrix<f64> {
        DMatrix::zeros(1, 2)
    }
    fn measurement_noise_dq(&self) -> Vec<DMatrix<f64>> {
        vec![DMatrix::zeros(2, 2)]
    }
}

// ============================================================================
// Data helpers
// ============================================================================

/// Wraps scalar values as fully-observed one-dimensional measurements.
pub fn scalar_measurements(ys: &[f64]) -> Vec<MaskedMeasurement<f64>> {
    ys.iter()
        .map(|&v| MaskedMeasurement::observed(DVector::from_vec(vec![v])))
        .collect()
}
