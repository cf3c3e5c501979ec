//! Duffing oscillator model
//!
//! Euler-discretized stochastic Duffing oscillator, the classic nonlinear
//! benchmark for likelihood-based parameter estimation:
//!
//! dp = v dt
//! dv = (−δ·v − β·p − α·p³ + γ·cos(ω·t)) dt + g₁ dW
//! y  = p + e,   e ~ N(0, σ²)
//!
//! State `x = [p, v]`; unknown parameters `q = [α, β, δ, g₁, σ]`; the forcing
//! amplitude `γ`, forcing frequency `ω` and sample period are known constants.
//! All partials are closed-form.

use nalgebra::{DMatrix, DVector, RealField};
use num_traits::Float;

use crate::models::{SensitivityModel, StateSpaceModel};
use crate::pem::ParametricModel;
use crate::{EstimationError, Result};

/// Number of unknown parameters of the Duffing model.
const NQ: usize = 5;

// ============================================================================
// Model
// ============================================================================

/// Euler-discretized Duffing oscillator for one parameter value.
#[derive(Debug, Clone)]
pub struct DuffingModel<T: RealField> {
    /// Cubic stiffness α
    pub alpha: T,
    /// Linear stiffness β
    pub beta: T,
    /// Damping δ
    pub delta: T,
    /// Diffusion intensity g₁
    pub g1: T,
    /// Measurement noise standard deviation σ
    pub meas_std: T,
    /// Forcing amplitude γ (known constant)
    pub gamma: T,
    /// Forcing angular frequency ω (known constant)
    pub omega: T,
    /// Sample period
    pub dt: T,
}

impl<T: RealField + Float + Copy> DuffingModel<T> {
    /// Creates a model from a packed parameter vector `[α, β, δ, g₁, σ]`.
    pub fn from_parameters(q: &DVector<T>, gamma: T, omega: T, dt: T) -> Result<Self> {
        if q.len() != NQ {
            return Err(EstimationError::ShapeMismatch {
                what: "Duffing parameter vector",
                expected: NQ,
                actual: q.len(),
            });
        }
        Ok(Self {
            alpha: q[0],
            beta: q[1],
            delta: q[2],
            g1: q[3],
            meas_std: q[4],
            gamma,
            omega,
            dt,
        })
    }

    #[inline]
    fn forcing(&self, k: usize) -> T {
        let t = T::from_subset(&(k as f64)) * self.dt;
        self.gamma * Float::cos(self.omega * t)
    }
}

impl<T: RealField + Float + Copy> StateSpaceModel<T> for DuffingModel<T> {
    fn nx(&self) -> usize {
        2
    }

    fn ny(&self) -> usize {
        1
    }

    fn drift(&self, k: usize, x: &DVector<T>) -> DVector<T> {
        let (p, v) = (x[0], x[1]);
        let accel = -self.delta * v - self.beta * p - self.alpha * p * p * p + self.forcing(k);
        DVector::from_vec(vec![p + self.dt * v, v + self.dt * accel])
    }

    fn process_noise(&self, _k: usize, _x: &DVector<T>) -> DMatrix<T> {
        let mut q = DMatrix::zeros(2, 2);
        q[(1, 1)] = self.g1 * self.g1 * self.dt;
        q
    }

    fn observe(&self, _k: usize, x: &DVector<T>) -> DVector<T> {
        DVector::from_vec(vec![x[0]])
    }

    fn measurement_noise(&self) -> DMatrix<T> {
        DMatrix::from_element(1, 1, self.meas_std * self.meas_std)
    }
}

impl<T: RealField + Float + Copy> SensitivityModel<T> for DuffingModel<T> {
    fn nq(&self) -> usize {
        NQ
    }

    fn drift_dx(&self, _k: usize, x: &DVector<T>) -> DMatrix<T> {
        let p = x[0];
        let three = T::from_subset(&3.0);
        let mut d = DMatrix::zeros(2, 2);
        d[(0, 0)] = T::one();
        d[(0, 1)] = self.dt * (-self.beta - three * self.alpha * p * p);
        d[(1, 0)] = self.dt;
        d[(1, 1)] = T::one() - self.delta * self.dt;
        d
    }

    fn drift_dq(&self, _k: usize, x: &DVector<T>) -> DMatrix<T> {
        let (p, v) = (x[0], x[1]);
        let mut d = DMatrix::zeros(NQ, 2);
        d[(0, 1)] = -self.dt * p * p * p;
        d[(1, 1)] = -self.dt * p;
        d[(2, 1)] = -self.dt * v;
        d
    }

    fn process_noise_dx(&self, _k: usize, _x: &DVector<T>) -> Vec<DMatrix<T>> {
        vec![DMatrix::zeros(2, 2); 2]
    }

    fn process_noise_dq(&self, _k: usize, _x: &DVector<T>) -> Vec<DMatrix<T>> {
        let two = T::from_subset(&2.0);
        let mut batch = vec![DMatrix::zeros(2, 2); NQ];
        batch[3][(1, 1)] = two * self.g1 * self.dt;
        batch
    }

    fn observe_dx(&self, _k: usize, _x: &DVector<T>) -> DMatrix<T> {
        let mut d = DMatrix::zeros(2, 1);
        d[(0, 0)] = T::one();
        d
    }

    fn observe_dq(&self, _k: usize, _x: &DVector<T>) -> DMatrix<T> {
        DMatrix::zeros(NQ, 1)
    }

    fn measurement_noise_dq(&self) -> Vec<DMatrix<T>> {
        let two = T::from_subset(&2.0);
        let mut batch = vec![DMatrix::zeros(1, 1); NQ];
        batch[4][(0, 0)] = two * self.meas_std;
        batch
    }
}

// ============================================================================
// Parametric family
// ============================================================================

/// The Duffing model family over its unknown-parameter vector.
#[derive(Debug, Clone)]
pub struct DuffingFamily<T: RealField> {
    /// Forcing amplitude γ
    pub gamma: T,
    /// Forcing angular frequency ω
    pub omega: T,
    /// Sample period
    pub dt: T,
}

impl<T: RealField + Float + Copy> ParametricModel<T> for DuffingFamily<T> {
    type Model = DuffingModel<T>;

    fn nq(&self) -> usize {
        NQ
    }

    fn build(&self, q: &DVector<T>) -> Result<DuffingModel<T>> {
        DuffingModel::from_parameters(q, self.gamma, self.omega, self.dt)
    }
}
