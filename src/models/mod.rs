//! Model traits for stochastic state-space systems
//!
//! This module defines the capability the filter consumes: a discrete-time
//! parametric model
//!
//! x_{k+1} = f(k, x_k) + w_k,   w_k ~ N(0, Q(k, x_k))
//! y_k     = h(k, x_k) + v_k,   v_k ~ N(0, R)
//!
//! together with, for gradient runs, its first partial derivatives with
//! respect to the state and the parameter vector. Model functions must be
//! pure for fixed inputs; the model is immutable during a filter run.
//!
//! # Derivative layout
//!
//! All partials use gradient layout, input index first:
//!
//! - a state partial of an `m`-valued function is `nx × m`, with element
//!   `(i, j)` holding `∂out_j/∂x_i`
//! - a parameter partial is `nq × m`, with element `(a, j)` holding
//!   `∂out_j/∂q_a`
//! - partials of matrix-valued functions are batches: one matrix per input
//!   index, `Vec` of length `nx` or `nq`
//!
//! Parameters do not appear as call arguments: a model instance is built for
//! one parameter value (see [`crate::pem::ParametricModel`]) and reports the
//! sensitivities of its functions at that value.

mod duffing;

pub use duffing::*;

use nalgebra::{DMatrix, DVector, RealField};

/// A discrete-time nonlinear stochastic state-space model.
pub trait StateSpaceModel<T: RealField> {
    /// State dimension.
    fn nx(&self) -> usize;

    /// Measurement dimension.
    fn ny(&self) -> usize;

    /// Drift: the state mean propagated one step, `f(k, x)`.
    fn drift(&self, k: usize, x: &DVector<T>) -> DVector<T>;

    /// Process noise covariance `Q(k, x)`, symmetric `nx × nx`.
    fn process_noise(&self, k: usize, x: &DVector<T>) -> DMatrix<T>;

    /// Observation function `h(k, x)`.
    fn observe(&self, k: usize, x: &DVector<T>) -> DVector<T>;

    /// Measurement noise covariance `R`, symmetric `ny × ny`.
    fn measurement_noise(&self) -> DMatrix<T>;
}

/// First parameter/state sensitivities of a [`StateSpaceModel`].
///
/// Required for gradient-propagating filter runs; value-only filtering works
/// with the base trait alone.
pub trait SensitivityModel<T: RealField>: StateSpaceModel<T> {
    /// Parameter dimension.
    fn nq(&self) -> usize;

    /// `∂f/∂x`, `nx × nx` in gradient layout.
    fn drift_dx(&self, k: usize, x: &DVector<T>) -> DMatrix<T>;

    /// `∂f/∂q`, `nq × nx`.
    fn drift_dq(&self, k: usize, x: &DVector<T>) -> DMatrix<T>;

    /// `∂Q/∂x`: one symmetric `nx × nx` matrix per state index.
    fn process_noise_dx(&self, k: usize, x: &DVector<T>) -> Vec<DMatrix<T>>;

    /// `∂Q/∂q`: one symmetric `nx × nx` matrix per parameter.
    fn process_noise_dq(&self, k: usize, x: &DVector<T>) -> Vec<DMatrix<T>>;

    /// `∂h/∂x`, `nx × ny`.
    fn observe_dx(&self, k: usize, x: &DVector<T>) -> DMatrix<T>;

    /// `∂h/∂q`, `nq × ny`.
    fn observe_dq(&self, k: usize, x: &DVector<T>) -> DMatrix<T>;

    /// `∂R/∂q`: one symmetric `ny × ny` matrix per parameter.
    fn measurement_noise_dq(&self) -> Vec<DMatrix<T>>;
}
