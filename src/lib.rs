//! KALGRAD: differentiable unscented Kalman filtering for parameter estimation
//!
//! A discrete-time Unscented Kalman Filter (UKF) with exact first-order
//! derivative propagation, intended for offline Prediction-Error-Method (PEM)
//! maximum-likelihood fitting of nonlinear stochastic state-space models.
//!
//! # Features
//!
//! - **Differentiable filtering**: the filter recursion propagates the
//!   derivatives of the state mean, covariance and accumulated Gaussian
//!   log-likelihood with respect to the model parameters, in closed form
//! - **Differentiable square roots**: exact first and second derivatives of
//!   the Cholesky factor used to generate sigma points and to invert the
//!   innovation covariance
//! - **Missing data**: measurement vectors carry a per-entry mask; inactive
//!   entries are excluded from the correction rather than imputed
//!
//! The filter consumes a user-supplied model through the traits in
//! [`models`]; the PEM merit/gradient/Hessian callables consumed by an
//! external optimizer live in [`pem`].

pub mod types;
pub mod models;
pub mod linalg;
pub mod filters;
pub mod pem;

pub mod prelude {
    pub use crate::types::gaussian::*;
    pub use crate::types::measurement::*;
    pub use crate::models::*;
    pub use crate::filters::unscented::*;
    pub use crate::filters::ukf::*;
    pub use crate::pem::*;
}

/// Error types for the library
#[derive(Debug, Clone, PartialEq)]
pub enum EstimationError {
    /// Input dimensions are inconsistent with the model's declared sizes
    ShapeMismatch {
        /// Which quantity failed validation
        what: &'static str,
        /// Size declared by the model or configuration
        expected: usize,
        /// Size actually supplied
        actual: usize,
    },
    /// A covariance or innovation-covariance factorization failed
    NotPositiveDefinite,
    /// The filter configuration is invalid
    InvalidConfiguration(&'static str),
}

impl std::error::Error for EstimationError {}

impl ::core::fmt::Display for EstimationError {
    fn fmt(&self, f: &mut ::core::fmt::Formatter<'_>) -> ::core::fmt::Result {
        match self {
            EstimationError::ShapeMismatch {
                what,
                expected,
                actual,
            } => write!(
                f,
                "Shape mismatch for {}: expected {}, got {}",
                what, expected, actual
            ),
            EstimationError::NotPositiveDefinite => {
                write!(f, "Matrix is not positive definite")
            }
            EstimationError::InvalidConfiguration(msg) => {
                write!(f, "Invalid configuration: {}", msg)
            }
        }
    }
}

pub type Result<T> = ::core::result::Result<T, EstimationError>;
