//! Differentiable filtering
//!
//! - [`unscented`]: sigma-point generation and the unscented transform, with
//!   derivative propagation through a differentiable matrix square root
//! - [`ukf::UnscentedKalmanFilter`]: the predict/correct recursion with
//!   log-likelihood accumulation and parameter-gradient propagation

pub mod unscented;
pub mod ukf;
