//! Linear-algebra support for differentiable filtering

mod cholesky;

pub use cholesky::*;
