//! Prediction-error-method estimation callables
//!
//! Wraps filter runs into the merit/gradient/Hessian callables a nonlinear
//! programming solver consumes to fit model parameters by maximum
//! likelihood. Each callable builds a model instance for the requested
//! parameter vector, runs an independent filter pass over the measurement
//! record, and reads the likelihood (and its exact gradient) off the final
//! context. The callables take `&self` and share no mutable state, so a
//! solver may evaluate them concurrently.

use nalgebra::{DMatrix, DVector, RealField};

use crate::filters::ukf::{run_filter, FilterOutput, UkfOptions};
use crate::models::SensitivityModel;
use crate::types::measurement::MaskedMeasurement;
use crate::{EstimationError, Result};

// ============================================================================
// Parametric model families
// ============================================================================

/// A family of models over a packed parameter vector.
///
/// The filter consumes models built for one fixed parameter value; the
/// estimation layer rebuilds the model at every trial point the solver
/// visits.
pub trait ParametricModel<T: RealField> {
    /// The model type produced for one parameter value.
    type Model: SensitivityModel<T>;

    /// Parameter dimension.
    fn nq(&self) -> usize;

    /// Builds the model for the given parameter vector.
    fn build(&self, q: &DVector<T>) -> Result<Self::Model>;
}

// ============================================================================
// Criterion
// ============================================================================

/// The PEM merit function and its derivatives for one estimation data set.
///
/// By default the merit is the negative log-likelihood, the convention of
/// minimizing solvers; [`maximizing`](Self::maximizing) flips the sign for
/// callers that maximize.
#[derive(Debug, Clone)]
pub struct PredictionErrorCriterion<T: RealField, P> {
    family: P,
    x0: DVector<T>,
    px0: DMatrix<T>,
    measurements: Vec<MaskedMeasurement<T>>,
    options: UkfOptions<T>,
    maximize: bool,
    hessian_step: T,
}

impl<T, P> PredictionErrorCriterion<T, P>
where
    T: RealField + Copy,
    P: ParametricModel<T>,
{
    /// Creates a criterion over the given data set with default filter
    /// options.
    pub fn new(
        family: P,
        x0: DVector<T>,
        px0: DMatrix<T>,
        measurements: Vec<MaskedMeasurement<T>>,
    ) -> Self {
        Self {
            family,
            x0,
            px0,
            measurements,
            options: UkfOptions::default(),
            maximize: false,
            hessian_step: T::from_subset(&1e-5),
        }
    }

    /// Replaces the filter options used by every evaluation.
    pub fn with_options(mut self, options: UkfOptions<T>) -> Self {
        self.options = options;
        self
    }

    /// Selects the merit sign convention: `true` returns `+L` for
    /// maximizing solvers, `false` (the default) returns `−L`.
    pub fn maximizing(mut self, maximize: bool) -> Self {
        self.maximize = maximize;
        self
    }

    /// Sets the relative step of the Hessian finite differences.
    pub fn with_hessian_step(mut self, step: T) -> Self {
        self.hessian_step = step;
        self
    }

    /// Parameter dimension of the underlying family.
    pub fn nq(&self) -> usize {
        self.family.nq()
    }

    #[inline]
    fn sign(&self) -> T {
        if self.maximize {
            T::one()
        } else {
            -T::one()
        }
    }

    /// Runs the filter at `q` with the criterion's own options, returning
    /// the full output (trajectory, likelihood, gradient).
    pub fn run(&self, q: &DVector<T>) -> Result<FilterOutput<T>> {
        let model = self.family.build(q)?;
        run_filter(model, &self.x0, &self.px0, &self.measurements, &self.options)
    }

    /// Merit value at `q`: the signed accumulated log-likelihood.
    pub fn merit(&self, q: &DVector<T>) -> Result<T> {
        let model = self.family.build(q)?;
        let options = UkfOptions {
            save_history: false,
            calculate_gradients: false,
            ..self.options.clone()
        };
        let out = run_filter(model, &self.x0, &self.px0, &self.measurements, &options)?;
        Ok(self.sign() * out.log_likelihood)
    }

    /// Exact merit gradient at `q`, from the filter's derivative
    /// propagation.
    pub fn gradient(&self, q: &DVector<T>) -> Result<DVector<T>> {
        let model = self.family.build(q)?;
        let options = UkfOptions {
            save_history: false,
            calculate_gradients: true,
            ..self.options.clone()
        };
        let out = run_filter(model, &self.x0, &self.px0, &self.measurements, &options)?;
        let gradient = out
            .gradient
            .expect("gradient-enabled run must produce a gradient");
        Ok(gradient * self.sign())
    }

    /// Merit Hessian entries for a caller-specified lower-triangular
    /// sparsity pattern of `(row, column)` index pairs.
    ///
    /// Built by central finite differences of the exact gradient, one
    /// perturbation pair per parameter; the differenced matrix is
    /// symmetrized before the pattern entries are read out.
    pub fn hessian_packed(&self, q: &DVector<T>, pattern: &[(usize, usize)]) -> Result<Vec<T>> {
        let nq = self.family.nq();
        for &(row, col) in pattern {
            if row >= nq || col >= nq {
                return Err(EstimationError::ShapeMismatch {
                    what: "Hessian pattern index",
                    expected: nq,
                    actual: row.max(col),
                });
            }
            if col > row {
                return Err(EstimationError::InvalidConfiguration(
                    "Hessian pattern must be lower triangular",
                ));
            }
        }

        let two = T::from_subset(&2.0);
        let mut hessian = DMatrix::<T>::zeros(nq, nq);
        for a in 0..nq {
            let step = self.hessian_step * (T::one() + q[a].abs());
            let mut qp = q.clone();
            let mut qm = q.clone();
            qp[a] += step;
            qm[a] -= step;
            let gp = self.gradient(&qp)?;
            let gm = self.gradient(&qm)?;
            let column = (gp - gm) / (two * step);
            hessian.set_column(a, &column);
        }

        let hessian = crate::types::gaussian::symmetrize(&hessian);
        Ok(pattern.iter().map(|&(row, col)| hessian[(row, col)]).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DuffingFamily;
    use approx::assert_relative_eq;

    fn duffing_criterion() -> PredictionErrorCriterion<f64, DuffingFamily<f64>> {
        let family = DuffingFamily {
            gamma: 0.3,
            omega: 1.2,
            dt: 0.05,
        };
        let measurements = [0.10, 0.12, 0.09, 0.11, 0.08]
            .iter()
            .map(|&v| MaskedMeasurement::observed(DVector::from_vec(vec![v])))
            .collect();
        PredictionErrorCriterion::new(
            family,
            DVector::from_vec(vec![0.1, 0.0]),
            DMatrix::from_diagonal(&DVector::from_vec(vec![0.5, 0.5])),
            measurements,
        )
    }

    fn nominal_q() -> DVector<f64> {
        DVector::from_vec(vec![1.0, -1.0, 0.2, 0.4, 0.1])
    }

    #[test]
    fn test_merit_sign_convention() {
        let criterion = duffing_criterion();
        let q = nominal_q();

        let minimize = criterion.merit(&q).unwrap();
        let maximize = duffing_criterion().maximizing(true).merit(&q).unwrap();
        assert_relative_eq!(minimize, -maximize, epsilon = 1e-12);
    }

    #[test]
    fn test_gradient_has_parameter_dimension() {
        let criterion = duffing_criterion();
        let g = criterion.gradient(&nominal_q()).unwrap();
        assert_eq!(g.len(), 5);
        assert!(g.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_gradient_sign_convention() {
        let q = nominal_q();
        let g_min = duffing_criterion().gradient(&q).unwrap();
        let g_max = duffing_criterion().maximizing(true).gradient(&q).unwrap();
        assert_relative_eq!(g_min, -g_max, epsilon = 1e-12);
    }

    #[test]
    fn test_hessian_pattern_validation() {
        let criterion = duffing_criterion();
        let q = nominal_q();

        let err = criterion.hessian_packed(&q, &[(0, 7)]).unwrap_err();
        assert!(matches!(err, EstimationError::ShapeMismatch { .. }));

        let err = criterion.hessian_packed(&q, &[(0, 1)]).unwrap_err();
        assert!(matches!(err, EstimationError::InvalidConfiguration(_)));
    }

    #[test]
    fn test_hessian_packed_entries() {
        let criterion = duffing_criterion();
        let q = nominal_q();

        // diagonal plus one off-diagonal pair
        let pattern = [(0, 0), (1, 1), (1, 0)];
        let packed = criterion.hessian_packed(&q, &pattern).unwrap();
        assert_eq!(packed.len(), 3);
        assert!(packed.iter().all(|v| v.is_finite()));
    }
}
