//! Differentiable unscented Kalman filter
//!
//! The discrete-time predict/correct recursion over a [`StateSpaceModel`],
//! with accumulated Gaussian log-likelihood and, on request, exact
//! first-order derivatives of the state distribution and likelihood with
//! respect to the model parameters. The likelihood and its gradient are the
//! inputs to prediction-error-method parameter estimation (see
//! [`crate::pem`]).
//!
//! # Call pairing
//!
//! The recursion is stateful and order-dependent: each `*_diff` call reads
//! intermediates retained by its matching value call on the same step. The
//! [`EstimationContext`] enforces the pairing with explicit per-step records
//! — `predict` clears the correction record, `correct` clears the prediction
//! record, and a derivative call without its matching record is a programmer
//! error that panics. The driver entry points call everything in the right
//! order: correct → correction_diff → update_likelihood → likelihood_diff →
//! predict → prediction_diff.

use nalgebra::{DMatrix, DVector, RealField};

use crate::filters::unscented::{
    CholeskySqrt, CovarianceSqrt, SqrtMethod, SvdSqrt, UnscentedTransform, UtWork,
};
use crate::linalg::DifferentiableCholesky;
use crate::models::{SensitivityModel, StateSpaceModel};
use crate::types::gaussian::{symmetrize, GaussianState};
use crate::types::measurement::MaskedMeasurement;
use crate::{EstimationError, Result};

// ============================================================================
// Options and output
// ============================================================================

/// Filter run configuration.
#[derive(Debug, Clone)]
pub struct UkfOptions<T: RealField> {
    /// Square-root variant used for sigma-point generation
    pub sqrt: SqrtMethod,
    /// Center sigma-point weight parameter (zero disables the center point)
    pub kappa: T,
    /// Retain the per-step filtered means and covariances
    pub save_history: bool,
    /// Propagate parameter derivatives and the likelihood gradient
    pub calculate_gradients: bool,
}

impl<T: RealField + Copy> Default for UkfOptions<T> {
    fn default() -> Self {
        Self {
            sqrt: SqrtMethod::Cholesky,
            kappa: T::zero(),
            save_history: true,
            calculate_gradients: false,
        }
    }
}

/// Result of a filter run.
#[derive(Debug, Clone)]
pub struct FilterOutput<T: RealField> {
    /// Final filtered state distribution
    pub state: GaussianState<T>,
    /// Accumulated measurement log-likelihood (up to the parameter-independent
    /// normalization constant)
    pub log_likelihood: T,
    /// Likelihood gradient `dL/dq`, when gradients were requested
    pub gradient: Option<DVector<T>>,
    /// Filtered means per step, when history was requested
    pub means: Option<Vec<DVector<T>>>,
    /// Filtered covariances per step, when history was requested
    pub covariances: Option<Vec<DMatrix<T>>>,
}

/// What a correction step did with its measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorrectionOutcome {
    /// At least one entry was observed and the state was updated
    Updated,
    /// Every entry was missing; the step was an identity and contributed
    /// nothing to the likelihood
    AllMissing,
}

// ============================================================================
// Estimation context
// ============================================================================

/// Parameter-derivative block of a gradient-enabled context.
#[derive(Debug, Clone)]
pub struct GradientState<T: RealField> {
    /// Derivative of the state mean, `nq × nx`
    pub dx_dq: DMatrix<T>,
    /// Derivative of the state covariance, one `nx × nx` matrix per parameter
    pub dpx_dq: Vec<DMatrix<T>>,
    /// Derivative of the accumulated log-likelihood
    pub dl_dq: DVector<T>,
}

impl<T: RealField + Copy> GradientState<T> {
    fn zeros(nq: usize, nx: usize) -> Self {
        Self {
            dx_dq: DMatrix::zeros(nq, nx),
            dpx_dq: vec![DMatrix::zeros(nx, nx); nq],
            dl_dq: DVector::zeros(nq),
        }
    }
}

#[derive(Debug, Clone)]
struct PredictionRecord<T: RealField> {
    ut: UtWork<T>,
    prev_mean: DVector<T>,
    k_prev: usize,
}

#[derive(Debug, Clone)]
struct CorrectionData<T: RealField> {
    ut: UtWork<T>,
    active: Vec<usize>,
    innovation: DVector<T>,
    gain: DMatrix<T>,
    crosscov: DMatrix<T>,
    py: DMatrix<T>,
    py_inv: DMatrix<T>,
    py_chol: DifferentiableCholesky<T>,
    grad: Option<CorrectionGradientData<T>>,
}

/// Derivative intermediates shared between `correction_diff` and
/// `likelihood_diff`.
#[derive(Debug, Clone)]
struct CorrectionGradientData<T: RealField> {
    de_dq: DMatrix<T>,
    dpy_dq: Vec<DMatrix<T>>,
    dpyi_dq: Vec<DMatrix<T>>,
}

#[derive(Debug, Clone)]
enum CorrectionRecord<T: RealField> {
    Identity,
    Update(Box<CorrectionData<T>>),
}

/// Mutable per-run state of the filter recursion.
///
/// Owned exclusively by one filter run: created from the initial state
/// distribution, mutated in place by every predict/correct call, and read
/// out once the run finishes. The transient per-step records couple each
/// value call to its derivative call (see the module docs).
#[derive(Debug, Clone)]
pub struct EstimationContext<T: RealField> {
    /// Current time index
    pub k: usize,
    /// Current state distribution
    pub state: GaussianState<T>,
    /// Accumulated measurement log-likelihood
    pub log_likelihood: T,
    /// Parameter-derivative block, present on gradient-enabled runs
    pub gradient: Option<GradientState<T>>,
    pred: Option<PredictionRecord<T>>,
    corr: Option<CorrectionRecord<T>>,
}

impl<T: RealField + Copy> EstimationContext<T> {
    /// Creates a value-only context from the initial state distribution.
    pub fn new(state: GaussianState<T>) -> Self {
        Self {
            k: 0,
            state,
            log_likelihood: T::zero(),
            gradient: None,
            pred: None,
            corr: None,
        }
    }

    /// Creates a gradient-enabled context for `nq` parameters.
    ///
    /// The initial state is treated as parameter-independent: the derivative
    /// block starts at zero.
    pub fn with_gradients(state: GaussianState<T>, nq: usize) -> Self {
        let nx = state.dim();
        let mut ctx = Self::new(state);
        ctx.gradient = Some(GradientState::zeros(nq, nx));
        ctx
    }
}

// ============================================================================
// Filter
// ============================================================================

/// Unscented Kalman filter over a state-space model.
///
/// Prediction and correction each own their unscented transform so that
/// their per-step working sets never alias.
#[derive(Debug, Clone)]
pub struct UnscentedKalmanFilter<T: RealField, M, R> {
    model: M,
    pred_ut: UnscentedTransform<T, R>,
    corr_ut: UnscentedTransform<T, R>,
}

impl<T, M, R> UnscentedKalmanFilter<T, M, R>
where
    T: RealField + Copy,
    M: StateSpaceModel<T>,
    R: CovarianceSqrt<T> + Clone,
{
    /// Creates a filter for the given model, center weight and square-root
    /// variant.
    pub fn new(model: M, kappa: T, sqrt: R) -> Result<Self> {
        let nx = model.nx();
        let pred_ut = UnscentedTransform::new(nx, kappa, sqrt.clone())?;
        let corr_ut = UnscentedTransform::new(nx, kappa, sqrt)?;
        Ok(Self {
            model,
            pred_ut,
            corr_ut,
        })
    }

    /// The underlying model.
    pub fn model(&self) -> &M {
        &self.model
    }

    // ------------------------------------------------------------------
    // Prediction
    // ------------------------------------------------------------------

    /// Predicts the state distribution at the next time index.
    ///
    /// Propagates the current distribution through the drift via the
    /// unscented transform, adds the process noise evaluated at the current
    /// mean, and advances the time index. The transform working set is
    /// retained for [`prediction_diff`](Self::prediction_diff).
    pub fn predict(&self, ctx: &mut EstimationContext<T>) -> Result<()> {
        let k = ctx.k;
        let model = &self.model;
        let mut ut = UtWork::new(ctx.state.mean.clone(), ctx.state.covariance.clone());
        let (f, pf) = self.pred_ut.transform(&mut ut, |x| model.drift(k, x))?;
        let q = self.model.process_noise(k, &ctx.state.mean);

        ctx.pred = Some(PredictionRecord {
            ut,
            prev_mean: ctx.state.mean.clone(),
            k_prev: k,
        });
        ctx.corr = None;
        ctx.k = k + 1;
        ctx.state.mean = f;
        ctx.state.covariance = pf + q;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Correction
    // ------------------------------------------------------------------

    /// Corrects the state distribution with a (possibly partially missing)
    /// measurement.
    ///
    /// The observation model, its noise covariance and the measurement are
    /// restricted to the active entries; if every entry is missing the step
    /// is an identity and contributes nothing to the likelihood. The
    /// innovation covariance is factorized and inverted through its
    /// triangular factor; the working set, gain and factorization are
    /// retained for the derivative and likelihood calls.
    pub fn correct(
        &self,
        ctx: &mut EstimationContext<T>,
        y: &MaskedMeasurement<T>,
    ) -> Result<CorrectionOutcome> {
        let ny = self.model.ny();
        if y.dim() != ny {
            return Err(EstimationError::ShapeMismatch {
                what: "measurement vector",
                expected: ny,
                actual: y.dim(),
            });
        }

        let k = ctx.k;
        let active = y.active_indices();
        if active.is_empty() {
            log::debug!(
                "all measurement entries missing at step {}; correction is an identity",
                k
            );
            ctx.corr = Some(CorrectionRecord::Identity);
            ctx.pred = None;
            return Ok(CorrectionOutcome::AllMissing);
        }

        let y_act = y.compress();
        let r_act = self
            .model
            .measurement_noise()
            .select_rows(&active)
            .select_columns(&active);

        let model = &self.model;
        let mut ut = UtWork::new(ctx.state.mean.clone(), ctx.state.covariance.clone());
        let (h, ph) = self
            .corr_ut
            .transform(&mut ut, |x| model.observe(k, x).select_rows(&active))?;
        let pxh = self.corr_ut.crosscov(&ut);

        // innovation covariance and its factorized inverse
        let py = ph + r_act;
        let mut py_chol = DifferentiableCholesky::new();
        let pyc = py_chol.decompose(&py)?;
        let na = active.len();
        let pyc_inv = pyc
            .solve_upper_triangular(&DMatrix::identity(na, na))
            .ok_or(EstimationError::NotPositiveDefinite)?;
        let py_inv = &pyc_inv * pyc_inv.transpose();

        let e = y_act - h;
        let gain = &pxh * &py_inv;
        let x_corr = &ctx.state.mean + &gain * &e;
        let px_corr = symmetrize(&(&ctx.state.covariance - &gain * &py * gain.transpose()));

        ctx.state.mean = x_corr;
        ctx.state.covariance = px_corr;
        ctx.corr = Some(CorrectionRecord::Update(Box::new(CorrectionData {
            ut,
            active,
            innovation: e,
            gain,
            crosscov: pxh,
            py,
            py_inv,
            py_chol,
            grad: None,
        })));
        ctx.pred = None;
        Ok(CorrectionOutcome::Updated)
    }

    /// Accumulates the measurement log-likelihood of the last correction.
    ///
    /// `L -= ½·eᵗ·Py⁻¹·e + Σ log diag(factor)`, the second term being half
    /// the log-determinant of the innovation covariance via its triangular
    /// factor. The parameter-independent `2π` normalization is omitted.
    /// No-op after an identity (all-missing) correction.
    ///
    /// # Panics
    /// Panics if called without a matching [`correct`](Self::correct) on the
    /// same step.
    pub fn update_likelihood(&self, ctx: &mut EstimationContext<T>) {
        let record = ctx
            .corr
            .as_ref()
            .expect("update_likelihood requires a matching correct on the same step");
        let data = match record {
            CorrectionRecord::Identity => return,
            CorrectionRecord::Update(data) => data,
        };

        let e = &data.innovation;
        let half = T::from_subset(&0.5);
        let quad = (e.transpose() * &data.py_inv * e)[(0, 0)];

        let factor = data.py_chol.factor().unwrap();
        let mut logdet = T::zero();
        for i in 0..factor.nrows() {
            logdet += factor[(i, i)].ln();
        }

        ctx.log_likelihood -= half * quad + logdet;
    }

    // ------------------------------------------------------------------
    // Value-only driver
    // ------------------------------------------------------------------

    /// Runs the correct/predict recursion over a measurement sequence.
    ///
    /// Corrects at every step and predicts between steps; the likelihood
    /// accumulates on the context. Returns the filtered means and
    /// covariances per step.
    pub fn filter(
        &self,
        ctx: &mut EstimationContext<T>,
        measurements: &[MaskedMeasurement<T>],
    ) -> Result<(Vec<DVector<T>>, Vec<DMatrix<T>>)> {
        let n = measurements.len();
        let mut means = Vec::with_capacity(n);
        let mut covariances = Vec::with_capacity(n);

        for (step, y) in measurements.iter().enumerate() {
            self.correct(ctx, y)?;
            self.update_likelihood(ctx);
            means.push(ctx.state.mean.clone());
            covariances.push(ctx.state.covariance.clone());
            if step + 1 < n {
                self.predict(ctx)?;
            }
        }
        Ok((means, covariances))
    }
}

impl<T, M, R> UnscentedKalmanFilter<T, M, R>
where
    T: RealField + Copy,
    M: SensitivityModel<T>,
    R: CovarianceSqrt<T> + Clone,
{
    // ------------------------------------------------------------------
    // Derivative propagation
    // ------------------------------------------------------------------

    /// Propagates the parameter derivatives of the last prediction.
    ///
    /// Uses the transform working set retained by the matching
    /// [`predict`](Self::predict); the process-noise derivative picks up the
    /// chain-rule term from its dependence on the pre-prediction mean.
    ///
    /// # Panics
    /// Panics if called without a matching `predict` on the same step, or on
    /// a context without a gradient block.
    pub fn prediction_diff(&self, ctx: &mut EstimationContext<T>) -> Result<()> {
        let EstimationContext {
            ref mut pred,
            ref mut gradient,
            ..
        } = *ctx;
        let record = pred
            .as_mut()
            .expect("prediction_diff requires a matching predict on the same step");
        let grad = gradient
            .as_mut()
            .expect("prediction_diff requires a gradient-enabled context");

        let k = record.k_prev;
        let model = &self.model;
        let (df_dq, dpf_dq) = self.pred_ut.transform_diff(
            &mut record.ut,
            |z| model.drift_dq(k, z),
            |z| model.drift_dx(k, z),
            &grad.dx_dq,
            &grad.dpx_dq,
        )?;

        let x = &record.prev_mean;
        let dq_dq = model.process_noise_dq(k, x);
        let dq_dx = model.process_noise_dx(k, x);
        let nx = model.nx();
        let nq = model.nq();

        for a in 0..nq {
            // total process-noise derivative: explicit parameter dependence
            // plus the chain through the pre-prediction mean
            let mut dq_total = dq_dq[a].clone();
            for j in 0..nx {
                dq_total += &dq_dx[j] * grad.dx_dq[(a, j)];
            }
            grad.dpx_dq[a] = &dpf_dq[a] + dq_total;
        }
        grad.dx_dq = df_dq;
        Ok(())
    }

    /// Propagates the parameter derivatives of the last correction.
    ///
    /// No-op after an identity (all-missing) correction. Retains the
    /// innovation and innovation-covariance derivatives for
    /// [`likelihood_diff`](Self::likelihood_diff).
    ///
    /// # Panics
    /// Panics if called without a matching [`correct`](Self::correct) on the
    /// same step, or on a context without a gradient block.
    pub fn correction_diff(&self, ctx: &mut EstimationContext<T>) -> Result<()> {
        let EstimationContext {
            ref mut corr,
            ref mut gradient,
            k,
            ..
        } = *ctx;
        let record = corr
            .as_mut()
            .expect("correction_diff requires a matching correct on the same step");
        let data = match record {
            CorrectionRecord::Identity => return Ok(()),
            CorrectionRecord::Update(data) => data,
        };
        let grad = gradient
            .as_mut()
            .expect("correction_diff requires a gradient-enabled context");

        let model = &self.model;
        let active = data.active.clone();
        let (dh_dq, dph_dq) = self.corr_ut.transform_diff(
            &mut data.ut,
            |z| model.observe_dq(k, z).select_columns(&active),
            |z| model.observe_dx(k, z).select_columns(&active),
            &grad.dx_dq,
            &grad.dpx_dq,
        )?;
        let dpxh_dq = self.corr_ut.crosscov_diff(&data.ut);
        let dr_dq = model.measurement_noise_dq();

        let nq = model.nq();
        let de_dq = -dh_dq;
        let mut dpy_dq = Vec::with_capacity(nq);
        let mut dpyi_dq = Vec::with_capacity(nq);

        for a in 0..nq {
            let dr_act = dr_dq[a].select_rows(&active).select_columns(&active);
            let dpy = &dph_dq[a] + dr_act;
            // d(Py⁻¹) = −Py⁻¹ (dPy) Py⁻¹
            let dpyi = -(&data.py_inv * &dpy * &data.py_inv);
            let dk = &data.crosscov * &dpyi + &dpxh_dq[a] * &data.py_inv;

            // product rule on x + K·e
            let dx_row = &dk * &data.innovation + &data.gain * de_dq.row(a).transpose();
            for j in 0..dx_row.len() {
                grad.dx_dq[(a, j)] += dx_row[j];
            }

            // product rule on Px − K·Py·Kᵗ
            let m = &dk * &data.py * data.gain.transpose();
            let mt = m.transpose();
            let kk = &data.gain * &dpy * data.gain.transpose();
            grad.dpx_dq[a] -= m + mt + kk;

            dpy_dq.push(dpy);
            dpyi_dq.push(dpyi);
        }

        data.grad = Some(CorrectionGradientData {
            de_dq,
            dpy_dq,
            dpyi_dq,
        });
        Ok(())
    }

    /// Accumulates the parameter derivative of the log-likelihood of the
    /// last correction.
    ///
    /// Differentiates `−½·eᵗ·Py⁻¹·e − Σ log diag(factor)` using the
    /// innovation derivatives retained by
    /// [`correction_diff`](Self::correction_diff) and the factor derivative
    /// from the differentiable factorization. No-op after an identity
    /// correction.
    ///
    /// # Panics
    /// Panics if called without a matching `correct` and `correction_diff`
    /// on the same step.
    pub fn likelihood_diff(&self, ctx: &mut EstimationContext<T>) -> Result<()> {
        let EstimationContext {
            ref mut corr,
            ref mut gradient,
            ..
        } = *ctx;
        let record = corr
            .as_mut()
            .expect("likelihood_diff requires a matching correct on the same step");
        let data = match record {
            CorrectionRecord::Identity => return Ok(()),
            CorrectionRecord::Update(data) => data,
        };
        let grad = gradient
            .as_mut()
            .expect("likelihood_diff requires a gradient-enabled context");
        let gdata = data
            .grad
            .as_ref()
            .expect("likelihood_diff requires a preceding correction_diff on the same step");

        let dpyc_dq = data.py_chol.diff(&gdata.dpy_dq)?;
        let factor = data.py_chol.factor().unwrap();

        let e = &data.innovation;
        let pyi_e = &data.py_inv * e;
        let half = T::from_subset(&0.5);
        let na = e.len();
        let nq = gdata.de_dq.nrows();

        for a in 0..nq {
            // log-determinant term through the factor diagonal
            let mut dlogdet = T::zero();
            for i in 0..na {
                dlogdet += dpyc_dq[a][(i, i)] / factor[(i, i)];
            }
            // the two e-linear quadratic-form terms coincide by symmetry
            let de_a = gdata.de_dq.row(a).transpose();
            let linear = de_a.dot(&pyi_e);
            let quad = (e.transpose() * &gdata.dpyi_dq[a] * e)[(0, 0)];
            grad.dl_dq[a] -= dlogdet + linear + half * quad;
        }
        Ok(())
    }
}

// ============================================================================
// Options-driven run entry point
// ============================================================================

/// Runs a complete filter pass over a measurement record.
///
/// Validates shapes against the model, builds the configured filter and
/// context, and drives the recursion in the order correct →
/// correction_diff → update_likelihood → likelihood_diff → predict →
/// prediction_diff. Requesting gradients with a square-root variant that
/// does not support them is rejected up front.
pub fn run_filter<T, M>(
    model: M,
    x0: &DVector<T>,
    px0: &DMatrix<T>,
    measurements: &[MaskedMeasurement<T>],
    options: &UkfOptions<T>,
) -> Result<FilterOutput<T>>
where
    T: RealField + Copy,
    M: SensitivityModel<T>,
{
    match options.sqrt {
        SqrtMethod::Cholesky => run_with(model, x0, px0, measurements, options, CholeskySqrt),
        SqrtMethod::Svd => run_with(model, x0, px0, measurements, options, SvdSqrt),
    }
}

fn run_with<T, M, R>(
    model: M,
    x0: &DVector<T>,
    px0: &DMatrix<T>,
    measurements: &[MaskedMeasurement<T>],
    options: &UkfOptions<T>,
    sqrt: R,
) -> Result<FilterOutput<T>>
where
    T: RealField + Copy,
    M: SensitivityModel<T>,
    R: CovarianceSqrt<T> + Clone,
{
    if options.calculate_gradients && !sqrt.supports_gradients() {
        return Err(EstimationError::InvalidConfiguration(
            "the configured square-root variant does not support gradients",
        ));
    }

    let nx = model.nx();
    let ny = model.ny();
    let nq = model.nq();
    if x0.len() != nx {
        return Err(EstimationError::ShapeMismatch {
            what: "initial state mean",
            expected: nx,
            actual: x0.len(),
        });
    }
    for y in measurements {
        if y.dim() != ny {
            return Err(EstimationError::ShapeMismatch {
                what: "measurement vector",
                expected: ny,
                actual: y.dim(),
            });
        }
    }

    let state0 = GaussianState::new(x0.clone(), px0.clone())?;
    let filter = UnscentedKalmanFilter::new(model, options.kappa, sqrt)?;
    let mut ctx = if options.calculate_gradients {
        EstimationContext::with_gradients(state0, nq)
    } else {
        EstimationContext::new(state0)
    };

    let n = measurements.len();
    let mut means = options.save_history.then(|| Vec::with_capacity(n));
    let mut covariances = options.save_history.then(|| Vec::with_capacity(n));

    for (step, y) in measurements.iter().enumerate() {
        filter.correct(&mut ctx, y)?;
        if options.calculate_gradients {
            filter.correction_diff(&mut ctx)?;
        }
        filter.update_likelihood(&mut ctx);
        if options.calculate_gradients {
            filter.likelihood_diff(&mut ctx)?;
        }

        if let (Some(means), Some(covariances)) = (means.as_mut(), covariances.as_mut()) {
            means.push(ctx.state.mean.clone());
            covariances.push(ctx.state.covariance.clone());
        }

        if step + 1 < n {
            filter.predict(&mut ctx)?;
            if options.calculate_gradients {
                filter.prediction_diff(&mut ctx)?;
            }
        }
    }

    log::trace!(
        "filter run over {} steps finished with log-likelihood {:?}",
        n,
        ctx.log_likelihood
    );

    Ok(FilterOutput {
        state: ctx.state,
        log_likelihood: ctx.log_likelihood,
        gradient: ctx.gradient.map(|g| g.dl_dq),
        means,
        covariances,
    })
}
