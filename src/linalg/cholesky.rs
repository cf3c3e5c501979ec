//! Differentiable Cholesky-type factorization
//!
//! Computes an upper-triangular square root `S` of a symmetric positive
//! definite matrix `Q`, with `SᵗS = Q`, together with its exact first and
//! second derivatives with respect to a batch of parameter directions.
//!
//! # Algorithm
//!
//! Differentiating `SᵗS = Q` gives, entry by entry over the lower triangle of
//! the symmetric `dQ`, a linear system in the free entries of `dS`:
//!
//! `A · vec_tril(dS) = vec_tril(dQ)`
//!
//! where `A` is assembled from the entries of `S` and acts on the
//! `n(n+1)/2`-dimensional space of free factor entries. `A` is inverted once
//! per decomposed factor and the inverse is reused across all derivative
//! directions. The entries of `A` are linear in `S`, so its derivative in a
//! parameter direction is the same assembly applied to `dS`, and the second
//! derivative of the factor follows from `d(A⁻¹) = −A⁻¹ (dA) A⁻¹`.

use nalgebra::{DMatrix, DVector, RealField};

use crate::{EstimationError, Result};

// ============================================================================
// Triangular index bookkeeping
// ============================================================================

/// Lower-triangular index tables for one matrix size.
///
/// Derived once per size and cached on the work object; `pairs[r]` is the
/// `(row, column)` pair of the `r`-th free entry in row-major order, and
/// `position(i, j) == r` inverts that mapping.
#[derive(Debug, Clone)]
struct TrilIndices {
    n: usize,
    pairs: Vec<(usize, usize)>,
}

impl TrilIndices {
    fn new(n: usize) -> Self {
        let mut pairs = Vec::with_capacity(n * (n + 1) / 2);
        for i in 0..n {
            for j in 0..=i {
                pairs.push((i, j));
            }
        }
        Self { n, pairs }
    }

    /// Linear position of the free entry `(i, j)`, `j <= i`.
    #[inline]
    fn position(i: usize, j: usize) -> usize {
        i * (i + 1) / 2 + j
    }

    fn len(&self) -> usize {
        self.pairs.len()
    }
}

// ============================================================================
// Differentiable Cholesky work object
// ============================================================================

/// Stateful Cholesky factorization with exact derivative propagation.
///
/// One work object serves one factorization site (e.g. the innovation
/// covariance of a corrector) and is reused across filter steps. The
/// intermediates of each call are retained for the follow-up calls on the
/// same factor: `decompose` enables `diff`, and `diff` enables `diff2`.
#[derive(Debug, Clone, Default)]
pub struct DifferentiableCholesky<T: RealField> {
    factor: Option<DMatrix<T>>,
    tril: Option<TrilIndices>,
    a_inv: Option<DMatrix<T>>,
    dq_tril: Option<DMatrix<T>>,
    ds: Option<Vec<DMatrix<T>>>,
}

impl<T: RealField + Copy> DifferentiableCholesky<T> {
    /// Creates an empty work object.
    pub fn new() -> Self {
        Self {
            factor: None,
            tril: None,
            a_inv: None,
            dq_tril: None,
            ds: None,
        }
    }

    /// Performs the factorization `SᵗS = Q`, returning the upper-triangular
    /// factor `S`.
    ///
    /// Invalidates any derivative state from a previous factor. Fails with
    /// [`EstimationError::NotPositiveDefinite`] if `Q` has no Cholesky
    /// factorization.
    pub fn decompose(&mut self, q: &DMatrix<T>) -> Result<DMatrix<T>> {
        let chol = q
            .clone()
            .cholesky()
            .ok_or(EstimationError::NotPositiveDefinite)?;
        let s = chol.l().transpose();
        self.factor = Some(s.clone());
        self.a_inv = None;
        self.dq_tril = None;
        self.ds = None;
        Ok(s)
    }

    /// Returns the factor of the last `decompose`, if any.
    pub fn factor(&self) -> Option<&DMatrix<T>> {
        self.factor.as_ref()
    }

    /// First derivative of the factor for a batch of parameter directions.
    ///
    /// `dq[a]` is the (symmetric) derivative of `Q` in direction `a`; the
    /// result holds the matching upper-triangular `dS` per direction.
    ///
    /// # Panics
    /// Panics if called without a preceding [`decompose`](Self::decompose);
    /// the pairing of value and derivative calls on the same factor is a
    /// caller obligation.
    pub fn diff(&mut self, dq: &[DMatrix<T>]) -> Result<Vec<DMatrix<T>>> {
        let s = self
            .factor
            .as_ref()
            .expect("DifferentiableCholesky::diff requires a preceding decompose");
        let n = s.nrows();

        if self.tril.as_ref().map(|t| t.n) != Some(n) {
            self.tril = Some(TrilIndices::new(n));
            self.a_inv = None;
        }
        let tril = self.tril.as_ref().unwrap();

        if self.a_inv.is_none() {
            let a = assemble_tril_operator(s, tril);
            let a_inv = a
                .try_inverse()
                .ok_or(EstimationError::NotPositiveDefinite)?;
            self.a_inv = Some(a_inv);
        }
        let a_inv = self.a_inv.as_ref().unwrap();

        let ntril = tril.len();
        let nq = dq.len();
        let mut dq_tril = DMatrix::<T>::zeros(nq, ntril);
        for (a, dqa) in dq.iter().enumerate() {
            for (r, &(i, j)) in tril.pairs.iter().enumerate() {
                dq_tril[(a, r)] = dqa[(i, j)];
            }
        }

        let mut ds = Vec::with_capacity(nq);
        for a in 0..nq {
            let rhs = dq_tril.row(a).transpose();
            let sol = a_inv * rhs;
            let mut dsa = DMatrix::<T>::zeros(n, n);
            for (r, &(i, j)) in tril.pairs.iter().enumerate() {
                // free entry (i, j) of the tril system is factor entry (j, i)
                dsa[(j, i)] = sol[r];
            }
            ds.push(dsa);
        }

        self.dq_tril = Some(dq_tril);
        self.ds = Some(ds.clone());
        Ok(ds)
    }

    /// Second derivative of the factor.
    ///
    /// `d2q[a][b]` is the (symmetric) second derivative of `Q` in the
    /// direction pair `(a, b)`, where index `a` runs over the same directions
    /// as the preceding [`diff`](Self::diff) call; the result holds
    /// `d²S/dq_a dq_b` in the same layout.
    ///
    /// # Panics
    /// Panics if called without a preceding `diff` on the same factor.
    pub fn diff2(&mut self, d2q: &[Vec<DMatrix<T>>]) -> Result<Vec<Vec<DMatrix<T>>>> {
        let ds = self
            .ds
            .as_ref()
            .expect("DifferentiableCholesky::diff2 requires a preceding diff");
        let dq_tril = self.dq_tril.as_ref().unwrap();
        let a_inv = self.a_inv.as_ref().unwrap();
        let tril = self.tril.as_ref().unwrap();
        let n = tril.n;

        assert_eq!(
            d2q.len(),
            ds.len(),
            "second-derivative batch must match the first-derivative directions"
        );

        let nb = dq_tril.nrows();
        let mut out = Vec::with_capacity(d2q.len());
        for (a, d2q_a) in d2q.iter().enumerate() {
            assert_eq!(
                d2q_a.len(),
                nb,
                "second-derivative batch must match the first-derivative directions"
            );
            // dA is the operator assembly applied to dS, its entries being
            // linear in the factor
            let da = assemble_tril_operator(&ds[a], tril);
            let da_inv = -(a_inv * da * a_inv);

            let mut row = Vec::with_capacity(nb);
            for (b, d2q_ab) in d2q_a.iter().enumerate() {
                let d2q_tril = DVector::from_iterator(
                    tril.len(),
                    tril.pairs.iter().map(|&(i, j)| d2q_ab[(i, j)]),
                );
                let sol = &da_inv * dq_tril.row(b).transpose() + a_inv * &d2q_tril;
                let mut d2s = DMatrix::<T>::zeros(n, n);
                for (r, &(i, j)) in tril.pairs.iter().enumerate() {
                    d2s[(j, i)] = sol[r];
                }
                row.push(d2s);
            }
            out.push(row);
        }
        Ok(out)
    }
}

/// Assembles the linear operator of the tril system from a factor-shaped
/// matrix.
///
/// Row `r = (i, j)` encodes `dQ[i, j] = Σ_k dS[k, i]·S[k, j] + S[k, i]·dS[k, j]`
/// with the unknowns `dS[k, i] ↦ (i, k)` and `dS[k, j] ↦ (j, k)` in tril
/// positions.
fn assemble_tril_operator<T: RealField + Copy>(
    s: &DMatrix<T>,
    tril: &TrilIndices,
) -> DMatrix<T> {
    let ntril = tril.len();
    let mut a = DMatrix::<T>::zeros(ntril, ntril);
    for (r, &(i, j)) in tril.pairs.iter().enumerate() {
        for k in 0..=i {
            a[(r, TrilIndices::position(i, k))] += s[(k, j)];
        }
        for k in 0..=j {
            a[(r, TrilIndices::position(j, k))] += s[(k, i)];
        }
    }
    a
}
