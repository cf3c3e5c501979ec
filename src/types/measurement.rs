//! Measurement vectors with missing-data masks
//!
//! Offline records frequently have gaps: a sensor drops out for a few samples,
//! or channels are logged at different rates. A [`MaskedMeasurement`] carries
//! the raw value vector together with a per-entry mask; masked-out entries are
//! excluded from the correction step entirely, never imputed.

use nalgebra::{DVector, RealField};

// ============================================================================
// Masked Measurement
// ============================================================================

/// A measurement vector with a parallel missing-data mask.
///
/// `mask[i] == true` means entry `i` was observed. The filter restricts the
/// observation model and noise covariance to the active entries at each step;
/// a fully-masked measurement degrades the correction to an identity step.
#[derive(Debug, Clone, PartialEq)]
pub struct MaskedMeasurement<T: RealField> {
    /// Raw measurement values (masked entries hold an arbitrary placeholder)
    pub values: DVector<T>,
    /// Per-entry observation mask, same length as `values`
    pub mask: Vec<bool>,
}

impl<T: RealField + Copy> MaskedMeasurement<T> {
    /// Creates a fully-observed measurement.
    pub fn observed(values: DVector<T>) -> Self {
        let mask = vec![true; values.len()];
        Self { values, mask }
    }

    /// Creates a measurement with an explicit mask.
    ///
    /// # Panics
    /// Panics if `mask` and `values` have different lengths.
    pub fn with_mask(values: DVector<T>, mask: Vec<bool>) -> Self {
        assert_eq!(
            values.len(),
            mask.len(),
            "measurement mask length must match the value vector"
        );
        Self { values, mask }
    }

    /// Creates a measurement from optional entries; `None` marks missing data.
    pub fn from_options(entries: &[Option<T>]) -> Self {
        let values = DVector::from_iterator(
            entries.len(),
            entries.iter().map(|e| e.unwrap_or_else(T::zero)),
        );
        let mask = entries.iter().map(|e| e.is_some()).collect();
        Self { values, mask }
    }

    /// Creates a fully-missing measurement of the given dimension.
    pub fn all_missing(ny: usize) -> Self {
        Self {
            values: DVector::zeros(ny),
            mask: vec![false; ny],
        }
    }

    /// Returns the full measurement dimension (observed or not).
    #[inline]
    pub fn dim(&self) -> usize {
        self.values.len()
    }

    /// Returns true if no entry was observed.
    pub fn is_all_missing(&self) -> bool {
        self.mask.iter().all(|&m| !m)
    }

    /// Returns the indices of the observed entries, in ascending order.
    pub fn active_indices(&self) -> Vec<usize> {
        self.mask
            .iter()
            .enumerate()
            .filter_map(|(i, &m)| if m { Some(i) } else { None })
            .collect()
    }

    /// Returns the observed entries as a compressed vector.
    pub fn compress(&self) -> DVector<T> {
        let active = self.active_indices();
        DVector::from_iterator(active.len(), active.iter().map(|&i| self.values[i]))
    }
}
