//! Per-pulsar combination of signals.
//!
//! A [`SignalCollection`] owns one pulsar's data and its additive signals,
//! concatenates their basis columns into the combined GP basis and records
//! which slice of the stacked prior covariance each signal fills. Dimension
//! consistency between basis and prior blocks is enforced here, before any
//! sampling can start.

use std::ops::Range;
use std::sync::Arc;

use faer::Mat;

use crate::params::Parameter;
use crate::pulsar::{ModelError, Pulsar};
use crate::signal::{Signal, WhiteNoise};

pub struct SignalCollection {
    pulsar: Pulsar,
    signals: Vec<Box<dyn Signal>>,
    basis: Mat<f64>,
    col_ranges: Vec<Range<usize>>,
}

impl SignalCollection {
    pub fn new(pulsar: Pulsar, signals: Vec<Box<dyn Signal>>) -> Result<Self, ModelError> {
        let nobs = pulsar.len();
        if !signals.iter().any(|s| s.contributes_white()) {
            return Err(ModelError::InvalidData {
                pulsar: pulsar.name().to_string(),
                reason: "no white-noise signal; the likelihood would be singular".into(),
            });
        }

        let mut total_cols = 0;
        let mut col_ranges = Vec::with_capacity(signals.len());
        for s in &signals {
            let cols = s.basis_cols();
            if s.phi_len() != cols {
                return Err(ModelError::DimensionMismatch {
                    pulsar: pulsar.name().to_string(),
                    basis_cols: cols,
                    phi_len: s.phi_len(),
                });
            }
            if let Some(b) = s.basis() {
                if b.nrows() != nobs {
                    return Err(ModelError::InvalidData {
                        pulsar: pulsar.name().to_string(),
                        reason: format!(
                            "signal {} basis has {} rows for {} observations",
                            s.name(),
                            b.nrows(),
                            nobs
                        ),
                    });
                }
            }
            col_ranges.push(total_cols..total_cols + cols);
            total_cols += cols;
        }

        let mut basis = Mat::zeros(nobs, total_cols);
        for (s, range) in signals.iter().zip(&col_ranges) {
            if let Some(b) = s.basis() {
                for (jj, j) in range.clone().enumerate() {
                    for i in 0..nobs {
                        basis[(i, j)] = b[(i, jj)];
                    }
                }
            }
        }

        Ok(SignalCollection {
            pulsar,
            signals,
            basis,
            col_ranges,
        })
    }

    pub fn pulsar(&self) -> &Pulsar {
        &self.pulsar
    }

    pub fn signals(&self) -> &[Box<dyn Signal>] {
        &self.signals
    }

    /// Combined GP basis: every signal's columns, in signal order.
    pub fn basis(&self) -> &Mat<f64> {
        &self.basis
    }

    /// Number of GP basis columns.
    pub fn nbasis(&self) -> usize {
        self.basis.ncols()
    }

    /// The slice of the stacked prior covariance filled by signal `i`.
    pub(crate) fn col_range(&self, i: usize) -> Range<usize> {
        self.col_ranges[i].clone()
    }

    /// All parameters, in signal order, deduplicated by first appearance.
    pub fn params(&self) -> Vec<Arc<Parameter>> {
        let mut out: Vec<Arc<Parameter>> = Vec::new();
        for s in &self.signals {
            for p in s.params() {
                if !out.iter().any(|q| Arc::ptr_eq(q, p)) {
                    out.push(p.clone());
                }
            }
        }
        out
    }

    /// Fresh white-noise accumulator sized for this pulsar.
    pub(crate) fn empty_white(&self) -> WhiteNoise {
        WhiteNoise::new(self.pulsar.len())
    }
}
