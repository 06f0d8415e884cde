//! Observed timing data for a single pulsar.
//!
//! A `Pulsar` is the immutable per-series input to the model: residuals,
//! arrival times, measurement uncertainties and backend labels, plus an
//! optional timing-model design matrix. All quantities are in seconds.

use faer::Mat;
use thiserror::Error;

/// Errors raised while assembling a model, before any sampling begins.
#[derive(Error, Debug)]
pub enum ModelError {
    #[error("pulsar {pulsar}: {reason}")]
    InvalidData { pulsar: String, reason: String },
    #[error(
        "pulsar {pulsar}: basis has {basis_cols} columns but prior covariance has {phi_len} entries"
    )]
    DimensionMismatch {
        pulsar: String,
        basis_cols: usize,
        phi_len: usize,
    },
    #[error("pulsar {pulsar}: selection is not a partition: {reason}")]
    InvalidPartition { pulsar: String, reason: String },
    #[error("parameter {0} declared more than once with distinct definitions")]
    ParameterCollision(String),
    #[error("parameter {0} has no sampling distribution")]
    Unsampleable(String),
    #[error("invalid jump group: {0}")]
    InvalidJumpGroup(String),
    #[error("model contains no pulsars")]
    EmptyModel,
}

/// Timing data for one pulsar. Construction validates that all
/// per-observation arrays have the same length.
#[derive(Debug, Clone)]
pub struct Pulsar {
    name: String,
    toas: Vec<f64>,
    residuals: Vec<f64>,
    toaerrs: Vec<f64>,
    backends: Vec<String>,
    design: Option<Mat<f64>>,
}

impl Pulsar {
    pub fn new(
        name: impl Into<String>,
        toas: Vec<f64>,
        residuals: Vec<f64>,
        toaerrs: Vec<f64>,
        backends: Vec<String>,
    ) -> Result<Self, ModelError> {
        let name = name.into();
        let n = toas.len();
        if n == 0 {
            return Err(ModelError::InvalidData {
                pulsar: name,
                reason: "no observations".into(),
            });
        }
        if residuals.len() != n || toaerrs.len() != n || backends.len() != n {
            return Err(ModelError::InvalidData {
                pulsar: name,
                reason: format!(
                    "length mismatch: {} toas, {} residuals, {} uncertainties, {} backends",
                    n,
                    residuals.len(),
                    toaerrs.len(),
                    backends.len()
                ),
            });
        }
        if toaerrs.iter().any(|&e| !(e > 0.0)) {
            return Err(ModelError::InvalidData {
                pulsar: name,
                reason: "non-positive TOA uncertainty".into(),
            });
        }
        Ok(Pulsar {
            name,
            toas,
            residuals,
            toaerrs,
            backends,
            design: None,
        })
    }

    /// Attach a timing-model design matrix (one row per observation).
    pub fn with_design(mut self, design: Mat<f64>) -> Result<Self, ModelError> {
        if design.nrows() != self.toas.len() {
            return Err(ModelError::InvalidData {
                pulsar: self.name,
                reason: format!(
                    "design matrix has {} rows for {} observations",
                    design.nrows(),
                    self.toas.len()
                ),
            });
        }
        self.design = Some(design);
        Ok(self)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.toas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.toas.is_empty()
    }

    pub fn toas(&self) -> &[f64] {
        &self.toas
    }

    pub fn residuals(&self) -> &[f64] {
        &self.residuals
    }

    pub fn toaerrs(&self) -> &[f64] {
        &self.toaerrs
    }

    pub fn backends(&self) -> &[String] {
        &self.backends
    }

    pub fn design(&self) -> Option<&Mat<f64>> {
        self.design.as_ref()
    }

    /// Total observation timespan in seconds.
    pub fn tspan(&self) -> f64 {
        let mut lo = f64::INFINITY;
        let mut hi = f64::NEG_INFINITY;
        for &t in &self.toas {
            lo = lo.min(t);
            hi = hi.max(t);
        }
        hi - lo
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toy() -> Pulsar {
        Pulsar::new(
            "J0000+0000",
            vec![0.0, 86400.0, 2.0 * 86400.0],
            vec![1e-6, -2e-6, 0.5e-6],
            vec![1e-6, 1e-6, 2e-6],
            vec!["A".into(), "B".into(), "A".into()],
        )
        .unwrap()
    }

    #[test]
    fn tspan_is_max_minus_min() {
        assert_eq!(toy().tspan(), 2.0 * 86400.0);
    }

    #[test]
    fn rejects_length_mismatch() {
        let err = Pulsar::new(
            "J0000+0000",
            vec![0.0, 1.0],
            vec![0.0],
            vec![1e-6, 1e-6],
            vec!["A".into(), "A".into()],
        );
        assert!(matches!(err, Err(ModelError::InvalidData { .. })));
    }

    #[test]
    fn rejects_bad_uncertainty() {
        let err = Pulsar::new(
            "J0000+0000",
            vec![0.0],
            vec![0.0],
            vec![0.0],
            vec!["A".into()],
        );
        assert!(matches!(err, Err(ModelError::InvalidData { .. })));
    }

    #[test]
    fn rejects_design_row_mismatch() {
        let psr = toy();
        let err = psr.with_design(Mat::zeros(2, 2));
        assert!(matches!(err, Err(ModelError::InvalidData { .. })));
    }
}
