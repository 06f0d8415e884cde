//! Gaussian-process signals on a Fourier basis, and the timing-model basis.

use std::sync::Arc;

use faer::{Mat, MatRef};

use crate::math::vector_dot;
use crate::params::{Parameter, Prior};
use crate::pulsar::{ModelError, Pulsar};
use crate::signal::Signal;

/// One sidereal year in seconds; power-law amplitudes are referenced to it.
const FYR: f64 = 1.0 / (365.25 * 86400.0);

/// Prior variance assigned to timing-model basis columns: effectively
/// unconstrained amplitudes.
const TM_VARIANCE: f64 = 1e40;

/// Sine/cosine design matrix on the frequency grid `k / tspan`,
/// `k = 1..=nmodes`. Returns the matrix (one sin and one cos column per
/// mode) and the frequency of each column.
pub fn fourier_design_matrix(toas: &[f64], nmodes: usize, tspan: f64) -> (Mat<f64>, Vec<f64>) {
    let n = toas.len();
    let mut basis = Mat::zeros(n, 2 * nmodes);
    let mut freqs = vec![0.0; 2 * nmodes];
    for k in 0..nmodes {
        let f = (k + 1) as f64 / tspan;
        freqs[2 * k] = f;
        freqs[2 * k + 1] = f;
        for (i, &t) in toas.iter().enumerate() {
            let phase = 2.0 * std::f64::consts::PI * f * t;
            basis[(i, 2 * k)] = phase.sin();
            basis[(i, 2 * k + 1)] = phase.cos();
        }
    }
    (basis, freqs)
}

/// Power-law PSD converted to the prior variance of one Fourier mode:
/// `A^2 / (12 pi^2) * fyr^(gamma-3) * f^-gamma * df`, with `df = 1/Tspan`.
pub fn powerlaw(f: f64, log10_a: f64, gamma: f64, df: f64) -> f64 {
    let a2 = 10f64.powf(2.0 * log10_a);
    a2 / (12.0 * std::f64::consts::PI * std::f64::consts::PI)
        * FYR.powf(gamma - 3.0)
        * f.powf(-gamma)
        * df
}

/// A stochastic process with a power-law spectrum on a Fourier basis.
///
/// Covers both per-pulsar red noise (private parameters) and an array-wide
/// common process: for the latter, construct one amplitude and one
/// spectral-index [`Parameter`] and pass the same `Arc`s into
/// [`FourierBasisGp::common`] for every pulsar, so all of them share the
/// sampled values.
pub struct FourierBasisGp {
    name: String,
    params: Vec<Arc<Parameter>>,
    basis: Mat<f64>,
    freqs: Vec<f64>,
    df: f64,
}

impl FourierBasisGp {
    /// Per-pulsar red noise with its own `{pulsar}_red_noise_log10_A` and
    /// `{pulsar}_red_noise_gamma` parameters. `tspan` overrides the
    /// frequency grid span; `None` uses the pulsar's own timespan.
    pub fn red_noise(
        psr: &Pulsar,
        nmodes: usize,
        tspan: Option<f64>,
        log10_a_prior: Prior,
        gamma_prior: Prior,
    ) -> Self {
        let tspan = tspan.unwrap_or_else(|| psr.tspan());
        let (basis, freqs) = fourier_design_matrix(psr.toas(), nmodes, tspan);
        FourierBasisGp {
            name: format!("{}_red_noise", psr.name()),
            params: vec![
                Parameter::new(format!("{}_red_noise_log10_A", psr.name()), log10_a_prior),
                Parameter::new(format!("{}_red_noise_gamma", psr.name()), gamma_prior),
            ],
            basis,
            freqs,
            df: 1.0 / tspan,
        }
    }

    /// An array-wide process: shared parameters, frequency grid set by the
    /// full array timespan.
    pub fn common(
        psr: &Pulsar,
        nmodes: usize,
        tspan: f64,
        log10_a: Arc<Parameter>,
        gamma: Arc<Parameter>,
    ) -> Self {
        let (basis, freqs) = fourier_design_matrix(psr.toas(), nmodes, tspan);
        FourierBasisGp {
            name: format!("{}_common", psr.name()),
            params: vec![log10_a, gamma],
            basis,
            freqs,
            df: 1.0 / tspan,
        }
    }
}

impl Signal for FourierBasisGp {
    fn name(&self) -> &str {
        &self.name
    }

    fn params(&self) -> &[Arc<Parameter>] {
        &self.params
    }

    fn basis(&self) -> Option<MatRef<'_, f64>> {
        Some(self.basis.as_ref())
    }

    fn phi(&self, values: &[f64], out: &mut [f64]) {
        let (log10_a, gamma) = (values[0], values[1]);
        for (o, &f) in out.iter_mut().zip(&self.freqs) {
            *o = powerlaw(f, log10_a, gamma, self.df);
        }
    }
}

/// Marginalized timing model: the pulsar's design matrix with columns
/// normalized to unit Euclidean norm, under an effectively infinite prior.
pub struct TimingModel {
    name: String,
    params: Vec<Arc<Parameter>>,
    basis: Mat<f64>,
}

impl TimingModel {
    pub fn new(psr: &Pulsar) -> Result<Self, ModelError> {
        let design = psr.design().ok_or_else(|| ModelError::InvalidData {
            pulsar: psr.name().to_string(),
            reason: "timing model requires a design matrix".into(),
        })?;
        let mut basis = design.clone();
        for j in 0..basis.ncols() {
            let col = basis.col_as_slice(j);
            let norm = vector_dot(col, col).sqrt();
            if norm == 0.0 {
                return Err(ModelError::InvalidData {
                    pulsar: psr.name().to_string(),
                    reason: format!("design matrix column {} is all zeros", j),
                });
            }
            for i in 0..basis.nrows() {
                basis[(i, j)] /= norm;
            }
        }
        Ok(TimingModel {
            name: format!("{}_timing_model", psr.name()),
            params: Vec::new(),
            basis,
        })
    }
}

impl Signal for TimingModel {
    fn name(&self) -> &str {
        &self.name
    }

    fn params(&self) -> &[Arc<Parameter>] {
        &self.params
    }

    fn basis(&self) -> Option<MatRef<'_, f64>> {
        Some(self.basis.as_ref())
    }

    fn phi(&self, _values: &[f64], out: &mut [f64]) {
        out.fill(TM_VARIANCE);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn toy() -> Pulsar {
        let toas: Vec<f64> = (0..40).map(|i| i as f64 * 10.0 * 86400.0).collect();
        Pulsar::new(
            "J0000+0000",
            toas,
            vec![0.0; 40],
            vec![1e-6; 40],
            vec!["A".into(); 40],
        )
        .unwrap()
    }

    #[test]
    fn fourier_basis_shape_and_frequencies() {
        let psr = toy();
        let (basis, freqs) = fourier_design_matrix(psr.toas(), 5, psr.tspan());
        assert_eq!(basis.nrows(), 40);
        assert_eq!(basis.ncols(), 10);
        assert_eq!(freqs.len(), 10);
        assert_relative_eq!(freqs[0], 1.0 / psr.tspan());
        assert_relative_eq!(freqs[9], 5.0 / psr.tspan());
        // Cosine columns start at 1, sine columns at 0 (t = 0).
        assert_relative_eq!(basis[(0, 0)], 0.0);
        assert_relative_eq!(basis[(0, 1)], 1.0);
    }

    #[test]
    fn powerlaw_scales_with_amplitude_and_steepens_with_gamma() {
        let f = 1e-8;
        let df = 1e-9;
        let base = powerlaw(f, -15.0, 4.33, df);
        assert!(base > 0.0);
        // +1 in log10_A multiplies the PSD by 100.
        assert_relative_eq!(powerlaw(f, -14.0, 4.33, df) / base, 100.0, max_relative = 1e-10);
        // Steeper spectra put more power at f < fyr.
        assert!(powerlaw(f, -15.0, 5.0, df) > base);
    }

    #[test]
    fn red_noise_phi_follows_the_powerlaw() {
        let psr = toy();
        let gp = FourierBasisGp::red_noise(
            &psr,
            3,
            None,
            Prior::Uniform { low: -18.0, high: -11.0 },
            Prior::Uniform { low: 0.0, high: 7.0 },
        );
        let mut phi = vec![0.0; gp.phi_len()];
        gp.phi(&[-14.0, 3.0], &mut phi);
        assert_eq!(phi.len(), 6);
        let expect = powerlaw(1.0 / psr.tspan(), -14.0, 3.0, 1.0 / psr.tspan());
        assert_relative_eq!(phi[0], expect, max_relative = 1e-12);
        assert_relative_eq!(phi[0], phi[1], max_relative = 1e-12);
        assert!(phi[2] < phi[0]);
    }

    #[test]
    fn timing_model_normalizes_columns() {
        let psr = toy();
        let n = psr.len();
        let design = Mat::from_fn(n, 2, |i, j| if j == 0 { 1.0 } else { psr.toas()[i] });
        let psr = psr.with_design(design).unwrap();
        let tm = TimingModel::new(&psr).unwrap();
        let basis = tm.basis().unwrap();
        for j in 0..2 {
            let norm: f64 = (0..n).map(|i| basis[(i, j)] * basis[(i, j)]).sum();
            assert_relative_eq!(norm, 1.0, max_relative = 1e-12);
        }
        let mut phi = vec![0.0; 2];
        tm.phi(&[], &mut phi);
        assert_eq!(phi, vec![1e40, 1e40]);
    }

    #[test]
    fn timing_model_requires_a_design() {
        assert!(TimingModel::new(&toy()).is_err());
    }
}
