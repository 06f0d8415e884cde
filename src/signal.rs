//! Additive signal contributions and the white-noise covariance.
//!
//! Every model component is a [`Signal`]: it may contribute columns to the
//! per-pulsar GP basis, the matching diagonal block of the GP prior
//! covariance, and/or a term of the white-noise covariance. Combining
//! signals is additive: bases concatenate, prior blocks stack, white-noise
//! terms accumulate into one [`WhiteNoise`].

use std::sync::Arc;

use faer::MatRef;

use crate::math::{multiply, weighted_dot};
use crate::params::{Parameter, Prior};
use crate::pulsar::Pulsar;
use crate::selection::Selection;

/// One additive contribution to a pulsar's data model.
///
/// `values` slices passed to the evaluation methods hold this signal's
/// parameter values in [`Signal::params`] order; the binding from global
/// sampler coordinates to these slots is resolved once at PTA construction.
pub trait Signal: Send + Sync {
    fn name(&self) -> &str;

    /// Parameters in declaration order.
    fn params(&self) -> &[Arc<Parameter>];

    /// Fixed basis columns contributed to the pulsar's GP basis.
    fn basis(&self) -> Option<MatRef<'_, f64>> {
        None
    }

    fn basis_cols(&self) -> usize {
        self.basis().map_or(0, |b| b.ncols())
    }

    /// Number of prior-covariance entries this signal writes. Must equal
    /// [`Signal::basis_cols`]; checked when the collection is assembled.
    fn phi_len(&self) -> usize {
        self.basis_cols()
    }

    /// Write the prior variance of each basis column into `out`.
    fn phi(&self, values: &[f64], out: &mut [f64]) {
        let _ = values;
        debug_assert!(out.is_empty());
    }

    /// Accumulate this signal's white-noise contribution.
    fn accumulate_white(&self, values: &[f64], white: &mut WhiteNoise) {
        let _ = (values, white);
    }

    /// Whether [`Signal::accumulate_white`] does anything; used to key the
    /// white-noise cache by exactly the parameters that feed it.
    fn contributes_white(&self) -> bool {
        false
    }
}

/// `{pulsar}_{subset}_{quantity}`, with the subset segment omitted for the
/// trivial selection. This convention is shared with external noise files
/// and must not change.
pub(crate) fn param_name(pulsar: &str, subset: &str, quantity: &str) -> String {
    if subset.is_empty() {
        format!("{}_{}", pulsar, quantity)
    } else {
        format!("{}_{}_{}", pulsar, subset, quantity)
    }
}

/// White-noise covariance for one pulsar: a diagonal plus rank-one jitter
/// blocks on disjoint observation groups.
///
/// Signals accumulate into it, then [`WhiteNoise::freeze`] precomputes the
/// inverse diagonal and per-block denominators; solves and determinants use
/// the Sherman-Morrison identity per block, so the matrix is never
/// densified.
pub struct WhiteNoise {
    diag: Vec<f64>,
    inv_diag: Vec<f64>,
    blocks: Vec<JitterBlock>,
    arch: pulp::Arch,
}

struct JitterBlock {
    indices: Vec<usize>,
    jitter: f64,
    /// `1/jitter + sum_i 1/diag_i` over the block, set by `freeze`.
    denom: f64,
}

impl WhiteNoise {
    pub(crate) fn new(nobs: usize) -> Self {
        WhiteNoise {
            diag: vec![0.0; nobs],
            inv_diag: Vec::new(),
            blocks: Vec::new(),
            arch: pulp::Arch::new(),
        }
    }

    /// Add `value[k]` to the variance of each observation in `indices`.
    pub fn add_diag(&mut self, indices: &[usize], values: &[f64]) {
        assert!(indices.len() == values.len());
        for (&i, &v) in indices.iter().zip(values) {
            self.diag[i] += v;
        }
    }

    /// Add a correlated block `jitter * 1 1^T` over `indices`.
    pub fn add_block(&mut self, indices: &[usize], jitter: f64) {
        self.blocks.push(JitterBlock {
            indices: indices.to_vec(),
            jitter,
            denom: 0.0,
        });
    }

    pub fn nobs(&self) -> usize {
        self.diag.len()
    }

    /// Finish accumulation. Must be called before any solve.
    pub(crate) fn freeze(&mut self) {
        self.inv_diag = self.diag.iter().map(|d| d.recip()).collect();
        for b in &mut self.blocks {
            let dsum: f64 = b.indices.iter().map(|&i| self.inv_diag[i]).sum();
            b.denom = b.jitter.recip() + dsum;
        }
    }

    /// `x^T N^-1 y` via Sherman-Morrison over the jitter blocks.
    pub fn quadratic(&self, x: &[f64], y: &[f64]) -> f64 {
        debug_assert_eq!(self.inv_diag.len(), self.diag.len(), "not frozen");
        let base = weighted_dot(x, &self.inv_diag, y);
        let mut corr = 0.0;
        for block in &self.blocks {
            let mut sx = 0.0;
            let mut sy = 0.0;
            for &i in &block.indices {
                sx += x[i] * self.inv_diag[i];
                sy += y[i] * self.inv_diag[i];
            }
            corr += sx * sy / block.denom;
        }
        base - corr
    }

    /// `out = N^-1 x`.
    pub fn solve_into(&self, x: &[f64], out: &mut [f64]) {
        debug_assert_eq!(self.inv_diag.len(), self.diag.len(), "not frozen");
        multiply(x, &self.inv_diag, out);
        for block in &self.blocks {
            let mut s = 0.0;
            for &i in &block.indices {
                s += x[i] * self.inv_diag[i];
            }
            let scale = s / block.denom;
            for &i in &block.indices {
                out[i] -= scale * self.inv_diag[i];
            }
        }
    }

    /// `ln det N`, by the matrix determinant lemma over the jitter blocks:
    /// `1 + jitter * sum(1/d) = jitter * denom`.
    pub fn log_det(&self) -> f64 {
        let base = self
            .arch
            .dispatch(|| self.diag.iter().map(|d| d.ln()).sum::<f64>());
        let corr: f64 = self
            .blocks
            .iter()
            .map(|b| (b.jitter * b.denom).ln())
            .sum();
        base + corr
    }

    /// Dense rendition, for validation against the low-rank path.
    #[cfg(test)]
    pub(crate) fn dense(&self) -> faer::Mat<f64> {
        let n = self.diag.len();
        let mut m = faer::Mat::zeros(n, n);
        for i in 0..n {
            m[(i, i)] = self.diag[i];
        }
        for b in &self.blocks {
            for &i in &b.indices {
                for &j in &b.indices {
                    m[(i, j)] += b.jitter;
                }
            }
        }
        m
    }
}

/// EFAC: scales each observation's measurement variance, per selection
/// subset. Parameters are `{pulsar}_{subset}_efac`.
pub struct MeasurementNoise {
    name: String,
    params: Vec<Arc<Parameter>>,
    groups: Vec<(Vec<usize>, Vec<f64>)>,
}

impl MeasurementNoise {
    pub fn new(psr: &Pulsar, selection: &Selection, efac_prior: Prior) -> Self {
        let mut params = Vec::new();
        let mut groups = Vec::new();
        for g in selection.groups() {
            params.push(Parameter::new(
                param_name(psr.name(), &g.name, "efac"),
                efac_prior.clone(),
            ));
            let sigma2 = g
                .indices
                .iter()
                .map(|&i| psr.toaerrs()[i] * psr.toaerrs()[i])
                .collect();
            groups.push((g.indices.clone(), sigma2));
        }
        MeasurementNoise {
            name: format!("{}_measurement_noise", psr.name()),
            params,
            groups,
        }
    }
}

impl Signal for MeasurementNoise {
    fn name(&self) -> &str {
        &self.name
    }

    fn params(&self) -> &[Arc<Parameter>] {
        &self.params
    }

    fn accumulate_white(&self, values: &[f64], white: &mut WhiteNoise) {
        for ((indices, sigma2), &efac) in self.groups.iter().zip(values) {
            for (&i, &s2) in indices.iter().zip(sigma2) {
                white.diag[i] += efac * efac * s2;
            }
        }
    }

    fn contributes_white(&self) -> bool {
        true
    }
}

/// EQUAD: adds `10^(2 log10_equad)` of variance per observation, per
/// selection subset. Parameters are `{pulsar}_{subset}_log10_equad`.
pub struct EquadNoise {
    name: String,
    params: Vec<Arc<Parameter>>,
    groups: Vec<Vec<usize>>,
}

impl EquadNoise {
    pub fn new(psr: &Pulsar, selection: &Selection, equad_prior: Prior) -> Self {
        let mut params = Vec::new();
        let mut groups = Vec::new();
        for g in selection.groups() {
            params.push(Parameter::new(
                param_name(psr.name(), &g.name, "log10_equad"),
                equad_prior.clone(),
            ));
            groups.push(g.indices.clone());
        }
        EquadNoise {
            name: format!("{}_equad_noise", psr.name()),
            params,
            groups,
        }
    }
}

impl Signal for EquadNoise {
    fn name(&self) -> &str {
        &self.name
    }

    fn params(&self) -> &[Arc<Parameter>] {
        &self.params
    }

    fn accumulate_white(&self, values: &[f64], white: &mut WhiteNoise) {
        for (indices, &log10_equad) in self.groups.iter().zip(values) {
            let var = 10f64.powf(2.0 * log10_equad);
            for &i in indices {
                white.diag[i] += var;
            }
        }
    }

    fn contributes_white(&self) -> bool {
        true
    }
}

/// ECORR: fully correlated jitter within an observing epoch, per selection
/// subset. Parameters are `{pulsar}_{subset}_log10_ecorr`.
///
/// Epochs are derived once at construction: observations of a subset taken
/// within `dt` seconds of each other form one block; blocks need at least
/// two observations to correlate anything.
pub struct EcorrKernelNoise {
    name: String,
    params: Vec<Arc<Parameter>>,
    epochs: Vec<Vec<Vec<usize>>>,
}

impl EcorrKernelNoise {
    pub fn new(psr: &Pulsar, selection: &Selection, ecorr_prior: Prior, dt: f64) -> Self {
        let mut params = Vec::new();
        for g in selection.groups() {
            params.push(Parameter::new(
                param_name(psr.name(), &g.name, "log10_ecorr"),
                ecorr_prior.clone(),
            ));
        }
        EcorrKernelNoise {
            name: format!("{}_ecorr_noise", psr.name()),
            params,
            epochs: selection.epoch_groups(psr, dt, 2),
        }
    }
}

impl Signal for EcorrKernelNoise {
    fn name(&self) -> &str {
        &self.name
    }

    fn params(&self) -> &[Arc<Parameter>] {
        &self.params
    }

    fn accumulate_white(&self, values: &[f64], white: &mut WhiteNoise) {
        for (epochs, &log10_ecorr) in self.epochs.iter().zip(values) {
            let jitter = 10f64.powf(2.0 * log10_ecorr);
            for epoch in epochs {
                white.add_block(epoch, jitter);
            }
        }
    }

    fn contributes_white(&self) -> bool {
        true
    }
}
