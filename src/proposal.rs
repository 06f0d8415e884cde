//! Proposal kernels and covariance adaptation for the adaptive sampler.
//!
//! Three symmetric kernels share one adapted covariance:
//!
//! - SCAM perturbs along a single eigenvector of one jump group's
//!   covariance block,
//! - AM draws a full-dimensional step from the adapted Cholesky factor,
//! - DE steps along the difference of two past chain states.
//!
//! Adaptation replaces the covariance with the empirical covariance of the
//! chain since the last update, floored on the diagonal so the Cholesky
//! factorization cannot be defeated by a degenerate history; if it is
//! anyway, the previous covariance is kept and the cycle is skipped.

use std::collections::VecDeque;

use faer::linalg::solvers::Llt;
use faer::{Mat, Side};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::pulsar::ModelError;

/// Scaling of a full-dimensional Gaussian step, from Gelman et al.
const AM_SCALE: f64 = 2.38;

/// Fraction of DE jumps taken at unit scale to hop between modes.
const DE_UNIT_FRACTION: f64 = 0.1;

/// The proposal kernel used for one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelKind {
    Scam,
    Am,
    De,
}

impl KernelKind {
    pub fn index(self) -> usize {
        match self {
            KernelKind::Scam => 0,
            KernelKind::Am => 1,
            KernelKind::De => 2,
        }
    }

    pub fn id(self) -> u8 {
        self.index() as u8
    }

    pub fn label(self) -> &'static str {
        match self {
            KernelKind::Scam => "scam",
            KernelKind::Am => "am",
            KernelKind::De => "de",
        }
    }
}

/// Relative selection weights of the three kernels.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ProposalWeights {
    pub scam: f64,
    pub am: f64,
    pub de: f64,
}

impl Default for ProposalWeights {
    fn default() -> Self {
        ProposalWeights {
            scam: 30.0,
            am: 15.0,
            de: 50.0,
        }
    }
}

impl ProposalWeights {
    /// Pick a kernel. DE is excluded until the chain history can supply a
    /// pair of distinct states.
    pub(crate) fn choose<R: Rng + ?Sized>(&self, rng: &mut R, de_ready: bool) -> KernelKind {
        let de = if de_ready { self.de } else { 0.0 };
        let total = self.scam + self.am + de;
        let u: f64 = rng.random::<f64>() * total;
        if u < self.scam {
            KernelKind::Scam
        } else if u < self.scam + self.am {
            KernelKind::Am
        } else {
            KernelKind::De
        }
    }
}

/// A static, externally declared set of correlated parameter-index blocks.
/// SCAM concentrates its proposal mass on one block at a time; a group
/// spanning all indices is usually included alongside the small ones.
#[derive(Debug, Clone)]
pub struct JumpGroups {
    groups: Vec<Vec<usize>>,
    ndim: usize,
}

impl JumpGroups {
    pub fn new(ndim: usize, groups: Vec<Vec<usize>>) -> Result<Self, ModelError> {
        if groups.is_empty() {
            return Err(ModelError::InvalidJumpGroup("no groups declared".into()));
        }
        for g in &groups {
            if g.is_empty() {
                return Err(ModelError::InvalidJumpGroup("empty group".into()));
            }
            let mut seen = vec![false; ndim];
            for &i in g {
                if i >= ndim {
                    return Err(ModelError::InvalidJumpGroup(format!(
                        "index {} out of range for {} dimensions",
                        i, ndim
                    )));
                }
                if seen[i] {
                    return Err(ModelError::InvalidJumpGroup(format!(
                        "index {} repeated within a group",
                        i
                    )));
                }
                seen[i] = true;
            }
        }
        Ok(JumpGroups { groups, ndim })
    }

    /// A single group spanning every dimension.
    pub fn full(ndim: usize) -> Self {
        JumpGroups {
            groups: vec![(0..ndim).collect()],
            ndim,
        }
    }

    /// The given blocks plus one group spanning every dimension.
    pub fn with_full(ndim: usize, mut groups: Vec<Vec<usize>>) -> Result<Self, ModelError> {
        groups.push((0..ndim).collect());
        Self::new(ndim, groups)
    }

    pub fn ndim(&self) -> usize {
        self.ndim
    }

    pub fn groups(&self) -> &[Vec<usize>] {
        &self.groups
    }

    fn choose<R: Rng + ?Sized>(&self, rng: &mut R) -> usize {
        rng.random_range(0..self.groups.len())
    }
}

/// Principal axes of one jump group's covariance block.
struct GroupAxes {
    vecs: Mat<f64>,
    scales: Vec<f64>,
}

/// The adapted proposal covariance and everything derived from it.
///
/// Invariant: `cov` always admits a Cholesky factorization; a candidate
/// that does not is rejected by [`AdaptiveProposal::adapt`] and the
/// previous covariance kept.
pub(crate) struct AdaptiveProposal {
    ndim: usize,
    groups: JumpGroups,
    cov: Mat<f64>,
    chol: Mat<f64>,
    group_axes: Vec<GroupAxes>,
    floor: f64,
}

impl AdaptiveProposal {
    pub(crate) fn new(groups: JumpGroups, initial_sigma: f64, floor: f64) -> Self {
        let ndim = groups.ndim();
        let var = initial_sigma * initial_sigma;
        let cov = Mat::from_fn(ndim, ndim, |i, j| if i == j { var } else { 0.0 });
        let mut proposal = AdaptiveProposal {
            ndim,
            groups,
            cov: cov.clone(),
            chol: Mat::zeros(ndim, ndim),
            group_axes: Vec::new(),
            floor,
        };
        let ok = proposal.set_covariance(cov);
        debug_assert!(ok, "diagonal initial covariance must factorize");
        proposal
    }

    pub(crate) fn cov(&self) -> &Mat<f64> {
        &self.cov
    }

    /// Install a covariance, refreshing the Cholesky factor and the
    /// per-group principal axes. Returns false (leaving the previous state
    /// untouched) if the matrix does not factorize.
    pub(crate) fn set_covariance(&mut self, cov: Mat<f64>) -> bool {
        let Ok(llt) = Llt::new(cov.as_ref(), Side::Lower) else {
            return false;
        };
        let mut axes = Vec::with_capacity(self.groups.groups().len());
        for g in self.groups.groups() {
            let sub = Mat::from_fn(g.len(), g.len(), |i, j| cov[(g[i], g[j])]);
            let Ok(eig) = sub.self_adjoint_eigen(Side::Lower) else {
                return false;
            };
            let vals = eig.S().column_vector().to_owned();
            let scales: Vec<f64> = vals.iter().map(|&v| v.max(self.floor).sqrt()).collect();
            axes.push(GroupAxes {
                vecs: eig.U().to_owned(),
                scales,
            });
        }
        self.chol = llt.L().to_owned();
        self.cov = cov;
        self.group_axes = axes;
        true
    }

    /// Replace the covariance with the empirical covariance of `samples`,
    /// floored on the diagonal. One inflation retry on factorization
    /// failure; persistent failure keeps the previous covariance and
    /// reports false.
    pub(crate) fn adapt(&mut self, samples: &[Vec<f64>]) -> bool {
        if samples.len() < 2 {
            return false;
        }
        let n = samples.len() as f64;
        let d = self.ndim;
        let mut mean = vec![0.0; d];
        for s in samples {
            for (m, &v) in mean.iter_mut().zip(s) {
                *m += v;
            }
        }
        for m in &mut mean {
            *m /= n;
        }
        let mut cov = Mat::zeros(d, d);
        for s in samples {
            for i in 0..d {
                let di = s[i] - mean[i];
                for j in 0..=i {
                    cov[(i, j)] += di * (s[j] - mean[j]);
                }
            }
        }
        for i in 0..d {
            for j in 0..=i {
                let v = cov[(i, j)] / (n - 1.0);
                cov[(i, j)] = v;
                cov[(j, i)] = v;
            }
            cov[(i, i)] += self.floor;
        }

        if self.set_covariance(cov.clone()) {
            return true;
        }
        // Inflate the diagonal once and retry.
        let mean_diag = (0..d).map(|i| cov[(i, i)].abs()).sum::<f64>() / d as f64;
        let bump = 1e-6 * mean_diag.max(self.floor);
        for i in 0..d {
            cov[(i, i)] += bump;
        }
        self.set_covariance(cov)
    }

    /// SCAM: one step along a random principal axis of a random jump group.
    pub(crate) fn propose_scam<R: Rng + ?Sized>(&self, rng: &mut R, x: &mut [f64]) {
        let gi = self.groups.choose(rng);
        let group = &self.groups.groups()[gi];
        let axes = &self.group_axes[gi];
        let axis = rng.random_range(0..group.len());
        let z: f64 = rng.sample(rand_distr::StandardNormal);
        let step = AM_SCALE * axes.scales[axis] * z;
        for (row, &idx) in group.iter().enumerate() {
            x[idx] += step * axes.vecs[(row, axis)];
        }
    }

    /// AM: a full-dimensional draw from the adapted covariance.
    pub(crate) fn propose_am<R: Rng + ?Sized>(&self, rng: &mut R, x: &mut [f64]) {
        let scale = AM_SCALE / (self.ndim as f64).sqrt();
        let z: Vec<f64> = (0..self.ndim)
            .map(|_| rng.sample(rand_distr::StandardNormal))
            .collect();
        for i in 0..self.ndim {
            let mut step = 0.0;
            for (j, &zj) in z.iter().enumerate().take(i + 1) {
                step += self.chol[(i, j)] * zj;
            }
            x[i] += scale * step;
        }
    }

    /// DE: step along the difference of two distinct history states.
    pub(crate) fn propose_de<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        history: &HistoryBuffer,
        x: &mut [f64],
    ) {
        let (a, b) = history.pair(rng).expect("DE chosen with insufficient history");
        let gamma = if rng.random::<f64>() < DE_UNIT_FRACTION {
            1.0
        } else {
            AM_SCALE / (2.0 * self.ndim as f64).sqrt()
        };
        for (xi, (&ai, &bi)) in x.iter_mut().zip(a.iter().zip(b)) {
            *xi += gamma * (ai - bi);
        }
    }
}

/// Fixed-capacity ring buffer of past chain states feeding DE proposals.
pub(crate) struct HistoryBuffer {
    buf: VecDeque<Vec<f64>>,
    cap: usize,
}

impl HistoryBuffer {
    pub(crate) fn new(cap: usize) -> Self {
        HistoryBuffer {
            buf: VecDeque::with_capacity(cap.min(1024)),
            cap,
        }
    }

    pub(crate) fn push(&mut self, x: Vec<f64>) {
        if self.buf.len() == self.cap {
            self.buf.pop_front();
        }
        self.buf.push_back(x);
    }

    pub(crate) fn len(&self) -> usize {
        self.buf.len()
    }

    pub(crate) fn is_ready(&self) -> bool {
        self.buf.len() >= 2
    }

    /// Two distinct entries, uniformly chosen.
    pub(crate) fn pair<R: Rng + ?Sized>(&self, rng: &mut R) -> Option<(&[f64], &[f64])> {
        if !self.is_ready() {
            return None;
        }
        let i = rng.random_range(0..self.len());
        let mut j = rng.random_range(0..self.len() - 1);
        if j >= i {
            j += 1;
        }
        Some((&self.buf[i], &self.buf[j]))
    }

    pub(crate) fn to_vec(&self) -> Vec<Vec<f64>> {
        self.buf.iter().cloned().collect()
    }

    pub(crate) fn restore(cap: usize, entries: Vec<Vec<f64>>) -> Self {
        let mut buf = HistoryBuffer::new(cap);
        for e in entries {
            buf.push(e);
        }
        buf
    }
}
