//! Adaptive multi-kernel Metropolis sampler.
//!
//! A single chain evolves strictly sequentially: each step proposes from
//! one of the SCAM/AM/DE kernels, evaluates the prior first (an
//! out-of-support proposal is rejected without touching the likelihood),
//! and applies the Metropolis rule. All kernels are symmetric, so no
//! Hastings correction appears.
//!
//! The chain RNG is a `ChaCha8Rng` whose stream position is recorded in
//! every [`ChainSnapshot`]; resuming from a snapshot reproduces the exact
//! proposal sequence an uninterrupted run would have produced.

use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

use anyhow::Context;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::proposal::{AdaptiveProposal, HistoryBuffer, JumpGroups, KernelKind, ProposalWeights};
use crate::storage::{ChainRecord, ChainStorage};

/// The two callables the sampler needs from a model.
pub trait Posterior: Send + Sync {
    fn dim(&self) -> usize;

    /// Log prior density; `-inf` outside the support (not an error).
    fn lnprior(&self, x: &[f64]) -> f64;

    /// Log likelihood. Only called where the prior is finite.
    fn lnlike(&self, x: &[f64]) -> anyhow::Result<f64>;
}

#[derive(Error, Debug)]
pub enum SamplerError {
    #[error("sampler has not been initialized with a starting point")]
    NotInitialized,
    #[error("starting point has non-finite posterior (lnlike {lnlike}, lnprior {lnprior})")]
    InvalidStartPoint { lnlike: f64, lnprior: f64 },
    #[error("jump groups are declared over {groups} dimensions, posterior has {posterior}")]
    DimensionMismatch { groups: usize, posterior: usize },
    #[error("SCAM and AM weights are both zero; no kernel can run before history exists")]
    NoUsableKernel,
    #[error("snapshot does not fit this model: {0}")]
    BadSnapshot(String),
    #[error("likelihood evaluation failed")]
    Likelihood(#[source] anyhow::Error),
    #[error("chain storage failed")]
    Storage(#[source] anyhow::Error),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SamplerSettings {
    pub seed: u64,
    /// Recompute the proposal covariance every this many steps.
    pub adapt_every: u64,
    /// Steps before the DE history starts collecting.
    pub burn_in: u64,
    /// Capacity of the DE history ring buffer.
    pub history_size: usize,
    /// Record every `history_thin`-th post-burn-in state in the history.
    pub history_thin: u64,
    pub weights: ProposalWeights,
    /// Standard deviation of the initial (diagonal) proposal covariance.
    pub initial_sigma: f64,
    /// Diagonal floor applied to every adapted covariance.
    pub adapt_floor: f64,
}

impl Default for SamplerSettings {
    fn default() -> Self {
        SamplerSettings {
            seed: 0,
            adapt_every: 1000,
            burn_in: 1000,
            history_size: 1000,
            history_thin: 10,
            weights: ProposalWeights::default(),
            initial_sigma: 0.1,
            adapt_floor: 1e-10,
        }
    }
}

/// Everything that changes as the chain advances.
#[derive(Debug, Clone)]
pub struct ChainState {
    pub position: Vec<f64>,
    pub lnlike: f64,
    pub lnprior: f64,
    pub iteration: u64,
    /// Per-kernel acceptance counters, indexed by [`KernelKind::index`].
    pub accepted: [u64; 3],
    pub proposed: [u64; 3],
}

impl ChainState {
    pub fn acceptance_rate(&self) -> f64 {
        let proposed: u64 = self.proposed.iter().sum();
        if proposed == 0 {
            return 0.0;
        }
        self.accepted.iter().sum::<u64>() as f64 / proposed as f64
    }
}

/// Per-step report, in the spirit of a progress line.
#[derive(Debug, Clone, Copy)]
pub struct StepInfo {
    pub iteration: u64,
    pub kernel: KernelKind,
    pub accepted: bool,
    pub lnlike: f64,
    pub lnprior: f64,
    pub acceptance_rate: f64,
}

/// A durable image of the chain, sufficient to continue the run with a
/// bit-identical proposal sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainSnapshot {
    pub ndim: usize,
    pub position: Vec<f64>,
    pub lnlike: f64,
    pub lnprior: f64,
    pub iteration: u64,
    pub accepted: [u64; 3],
    pub proposed: [u64; 3],
    /// Adapted proposal covariance, row-major.
    pub cov: Vec<f64>,
    pub history: Vec<Vec<f64>>,
    pub adapt_buffer: Vec<Vec<f64>>,
    pub seed: u64,
    /// ChaCha word position, split into (high, low) halves.
    pub rng_word_pos: (u64, u64),
}

impl ChainSnapshot {
    pub fn save(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let path = path.as_ref();
        let file = File::create(path)
            .with_context(|| format!("creating snapshot file {}", path.display()))?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer(&mut writer, self).context("serializing snapshot")?;
        writer.flush().context("flushing snapshot")?;
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)
            .with_context(|| format!("opening snapshot file {}", path.display()))?;
        serde_json::from_reader(BufReader::new(file)).context("deserializing snapshot")
    }
}

pub struct Sampler<P: Posterior> {
    posterior: P,
    settings: SamplerSettings,
    proposal: AdaptiveProposal,
    history: HistoryBuffer,
    adapt_buffer: Vec<Vec<f64>>,
    rng: ChaCha8Rng,
    state: Option<ChainState>,
    scratch: Vec<f64>,
}

impl<P: Posterior> Sampler<P> {
    pub fn new(
        posterior: P,
        groups: JumpGroups,
        settings: SamplerSettings,
    ) -> Result<Self, SamplerError> {
        if groups.ndim() != posterior.dim() {
            return Err(SamplerError::DimensionMismatch {
                groups: groups.ndim(),
                posterior: posterior.dim(),
            });
        }
        if settings.weights.scam + settings.weights.am <= 0.0 {
            return Err(SamplerError::NoUsableKernel);
        }
        let proposal = AdaptiveProposal::new(groups, settings.initial_sigma, settings.adapt_floor);
        Ok(Sampler {
            posterior,
            settings,
            proposal,
            history: HistoryBuffer::new(settings.history_size),
            adapt_buffer: Vec::new(),
            rng: ChaCha8Rng::seed_from_u64(settings.seed),
            state: None,
            scratch: Vec::new(),
        })
    }

    /// Move from `initializing` to `sampling` by installing a starting
    /// vector with finite log-likelihood and log-prior.
    pub fn initialize(&mut self, x0: &[f64]) -> Result<(), SamplerError> {
        let lnprior = self.posterior.lnprior(x0);
        if !lnprior.is_finite() {
            return Err(SamplerError::InvalidStartPoint {
                lnlike: f64::NAN,
                lnprior,
            });
        }
        let lnlike = self
            .posterior
            .lnlike(x0)
            .map_err(SamplerError::Likelihood)?;
        if !lnlike.is_finite() {
            return Err(SamplerError::InvalidStartPoint { lnlike, lnprior });
        }
        self.state = Some(ChainState {
            position: x0.to_vec(),
            lnlike,
            lnprior,
            iteration: 0,
            accepted: [0; 3],
            proposed: [0; 3],
        });
        Ok(())
    }

    pub fn state(&self) -> Option<&ChainState> {
        self.state.as_ref()
    }

    pub fn posterior(&self) -> &P {
        &self.posterior
    }

    /// Advance the chain by one step.
    pub fn step(&mut self) -> Result<StepInfo, SamplerError> {
        let (lnlike_cur, lnprior_cur) = match &self.state {
            Some(s) => {
                self.scratch.clear();
                self.scratch.extend_from_slice(&s.position);
                (s.lnlike, s.lnprior)
            }
            None => return Err(SamplerError::NotInitialized),
        };

        let kernel = self
            .settings
            .weights
            .choose(&mut self.rng, self.history.is_ready());
        match kernel {
            KernelKind::Scam => self.proposal.propose_scam(&mut self.rng, &mut self.scratch),
            KernelKind::Am => self.proposal.propose_am(&mut self.rng, &mut self.scratch),
            KernelKind::De => {
                self.proposal
                    .propose_de(&mut self.rng, &self.history, &mut self.scratch)
            }
        }

        let lnprior_new = self.posterior.lnprior(&self.scratch);
        let (accepted, lnlike_new) = if lnprior_new == f64::NEG_INFINITY {
            // Outside the support: rejected without a likelihood call.
            (false, f64::NEG_INFINITY)
        } else {
            let lnlike_new = self
                .posterior
                .lnlike(&self.scratch)
                .map_err(SamplerError::Likelihood)?;
            let log_ratio = (lnlike_new + lnprior_new) - (lnlike_cur + lnprior_cur);
            let u: f64 = self.rng.random();
            (u.ln() < log_ratio, lnlike_new)
        };

        let state = self.state.as_mut().expect("state checked above");
        state.proposed[kernel.index()] += 1;
        if accepted {
            state.position.copy_from_slice(&self.scratch);
            state.lnlike = lnlike_new;
            state.lnprior = lnprior_new;
            state.accepted[kernel.index()] += 1;
        }
        state.iteration += 1;
        let info = StepInfo {
            iteration: state.iteration,
            kernel,
            accepted,
            lnlike: state.lnlike,
            lnprior: state.lnprior,
            acceptance_rate: state.acceptance_rate(),
        };

        self.adapt_buffer.push(state.position.clone());
        let iteration = state.iteration;
        if iteration % self.settings.adapt_every == 0 {
            // A degenerate window is non-fatal: the previous covariance
            // stays in place and this cycle is skipped.
            self.proposal.adapt(&self.adapt_buffer);
            self.adapt_buffer.clear();
        }
        if iteration > self.settings.burn_in && iteration % self.settings.history_thin == 0 {
            let state = self.state.as_ref().expect("state checked above");
            self.history.push(state.position.clone());
        }

        Ok(info)
    }

    /// Run `nsteps` steps, appending every state to `storage`.
    pub fn run<S: ChainStorage>(
        &mut self,
        nsteps: u64,
        storage: &mut S,
    ) -> Result<(), SamplerError> {
        for _ in 0..nsteps {
            let info = self.step()?;
            let state = self.state.as_ref().expect("state after step");
            storage
                .append(&ChainRecord {
                    position: &state.position,
                    lnlike: state.lnlike,
                    lnprior: state.lnprior,
                    kernel: info.kernel,
                    accepted: info.accepted,
                })
                .map_err(SamplerError::Storage)?;
        }
        storage.flush().map_err(SamplerError::Storage)?;
        Ok(())
    }

    /// Capture the chain for later resumption.
    pub fn snapshot(&self) -> Result<ChainSnapshot, SamplerError> {
        let state = self.state.as_ref().ok_or(SamplerError::NotInitialized)?;
        let ndim = self.posterior.dim();
        let cov = self.proposal.cov();
        let mut flat = Vec::with_capacity(ndim * ndim);
        for i in 0..ndim {
            for j in 0..ndim {
                flat.push(cov[(i, j)]);
            }
        }
        let pos = self.rng.get_word_pos();
        Ok(ChainSnapshot {
            ndim,
            position: state.position.clone(),
            lnlike: state.lnlike,
            lnprior: state.lnprior,
            iteration: state.iteration,
            accepted: state.accepted,
            proposed: state.proposed,
            cov: flat,
            history: self.history.to_vec(),
            adapt_buffer: self.adapt_buffer.clone(),
            seed: self.settings.seed,
            rng_word_pos: ((pos >> 64) as u64, pos as u64),
        })
    }

    /// Rebuild a sampler mid-run from a snapshot. With the same posterior,
    /// groups and settings, the continued chain is bit-identical to the
    /// uninterrupted one.
    pub fn resume(
        posterior: P,
        groups: JumpGroups,
        settings: SamplerSettings,
        snapshot: &ChainSnapshot,
    ) -> Result<Self, SamplerError> {
        if snapshot.ndim != posterior.dim() || snapshot.position.len() != snapshot.ndim {
            return Err(SamplerError::BadSnapshot(format!(
                "snapshot has {} dimensions, posterior has {}",
                snapshot.ndim,
                posterior.dim()
            )));
        }
        if snapshot.cov.len() != snapshot.ndim * snapshot.ndim {
            return Err(SamplerError::BadSnapshot(
                "covariance length does not match dimension".into(),
            ));
        }
        let mut settings = settings;
        settings.seed = snapshot.seed;
        let mut sampler = Sampler::new(posterior, groups, settings)?;

        let ndim = snapshot.ndim;
        let cov = faer::Mat::from_fn(ndim, ndim, |i, j| snapshot.cov[i * ndim + j]);
        if !sampler.proposal.set_covariance(cov) {
            return Err(SamplerError::BadSnapshot(
                "snapshot covariance does not factorize".into(),
            ));
        }
        sampler.history = HistoryBuffer::restore(settings.history_size, snapshot.history.clone());
        sampler.adapt_buffer = snapshot.adapt_buffer.clone();
        let word_pos =
            ((snapshot.rng_word_pos.0 as u128) << 64) | snapshot.rng_word_pos.1 as u128;
        sampler.rng = ChaCha8Rng::seed_from_u64(snapshot.seed);
        sampler.rng.set_word_pos(word_pos);
        sampler.state = Some(ChainState {
            position: snapshot.position.clone(),
            lnlike: snapshot.lnlike,
            lnprior: snapshot.lnprior,
            iteration: snapshot.iteration,
            accepted: snapshot.accepted,
            proposed: snapshot.proposed,
        });
        Ok(sampler)
    }
}
