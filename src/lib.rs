//! Bayesian search for a stochastic process common to an array of pulsar
//! timing-residual series.
//!
//! The model is assembled from additive per-pulsar [`Signal`]s (white
//! noise, Fourier-basis Gaussian processes, the marginalized timing
//! model); a [`Pta`] marginalizes the GP amplitudes analytically with the
//! Woodbury identity and exposes the joint log-likelihood and log-prior;
//! a [`Sampler`] explores the posterior with adaptive SCAM/AM/DE
//! Metropolis kernels and can resume bit-identically from a persisted
//! [`ChainSnapshot`].

pub(crate) mod collection;
pub(crate) mod gp;
pub(crate) mod linalg;
pub(crate) mod math;
pub(crate) mod params;
pub(crate) mod proposal;
pub(crate) mod pta;
pub(crate) mod pulsar;
pub(crate) mod sampler;
pub(crate) mod selection;
pub(crate) mod signal;
pub(crate) mod storage;

pub use collection::SignalCollection;
pub use gp::{fourier_design_matrix, powerlaw, FourierBasisGp, TimingModel};
pub use linalg::NonPositiveDefiniteError;
pub use params::{Parameter, Prior};
pub use proposal::{JumpGroups, KernelKind, ProposalWeights};
pub use pta::{LikelihoodError, Pta};
pub use pulsar::{ModelError, Pulsar};
pub use sampler::{
    ChainSnapshot, ChainState, Posterior, Sampler, SamplerError, SamplerSettings, StepInfo,
};
pub use selection::{Selection, SelectionGroup};
pub use signal::{EcorrKernelNoise, EquadNoise, MeasurementNoise, Signal, WhiteNoise};
pub use storage::{ChainRecord, ChainRow, ChainStorage, MemoryChain, TextChain};
