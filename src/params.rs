//! Model parameters and their prior distributions.
//!
//! A [`Parameter`] is a named random variable. Parameters are created once at
//! model-build time and shared by reference (`Arc`) wherever two signals must
//! see the same sampled value; the PTA registry treats "same `Arc`" as
//! intentional sharing and "same name, different object" as a collision.

use std::sync::Arc;

use rand::Rng;

use crate::pulsar::ModelError;

const LN10: f64 = std::f64::consts::LN_10;

/// Prior distribution of a parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum Prior {
    /// Flat density on `[low, high]`.
    Uniform { low: f64, high: f64 },
    /// Density proportional to `10^x` on `[low, high]`: the parameter is
    /// sampled in log10 space while the prior is uniform on the linear
    /// quantity.
    LinearExp { low: f64, high: f64 },
    /// Fixed value, never part of the sampler coordinates. A `None` value
    /// must be resolved from the default parameter map before the first
    /// likelihood evaluation.
    Constant { value: Option<f64> },
}

/// A named random variable with a prior.
#[derive(Debug)]
pub struct Parameter {
    name: String,
    prior: Prior,
}

impl Parameter {
    pub fn new(name: impl Into<String>, prior: Prior) -> Arc<Self> {
        Arc::new(Parameter {
            name: name.into(),
            prior,
        })
    }

    pub fn uniform(name: impl Into<String>, low: f64, high: f64) -> Arc<Self> {
        Self::new(name, Prior::Uniform { low, high })
    }

    pub fn linear_exp(name: impl Into<String>, low: f64, high: f64) -> Arc<Self> {
        Self::new(name, Prior::LinearExp { low, high })
    }

    /// A constant whose value is injected later from the default parameter map.
    pub fn constant(name: impl Into<String>) -> Arc<Self> {
        Self::new(name, Prior::Constant { value: None })
    }

    pub fn constant_fixed(name: impl Into<String>, value: f64) -> Arc<Self> {
        Self::new(name, Prior::Constant { value: Some(value) })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn prior(&self) -> &Prior {
        &self.prior
    }

    /// Whether this parameter appears in the sampler's coordinate space.
    pub fn is_free(&self) -> bool {
        !matches!(self.prior, Prior::Constant { .. })
    }

    pub fn fixed_value(&self) -> Option<f64> {
        match self.prior {
            Prior::Constant { value } => value,
            _ => None,
        }
    }

    /// Draw a value from the prior. Constants have no sampling support.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<f64, ModelError> {
        match self.prior {
            Prior::Uniform { low, high } => {
                let u: f64 = rng.random();
                Ok(low + u * (high - low))
            }
            Prior::LinearExp { low, high } => {
                // Inverse CDF of the uniform-in-linear-space density.
                let u: f64 = rng.random();
                let lo = 10f64.powf(low);
                let hi = 10f64.powf(high);
                Ok((lo + u * (hi - lo)).log10())
            }
            Prior::Constant { .. } => Err(ModelError::Unsampleable(self.name.clone())),
        }
    }

    /// Log prior density at `x`, `-inf` outside the support.
    ///
    /// Constants return 0: they never enter the prior sum.
    pub fn log_density(&self, x: f64) -> f64 {
        match self.prior {
            Prior::Uniform { low, high } => {
                if x < low || x > high {
                    f64::NEG_INFINITY
                } else {
                    -(high - low).ln()
                }
            }
            Prior::LinearExp { low, high } => {
                if x < low || x > high {
                    f64::NEG_INFINITY
                } else {
                    LN10.ln() + x * LN10 - (10f64.powf(high) - 10f64.powf(low)).ln()
                }
            }
            Prior::Constant { .. } => 0.0,
        }
    }
}
