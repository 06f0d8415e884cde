//! The array-level likelihood engine.
//!
//! A [`Pta`] owns the per-pulsar [`SignalCollection`]s and a deduplicated,
//! first-encounter-ordered registry of free parameters. The registry is
//! fixed at construction and defines the sampler's coordinate space.
//!
//! Per pulsar, with residuals `r`, GP basis `F`, prior covariance `phi` and
//! white-noise covariance `N`, the GP amplitudes are marginalized with the
//! Woodbury identity:
//!
//! ```text
//! Sigma   = phi^-1 + F^T N^-1 F
//! loglike = -1/2 [ r^T N^-1 r - (F^T N^-1 r)^T Sigma^-1 (F^T N^-1 r)
//!                  + ln|N| + ln|phi| + ln|Sigma| ]
//! ```
//!
//! so the factored matrix is sized by the GP basis, never by the number of
//! observations. Pulsars are conditionally independent given the parameter
//! vector, so their terms are summed in parallel.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use faer::Mat;
use rand::Rng;
use rayon::prelude::*;
use thiserror::Error;

use crate::collection::SignalCollection;
use crate::linalg::{cholesky_with_jitter, log_det, NonPositiveDefiniteError};
use crate::math::vector_dot;
use crate::params::Parameter;
use crate::pulsar::ModelError;
use crate::sampler::Posterior;

use faer::linalg::solvers::Solve;

/// Jitter added (relative to the mean diagonal) when a pulsar's `Sigma`
/// factorization fails on the first attempt.
const SIGMA_JITTER: f64 = 1e-9;

/// Errors raised while evaluating the likelihood. All of these are fatal
/// for the call; an out-of-support parameter is *not* an error (it is a
/// `-inf` log-prior handled by the sampler).
#[derive(Error, Debug)]
pub enum LikelihoodError {
    #[error("no value for parameter {0}")]
    MissingParameter(String),
    #[error("parameter vector has {got} entries, model has {expected} free parameters")]
    WrongDimension { expected: usize, got: usize },
    #[error("GP covariance factorization failed for {pulsar}")]
    NonPositiveDefinite {
        pulsar: String,
        #[source]
        source: NonPositiveDefiniteError,
    },
}

/// Where a signal's parameter value comes from: the sampler coordinate
/// vector, or the resolved constants.
#[derive(Debug, Clone, Copy)]
enum ParamSlot {
    Free(usize),
    Const(usize),
}

fn resolve(slots: &[ParamSlot], x: &[f64], consts: &[f64], out: &mut Vec<f64>) {
    out.clear();
    out.extend(slots.iter().map(|s| match s {
        ParamSlot::Free(i) => x[*i],
        ParamSlot::Const(i) => consts[*i],
    }));
}

/// White-noise-dependent inner products, cached between likelihood calls.
/// These carry the per-observation work (`O(n k)`); everything downstream
/// is sized by the basis.
struct WhiteProducts {
    rnr: f64,
    logdet_n: f64,
    fnr: Mat<f64>,
    fnf: Mat<f64>,
}

#[derive(Default)]
struct EvalCache {
    white_key: Vec<f64>,
    white: Option<WhiteProducts>,
    like_key: Vec<f64>,
    loglike: Option<f64>,
}

/// Per-pulsar evaluation state: the construction-time-resolved parameter
/// slots and this pulsar's factorization cache. The cache is keyed by the
/// pulsar's own parameter values only, and is touched by no other pulsar's
/// evaluation.
struct Evaluator {
    signal_slots: Vec<Vec<ParamSlot>>,
    like_slots: Vec<ParamSlot>,
    white_slots: Vec<ParamSlot>,
    cache: Mutex<EvalCache>,
}

impl Evaluator {
    fn loglike(
        &self,
        coll: &SignalCollection,
        x: &[f64],
        consts: &[f64],
    ) -> Result<f64, LikelihoodError> {
        let mut key = Vec::with_capacity(self.like_slots.len());
        resolve(&self.like_slots, x, consts, &mut key);

        let mut cache = self.cache.lock().expect("likelihood cache poisoned");
        if let Some(cached) = cache.loglike {
            if cache.like_key == key {
                return Ok(cached);
            }
        }

        let mut white_key = Vec::with_capacity(self.white_slots.len());
        resolve(&self.white_slots, x, consts, &mut white_key);
        if cache.white.is_none() || cache.white_key != white_key {
            cache.white = Some(self.white_products(coll, x, consts));
            cache.white_key = white_key;
        }
        let wp = cache.white.as_ref().expect("white products just computed");

        let k = coll.nbasis();
        let loglike = if k == 0 {
            -0.5 * (wp.rnr + wp.logdet_n)
        } else {
            let mut phi = vec![0.0; k];
            let mut vals = Vec::new();
            for (i, (sig, slots)) in coll
                .signals()
                .iter()
                .zip(&self.signal_slots)
                .enumerate()
            {
                if sig.basis_cols() > 0 {
                    resolve(slots, x, consts, &mut vals);
                    sig.phi(&vals, &mut phi[coll.col_range(i)]);
                }
            }

            let mut sigma = wp.fnf.clone();
            let mut logdet_phi = 0.0;
            for (j, &p) in phi.iter().enumerate() {
                sigma[(j, j)] += 1.0 / p;
                logdet_phi += p.ln();
            }

            let llt = cholesky_with_jitter(&sigma, SIGMA_JITTER).map_err(|source| {
                LikelihoodError::NonPositiveDefinite {
                    pulsar: coll.pulsar().name().to_string(),
                    source,
                }
            })?;
            let s = llt.solve(wp.fnr.as_ref());
            let dsd = vector_dot(wp.fnr.col_as_slice(0), s.col_as_slice(0));

            -0.5 * (wp.rnr - dsd + wp.logdet_n + logdet_phi + log_det(&llt))
        };

        cache.like_key = key;
        cache.loglike = Some(loglike);
        Ok(loglike)
    }

    fn white_products(&self, coll: &SignalCollection, x: &[f64], consts: &[f64]) -> WhiteProducts {
        let mut white = coll.empty_white();
        let mut vals = Vec::new();
        for (sig, slots) in coll.signals().iter().zip(&self.signal_slots) {
            if sig.contributes_white() {
                resolve(slots, x, consts, &mut vals);
                sig.accumulate_white(&vals, &mut white);
            }
        }
        white.freeze();

        let n = coll.pulsar().len();
        let k = coll.nbasis();
        let r = coll.pulsar().residuals();
        let basis = coll.basis();

        let rnr = white.quadratic(r, r);
        let logdet_n = white.log_det();

        let mut ninv_r = Mat::zeros(n, 1);
        {
            let mut out = vec![0.0; n];
            white.solve_into(r, &mut out);
            for (i, &v) in out.iter().enumerate() {
                ninv_r[(i, 0)] = v;
            }
        }
        let fnr = basis.transpose() * &ninv_r;

        let mut ninv_f = Mat::zeros(n, k);
        let mut col_in = vec![0.0; n];
        let mut col_out = vec![0.0; n];
        for j in 0..k {
            for i in 0..n {
                col_in[i] = basis[(i, j)];
            }
            white.solve_into(&col_in, &mut col_out);
            for i in 0..n {
                ninv_f[(i, j)] = col_out[i];
            }
        }
        let fnf = basis.transpose() * &ninv_f;

        WhiteProducts {
            rnr,
            logdet_n,
            fnr,
            fnf,
        }
    }
}

pub struct Pta {
    collections: Vec<SignalCollection>,
    params: Vec<Arc<Parameter>>,
    constants: Vec<Arc<Parameter>>,
    constant_values: Vec<Option<f64>>,
    evaluators: Vec<Evaluator>,
}

impl Pta {
    pub fn new(collections: Vec<SignalCollection>) -> Result<Self, ModelError> {
        if collections.is_empty() {
            return Err(ModelError::EmptyModel);
        }

        // Global registry: first-encounter order, `Arc` identity decides
        // between intentional sharing and accidental name collision.
        let mut params: Vec<Arc<Parameter>> = Vec::new();
        let mut constants: Vec<Arc<Parameter>> = Vec::new();
        let mut by_name: HashMap<String, Arc<Parameter>> = HashMap::new();
        for coll in &collections {
            for sig in coll.signals() {
                for p in sig.params() {
                    match by_name.get(p.name()) {
                        Some(existing) => {
                            if !Arc::ptr_eq(existing, p) {
                                return Err(ModelError::ParameterCollision(
                                    p.name().to_string(),
                                ));
                            }
                        }
                        None => {
                            by_name.insert(p.name().to_string(), p.clone());
                            if p.is_free() {
                                params.push(p.clone());
                            } else {
                                constants.push(p.clone());
                            }
                        }
                    }
                }
            }
        }

        let mut slot_of: HashMap<&str, ParamSlot> = HashMap::new();
        for (i, p) in params.iter().enumerate() {
            slot_of.insert(p.name(), ParamSlot::Free(i));
        }
        for (i, p) in constants.iter().enumerate() {
            slot_of.insert(p.name(), ParamSlot::Const(i));
        }

        let evaluators = collections
            .iter()
            .map(|coll| {
                let signal_slots: Vec<Vec<ParamSlot>> = coll
                    .signals()
                    .iter()
                    .map(|sig| {
                        sig.params()
                            .iter()
                            .map(|p| slot_of[p.name()])
                            .collect()
                    })
                    .collect();
                let mut like_slots: Vec<ParamSlot> = Vec::new();
                let mut white_slots: Vec<ParamSlot> = Vec::new();
                let mut seen: Vec<&str> = Vec::new();
                let mut seen_white: Vec<&str> = Vec::new();
                for (sig, slots) in coll.signals().iter().zip(&signal_slots) {
                    for (p, &slot) in sig.params().iter().zip(slots) {
                        if !seen.contains(&p.name()) {
                            seen.push(p.name());
                            like_slots.push(slot);
                        }
                        if sig.contributes_white() && !seen_white.contains(&p.name()) {
                            seen_white.push(p.name());
                            white_slots.push(slot);
                        }
                    }
                }
                Evaluator {
                    signal_slots,
                    like_slots,
                    white_slots,
                    cache: Mutex::new(EvalCache::default()),
                }
            })
            .collect();

        let constant_values = constants.iter().map(|p| p.fixed_value()).collect();

        Ok(Pta {
            collections,
            params,
            constants,
            constant_values,
            evaluators,
        })
    }

    /// Resolve Constants that were built without a value from an external
    /// name-to-value mapping (a parsed noise file). Values already fixed at
    /// construction are kept.
    pub fn set_default_params(&mut self, defaults: &HashMap<String, f64>) {
        for (p, v) in self.constants.iter().zip(&mut self.constant_values) {
            if v.is_none() {
                *v = defaults.get(p.name()).copied();
            }
        }
    }

    /// Free parameters, in registry order. This order is stable for the
    /// lifetime of the PTA and defines sampler coordinates.
    pub fn params(&self) -> &[Arc<Parameter>] {
        &self.params
    }

    pub fn param_names(&self) -> Vec<String> {
        self.params.iter().map(|p| p.name().to_string()).collect()
    }

    pub fn ndim(&self) -> usize {
        self.params.len()
    }

    pub fn collections(&self) -> &[SignalCollection] {
        &self.collections
    }

    /// Draw a starting vector from the priors.
    pub fn initial_sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<Vec<f64>, ModelError> {
        self.params.iter().map(|p| p.sample(rng)).collect()
    }

    /// Joint log-likelihood at `x` (free parameters in registry order).
    pub fn get_lnlikelihood(&self, x: &[f64]) -> Result<f64, LikelihoodError> {
        let expected = self.params.len();
        if x.len() < expected {
            return Err(LikelihoodError::MissingParameter(
                self.params[x.len()].name().to_string(),
            ));
        }
        if x.len() > expected {
            return Err(LikelihoodError::WrongDimension {
                expected,
                got: x.len(),
            });
        }
        let consts: Vec<f64> = self
            .constants
            .iter()
            .zip(self.constant_values.iter().copied())
            .map(|(p, v)| {
                v.ok_or_else(|| LikelihoodError::MissingParameter(p.name().to_string()))
            })
            .collect::<Result<_, _>>()?;

        // Parallel per-pulsar terms, sequential sum: the reduction order is
        // fixed so repeated evaluations are bit-identical.
        let terms: Result<Vec<f64>, LikelihoodError> = self
            .collections
            .par_iter()
            .zip(self.evaluators.par_iter())
            .map(|(coll, eval)| eval.loglike(coll, x, &consts))
            .collect();
        Ok(terms?.into_iter().sum())
    }

    /// Joint log-prior at `x`: the sum of per-parameter log densities,
    /// `-inf` as soon as any value is outside its support.
    pub fn get_lnprior(&self, x: &[f64]) -> f64 {
        assert_eq!(x.len(), self.params.len());
        let mut total = 0.0;
        for (p, &v) in self.params.iter().zip(x) {
            let ld = p.log_density(v);
            if ld == f64::NEG_INFINITY {
                return f64::NEG_INFINITY;
            }
            total += ld;
        }
        total
    }
}

impl Posterior for Pta {
    fn dim(&self) -> usize {
        self.ndim()
    }

    fn lnprior(&self, x: &[f64]) -> f64 {
        self.get_lnprior(x)
    }

    fn lnlike(&self, x: &[f64]) -> anyhow::Result<f64> {
        Ok(self.get_lnlikelihood(x)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gp::FourierBasisGp;
    use crate::params::Prior;
    use crate::pulsar::Pulsar;
    use crate::selection::Selection;
    use crate::signal::{MeasurementNoise, Signal};
    use approx::assert_relative_eq;
    use faer::linalg::solvers::Llt;
    use faer::Side;
    use rand::rngs::SmallRng;
    use rand::SeedableRng;

    fn toy_pulsar(name: &str, seed: u64) -> Pulsar {
        let mut rng = SmallRng::seed_from_u64(seed);
        let n = 25;
        let toas: Vec<f64> = (0..n).map(|i| i as f64 * 8.0 * 86400.0).collect();
        let residuals: Vec<f64> = (0..n)
            .map(|_| {
                let z: f64 = rng.sample(rand_distr::StandardNormal);
                1e-6 * z
            })
            .collect();
        Pulsar::new(
            name,
            toas,
            residuals,
            vec![1e-6; n],
            vec!["A".into(); n],
        )
        .unwrap()
    }

    fn toy_pta(name: &str, seed: u64) -> Pta {
        let psr = toy_pulsar(name, seed);
        let sel = Selection::all(&psr);
        let signals: Vec<Box<dyn Signal>> = vec![
            Box::new(MeasurementNoise::new(
                &psr,
                &sel,
                Prior::Uniform { low: 0.1, high: 5.0 },
            )),
            Box::new(FourierBasisGp::red_noise(
                &psr,
                3,
                None,
                Prior::Uniform { low: -18.0, high: -11.0 },
                Prior::Uniform { low: 0.0, high: 7.0 },
            )),
        ];
        Pta::new(vec![SignalCollection::new(psr, signals).unwrap()]).unwrap()
    }

    #[test]
    fn registry_order_is_first_encounter_and_stable() {
        let pta = toy_pta("J0613-0200", 1);
        assert_eq!(
            pta.param_names(),
            vec![
                "J0613-0200_efac",
                "J0613-0200_red_noise_log10_A",
                "J0613-0200_red_noise_gamma",
            ]
        );
    }

    #[test]
    fn woodbury_matches_dense_inversion() {
        let pta = toy_pta("J0613-0200", 2);
        let x = [1.3, -13.0, 3.0];
        let woodbury = pta.get_lnlikelihood(&x).unwrap();

        let coll = &pta.collections()[0];
        let psr = coll.pulsar();
        let n = psr.len();
        let k = coll.nbasis();

        // phi for the GP signal (signal index 1, columns 0..k).
        let mut phi = vec![0.0; k];
        coll.signals()[1].phi(&[x[1], x[2]], &mut phi);

        // Dense C = N + F phi F^T.
        let basis = coll.basis();
        let mut c = Mat::zeros(n, n);
        for i in 0..n {
            for j in 0..n {
                let mut v = 0.0;
                for m in 0..k {
                    v += basis[(i, m)] * phi[m] * basis[(j, m)];
                }
                c[(i, j)] = v;
            }
            let sigma = psr.toaerrs()[i];
            c[(i, i)] += x[0] * x[0] * sigma * sigma;
        }

        let llt = Llt::new(c.as_ref(), Side::Lower).unwrap();
        let mut r = Mat::zeros(n, 1);
        for (i, &v) in psr.residuals().iter().enumerate() {
            r[(i, 0)] = v;
        }
        let cinv_r = llt.solve(r.as_ref());
        let rcr: f64 = (0..n).map(|i| r[(i, 0)] * cinv_r[(i, 0)]).sum();
        let logdet: f64 = 2.0 * (0..n).map(|i| llt.L()[(i, i)].ln()).sum::<f64>();
        let dense = -0.5 * (rcr + logdet);

        assert_relative_eq!(woodbury, dense, max_relative = 1e-6);
    }

    #[test]
    fn lnprior_is_additive_and_minus_inf_outside_support() {
        let pta = toy_pta("J0613-0200", 3);
        let x = [1.3, -13.0, 3.0];
        let expected: f64 = pta
            .params()
            .iter()
            .zip(&x)
            .map(|(p, &v)| p.log_density(v))
            .sum();
        assert_relative_eq!(pta.get_lnprior(&x), expected, max_relative = 1e-12);
        assert_eq!(pta.get_lnprior(&[1.3, -13.0, 9.0]), f64::NEG_INFINITY);
        assert_eq!(pta.get_lnprior(&[0.0, -13.0, 3.0]), f64::NEG_INFINITY);
    }

    #[test]
    fn cache_reuse_never_goes_stale() {
        let pta = toy_pta("J0613-0200", 4);
        let fresh = toy_pta("J0613-0200", 4);
        let x1 = [1.3, -13.0, 3.0];
        let x2 = [1.3, -14.0, 3.0];
        // Warm the cache, move away, come back: every answer must match a
        // cache-cold evaluation.
        let a1 = pta.get_lnlikelihood(&x1).unwrap();
        let a2 = pta.get_lnlikelihood(&x2).unwrap();
        let a3 = pta.get_lnlikelihood(&x1).unwrap();
        assert_eq!(a1, a3);
        assert_eq!(a1, fresh.get_lnlikelihood(&x1).unwrap());
        let fresh2 = toy_pta("J0613-0200", 4);
        assert_eq!(a2, fresh2.get_lnlikelihood(&x2).unwrap());
        assert_ne!(a1, a2);
    }

    #[test]
    fn missing_and_excess_parameters_are_reported() {
        let pta = toy_pta("J0613-0200", 5);
        match pta.get_lnlikelihood(&[1.3]) {
            Err(LikelihoodError::MissingParameter(name)) => {
                assert_eq!(name, "J0613-0200_red_noise_log10_A");
            }
            other => panic!("expected MissingParameter, got {:?}", other.map(|_| ())),
        }
        assert!(matches!(
            pta.get_lnlikelihood(&[1.0, 2.0, 3.0, 4.0]),
            Err(LikelihoodError::WrongDimension { expected: 3, got: 4 })
        ));
    }

    #[test]
    fn unresolved_constant_is_a_missing_parameter() {
        let psr = toy_pulsar("J1909-3744", 6);
        let sel = Selection::all(&psr);
        let signals: Vec<Box<dyn Signal>> = vec![Box::new(MeasurementNoise::new(
            &psr,
            &sel,
            Prior::Constant { value: None },
        ))];
        let mut pta = Pta::new(vec![SignalCollection::new(psr, signals).unwrap()]).unwrap();
        assert_eq!(pta.ndim(), 0);
        assert!(matches!(
            pta.get_lnlikelihood(&[]),
            Err(LikelihoodError::MissingParameter(_))
        ));

        let mut defaults = HashMap::new();
        defaults.insert("J1909-3744_efac".to_string(), 1.1);
        pta.set_default_params(&defaults);
        assert!(pta.get_lnlikelihood(&[]).unwrap().is_finite());
    }

    #[test]
    fn name_collision_between_distinct_parameters_is_rejected() {
        let psr = toy_pulsar("J0030+0451", 7);
        let sel = Selection::all(&psr);
        // Two separately constructed parameter sets with identical names.
        let s1 = MeasurementNoise::new(&psr, &sel, Prior::Uniform { low: 0.1, high: 5.0 });
        let s2 = MeasurementNoise::new(&psr, &sel, Prior::Uniform { low: 0.1, high: 5.0 });
        let signals: Vec<Box<dyn Signal>> = vec![Box::new(s1), Box::new(s2)];
        let coll = SignalCollection::new(psr, signals).unwrap();
        assert!(matches!(
            Pta::new(vec![coll]),
            Err(ModelError::ParameterCollision(_))
        ));
    }
}
