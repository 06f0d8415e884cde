//! Two synthetic pulsars sharing one common-process parameter pair.

use std::collections::HashMap;
use std::sync::Arc;

use faer::Mat;
use pta_rs::{
    FourierBasisGp, LikelihoodError, MeasurementNoise, Parameter, Prior, Pta, Pulsar, Selection,
    Signal, SignalCollection, TimingModel,
};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

fn synth_pulsar(name: &str, seed: u64, n: usize, cadence_days: f64) -> Pulsar {
    let mut rng = SmallRng::seed_from_u64(seed);
    let toas: Vec<f64> = (0..n).map(|i| i as f64 * cadence_days * 86400.0).collect();
    let residuals: Vec<f64> = (0..n)
        .map(|_| {
            let z: f64 = rng.sample(rand_distr::StandardNormal);
            1e-6 * z
        })
        .collect();
    let design = Mat::from_fn(n, 3, |i, j| {
        let t = toas[i] / 1e7;
        match j {
            0 => 1.0,
            1 => t,
            _ => t * t,
        }
    });
    Pulsar::new(name, toas, residuals, vec![1e-6; n], vec!["L".into(); n])
        .unwrap()
        .with_design(design)
        .unwrap()
}

fn collection(
    psr: &Pulsar,
    tspan: f64,
    gw_log10_a: &Arc<Parameter>,
    gw_gamma: &Arc<Parameter>,
) -> SignalCollection {
    let sel = Selection::all(psr);
    let signals: Vec<Box<dyn Signal>> = vec![
        Box::new(MeasurementNoise::new(
            psr,
            &sel,
            Prior::Constant { value: None },
        )),
        Box::new(FourierBasisGp::red_noise(
            psr,
            5,
            Some(tspan),
            Prior::LinearExp {
                low: -18.0,
                high: -11.0,
            },
            Prior::Uniform {
                low: 0.0,
                high: 7.0,
            },
        )),
        Box::new(FourierBasisGp::common(
            psr,
            3,
            tspan,
            gw_log10_a.clone(),
            gw_gamma.clone(),
        )),
        Box::new(TimingModel::new(psr).unwrap()),
    ];
    SignalCollection::new(psr.clone(), signals).unwrap()
}

struct Setup {
    both: Pta,
    one: Pta,
    two: Pta,
}

fn setup() -> Setup {
    let psr1 = synth_pulsar("J1713+0747", 1, 40, 10.0);
    let psr2 = synth_pulsar("J1909-3744", 2, 30, 14.0);
    let tspan = psr1.tspan().max(psr2.tspan());

    // One parameter pair shared by every pulsar's common-process signal.
    let gw_log10_a = Parameter::linear_exp("gw_log10_A", -18.0, -12.0);
    let gw_gamma = Parameter::uniform("gw_gamma", 0.0, 7.0);

    let both = Pta::new(vec![
        collection(&psr1, tspan, &gw_log10_a, &gw_gamma),
        collection(&psr2, tspan, &gw_log10_a, &gw_gamma),
    ])
    .unwrap();
    let one = Pta::new(vec![collection(&psr1, tspan, &gw_log10_a, &gw_gamma)]).unwrap();
    let two = Pta::new(vec![collection(&psr2, tspan, &gw_log10_a, &gw_gamma)]).unwrap();

    let mut setup = Setup { both, one, two };
    let mut defaults = HashMap::new();
    defaults.insert("J1713+0747_efac".to_string(), 1.1);
    defaults.insert("J1909-3744_efac".to_string(), 0.9);
    setup.both.set_default_params(&defaults);
    setup.one.set_default_params(&defaults);
    setup.two.set_default_params(&defaults);
    setup
}

#[test]
fn registry_follows_first_encounter_order_and_excludes_constants() {
    let s = setup();
    assert_eq!(
        s.both.param_names(),
        vec![
            "J1713+0747_red_noise_log10_A",
            "J1713+0747_red_noise_gamma",
            "gw_log10_A",
            "gw_gamma",
            "J1909-3744_red_noise_log10_A",
            "J1909-3744_red_noise_gamma",
        ]
    );
    assert_eq!(s.both.ndim(), 6);
}

#[test]
fn unresolved_efac_constant_fails_with_missing_parameter() {
    let psr1 = synth_pulsar("J1713+0747", 1, 40, 10.0);
    let tspan = psr1.tspan();
    let gw_log10_a = Parameter::linear_exp("gw_log10_A", -18.0, -12.0);
    let gw_gamma = Parameter::uniform("gw_gamma", 0.0, 7.0);
    let pta = Pta::new(vec![collection(&psr1, tspan, &gw_log10_a, &gw_gamma)]).unwrap();
    let x = [-14.0, 3.0, -14.5, 4.33];
    match pta.get_lnlikelihood(&x) {
        Err(LikelihoodError::MissingParameter(name)) => assert_eq!(name, "J1713+0747_efac"),
        other => panic!("expected MissingParameter, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn series_terms_are_conditionally_independent() {
    let s = setup();
    let x_both = [-14.0, 3.0, -14.5, 4.33, -13.5, 2.0];
    let x_one = [-14.0, 3.0, -14.5, 4.33];
    let x_two = [-13.5, 2.0, -14.5, 4.33];
    assert_eq!(
        s.two.param_names(),
        vec![
            "J1909-3744_red_noise_log10_A",
            "J1909-3744_red_noise_gamma",
            "gw_log10_A",
            "gw_gamma",
        ]
    );
    let both = s.both.get_lnlikelihood(&x_both).unwrap();
    let one = s.one.get_lnlikelihood(&x_one).unwrap();
    let two = s.two.get_lnlikelihood(&x_two).unwrap();
    assert_eq!(both, one + two);
}

#[test]
fn shared_parameter_moves_every_series() {
    let s = setup();
    let x1 = [-14.0, 3.0, -14.5, 4.33];
    let x1_shift = [-14.0, 3.0, -13.0, 4.33];
    let one = s.one.get_lnlikelihood(&x1).unwrap();
    let one_shift = s.one.get_lnlikelihood(&x1_shift).unwrap();
    assert_ne!(one, one_shift);

    let x2 = [-13.5, 2.0, -14.5, 4.33];
    let x2_shift = [-13.5, 2.0, -13.0, 4.33];
    let two = s.two.get_lnlikelihood(&x2).unwrap();
    let two_shift = s.two.get_lnlikelihood(&x2_shift).unwrap();
    assert_ne!(two, two_shift);

    // And the joint likelihood moves by exactly the sum of the two shifts.
    let both = s.both.get_lnlikelihood(&[-14.0, 3.0, -14.5, 4.33, -13.5, 2.0]).unwrap();
    let both_shift = s
        .both
        .get_lnlikelihood(&[-14.0, 3.0, -13.0, 4.33, -13.5, 2.0])
        .unwrap();
    assert_eq!(both, one + two);
    assert_eq!(both_shift, one_shift + two_shift);
}

#[test]
fn private_parameter_moves_only_its_own_series() {
    let s = setup();
    let x2 = [-13.5, 2.0, -14.5, 4.33];
    let two = s.two.get_lnlikelihood(&x2).unwrap();

    // Shift pulsar 1's red-noise amplitude in the joint model.
    let base = [-14.0, 3.0, -14.5, 4.33, -13.5, 2.0];
    let shifted = [-12.5, 3.0, -14.5, 4.33, -13.5, 2.0];
    let both = s.both.get_lnlikelihood(&base).unwrap();
    let both_shift = s.both.get_lnlikelihood(&shifted).unwrap();
    assert_ne!(both, both_shift);

    // Pulsar 2's contribution is untouched by pulsar 1's parameter.
    let two_again = s.two.get_lnlikelihood(&x2).unwrap();
    assert_eq!(two, two_again);
    let one_shift = s.one.get_lnlikelihood(&[-12.5, 3.0, -14.5, 4.33]).unwrap();
    assert_eq!(both_shift, one_shift + two);
}

#[test]
fn sharing_requires_the_same_parameter_object() {
    let psr1 = synth_pulsar("J1713+0747", 1, 40, 10.0);
    let psr2 = synth_pulsar("J1909-3744", 2, 30, 14.0);
    let tspan = psr1.tspan().max(psr2.tspan());
    // Accidental collision: same names, separately constructed objects.
    let a1 = Parameter::linear_exp("gw_log10_A", -18.0, -12.0);
    let g1 = Parameter::uniform("gw_gamma", 0.0, 7.0);
    let a2 = Parameter::linear_exp("gw_log10_A", -18.0, -12.0);
    let g2 = Parameter::uniform("gw_gamma", 0.0, 7.0);
    let result = Pta::new(vec![
        collection(&psr1, tspan, &a1, &g1),
        collection(&psr2, tspan, &a2, &g2),
    ]);
    assert!(matches!(
        result,
        Err(pta_rs::ModelError::ParameterCollision(_))
    ));
}
