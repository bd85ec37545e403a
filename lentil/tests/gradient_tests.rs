use approx::assert_abs_diff_eq;
use lentil::common::*;
use lentil::*;
use rand::{Rng, SeedableRng};

/// Six rows, two latent dimensions, two inducing inputs
fn small_model(
    group_spike: bool,
    learn_pi: bool,
    ard: bool,
    inference: Box<dyn InferenceMethod>,
) -> SsGplvm {
    let mut rng = rand::rngs::StdRng::seed_from_u64(17);
    let (nn, dd, kk) = (6, 3, 2);
    let y = Mat::from_fn(nn, dd, |_, _| rng.random_range(-1.5..1.5));
    let x = Mat::from_fn(nn, kk, |_, _| rng.random_range(-1.0..1.0));
    let x_variance = Mat::from_fn(nn, kk, |_, _| rng.random_range(0.1..0.6));
    let z = Mat::from_row_slice(2, 2, &[0.8, -0.3, -0.5, 1.1]);

    let kernel: Box<dyn Kernel> = if ard {
        Box::new(LinearArd::new(DVec::from_vec(vec![1.2, 0.6])).unwrap())
    } else {
        Box::new(LinearArd::shared(kk, 0.9).unwrap())
    };

    let options = SsGplvmOptions {
        input_dim: kk,
        group_spike,
        learn_pi,
        pi: Some(vec![0.3, 0.6]),
        slab_variance: 1.3,
        noise_variance: 0.4,
        seed: 5,
        ..SsGplvmOptions::default()
    };

    SsGplvm::build(
        y,
        &options,
        ModelInputs {
            x: Some(x),
            x_variance: Some(x_variance),
            z: Some(z),
            kernel: Some(kernel),
            inference: Some(inference),
            comm: None,
        },
    )
    .unwrap()
}

fn check_against_finite_differences(model: &mut SsGplvm) {
    let theta = model.parameters();
    let analytic = model.gradients();
    assert_eq!(theta.len(), analytic.len());

    let h = 1e-5;
    for j in 0..theta.len() {
        let mut tt = theta.clone();
        tt[j] += h;
        model.set_parameters(&tt, SessionState::Idle).unwrap();
        let up = model.evidence();
        tt[j] -= 2.0 * h;
        model.set_parameters(&tt, SessionState::Idle).unwrap();
        let down = model.evidence();
        let numeric = (up - down) / (2.0 * h);
        assert_abs_diff_eq!(analytic[j], numeric, epsilon = 1e-4 * (1.0 + numeric.abs()));
    }
    model.set_parameters(&theta, SessionState::Idle).unwrap();
}

#[test]
fn full_gradient_matches_finite_differences() {
    let mut model = small_model(false, true, true, Box::new(VarDtc));
    check_against_finite_differences(&mut model);
}

#[test]
fn batched_gradient_matches_finite_differences() {
    let mut model = small_model(false, true, true, Box::new(VarDtcMinibatch::new(4)));
    check_against_finite_differences(&mut model);
}

#[test]
fn grouped_gradient_matches_finite_differences() {
    for inference in [
        Box::new(VarDtc) as Box<dyn InferenceMethod>,
        Box::new(VarDtcMinibatch::new(2)),
    ] {
        let mut model = small_model(true, false, true, inference);
        check_against_finite_differences(&mut model);
    }
}

#[test]
fn shared_variance_gradient_matches_finite_differences() {
    let mut model = small_model(false, false, false, Box::new(VarDtc));
    check_against_finite_differences(&mut model);
}

#[test]
fn batch_size_does_not_change_the_bound() {
    let full = small_model(false, true, true, Box::new(VarDtc));
    for batch_size in [1, 4, 100] {
        let batched = small_model(false, true, true, Box::new(VarDtcMinibatch::new(batch_size)));
        assert_abs_diff_eq!(full.evidence(), batched.evidence(), epsilon = 1e-9);
        assert_abs_diff_eq!(full.kl(), batched.kl(), epsilon = 1e-9);
        for (a, b) in full.gradients().iter().zip(batched.gradients().iter()) {
            assert_abs_diff_eq!(*a, *b, epsilon = 1e-8 * (1.0 + a.abs()));
        }
    }
}
