use approx::{assert_abs_diff_eq, assert_relative_eq};
use lentil::common::*;
use lentil::simulate::{generate_sparse_latent_data, SimArgs};
use lentil::*;

fn toy_data(rows: usize) -> Mat {
    generate_sparse_latent_data(&SimArgs {
        rows,
        cols: 5,
        latent: 2,
        active: 2,
        noise: 0.1,
        rseed: 3,
        ..SimArgs::default()
    })
    .unwrap()
    .y
}

fn quiet_adam(max_iter: usize) -> Adam {
    Adam::new(AdamOptions {
        max_iter,
        learning_rate: 0.05,
        show_progress: false,
        ..AdamOptions::default()
    })
}

#[test]
fn fitting_a_toy_data_set_improves_the_bound() {
    let options = SsGplvmOptions {
        input_dim: 2,
        num_inducing: 10,
        ..SsGplvmOptions::default()
    };
    let mut model = SsGplvm::new(toy_data(50), &options).unwrap();

    let initial = model.evidence();
    assert!(initial.is_finite());
    assert!(model.kl() >= 0.0);
    assert!(model.evidence() <= model.data_evidence());
    assert_eq!(model.inducing_inputs().shape(), (10, 2));

    model.optimize(&mut quiet_adam(40)).unwrap();

    assert!(model.evidence().is_finite());
    assert!(model.evidence() >= initial - 1e-6);
    assert!(model.kl() >= 0.0);
    assert_relative_eq!(
        model.evidence(),
        model.data_evidence() - model.kl(),
        max_relative = 1e-12
    );
    assert_eq!(model.latent_mean().shape(), (50, 2));
    assert_eq!(model.input_sensitivity().len(), 2);
}

#[test]
fn parameter_vector_round_trips() {
    let mut model = SsGplvm::new(toy_data(20), &SsGplvmOptions::default()).unwrap();
    let theta = model.parameters();
    assert_eq!(theta.len(), model.num_params());
    assert_eq!(model.gradients().len(), theta.len());

    let before = model.evidence();
    model.set_parameters(&theta, SessionState::Idle).unwrap();
    assert_relative_eq!(model.evidence(), before, max_relative = 1e-10);

    let err = model
        .set_parameters(&theta[1..], SessionState::Idle)
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<LentilError>(),
        Some(LentilError::DimensionMismatch { .. })
    ));
}

#[test]
fn grouped_inclusion_probabilities_stay_shared() {
    let options = SsGplvmOptions {
        input_dim: 3,
        num_inducing: 5,
        group_spike: true,
        ..SsGplvmOptions::default()
    };
    let mut model = SsGplvm::new(toy_data(30), &options).unwrap();
    model.optimize(&mut quiet_adam(10)).unwrap();

    let gamma = model.posterior().binary_prob();
    for i in 0..gamma.nrows() {
        assert!(gamma.row(i).iter().all(|&g| g == gamma[(i, 0)]));
    }
    assert!(model.kernel().group_spike());
}

#[test]
fn sensitivity_falls_back_to_inclusion_probabilities() {
    let options = SsGplvmOptions {
        input_dim: 2,
        pi: Some(vec![0.2, 0.7]),
        ..SsGplvmOptions::default()
    };
    let kernel: Box<dyn Kernel> = Box::new(LinearArd::shared(2, 1.0).unwrap());
    let model = SsGplvm::build(
        toy_data(20),
        &options,
        ModelInputs {
            kernel: Some(kernel),
            ..ModelInputs::default()
        },
    )
    .unwrap();
    assert_eq!(model.input_sensitivity(), DVec::from_vec(vec![0.2, 0.7]));

    let ard = SsGplvm::new(toy_data(20), &options).unwrap();
    assert_eq!(ard.input_sensitivity(), ard.kernel().input_sensitivity());
}

#[test]
fn inducing_inputs_must_match_the_latent_space() {
    let options = SsGplvmOptions {
        input_dim: 2,
        ..SsGplvmOptions::default()
    };
    let err = SsGplvm::build(
        toy_data(20),
        &options,
        ModelInputs {
            z: Some(Mat::zeros(4, 3)),
            ..ModelInputs::default()
        },
    )
    .err()
    .unwrap();
    assert!(matches!(
        err.downcast_ref::<LentilError>(),
        Some(LentilError::DimensionMismatch { .. })
    ));
}

#[test]
fn inducing_inputs_are_capped_by_rows() {
    let options = SsGplvmOptions {
        num_inducing: 50,
        ..SsGplvmOptions::default()
    };
    let model = SsGplvm::new(toy_data(8), &options).unwrap();
    assert_eq!(model.inducing_inputs().nrows(), 8);
}

#[test]
fn snapshot_restores_the_same_bound() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("fit.model.json");
    let path = path.to_str().unwrap();

    let options = SsGplvmOptions {
        learn_pi: true,
        ..SsGplvmOptions::default()
    };
    let mut model = SsGplvm::new(toy_data(25), &options).unwrap();
    model.optimize(&mut quiet_adam(5)).unwrap();

    let snapshot = model.snapshot();
    snapshot.save_json(path).unwrap();
    let loaded = ModelSnapshot::load_json(path).unwrap();
    assert_eq!(loaded.kernel, snapshot.kernel);
    assert_eq!(loaded.mean.data.len(), snapshot.mean.data.len());

    let kernel = Box::new(LinearArd::new(DVec::from_element(2, 1.0)).unwrap());
    let restored = SsGplvm::restore(&loaded, kernel, Box::new(VarDtc)).unwrap();

    assert_eq!(restored.rank(), 0);
    assert!(restored.partition().is_none());
    assert_abs_diff_eq!(restored.posterior().mean(), model.posterior().mean(), epsilon = 1e-12);
    assert_abs_diff_eq!(restored.prior().pi(), model.prior().pi(), epsilon = 1e-12);
    assert_relative_eq!(restored.evidence(), model.evidence(), max_relative = 1e-8);
    assert_abs_diff_eq!(restored.kl(), model.kl(), epsilon = 1e-8);
}

#[test]
fn snapshot_rejects_a_different_kernel_layout() {
    let model = SsGplvm::new(toy_data(10), &SsGplvmOptions::default()).unwrap();
    let snapshot = model.snapshot();
    assert_eq!(snapshot.kernel, "linear_ard");

    let kernel = Box::new(LinearArd::shared(2, 1.0).unwrap());
    let err = SsGplvm::restore(&snapshot, kernel, Box::new(VarDtc))
        .err()
        .unwrap();
    assert!(err.to_string().contains("linear_ard kernel, not linear"));
}
