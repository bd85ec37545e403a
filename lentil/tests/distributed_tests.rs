use approx::assert_relative_eq;
use lentil::common::*;
use lentil::simulate::{generate_sparse_latent_data, SimArgs};
use lentil::*;

fn toy_data() -> Mat {
    generate_sparse_latent_data(&SimArgs {
        rows: 40,
        cols: 4,
        latent: 2,
        active: 2,
        noise: 0.1,
        rseed: 11,
        ..SimArgs::default()
    })
    .unwrap()
    .y
}

fn options() -> SsGplvmOptions {
    options_with_seed(42)
}

fn options_with_seed(seed: u64) -> SsGplvmOptions {
    SsGplvmOptions {
        input_dim: 2,
        num_inducing: 2,
        batch_size: 5,
        seed,
        ..SsGplvmOptions::default()
    }
}

struct WorkerResult {
    rank: usize,
    rows: (usize, usize),
    theta: Vec<f64>,
    z: Mat,
    evidence: f64,
}

fn fit_in_group(size: usize, max_iter: usize) -> Vec<WorkerResult> {
    fit_with_seeds(&vec![42; size], max_iter)
}

/// One worker per entry of `seeds`; worker `r` initialises with `seeds[r]`
fn fit_with_seeds(seeds: &[u64], max_iter: usize) -> Vec<WorkerResult> {
    let y = toy_data();
    let comms = LocalComm::group(seeds.len());

    let mut results: Vec<WorkerResult> = std::thread::scope(|s| {
        let handles: Vec<_> = comms
            .into_iter()
            .zip(seeds.iter().copied())
            .map(|(comm, seed)| {
                let y = y.clone();
                s.spawn(move || {
                    let mut model = SsGplvm::build(
                        y,
                        &options_with_seed(seed),
                        ModelInputs {
                            comm: Some(Box::new(comm)),
                            ..ModelInputs::default()
                        },
                    )
                    .unwrap();
                    let mut adam = Adam::new(AdamOptions {
                        max_iter,
                        show_progress: false,
                        ..AdamOptions::default()
                    });
                    model.optimize(&mut adam).unwrap();
                    let part = model.partition().unwrap();
                    WorkerResult {
                        rank: model.rank(),
                        rows: (part.start, part.end),
                        theta: model.parameters(),
                        z: model.inducing_inputs().clone(),
                        evidence: model.evidence(),
                    }
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    results.sort_by_key(|r| r.rank);
    results
}

#[test]
fn workers_end_with_identical_models() {
    let results = fit_in_group(3, 15);
    assert_eq!(results.len(), 3);

    let root = &results[0];
    assert!(root.evidence.is_finite());
    for other in &results[1..] {
        assert_eq!(other.theta, root.theta);
        assert_eq!(other.evidence.to_bits(), root.evidence.to_bits());
    }

    let rows: Vec<(usize, usize)> = results.iter().map(|r| r.rows).collect();
    assert_eq!(rows, vec![(0, 14), (14, 27), (27, 40)]);
}

#[test]
fn distributed_bound_matches_a_single_process() {
    let results = fit_in_group(3, 5);
    let root = &results[0];

    let mut single = SsGplvm::new(toy_data(), &options()).unwrap();
    single
        .set_parameters(&root.theta, SessionState::Idle)
        .unwrap();
    assert_relative_eq!(single.evidence(), root.evidence, max_relative = 1e-8);
}

#[test]
fn a_group_of_one_behaves_like_a_single_process() {
    let results = fit_in_group(1, 5);
    assert_eq!(results[0].rows, (0, 40));

    let mut single = SsGplvm::new(toy_data(), &options()).unwrap();
    single
        .set_parameters(&results[0].theta, SessionState::Idle)
        .unwrap();
    assert_relative_eq!(single.evidence(), results[0].evidence, max_relative = 1e-8);
}

#[test]
fn workers_take_rank0_state_whatever_their_seed() {
    let results = fit_with_seeds(&[100, 101, 102], 3);
    let root = &results[0];
    assert!(root.evidence.is_finite());
    for other in &results[1..] {
        assert_eq!(other.z, root.z);
        assert_eq!(other.theta, root.theta);
        assert_eq!(other.evidence.to_bits(), root.evidence.to_bits());
    }

    let mut single = SsGplvm::new(toy_data(), &options_with_seed(100)).unwrap();
    assert_eq!(single.inducing_inputs(), &root.z);
    single
        .set_parameters(&root.theta, SessionState::Idle)
        .unwrap();
    assert_relative_eq!(single.evidence(), root.evidence, max_relative = 1e-8);
}

#[test]
fn workers_must_hold_the_same_rows() {
    let y = toy_data();
    let mut comms = LocalComm::group(2);
    let follower_comm = comms.pop().unwrap();
    let root_comm = comms.pop().unwrap();

    let (root, follower) = std::thread::scope(|s| {
        let root = s.spawn(|| -> anyhow::Result<()> {
            let inputs = ModelInputs {
                comm: Some(Box::new(root_comm)),
                ..ModelInputs::default()
            };
            let mut model = SsGplvm::build(y.clone(), &options(), inputs)?;
            let mut adam = Adam::new(AdamOptions {
                max_iter: 2,
                show_progress: false,
                ..AdamOptions::default()
            });
            model.optimize(&mut adam)
        });
        let follower = s.spawn(|| -> anyhow::Result<()> {
            let inputs = ModelInputs {
                comm: Some(Box::new(follower_comm)),
                ..ModelInputs::default()
            };
            SsGplvm::build(y.rows(0, 30).into_owned(), &options(), inputs).map(|_| ())
        });
        (root.join().unwrap(), follower.join().unwrap())
    });

    let err = follower.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<LentilError>(),
        Some(LentilError::DimensionMismatch {
            expected: 40,
            actual: 30,
            ..
        })
    ));
    // rank 0 notices the missing peer instead of waiting forever
    assert!(root.is_err());
}
