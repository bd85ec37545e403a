use clap::Args;
use lentil::common::*;
use lentil::*;
use matrix_param::io::ParamIo;
use matrix_util::traits::IoOps;

#[derive(Args, Debug)]
pub struct FitArgs {
    /// Data file; rows are samples and columns are features
    #[arg(required = true)]
    data_file: Box<str>,

    /// Output header
    #[arg(long, short, required = true)]
    out: Box<str>,

    /// number of leading lines to skip in the data file
    #[arg(long)]
    skip_lines: Option<usize>,

    /// number of latent dimensions
    #[arg(long, short = 'q', default_value_t = 2)]
    latent: usize,

    /// number of inducing inputs
    #[arg(long, short = 'm', default_value_t = 10)]
    inducing: usize,

    /// latent initialisation
    #[arg(long, value_enum, default_value_t = InitMethod::Pca)]
    init: InitMethod,

    /// share one inclusion probability across latent dimensions
    #[arg(long, default_value_t = false)]
    group_spike: bool,

    /// learn the prior inclusion probabilities
    #[arg(long, default_value_t = false)]
    learn_pi: bool,

    /// variance of the slab component
    #[arg(long, default_value_t = 1.0)]
    slab_variance: f64,

    /// initial noise variance
    #[arg(long, default_value_t = 1.0)]
    noise_variance: f64,

    /// optimization iterations
    #[arg(long, default_value_t = 300)]
    iter: usize,

    /// learning rate
    #[arg(long, default_value_t = 0.05)]
    learning_rate: f64,

    /// number of in-process workers sharing the rows
    #[arg(long, short = 'w', default_value_t = 1)]
    workers: usize,

    /// rows per batch when the statistics are accumulated in batches
    #[arg(long, default_value_t = 256)]
    batch_size: usize,

    /// random seed
    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// verbosity
    #[arg(long, short)]
    verbose: bool,
}

pub fn fit_ssgplvm(args: &FitArgs) -> anyhow::Result<()> {
    if args.verbose {
        std::env::set_var("RUST_LOG", "info");
    }
    env_logger::init();

    let y = Mat::from_tsv(&args.data_file, args.skip_lines)?;
    info!("read {} x {} data: {}", y.nrows(), y.ncols(), args.data_file);

    let options = SsGplvmOptions {
        input_dim: args.latent,
        num_inducing: args.inducing,
        init: args.init,
        group_spike: args.group_spike,
        learn_pi: args.learn_pi,
        slab_variance: args.slab_variance,
        noise_variance: args.noise_variance,
        batch_size: args.batch_size,
        seed: args.seed,
        ..SsGplvmOptions::default()
    };

    let adam_options = AdamOptions {
        learning_rate: args.learning_rate,
        max_iter: args.iter,
        verbose: args.verbose,
        ..AdamOptions::default()
    };

    let workers = args.workers.max(1);
    if workers > num_cpus::get() {
        warn!(
            "{} workers requested on {} cores",
            workers,
            num_cpus::get()
        );
    }

    let model = if workers == 1 {
        let mut model = SsGplvm::new(y, &options)?;
        model.optimize(&mut Adam::new(adam_options))?;
        model
    } else {
        fit_with_workers(y, &options, &adam_options, workers)?
    };

    write_results(&model, &args.out)
}

/// Run `workers` replicas over `LocalComm` and keep rank 0's model
fn fit_with_workers(
    y: Mat,
    options: &SsGplvmOptions,
    adam_options: &AdamOptions,
    workers: usize,
) -> anyhow::Result<SsGplvm> {
    info!("fitting with {} workers", workers);

    std::thread::scope(|scope| {
        let handles: Vec<_> = LocalComm::group(workers)
            .into_iter()
            .map(|comm| {
                let y = y.clone();
                let adam_options = AdamOptions {
                    show_progress: comm.rank() == 0 && adam_options.show_progress,
                    ..adam_options.clone()
                };
                scope.spawn(move || -> anyhow::Result<SsGplvm> {
                    let inputs = ModelInputs {
                        comm: Some(Box::new(comm)),
                        ..ModelInputs::default()
                    };
                    let mut model = SsGplvm::build(y, options, inputs)?;
                    model.optimize(&mut Adam::new(adam_options))?;
                    Ok(model)
                })
            })
            .collect();

        let mut models = handles
            .into_iter()
            .enumerate()
            .map(|(rank, h)| {
                h.join()
                    .map_err(|_| anyhow::anyhow!("worker {} panicked", rank))?
            })
            .collect::<anyhow::Result<Vec<_>>>()?;

        Ok(models.swap_remove(0))
    })
}

fn write_results(model: &SsGplvm, out: &str) -> anyhow::Result<()> {
    model.posterior().to_tsv(out)?;

    let sensitivity = model.input_sensitivity();
    Mat::from_column_slice(sensitivity.len(), 1, sensitivity.as_slice())
        .to_tsv(&format!("{}.sensitivity.tsv.gz", out))?;

    model.snapshot().save_json(&format!("{}.model.json", out))?;

    info!(
        "evidence {} (data fit {}, KL {})",
        model.evidence(),
        model.data_evidence(),
        model.kl()
    );
    Ok(())
}
