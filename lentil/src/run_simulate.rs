use clap::Args;
use lentil::simulate::{generate_sparse_latent_data, SimArgs};
use log::info;
use matrix_util::traits::IoOps;

#[derive(Args, Debug)]
pub struct SimulateArgs {
    /// Output header
    #[arg(long, short, required = true)]
    out: Box<str>,

    /// number of samples (rows)
    #[arg(long, short = 'n', default_value_t = 100)]
    rows: usize,

    /// number of features (columns)
    #[arg(long, short = 'd', default_value_t = 10)]
    cols: usize,

    /// number of latent dimensions
    #[arg(long, short = 'q', default_value_t = 5)]
    latent: usize,

    /// number of latent dimensions carrying signal
    #[arg(long, default_value_t = 2)]
    active: usize,

    /// probability that an active dimension is used by a sample
    #[arg(long, default_value_t = 0.5)]
    inclusion: f64,

    /// standard deviation of the observation noise
    #[arg(long, default_value_t = 0.1)]
    noise: f64,

    /// random seed
    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// verbosity
    #[arg(long, short)]
    verbose: bool,
}

pub fn run_simulate(args: &SimulateArgs) -> anyhow::Result<()> {
    if args.verbose {
        std::env::set_var("RUST_LOG", "info");
    }
    env_logger::init();

    let sim = generate_sparse_latent_data(&SimArgs {
        rows: args.rows,
        cols: args.cols,
        latent: args.latent,
        active: args.active,
        inclusion: args.inclusion,
        noise: args.noise,
        rseed: args.seed,
    })?;

    let data_file = format!("{}.data.tsv.gz", args.out);
    let latent_file = format!("{}.latent.tsv.gz", args.out);
    let loadings_file = format!("{}.loadings.tsv.gz", args.out);

    sim.y.to_tsv(&data_file)?;
    sim.x.to_tsv(&latent_file)?;
    sim.loadings.to_tsv(&loadings_file)?;

    info!(
        "wrote simulated data:\n{:?},\n{:?},\n{:?}",
        data_file, latent_file, loadings_file
    );
    Ok(())
}
