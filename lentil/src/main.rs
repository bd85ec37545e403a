mod fit_ssgplvm;
mod run_simulate;

use clap::{Parser, Subcommand};
use fit_ssgplvm::*;
use log::info;
use run_simulate::*;

#[derive(Parser, Debug)]
#[command(
    version,
    about = "LENTIL",
    long_about = "Spike-and-slab Gaussian process latent variable models.\n\
		  Data files are tab-separated matrices (`.gz` allowed) with\n\
		  samples in rows and features in columns."
)]
struct Cli {
    #[command(subcommand)]
    commands: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    #[command(
        about = "Fit a spike-and-slab GPLVM",
        long_about = "Learn a sparse latent representation of the rows in three stages: \n\
		      (1) Initialize latent means by PCA (or at random)\n\
		      (2) Maximize the variational lower bound by Adam\n\
		      (3) Write posterior statistics and a model snapshot.\n"
    )]
    Fit(FitArgs),

    #[command(about = "Simulate data from a sparse latent space")]
    Simulate(SimulateArgs),
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match &cli.commands {
        Commands::Fit(args) => {
            fit_ssgplvm(args)?;
        }
        Commands::Simulate(args) => {
            run_simulate(args)?;
        }
    }

    info!("Done");
    Ok(())
}
