use crate::common::*;
use matrix_util::traits::SampleOps;
use rand::SeedableRng;
use rand_distr::{Bernoulli, Distribution};

pub struct SimArgs {
    pub rows: usize,
    pub cols: usize,
    /// number of latent dimensions in the output
    pub latent: usize,
    /// only the first `active` latent dimensions carry signal
    pub active: usize,
    /// probability that an active dimension is switched on in a row
    pub inclusion: f64,
    /// standard deviation of the observation noise
    pub noise: f64,
    pub rseed: u64,
}

impl Default for SimArgs {
    fn default() -> Self {
        Self {
            rows: 100,
            cols: 10,
            latent: 5,
            active: 2,
            inclusion: 0.5,
            noise: 0.1,
            rseed: 42,
        }
    }
}

pub struct SimOut {
    /// `rows x cols`
    pub y: Mat,
    /// `rows x latent`, zero outside the active dimensions
    pub x: Mat,
    /// `latent x cols`
    pub loadings: Mat,
}

/// Observations generated from a sparse latent space
///
/// ```text
/// b(n,q) ~ Bernoulli(inclusion) for q < active, 0 otherwise
/// x(n,q) = b(n,q) * s(n,q), s(n,q) ~ N(0,1)
/// y(n,d) = sum_q x(n,q) * w(q,d) + noise * e(n,d)
/// ```
pub fn generate_sparse_latent_data(args: &SimArgs) -> anyhow::Result<SimOut> {
    let (nn, dd, kk) = (args.rows, args.cols, args.latent);
    let active = args.active.min(kk);
    let mut rng = rand::rngs::StdRng::seed_from_u64(args.rseed);

    let spike = Bernoulli::new(args.inclusion.clamp(0., 1.))?;
    let slab = Mat::rnorm_rng(nn, kk, &mut rng);
    let x = Mat::from_fn(nn, kk, |i, q| {
        if q < active && spike.sample(&mut rng) {
            slab[(i, q)]
        } else {
            0.0
        }
    });

    let loadings = Mat::rnorm_rng(kk, dd, &mut rng);
    let noise = Mat::rnorm_rng(nn, dd, &mut rng) * args.noise.max(0.0);
    let y = &x * &loadings + noise;

    info!(
        "simulated {} x {} observations from {} of {} latent dimensions",
        nn, dd, active, kk
    );
    Ok(SimOut { y, x, loadings })
}
