pub use nalgebra::{DMatrix, DVector};
pub use rand::Rng;
pub use rand_distr::{StandardNormal, Uniform};
pub use rayon::prelude::*;

use crate::traits::*;

impl SampleOps for DMatrix<f64> {
    type Mat = Self;
    type Scalar = f64;

    fn runif(nrow: usize, ncol: usize) -> Self::Mat {
        let rvec = (0..(nrow * ncol))
            .into_par_iter()
            .map_init(rand::rng, |rng, _| rng.random::<f64>())
            .collect();

        DMatrix::<f64>::from_vec(nrow, ncol, rvec)
    }

    fn runif_rng<R: Rng + ?Sized>(
        nrow: usize,
        ncol: usize,
        lb: f64,
        ub: f64,
        rng: &mut R,
    ) -> anyhow::Result<Self::Mat> {
        let unif = Uniform::new(lb, ub)?;
        // sequential so the generator state advances deterministically
        let rvec: Vec<f64> = (0..(nrow * ncol)).map(|_| rng.sample(unif)).collect();
        Ok(DMatrix::<f64>::from_vec(nrow, ncol, rvec))
    }

    fn rnorm_rng<R: Rng + ?Sized>(nrow: usize, ncol: usize, rng: &mut R) -> Self::Mat {
        let rvec: Vec<f64> = (0..(nrow * ncol))
            .map(|_| rng.sample::<f64, _>(StandardNormal))
            .collect();
        DMatrix::<f64>::from_vec(nrow, ncol, rvec)
    }
}

impl MatOps for DMatrix<f64> {
    type Mat = Self;
    type Scalar = f64;
    type DVec = DVector<f64>;

    fn centre_columns_inplace(&mut self) {
        for mut xx_j in self.column_iter_mut() {
            let mu = xx_j.mean();
            xx_j.add_scalar_mut(-mu);
        }
    }

    fn centre_columns(&self) -> Self::Mat {
        let mut ret = self.clone();
        ret.centre_columns_inplace();
        ret
    }

    fn scale_columns_inplace(&mut self) {
        for mut xx_j in self.column_iter_mut() {
            let mu = xx_j.mean();
            xx_j.add_scalar_mut(-mu);
            let sd = (xx_j.norm_squared() / xx_j.len().max(1) as f64).sqrt();
            if sd > 0.0 {
                xx_j /= sd;
            }
        }
    }

    fn column_variances(&self) -> Self::DVec {
        DVector::from_iterator(
            self.ncols(),
            self.column_iter().map(|xx_j| {
                let mu = xx_j.mean();
                xx_j.iter().map(|&x| (x - mu) * (x - mu)).sum::<f64>() / xx_j.len().max(1) as f64
            }),
        )
    }
}
