use crate::common::*;
use matrix_util::traits::{MatOps, SampleOps};
use rand::Rng;

/// floor on the relative importance of a latent dimension
const MIN_FRAC: f64 = 1e-6;

#[derive(clap::ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum InitMethod {
    Pca,
    Random,
}

/// Initial latent means and the relative importance of each column.
///
/// * `Pca` - leading principal components of the column-centred `y`;
///   columns beyond the rank of `y` are standard normal
/// * `Random` - standard normal
///
/// Every column of the returned `x` is standardised. `fracs` are the
/// explained-variance fractions (PCA) or column variances (random),
/// divided by their maximum.
pub fn initialize_latent<R: Rng + ?Sized>(
    method: InitMethod,
    input_dim: usize,
    y: &Mat,
    rng: &mut R,
) -> anyhow::Result<(Mat, DVec)> {
    let nn = y.nrows();
    if nn == 0 || input_dim == 0 {
        anyhow::bail!(
            "cannot initialize a {} x {} latent space",
            nn,
            input_dim
        );
    }

    let mut x = Mat::rnorm_rng(nn, input_dim, rng);

    let fracs = match method {
        InitMethod::Pca => {
            let (pcs, fracs) = principal_components(y, input_dim)?;
            x.columns_mut(0, pcs.ncols()).copy_from(&pcs);
            fracs
        }
        InitMethod::Random => x.column_variances(),
    };

    x.scale_columns_inplace();

    let max = fracs.max();
    let fracs = if max > 0.0 {
        fracs.map(|f| (f / max).max(MIN_FRAC))
    } else {
        DVec::from_element(input_dim, 1.0)
    };

    debug!("initial relevance: {:?}", fracs.as_slice());
    Ok((x, fracs))
}

/// Scores `U S` of up to `num_comp` leading components and the fraction
/// of variance each one explains; missing components get the smallest
/// observed fraction.
fn principal_components(y: &Mat, num_comp: usize) -> anyhow::Result<(Mat, DVec)> {
    let nn = y.nrows();
    let svd = y.centre_columns().svd(true, false);
    let u = svd
        .u
        .ok_or_else(|| LentilError::Numerical("SVD returned no left singular vectors".into()))?;
    let s = &svd.singular_values;

    let mut order: Vec<usize> = (0..s.len()).collect();
    order.sort_by(|&a, &b| s[b].total_cmp(&s[a]));
    let kk = num_comp.min(order.len());

    let pcs = Mat::from_fn(nn, kk, |i, j| u[(i, order[j])] * s[order[j]]);

    let total: f64 = s.iter().map(|x| x * x).sum();
    if total <= 0.0 {
        return Ok((pcs, DVec::from_element(num_comp, 1.0)));
    }

    let leading: Vec<f64> = order[..kk].iter().map(|&j| s[j] * s[j] / total).collect();
    let floor = leading
        .iter()
        .cloned()
        .filter(|&f| f > 0.0)
        .fold(f64::INFINITY, f64::min);
    let floor = if floor.is_finite() { floor } else { MIN_FRAC };

    let fracs = DVec::from_fn(num_comp, |j, _| if j < kk { leading[j] } else { floor });
    Ok((pcs, fracs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn pca_ranks_columns_by_explained_variance() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        let nn = 60;
        // strong signal in one direction, weak in another
        let t = Mat::rnorm_rng(nn, 2, &mut rng);
        let w = Mat::from_row_slice(2, 5, &[3.0, 3.0, 0.0, 0.0, 3.0, 0.0, 0.0, 0.5, 0.5, 0.0]);
        let y = t * w;

        let (x, fracs) = initialize_latent(InitMethod::Pca, 3, &y, &mut rng).unwrap();
        assert_eq!(x.shape(), (nn, 3));
        assert_eq!(fracs[0], 1.0);
        assert!(fracs[1] < 0.1);
        assert!(fracs.iter().all(|&f| f > 0.0 && f <= 1.0));
        for col in x.column_iter() {
            assert!(col.mean().abs() < 1e-10);
        }
    }

    #[test]
    fn latent_dimensions_may_exceed_data_columns() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(1);
        let y = Mat::rnorm_rng(20, 2, &mut rng);
        let (x, fracs) = initialize_latent(InitMethod::Pca, 4, &y, &mut rng).unwrap();
        assert_eq!(x.shape(), (20, 4));
        assert_eq!(fracs.len(), 4);
        assert!(fracs.iter().all(|f| f.is_finite() && *f > 0.0));
    }
}
