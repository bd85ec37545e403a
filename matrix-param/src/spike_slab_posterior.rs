use crate::error::{check_length, check_shape, ParamError};
use crate::traits::*;
use nalgebra::DMatrix;

type Mat = DMatrix<f64>;

/// Inclusion probabilities are kept inside `[eps, 1 - eps]`
pub const BINARY_PROB_EPS: f64 = 1e-9;

fn clamp_prob(p: f64) -> f64 {
    p.clamp(BINARY_PROB_EPS, 1.0 - BINARY_PROB_EPS)
}

/// Variational posterior `q(X)` over an `N x Q` latent matrix:
///
/// ```text
/// q(x[n,q]) = gamma[n,q] * N(mu[n,q], S[n,q]) + (1 - gamma[n,q]) * delta_0
/// ```
///
/// Each parameter matrix has a gradient slot of the same shape. The
/// slots hold the gradient of the evidence; collaborators write or
/// accumulate into them and the optimizer reads them back through
/// [`ParamVector::gradients`].
#[derive(Debug, Clone)]
pub struct SpikeSlabPosterior {
    //////////////////////////
    // variational params   //
    //////////////////////////
    mean: Mat,
    variance: Mat,
    binary_prob: Mat,
    group_spike: bool,
    ////////////////////
    // gradient slots //
    ////////////////////
    mean_grad: Mat,
    variance_grad: Mat,
    binary_prob_grad: Mat,
}

/// Write handles for the three gradient slots
pub struct GradientSlots<'a> {
    pub mean: &'a mut Mat,
    pub variance: &'a mut Mat,
    pub binary_prob: &'a mut Mat,
}

impl SpikeSlabPosterior {
    /// Build a posterior from its three parameter matrices.
    ///
    /// * `mean` - `N x Q` variational means
    /// * `variance` - `N x Q`, strictly positive
    /// * `binary_prob` - `N x Q`, clamped into `[eps, 1-eps]`
    /// * `group_spike` - share one inclusion probability per row; the
    ///   first column of `binary_prob` is broadcast across the row
    pub fn new(
        mean: Mat,
        variance: Mat,
        binary_prob: Mat,
        group_spike: bool,
    ) -> anyhow::Result<Self> {
        let dims = mean.shape();
        check_shape("variance", dims, variance.shape())?;
        check_shape("binary_prob", dims, binary_prob.shape())?;

        if let Some(s) = variance.iter().find(|&&s| !(s > 0.0 && s.is_finite())) {
            return Err(ParamError::InvalidValue {
                what: "variance",
                message: format!("must be positive and finite, found {}", s),
            }
            .into());
        }

        if mean.iter().any(|m| !m.is_finite()) || binary_prob.iter().any(|p| !p.is_finite()) {
            return Err(ParamError::InvalidValue {
                what: "mean/binary_prob",
                message: "non-finite entry".to_string(),
            }
            .into());
        }

        let mut binary_prob = binary_prob.map(clamp_prob);

        if group_spike && dims.1 > 0 {
            for i in 0..dims.0 {
                let g = binary_prob[(i, 0)];
                binary_prob.row_mut(i).fill(g);
            }
        }

        Ok(Self {
            mean,
            variance,
            binary_prob,
            group_spike,
            mean_grad: Mat::zeros(dims.0, dims.1),
            variance_grad: Mat::zeros(dims.0, dims.1),
            binary_prob_grad: Mat::zeros(dims.0, dims.1),
        })
    }

    pub fn nrows(&self) -> usize {
        self.mean.nrows()
    }

    pub fn ncols(&self) -> usize {
        self.mean.ncols()
    }

    pub fn shape(&self) -> (usize, usize) {
        self.mean.shape()
    }

    pub fn mean(&self) -> &Mat {
        &self.mean
    }

    pub fn variance(&self) -> &Mat {
        &self.variance
    }

    pub fn binary_prob(&self) -> &Mat {
        &self.binary_prob
    }

    pub fn group_spike(&self) -> bool {
        self.group_spike
    }

    /// `E[x] = gamma * mu`
    pub fn expected_latent(&self) -> Mat {
        self.binary_prob.component_mul(&self.mean)
    }

    /// `E[x^2] = gamma * (mu^2 + S)`
    pub fn second_moment(&self) -> Mat {
        self.mean
            .zip_zip_map(&self.variance, &self.binary_prob, |m, s, g| {
                g * (m * m + s)
            })
    }

    /// `Var[x] = gamma * (mu^2 + S) - gamma^2 * mu^2`
    pub fn latent_variance(&self) -> Mat {
        self.mean
            .zip_zip_map(&self.variance, &self.binary_prob, |m, s, g| {
                g * (m * m + s) - g * g * m * m
            })
    }

    /// Current gradients `(mean, variance, binary_prob)`
    pub fn gradient_matrices(&self) -> (&Mat, &Mat, &Mat) {
        (&self.mean_grad, &self.variance_grad, &self.binary_prob_grad)
    }

    /// Write handles for accumulating into the gradient slots
    pub fn gradient_slots(&mut self) -> GradientSlots<'_> {
        GradientSlots {
            mean: &mut self.mean_grad,
            variance: &mut self.variance_grad,
            binary_prob: &mut self.binary_prob_grad,
        }
    }

    /// Replace all three gradients. Shapes are checked before any slot
    /// is touched, so either every slot changes or none does.
    pub fn set_gradients(
        &mut self,
        mean_grad: Mat,
        variance_grad: Mat,
        binary_prob_grad: Mat,
    ) -> anyhow::Result<()> {
        let dims = self.shape();
        check_shape("mean gradient", dims, mean_grad.shape())?;
        check_shape("variance gradient", dims, variance_grad.shape())?;
        check_shape("binary_prob gradient", dims, binary_prob_grad.shape())?;

        self.mean_grad = mean_grad;
        self.variance_grad = variance_grad;
        self.binary_prob_grad = binary_prob_grad;
        Ok(())
    }

    /// Copy a block of gradients into rows `start..start + nrows`
    pub fn set_row_gradients(
        &mut self,
        start: usize,
        mean_grad: &Mat,
        variance_grad: &Mat,
        binary_prob_grad: &Mat,
    ) -> anyhow::Result<()> {
        let nrows = mean_grad.nrows();
        let dims = (nrows, self.ncols());
        check_shape("mean gradient block", dims, mean_grad.shape())?;
        check_shape("variance gradient block", dims, variance_grad.shape())?;
        check_shape("binary_prob gradient block", dims, binary_prob_grad.shape())?;

        if start + nrows > self.nrows() {
            return Err(ParamError::InvalidValue {
                what: "gradient block",
                message: format!(
                    "rows {}..{} exceed {} rows",
                    start,
                    start + nrows,
                    self.nrows()
                ),
            }
            .into());
        }

        self.mean_grad.rows_mut(start, nrows).copy_from(mean_grad);
        self.variance_grad.rows_mut(start, nrows).copy_from(variance_grad);
        self.binary_prob_grad
            .rows_mut(start, nrows)
            .copy_from(binary_prob_grad);
        Ok(())
    }

    pub fn reset_gradients(&mut self) {
        self.mean_grad.fill(0.0);
        self.variance_grad.fill(0.0);
        self.binary_prob_grad.fill(0.0);
    }

    /// Posterior restricted to rows `start..end`, with zeroed gradients.
    /// A range outside `0..=nrows()` is an error.
    pub fn rows(&self, start: usize, end: usize) -> Result<Self, ParamError> {
        if start > end || end > self.nrows() {
            return Err(ParamError::RowRange {
                start,
                end,
                nrows: self.nrows(),
            });
        }
        let nrows = end - start;
        let ncols = self.ncols();
        Ok(Self {
            mean: self.mean.rows(start, nrows).into_owned(),
            variance: self.variance.rows(start, nrows).into_owned(),
            binary_prob: self.binary_prob.rows(start, nrows).into_owned(),
            group_spike: self.group_spike,
            mean_grad: Mat::zeros(nrows, ncols),
            variance_grad: Mat::zeros(nrows, ncols),
            binary_prob_grad: Mat::zeros(nrows, ncols),
        })
    }

    fn num_binary_params(&self) -> usize {
        if self.group_spike {
            self.nrows()
        } else {
            self.nrows() * self.ncols()
        }
    }
}

/// Layout: `[mean | log variance | logit binary_prob]`, column-major.
/// Under grouping only the first column of `binary_prob` is exposed.
impl ParamVector for SpikeSlabPosterior {
    fn num_params(&self) -> usize {
        2 * self.nrows() * self.ncols() + self.num_binary_params()
    }

    fn params(&self) -> Vec<f64> {
        let mut ret = Vec::with_capacity(self.num_params());
        ret.extend_from_slice(self.mean.as_slice());
        ret.extend(self.variance.iter().map(|s| s.ln()));
        if self.group_spike {
            ret.extend(self.binary_prob.column(0).iter().map(|&g| logit(g)));
        } else {
            ret.extend(self.binary_prob.iter().map(|&g| logit(g)));
        }
        ret
    }

    fn set_params(&mut self, theta: &[f64]) -> anyhow::Result<()> {
        check_length("spike-and-slab posterior", self.num_params(), theta.len())?;
        let nq = self.nrows() * self.ncols();

        self.mean.as_mut_slice().copy_from_slice(&theta[..nq]);

        for (s, &t) in self
            .variance
            .as_mut_slice()
            .iter_mut()
            .zip(theta[nq..(2 * nq)].iter())
        {
            *s = exp_positive(t);
        }

        let binary = &theta[(2 * nq)..];
        if self.group_spike {
            for (i, &t) in binary.iter().enumerate() {
                let g = clamp_prob(sigmoid(t));
                self.binary_prob.row_mut(i).fill(g);
            }
        } else {
            for (g, &t) in self.binary_prob.as_mut_slice().iter_mut().zip(binary.iter()) {
                *g = clamp_prob(sigmoid(t));
            }
        }
        Ok(())
    }

    fn gradients(&self) -> Vec<f64> {
        let mut ret = Vec::with_capacity(self.num_params());
        ret.extend_from_slice(self.mean_grad.as_slice());
        ret.extend(
            self.variance_grad
                .iter()
                .zip(self.variance.iter())
                .map(|(d, s)| d * s),
        );
        // grouped rows carry the shared gradient in every column
        if self.group_spike {
            ret.extend(
                self.binary_prob_grad
                    .column(0)
                    .iter()
                    .zip(self.binary_prob.column(0).iter())
                    .map(|(d, g)| d * g * (1.0 - g)),
            );
        } else {
            ret.extend(
                self.binary_prob_grad
                    .iter()
                    .zip(self.binary_prob.iter())
                    .map(|(d, g)| d * g * (1.0 - g)),
            );
        }
        ret
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toy(group_spike: bool) -> SpikeSlabPosterior {
        let mean = Mat::from_fn(4, 3, |i, j| (i as f64) - (j as f64) * 0.5);
        let variance = Mat::from_element(4, 3, 0.2);
        let gamma = Mat::from_fn(4, 3, |i, j| 0.1 + 0.2 * (i as f64) + 0.05 * (j as f64));
        SpikeSlabPosterior::new(mean, variance, gamma, group_spike).unwrap()
    }

    #[test]
    fn clamps_binary_prob() {
        let gamma = Mat::from_row_slice(1, 3, &[0.0, 1.0, 0.5]);
        let q = SpikeSlabPosterior::new(
            Mat::zeros(1, 3),
            Mat::from_element(1, 3, 1.0),
            gamma,
            false,
        )
        .unwrap();
        assert_eq!(q.binary_prob()[(0, 0)], BINARY_PROB_EPS);
        assert_eq!(q.binary_prob()[(0, 1)], 1.0 - BINARY_PROB_EPS);
        assert_eq!(q.binary_prob()[(0, 2)], 0.5);
    }

    #[test]
    fn rejects_non_positive_variance() {
        let ret = SpikeSlabPosterior::new(
            Mat::zeros(2, 2),
            Mat::from_element(2, 2, 0.0),
            Mat::from_element(2, 2, 0.5),
            false,
        );
        assert!(ret.is_err());
    }

    #[test]
    fn set_gradients_is_all_or_nothing() {
        let mut q = toy(false);
        let ok = Mat::from_element(4, 3, 1.0);
        let bad = Mat::from_element(3, 4, 1.0);
        let err = q.set_gradients(ok.clone(), ok.clone(), bad).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ParamError>(),
            Some(ParamError::ShapeMismatch { .. })
        ));
        assert!(q.gradient_matrices().0.iter().all(|&x| x == 0.0));

        q.set_gradients(ok.clone(), ok.clone() * 2.0, ok.clone() * 3.0)
            .unwrap();
        assert_eq!(q.gradient_matrices().2[(3, 2)], 3.0);
    }

    #[test]
    fn param_vector_round_trip() {
        for group_spike in [false, true] {
            let mut q = toy(group_spike);
            let theta = q.params();
            assert_eq!(theta.len(), q.num_params());

            let before = q.clone();
            q.set_params(&theta).unwrap();
            approx::assert_relative_eq!(q.mean(), before.mean());
            approx::assert_relative_eq!(q.variance(), before.variance(), epsilon = 1e-12);
            approx::assert_relative_eq!(q.binary_prob(), before.binary_prob(), epsilon = 1e-12);
        }
    }

    #[test]
    fn grouped_rows_stay_shared() {
        let mut q = toy(true);
        assert_eq!(q.num_params(), 2 * 12 + 4);
        for i in 0..4 {
            let row = q.binary_prob().row(i);
            assert!(row.iter().all(|&g| g == row[0]));
        }

        let mut theta = q.params();
        let n = theta.len();
        theta[n - 1] = 2.0;
        q.set_params(&theta).unwrap();
        let row = q.binary_prob().row(3);
        assert!(row.iter().all(|&g| g == row[0]));
        approx::assert_relative_eq!(row[0], sigmoid(2.0));
    }

    #[test]
    fn row_slices() {
        let q = toy(false);
        let sub = q.rows(1, 3).unwrap();
        assert_eq!(sub.shape(), (2, 3));
        assert_eq!(sub.mean()[(0, 0)], q.mean()[(1, 0)]);
        assert_eq!(q.rows(4, 4).unwrap().nrows(), 0);
    }

    #[test]
    fn row_slices_out_of_range_fail() {
        let q = toy(false);
        assert!(matches!(
            q.rows(3, 10),
            Err(ParamError::RowRange {
                start: 3,
                end: 10,
                nrows: 4
            })
        ));
        assert!(q.rows(3, 2).is_err());
    }
}
