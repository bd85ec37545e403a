use crate::common::*;
use crate::error::{check_dim, check_shape};
use crate::inference::GradDict;
use matrix_param::traits::exp_positive;

/// Kernel expectations under the spike-and-slab posterior
///
/// * `psi0[n] = E[k(x_n, x_n)]`
/// * `psi1[n, m] = E[k(x_n, z_m)]`
/// * `psi2 = sum_n E[k(z, x_n) k(x_n, z)]`
#[derive(Debug, Clone)]
pub struct PsiStatistics {
    pub psi0: DVec,
    pub psi1: Mat,
    pub psi2: Mat,
}

/// Covariance function over latent inputs.
///
/// Hyperparameters are exposed in unconstrained coordinates through
/// [`ParamVector`]; `set_hyper_gradients` takes the gradient of the
/// evidence in the same coordinates.
pub trait Kernel: ParamVector + Send + Sync {
    fn name(&self) -> &'static str;

    fn input_dim(&self) -> usize;

    /// one relevance weight per latent dimension
    fn is_ard(&self) -> bool;

    /// Relevance of each latent dimension; length `input_dim`
    fn input_sensitivity(&self) -> DVec;

    fn set_group_spike(&mut self, group_spike: bool);

    fn group_spike(&self) -> bool;

    /// `K(Z, Z)`
    fn k_mm(&self, z: &Mat) -> anyhow::Result<Mat>;

    fn psi_statistics(&self, qx: &SpikeSlabPosterior, z: &Mat) -> anyhow::Result<PsiStatistics>;

    /// Gradients of the evidence with respect to the posterior's
    /// `(mean, variance, binary_prob)`, chained through the psi
    /// statistics.
    fn expectation_gradients(
        &self,
        qx: &SpikeSlabPosterior,
        z: &Mat,
        grad: &GradDict,
    ) -> anyhow::Result<(Mat, Mat, Mat)>;

    /// Hyperparameter gradient contributed by the psi statistics of
    /// the rows in `qx`
    fn hyper_gradients_expectations(
        &self,
        qx: &SpikeSlabPosterior,
        z: &Mat,
        grad: &GradDict,
    ) -> anyhow::Result<Vec<f64>>;

    /// Hyperparameter gradient contributed through `K(Z, Z)`
    fn hyper_gradients_kmm(&self, dl_dkmm: &Mat, z: &Mat) -> anyhow::Result<Vec<f64>>;

    fn set_hyper_gradients(&mut self, grad: Vec<f64>) -> anyhow::Result<()>;

    fn boxed_clone(&self) -> Box<dyn Kernel>;
}

/// Linear kernel with per-dimension variances:
///
/// ```text
/// k(x, x') = sum_q alpha[q] * x[q] * x'[q]
/// ```
///
/// Its expectations have a closed form under the spike-and-slab
/// posterior since they only involve the first two moments of `x`.
#[derive(Debug, Clone)]
pub struct LinearArd {
    variances: DVec,
    input_dim: usize,
    ard: bool,
    group_spike: bool,
    hyper_grad: DVec,
}

impl LinearArd {
    /// * `variances` - one per latent dimension
    pub fn new(variances: DVec) -> anyhow::Result<Self> {
        Self::check_positive(&variances)?;
        let input_dim = variances.len();
        Ok(Self {
            hyper_grad: DVec::zeros(input_dim),
            variances,
            input_dim,
            ard: true,
            group_spike: false,
        })
    }

    /// A single variance shared by all `input_dim` dimensions
    pub fn shared(input_dim: usize, variance: f64) -> anyhow::Result<Self> {
        let variances = DVec::from_element(1, variance);
        Self::check_positive(&variances)?;
        Ok(Self {
            variances,
            input_dim,
            ard: false,
            group_spike: false,
            hyper_grad: DVec::zeros(1),
        })
    }

    fn check_positive(variances: &DVec) -> anyhow::Result<()> {
        if variances.iter().any(|&v| !(v > 0.0 && v.is_finite())) {
            return Err(LentilError::Numerical(format!(
                "kernel variances must be positive: {:?}",
                variances.as_slice()
            ))
            .into());
        }
        Ok(())
    }

    pub fn variances(&self) -> &DVec {
        &self.variances
    }

    /// variance per latent dimension
    fn alpha(&self) -> DVec {
        if self.ard {
            self.variances.clone()
        } else {
            DVec::from_element(self.input_dim, self.variances[0])
        }
    }

    /// `Z * diag(alpha)`
    fn scaled_inducing(&self, z: &Mat) -> Mat {
        let alpha = self.alpha();
        let mut za = z.clone();
        for (q, mut col) in za.column_iter_mut().enumerate() {
            col *= alpha[q];
        }
        za
    }

    fn check_inputs(&self, qx: &SpikeSlabPosterior, z: &Mat) -> anyhow::Result<()> {
        check_dim("latent dimensions of q(X)", self.input_dim, qx.ncols())?;
        check_dim("columns of Z", self.input_dim, z.ncols())?;
        Ok(())
    }

    fn check_grad(&self, nn: usize, mm: usize, grad: &GradDict) -> anyhow::Result<()> {
        check_shape("dL/dpsi0", (nn, 1), grad.dl_dpsi0.shape())?;
        check_shape("dL/dpsi1", (nn, mm), grad.dl_dpsi1.shape())?;
        check_shape("dL/dpsi2", (mm, mm), grad.dl_dpsi2.shape())?;
        Ok(())
    }

    /// Gradient w.r.t. `alpha` to gradient w.r.t. `ln(variances)`
    fn chain_log(&self, d_alpha: DVec) -> Vec<f64> {
        if self.ard {
            d_alpha
                .iter()
                .zip(self.variances.iter())
                .map(|(d, v)| d * v)
                .collect()
        } else {
            vec![d_alpha.sum() * self.variances[0]]
        }
    }

    /// `sum_n m_n m_n' + diag(sum_n v_n)`
    fn latent_moment(qx: &SpikeSlabPosterior) -> Mat {
        let m = qx.expected_latent();
        let v = qx.latent_variance();
        let mut c = m.transpose() * &m;
        for q in 0..v.ncols() {
            c[(q, q)] += v.column(q).sum();
        }
        c
    }
}

impl Kernel for LinearArd {
    fn name(&self) -> &'static str {
        if self.ard {
            "linear_ard"
        } else {
            "linear"
        }
    }

    fn input_dim(&self) -> usize {
        self.input_dim
    }

    fn is_ard(&self) -> bool {
        self.ard
    }

    fn input_sensitivity(&self) -> DVec {
        self.alpha()
    }

    fn set_group_spike(&mut self, group_spike: bool) {
        self.group_spike = group_spike;
    }

    fn group_spike(&self) -> bool {
        self.group_spike
    }

    fn k_mm(&self, z: &Mat) -> anyhow::Result<Mat> {
        check_dim("columns of Z", self.input_dim, z.ncols())?;
        Ok(self.scaled_inducing(z) * z.transpose())
    }

    fn psi_statistics(&self, qx: &SpikeSlabPosterior, z: &Mat) -> anyhow::Result<PsiStatistics> {
        self.check_inputs(qx, z)?;
        let alpha = self.alpha();
        let za = self.scaled_inducing(z);

        let psi0 = qx.second_moment() * &alpha;
        let psi1 = qx.expected_latent() * za.transpose();
        let psi2 = &za * Self::latent_moment(qx) * za.transpose();

        Ok(PsiStatistics { psi0, psi1, psi2 })
    }

    fn expectation_gradients(
        &self,
        qx: &SpikeSlabPosterior,
        z: &Mat,
        grad: &GradDict,
    ) -> anyhow::Result<(Mat, Mat, Mat)> {
        self.check_inputs(qx, z)?;
        let (nn, kk) = qx.shape();
        self.check_grad(nn, z.nrows(), grad)?;

        let alpha = self.alpha();
        let za = self.scaled_inducing(z);
        let m = qx.expected_latent();

        // B = A Z' G2 Z A
        let b = za.transpose() * &grad.dl_dpsi2 * &za;
        let b_sym = &b + b.transpose();

        // derivatives w.r.t. E[x^2], E[x] and Var[x]
        let d_e2 = Mat::from_fn(nn, kk, |n, q| grad.dl_dpsi0[n] * alpha[q]);
        let d_m = &grad.dl_dpsi1 * &za + &m * &b_sym;
        let d_v = Mat::from_fn(nn, kk, |_, q| b[(q, q)]);

        let (mu, s, gamma) = (qx.mean(), qx.variance(), qx.binary_prob());

        let d_mu = Mat::from_fn(nn, kk, |n, q| {
            let (mu, g) = (mu[(n, q)], gamma[(n, q)]);
            d_e2[(n, q)] * 2.0 * g * mu + d_m[(n, q)] * g + d_v[(n, q)] * 2.0 * g * mu * (1.0 - g)
        });

        let d_s = Mat::from_fn(nn, kk, |n, q| (d_e2[(n, q)] + d_v[(n, q)]) * gamma[(n, q)]);

        let mut d_gamma = Mat::from_fn(nn, kk, |n, q| {
            let (mu, s, g) = (mu[(n, q)], s[(n, q)], gamma[(n, q)]);
            let mu2 = mu * mu;
            d_e2[(n, q)] * (mu2 + s) + d_m[(n, q)] * mu + d_v[(n, q)] * (mu2 + s - 2.0 * g * mu2)
        });

        if qx.group_spike() {
            for n in 0..nn {
                let total = d_gamma.row(n).sum();
                d_gamma.row_mut(n).fill(total);
            }
        }

        Ok((d_mu, d_s, d_gamma))
    }

    fn hyper_gradients_expectations(
        &self,
        qx: &SpikeSlabPosterior,
        z: &Mat,
        grad: &GradDict,
    ) -> anyhow::Result<Vec<f64>> {
        self.check_inputs(qx, z)?;
        self.check_grad(qx.nrows(), z.nrows(), grad)?;
        let alpha = self.alpha();
        let kk = self.input_dim;

        let from_psi0 = qx.second_moment().transpose() * &grad.dl_dpsi0;

        let m = qx.expected_latent();
        let g1z = &grad.dl_dpsi1 * z;
        let from_psi1 = DVec::from_fn(kk, |q, _| m.column(q).dot(&g1z.column(q)));

        let c = Self::latent_moment(qx);
        let h = z.transpose() * &grad.dl_dpsi2 * z;
        let mut ca = c;
        for (q, mut col) in ca.column_iter_mut().enumerate() {
            col *= alpha[q];
        }
        let cah = ca * (&h + h.transpose());
        let from_psi2 = cah.diagonal();

        Ok(self.chain_log(from_psi0 + from_psi1 + from_psi2))
    }

    fn hyper_gradients_kmm(&self, dl_dkmm: &Mat, z: &Mat) -> anyhow::Result<Vec<f64>> {
        check_dim("columns of Z", self.input_dim, z.ncols())?;
        check_shape("dL/dKmm", (z.nrows(), z.nrows()), dl_dkmm.shape())?;
        let zkz = z.transpose() * dl_dkmm * z;
        Ok(self.chain_log(zkz.diagonal()))
    }

    fn set_hyper_gradients(&mut self, grad: Vec<f64>) -> anyhow::Result<()> {
        check_dim("kernel gradient", self.variances.len(), grad.len())?;
        self.hyper_grad = DVec::from_vec(grad);
        Ok(())
    }

    fn boxed_clone(&self) -> Box<dyn Kernel> {
        Box::new(self.clone())
    }
}

/// `ln(variances)`
impl ParamVector for LinearArd {
    fn num_params(&self) -> usize {
        self.variances.len()
    }

    fn params(&self) -> Vec<f64> {
        self.variances.iter().map(|v| v.ln()).collect()
    }

    fn set_params(&mut self, theta: &[f64]) -> anyhow::Result<()> {
        check_dim("kernel parameters", self.variances.len(), theta.len())?;
        for (v, &t) in self.variances.iter_mut().zip(theta.iter()) {
            *v = exp_positive(t);
        }
        Ok(())
    }

    fn gradients(&self) -> Vec<f64> {
        self.hyper_grad.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn toy_posterior() -> SpikeSlabPosterior {
        let mean = Mat::from_row_slice(3, 2, &[0.5, -1.0, 1.5, 0.2, -0.3, 0.8]);
        let variance = Mat::from_row_slice(3, 2, &[0.1, 0.2, 0.3, 0.4, 0.5, 0.6]);
        let gamma = Mat::from_row_slice(3, 2, &[0.9, 0.4, 0.3, 0.7, 0.5, 0.5]);
        SpikeSlabPosterior::new(mean, variance, gamma, false).unwrap()
    }

    #[test]
    fn psi2_sums_the_rowwise_outer_products() {
        let kern = LinearArd::new(DVec::from_vec(vec![0.7, 1.3])).unwrap();
        let qx = toy_posterior();
        let z = Mat::from_row_slice(2, 2, &[1.0, 0.0, 0.5, -1.0]);
        let psi = kern.psi_statistics(&qx, &z).unwrap();

        let mut expected = Mat::zeros(2, 2);
        for n in 0..3 {
            let row = qx.rows(n, n + 1).unwrap();
            let m = row.expected_latent();
            let v = row.latent_variance();
            for a in 0..2 {
                for b in 0..2 {
                    let mut acc = 0.0;
                    for q in 0..2 {
                        for r in 0..2 {
                            let cov = m[(0, q)] * m[(0, r)] + if q == r { v[(0, q)] } else { 0.0 };
                            acc += z[(a, q)] * kern.alpha()[q] * cov * kern.alpha()[r] * z[(b, r)];
                        }
                    }
                    expected[(a, b)] += acc;
                }
            }
        }
        assert_relative_eq!(psi.psi2, expected, epsilon = 1e-12);
        assert_relative_eq!(
            psi.psi0[0],
            0.7 * 0.9 * (0.25 + 0.1) + 1.3 * 0.4 * (1.0 + 0.2),
            epsilon = 1e-12
        );
    }

    #[test]
    fn shared_variance_reports_broadcast_sensitivity() {
        let kern = LinearArd::shared(3, 2.0).unwrap();
        assert!(!kern.is_ard());
        assert_eq!(kern.name(), "linear");
        assert_eq!(kern.num_params(), 1);
        assert_eq!(kern.input_sensitivity(), DVec::from_element(3, 2.0));
    }

    #[test]
    fn mismatched_inducing_inputs_are_rejected() {
        let kern = LinearArd::new(DVec::from_vec(vec![1.0, 1.0])).unwrap();
        let err = kern.k_mm(&Mat::zeros(4, 3)).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<LentilError>(),
            Some(LentilError::DimensionMismatch { .. })
        ));
    }
}
