use crate::common::*;
use crate::error::check_dim;
use crate::kernel::PsiStatistics;
use crate::model::ModelCore;
use crate::sync::Shard;
use nalgebra::Cholesky;
use rayon::prelude::*;

/// Gradients of the data evidence w.r.t. the kernel expectations, the
/// inducing covariance and the noise variance
#[derive(Debug, Clone)]
pub struct GradDict {
    pub dl_dpsi0: DVec,
    pub dl_dpsi1: Mat,
    pub dl_dpsi2: Mat,
    pub dl_dkmm: Mat,
    pub dl_dnoise: f64,
}

/// The two parts of the bound: `evidence = data_fit - kl`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundTerms {
    pub data_fit: f64,
    pub kl: f64,
}

impl BoundTerms {
    pub fn evidence(&self) -> f64 {
        self.data_fit - self.kl
    }
}

/// An evidence engine.
///
/// Engines with `computes_own_kl() == false` only provide the data
/// part of the bound through `inference`; the caller subtracts the KL
/// and chains the gradients. The others evaluate the full bound in
/// `update_gradients` and write every gradient themselves.
pub trait InferenceMethod: Send {
    fn name(&self) -> &'static str;

    fn computes_own_kl(&self) -> bool;

    fn inference(&self, core: &ModelCore) -> anyhow::Result<(f64, GradDict)>;

    fn update_gradients(
        &self,
        _core: &mut ModelCore,
        _shard: Option<Shard<'_>>,
    ) -> anyhow::Result<BoundTerms> {
        anyhow::bail!("{} leaves the KL correction to the caller", self.name())
    }

    fn boxed_clone(&self) -> Box<dyn InferenceMethod>;
}

/// Row-additive statistics of the collapsed bound
#[derive(Debug, Clone)]
struct SuffStats {
    nrows: f64,
    /// `tr(Y'Y)`
    yy: f64,
    /// `sum_n psi0[n]`
    psi0: f64,
    psi2: Mat,
    /// `psi1' Y`
    psi1_y: Mat,
}

impl SuffStats {
    fn zeros(mm: usize, dd: usize) -> Self {
        Self {
            nrows: 0.0,
            yy: 0.0,
            psi0: 0.0,
            psi2: Mat::zeros(mm, mm),
            psi1_y: Mat::zeros(mm, dd),
        }
    }

    fn from_rows(psi: &PsiStatistics, y: &Mat) -> Self {
        Self {
            nrows: y.nrows() as f64,
            yy: y.norm_squared(),
            psi0: psi.psi0.sum(),
            psi2: psi.psi2.clone(),
            psi1_y: psi.psi1.transpose() * y,
        }
    }

    fn add(&mut self, other: &Self) {
        self.nrows += other.nrows;
        self.yy += other.yy;
        self.psi0 += other.psi0;
        self.psi2 += &other.psi2;
        self.psi1_y += &other.psi1_y;
    }

    fn to_flat(&self) -> Vec<f64> {
        let mut ret = vec![self.nrows, self.yy, self.psi0];
        ret.extend_from_slice(self.psi2.as_slice());
        ret.extend_from_slice(self.psi1_y.as_slice());
        ret
    }

    fn load_flat(&mut self, flat: &[f64]) -> anyhow::Result<()> {
        let n2 = self.psi2.len();
        let n1 = self.psi1_y.len();
        check_dim("reduced statistics", 3 + n2 + n1, flat.len())?;
        self.nrows = flat[0];
        self.yy = flat[1];
        self.psi0 = flat[2];
        self.psi2.copy_from_slice(&flat[3..3 + n2]);
        self.psi1_y.copy_from_slice(&flat[3 + n2..]);
        Ok(())
    }
}

/// Titsias' collapsed bound and its gradients, given the statistics
/// summed over all rows
struct CollapsedBound {
    value: f64,
    beta: f64,
    dl_dpsi0: f64,
    dl_dpsi2: Mat,
    dl_dkmm: Mat,
    dl_dnoise: f64,
    /// `(Kmm + beta psi2)^{-1} psi1' Y`
    ainv_p: Mat,
}

impl CollapsedBound {
    /// `beta^2 Y (A^{-1} P)'` for the rows in `y`
    fn dl_dpsi1(&self, y: &Mat) -> Mat {
        y * self.ainv_p.transpose() * (self.beta * self.beta)
    }

    fn grad_dict(&self, y: &Mat) -> GradDict {
        GradDict {
            dl_dpsi0: DVec::from_element(y.nrows(), self.dl_dpsi0),
            dl_dpsi1: self.dl_dpsi1(y),
            dl_dpsi2: self.dl_dpsi2.clone(),
            dl_dkmm: self.dl_dkmm.clone(),
            dl_dnoise: self.dl_dnoise,
        }
    }
}

fn inverse_logdet(a: &Mat, what: &str) -> anyhow::Result<(Mat, f64)> {
    let chol = Cholesky::new(a.clone())
        .ok_or_else(|| LentilError::Numerical(format!("{} is not positive definite", what)))?;
    let logdet = 2.0 * chol.l().diagonal().iter().map(|x| x.ln()).sum::<f64>();
    Ok((chol.inverse(), logdet))
}

fn collapsed_bound(
    stats: &SuffStats,
    kmm: &Mat,
    noise_variance: f64,
    out_dim: usize,
) -> anyhow::Result<CollapsedBound> {
    let mm = kmm.nrows();
    let nn = stats.nrows;
    let dd = out_dim as f64;
    let beta = 1.0 / noise_variance;
    let beta2 = beta * beta;

    let mut k = kmm.clone();
    for i in 0..mm {
        k[(i, i)] += DEFAULT_JITTER;
    }
    let (k_inv, logdet_k) = inverse_logdet(&k, "Kmm")?;
    let a = &k + &stats.psi2 * beta;
    let (a_inv, logdet_a) = inverse_logdet(&a, "Kmm + beta * psi2")?;

    let p = &stats.psi1_y;
    let ainv_p = &a_inv * p;
    let tr_pap = p.dot(&ainv_p);
    let kinv_psi2 = &k_inv * &stats.psi2;
    let tr_kinv_psi2 = kinv_psi2.trace();
    let tr_ainv_psi2 = (&a_inv * &stats.psi2).trace();
    let tr_papsi2ap = ainv_p.dot(&(&stats.psi2 * &ainv_p));

    let value = -0.5 * nn * dd * (2.0 * std::f64::consts::PI).ln() + 0.5 * nn * dd * beta.ln()
        - 0.5 * beta * stats.yy
        - 0.5 * dd * beta * stats.psi0
        + 0.5 * dd * beta * tr_kinv_psi2
        + 0.5 * dd * logdet_k
        - 0.5 * dd * logdet_a
        + 0.5 * beta2 * tr_pap;

    if !value.is_finite() {
        return Err(LentilError::Numerical(format!("collapsed bound is {}", value)).into());
    }

    // A^{-1} P P' A^{-1}
    let e = &ainv_p * ainv_p.transpose();
    let k_minus_a = &k_inv - &a_inv;

    let dl_dpsi2 = &k_minus_a * (0.5 * dd * beta) - &e * (0.5 * beta2 * beta);
    let dl_dkmm =
        &k_minus_a * (0.5 * dd) - kinv_psi2 * &k_inv * (0.5 * dd * beta) - &e * (0.5 * beta2);

    let dl_dbeta = 0.5 * nn * dd / beta - 0.5 * stats.yy - 0.5 * dd * stats.psi0
        + 0.5 * dd * tr_kinv_psi2
        - 0.5 * dd * tr_ainv_psi2
        + beta * tr_pap
        - 0.5 * beta2 * tr_papsi2ap;

    Ok(CollapsedBound {
        value,
        beta,
        dl_dpsi0: -0.5 * dd * beta,
        dl_dpsi2,
        dl_dkmm,
        dl_dnoise: -beta2 * dl_dbeta,
        ainv_p,
    })
}

/// Sparse variational bound with a Gaussian likelihood, evaluated on
/// all rows at once
#[derive(Debug, Clone, Default)]
pub struct VarDtc;

impl InferenceMethod for VarDtc {
    fn name(&self) -> &'static str {
        "var_dtc"
    }

    fn computes_own_kl(&self) -> bool {
        false
    }

    fn inference(&self, core: &ModelCore) -> anyhow::Result<(f64, GradDict)> {
        check_dim("rows of Y vs. q(X)", core.posterior.nrows(), core.y.nrows())?;
        let psi = core.kernel.psi_statistics(&core.posterior, &core.z)?;
        let kmm = core.kernel.k_mm(&core.z)?;
        let stats = SuffStats::from_rows(&psi, &core.y);
        let bound = collapsed_bound(&stats, &kmm, core.likelihood.variance(), core.y.ncols())?;
        Ok((bound.value, bound.grad_dict(&core.y)))
    }

    fn boxed_clone(&self) -> Box<dyn InferenceMethod> {
        Box::new(self.clone())
    }
}

/// The same bound built from row batches.
///
/// Statistics are accumulated batch by batch, so memory scales with
/// the batch rather than the data. Given a [`Shard`], each worker only
/// visits its own rows and the collectives make the result global.
#[derive(Debug, Clone)]
pub struct VarDtcMinibatch {
    pub batch_size: usize,
}

impl Default for VarDtcMinibatch {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

struct BatchGradients {
    start: usize,
    mean: Mat,
    variance: Mat,
    binary_prob: Mat,
    kl: f64,
    hyper: Vec<f64>,
    pi: DVec,
}

impl VarDtcMinibatch {
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch_size: batch_size.max(1),
        }
    }

    fn batches(&self, nrows: usize) -> Vec<(usize, usize)> {
        let size = self.batch_size.max(1);
        (0..nrows)
            .step_by(size)
            .map(|lb| (lb, (lb + size).min(nrows)))
            .collect()
    }

    /// Statistics of rows `offset + lb .. offset + ub` for each batch,
    /// summed in batch order
    fn local_statistics(
        &self,
        core: &ModelCore,
        offset: usize,
        y_local: &Mat,
    ) -> anyhow::Result<SuffStats> {
        let kernel = core.kernel.as_ref();
        let parts = self
            .batches(y_local.nrows())
            .into_par_iter()
            .map(|(lb, ub)| -> anyhow::Result<SuffStats> {
                let qx = core.posterior.rows(offset + lb, offset + ub)?;
                let psi = kernel.psi_statistics(&qx, &core.z)?;
                let y = y_local.rows(lb, ub - lb).into_owned();
                Ok(SuffStats::from_rows(&psi, &y))
            })
            .collect::<anyhow::Result<Vec<_>>>()?;

        let mut stats = SuffStats::zeros(core.z.nrows(), y_local.ncols());
        parts.iter().for_each(|s| stats.add(s));
        Ok(stats)
    }
}

impl InferenceMethod for VarDtcMinibatch {
    fn name(&self) -> &'static str {
        "var_dtc_minibatch"
    }

    fn computes_own_kl(&self) -> bool {
        true
    }

    fn inference(&self, core: &ModelCore) -> anyhow::Result<(f64, GradDict)> {
        check_dim("rows of Y vs. q(X)", core.posterior.nrows(), core.y.nrows())?;
        let stats = self.local_statistics(core, 0, &core.y)?;
        let kmm = core.kernel.k_mm(&core.z)?;
        let bound = collapsed_bound(&stats, &kmm, core.likelihood.variance(), core.y.ncols())?;
        Ok((bound.value, bound.grad_dict(&core.y)))
    }

    fn update_gradients(
        &self,
        core: &mut ModelCore,
        shard: Option<Shard<'_>>,
    ) -> anyhow::Result<BoundTerms> {
        let (offset, y_local) = match &shard {
            Some(s) => {
                check_dim("rows of local Y", s.partition.len(), s.y_local.nrows())?;
                (s.partition.start, s.y_local)
            }
            None => (0, &core.y),
        };
        check_dim("rows of Y vs. q(X)", core.posterior.nrows(), core.y.nrows())?;
        if offset + y_local.nrows() > core.posterior.nrows() {
            return Err(LentilError::DimensionMismatch {
                what: "end of local rows",
                expected: core.posterior.nrows(),
                actual: offset + y_local.nrows(),
            }
            .into());
        }

        let kk = core.posterior.ncols();
        let nlocal = y_local.nrows();

        let mut stats = self.local_statistics(core, offset, y_local)?;
        if let Some(s) = &shard {
            let mut flat = stats.to_flat();
            s.comm.allreduce_sum(&mut flat)?;
            stats.load_flat(&flat)?;
        }

        let kmm = core.kernel.k_mm(&core.z)?;
        let bound = collapsed_bound(&stats, &kmm, core.likelihood.variance(), core.y.ncols())?;

        let (kernel, prior, posterior, z) =
            (core.kernel.as_ref(), &core.prior, &core.posterior, &core.z);

        let batch_grads = self
            .batches(nlocal)
            .into_par_iter()
            .map(|(lb, ub)| -> anyhow::Result<BatchGradients> {
                let mut qx = posterior.rows(offset + lb, offset + ub)?;
                let y = y_local.rows(lb, ub - lb).into_owned();
                let grad = bound.grad_dict(&y);

                let (d_mean, d_var, d_gamma) = kernel.expectation_gradients(&qx, z, &grad)?;
                let hyper = kernel.hyper_gradients_expectations(&qx, z, &grad)?;
                qx.set_gradients(d_mean, d_var, d_gamma)?;

                let kl = prior.kl_divergence(&qx)?;
                prior.update_gradients_kl(&mut qx)?;
                let pi = if prior.learn_pi() {
                    prior.pi_gradient(&qx)?
                } else {
                    DVec::zeros(prior.dim())
                };

                let (mean, variance, binary_prob) = qx.gradient_matrices();
                Ok(BatchGradients {
                    start: lb,
                    mean: mean.clone(),
                    variance: variance.clone(),
                    binary_prob: binary_prob.clone(),
                    kl,
                    hyper,
                    pi,
                })
            })
            .collect::<anyhow::Result<Vec<_>>>()?;

        let num_hyper = kernel.num_params();
        let mut local_mean = Mat::zeros(nlocal, kk);
        let mut local_var = Mat::zeros(nlocal, kk);
        let mut local_gamma = Mat::zeros(nlocal, kk);

        // [kl, kernel..., pi...]
        let mut reduced = vec![0.0; 1 + num_hyper + prior.dim()];
        for b in batch_grads.iter() {
            let nb = b.mean.nrows();
            local_mean.rows_mut(b.start, nb).copy_from(&b.mean);
            local_var.rows_mut(b.start, nb).copy_from(&b.variance);
            local_gamma.rows_mut(b.start, nb).copy_from(&b.binary_prob);

            check_dim("kernel gradient", num_hyper, b.hyper.len())?;
            reduced[0] += b.kl;
            for (r, h) in reduced[1..=num_hyper].iter_mut().zip(b.hyper.iter()) {
                *r += h;
            }
            for (r, p) in reduced[1 + num_hyper..].iter_mut().zip(b.pi.iter()) {
                *r += p;
            }
        }

        let kmm_hyper = kernel.hyper_gradients_kmm(&bound.dl_dkmm, z)?;

        match &shard {
            Some(s) => {
                s.comm.allreduce_sum(&mut reduced)?;

                let mut local = Vec::with_capacity(3 * nlocal * kk);
                local.extend_from_slice(local_mean.as_slice());
                local.extend_from_slice(local_var.as_slice());
                local.extend_from_slice(local_gamma.as_slice());
                let blocks = s.comm.allgather(&local)?;
                check_dim("gathered gradient blocks", s.partition.table.len(), blocks.len())?;

                for (&(start, end), block) in s.partition.table.iter().zip(blocks.iter()) {
                    let len = (end - start) * kk;
                    check_dim("gathered gradient block", 3 * len, block.len())?;
                    let rows = end - start;
                    let mean = Mat::from_column_slice(rows, kk, &block[..len]);
                    let var = Mat::from_column_slice(rows, kk, &block[len..2 * len]);
                    let gamma = Mat::from_column_slice(rows, kk, &block[2 * len..]);
                    core.posterior.set_row_gradients(start, &mean, &var, &gamma)?;
                }
            }
            None => {
                core.posterior.set_gradients(local_mean, local_var, local_gamma)?;
            }
        }

        let kl = reduced[0];
        let hyper: Vec<f64> = reduced[1..=num_hyper]
            .iter()
            .zip(kmm_hyper.iter())
            .map(|(a, b)| a + b)
            .collect();
        core.kernel.set_hyper_gradients(hyper)?;

        if core.prior.learn_pi() {
            let pi_grad = DVec::from_column_slice(&reduced[1 + num_hyper..]);
            core.prior.set_pi_gradient(pi_grad)?;
        } else {
            core.prior.reset_pi_gradient();
        }
        core.likelihood.set_gradient(bound.dl_dnoise);

        Ok(BoundTerms {
            data_fit: bound.value,
            kl,
        })
    }

    fn boxed_clone(&self) -> Box<dyn InferenceMethod> {
        Box::new(self.clone())
    }
}
