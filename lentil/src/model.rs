use crate::common::*;
use crate::error::check_dim;
use crate::inference::{BoundTerms, InferenceMethod, VarDtc, VarDtcMinibatch};
use crate::init::{initialize_latent, InitMethod};
use crate::kernel::{Kernel, LinearArd};
use crate::likelihood::GaussianNoise;
use crate::optimize::{Objective, Optimizer};
use crate::sync::*;

use matrix_util::traits::SampleOps;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use std::sync::Arc;

/// lower bound on initial posterior variances
const MIN_INIT_VARIANCE: f64 = 1e-6;

#[derive(Debug, Clone)]
pub struct SsGplvmOptions {
    /// Number of latent dimensions. Default: 2
    pub input_dim: usize,
    /// Number of inducing inputs, capped by the number of rows. Default: 10
    pub num_inducing: usize,
    /// Latent initialisation. Default: PCA
    pub init: InitMethod,
    /// Share one inclusion probability across the dimensions of a row.
    /// Default: false
    pub group_spike: bool,
    /// Optimise the prior inclusion probabilities. Default: false
    pub learn_pi: bool,
    /// Prior inclusion probability per latent dimension. Default: 0.5
    pub pi: Option<Vec<f64>>,
    /// Variance of the slab component. Default: 1.0
    pub slab_variance: f64,
    /// Initial posterior variances are drawn from `U(0, x_variance_max)`.
    /// Default: 0.1
    pub x_variance_max: f64,
    /// Initial Gaussian noise variance. Default: 1.0
    pub noise_variance: f64,
    /// Rows per batch for the minibatch engine. Default: 256
    pub batch_size: usize,
    /// Random seed. Default: 42
    pub seed: u64,
}

impl Default for SsGplvmOptions {
    fn default() -> Self {
        SsGplvmOptions {
            input_dim: 2,
            num_inducing: DEFAULT_NUM_INDUCING,
            init: InitMethod::Pca,
            group_spike: false,
            learn_pi: false,
            pi: None,
            slab_variance: 1.0,
            x_variance_max: 0.1,
            noise_variance: 1.0,
            batch_size: DEFAULT_BATCH_SIZE,
            seed: 42,
        }
    }
}

/// Whether a parameter write belongs to a distributed optimisation.
///
/// Only `Optimizing` writes are forwarded to other workers and let the
/// evidence engine use collectives; `Idle` writes stay local.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Optimizing,
}

/// Everything an evidence engine reads and writes gradients into
pub struct ModelCore {
    pub y: Mat,
    pub posterior: SpikeSlabPosterior,
    pub prior: SpikeSlabPrior,
    pub kernel: Box<dyn Kernel>,
    /// inducing inputs, `M x Q`
    pub z: Mat,
    pub likelihood: GaussianNoise,
}

/// Optional pieces supplied instead of the defaults
#[derive(Default)]
pub struct ModelInputs {
    pub x: Option<Mat>,
    pub x_variance: Option<Mat>,
    pub z: Option<Mat>,
    pub kernel: Option<Box<dyn Kernel>>,
    pub inference: Option<Box<dyn InferenceMethod>>,
    pub comm: Option<Box<dyn Communicator>>,
}

/// Bayesian GPLVM with a spike-and-slab prior over the latent space.
///
/// The parameter vector seen by an optimizer is the concatenation of
/// the posterior, prior, kernel and noise parameters, in that order;
/// [`SsGplvm::gradients`] follows the same layout.
pub struct SsGplvm {
    pub(crate) core: ModelCore,
    pub(crate) inference: Box<dyn InferenceMethod>,
    pub(crate) session: Option<DistributedSession>,
    pub(crate) terms: BoundTerms,
}

impl SsGplvm {
    pub fn new(y: Mat, options: &SsGplvmOptions) -> anyhow::Result<Self> {
        Self::build(y, options, ModelInputs::default())
    }

    pub fn build(y: Mat, options: &SsGplvmOptions, inputs: ModelInputs) -> anyhow::Result<Self> {
        let ModelInputs {
            x,
            x_variance,
            z,
            kernel,
            inference,
            comm,
        } = inputs;

        let (nn, dd) = y.shape();
        let kk = options.input_dim;
        if nn == 0 || dd == 0 {
            anyhow::bail!("empty observations: {} x {}", nn, dd);
        }

        let mut rng = StdRng::seed_from_u64(options.seed);

        let (x, fracs) = match x {
            Some(x) => {
                check_dim("rows of X", nn, x.nrows())?;
                check_dim("columns of X", kk, x.ncols())?;
                (x, DVec::from_element(kk, 1.0))
            }
            None => initialize_latent(options.init, kk, &y, &mut rng)?,
        };

        let x_variance = match x_variance {
            Some(v) => v,
            None => Mat::runif_rng(nn, kk, 0.0, options.x_variance_max, &mut rng)?
                .map(|v| v.max(MIN_INIT_VARIANCE)),
        };

        let gamma = Mat::from_fn(nn, kk, |_, _| {
            0.5 + 0.1 * rng.sample::<f64, _>(StandardNormal)
        });

        let z = match z {
            Some(z) => z,
            None => {
                let mm = options.num_inducing.min(nn);
                let mut rows: Vec<usize> = (0..nn).collect();
                rows.shuffle(&mut rng);
                Mat::from_fn(mm, kk, |i, q| x[(rows[i], q)])
            }
        };
        check_dim("columns of Z", kk, z.ncols())?;
        if z.nrows() == 0 {
            anyhow::bail!("need at least one inducing input");
        }

        let posterior = SpikeSlabPosterior::new(x, x_variance, gamma, options.group_spike)?;

        let pi = match &options.pi {
            Some(pi) => {
                check_dim("prior inclusion probabilities", kk, pi.len())?;
                DVec::from_column_slice(pi)
            }
            None => DVec::from_element(kk, 0.5),
        };
        let mut prior = SpikeSlabPrior::new(pi)?.with_slab_variance(options.slab_variance)?;
        prior.set_group_spike(options.group_spike);
        prior.set_learn_pi(options.learn_pi);

        let mut kernel = match kernel {
            Some(kernel) => kernel,
            None => Box::new(LinearArd::new(fracs)?) as Box<dyn Kernel>,
        };
        check_dim("kernel input dimensions", kk, kernel.input_dim())?;
        kernel.set_group_spike(options.group_spike);

        let likelihood = GaussianNoise::new(options.noise_variance)?;

        let inference = inference.unwrap_or_else(|| {
            if comm.is_some() {
                Box::new(VarDtcMinibatch::new(options.batch_size)) as Box<dyn InferenceMethod>
            } else {
                Box::new(VarDtc)
            }
        });

        info!(
            "SS-GPLVM: {} x {} observations, {} latent dimensions, {} inducing inputs, {} kernel, {} engine",
            nn,
            dd,
            kk,
            z.nrows(),
            kernel.name(),
            inference.name()
        );

        let mut model = SsGplvm {
            core: ModelCore {
                y,
                posterior,
                prior,
                kernel,
                z,
                likelihood,
            },
            inference,
            session: None,
            terms: BoundTerms {
                data_fit: 0.0,
                kl: 0.0,
            },
        };

        match comm {
            Some(comm) => model.attach_comm(comm)?,
            None => model.parameters_changed(SessionState::Idle)?,
        }
        Ok(model)
    }

    /// Join a group of workers: take rank 0's inducing inputs and
    /// parameters and own a block of rows from now on
    pub fn attach_comm(&mut self, comm: Box<dyn Communicator>) -> anyhow::Result<()> {
        let comm: Arc<dyn Communicator> = Arc::from(comm);
        self.take_root_inducing_inputs(comm.as_ref())?;

        let session = DistributedSession::new(comm, &self.core.y)?;
        let mut theta = self.parameters();
        session.comm.broadcast(&mut theta, ROOT_RANK)?;
        self.session = Some(session);
        self.write_parameters(&theta)?;
        self.parameters_changed(SessionState::Idle)
    }

    /// `Z` is not part of the parameter vector, so it travels once, with
    /// rank 0's row count: `[rows of Y, rows of Z, Z...]`
    fn take_root_inducing_inputs(&mut self, comm: &dyn Communicator) -> anyhow::Result<()> {
        let core = &mut self.core;
        let mut payload = vec![core.y.nrows() as f64, core.z.nrows() as f64];
        payload.extend_from_slice(core.z.as_slice());
        comm.broadcast(&mut payload, ROOT_RANK)?;

        if comm.rank() == ROOT_RANK {
            return Ok(());
        }
        if payload.len() < 2 {
            return Err(LentilError::Transport(format!(
                "worker {} got a truncated header for Z",
                comm.rank()
            ))
            .into());
        }
        let (nn, mm) = (payload[0] as usize, payload[1] as usize);
        check_dim("rows of Y on rank 0", nn, core.y.nrows())?;
        let kk = core.posterior.ncols();
        check_dim("entries of Z from rank 0", mm * kk, payload.len() - 2)?;
        core.z = Mat::from_column_slice(mm, kk, &payload[2..]);
        Ok(())
    }

    pub fn num_params(&self) -> usize {
        let core = &self.core;
        core.posterior.num_params()
            + core.prior.num_params()
            + core.kernel.num_params()
            + core.likelihood.num_params()
    }

    /// `[posterior | prior | kernel | noise]` in unconstrained space
    pub fn parameters(&self) -> Vec<f64> {
        let core = &self.core;
        let mut ret = core.posterior.params();
        ret.extend(core.prior.params());
        ret.extend(core.kernel.params());
        ret.extend(core.likelihood.params());
        ret
    }

    /// Gradient of the evidence, laid out like [`SsGplvm::parameters`]
    pub fn gradients(&self) -> Vec<f64> {
        let core = &self.core;
        let mut ret = core.posterior.gradients();
        ret.extend(core.prior.gradients());
        ret.extend(core.kernel.gradients());
        ret.extend(core.likelihood.gradients());
        ret
    }

    /// Write `theta` and recompute the evidence and gradients.
    ///
    /// Under `Optimizing`, rank 0 first forwards `theta` to the other
    /// workers, which must be inside [`SsGplvm::optimize`].
    pub fn set_parameters(&mut self, theta: &[f64], state: SessionState) -> anyhow::Result<()> {
        check_dim("parameter vector", self.num_params(), theta.len())?;
        if state == SessionState::Optimizing {
            if let Some(session) = self.session.as_ref().filter(|s| s.is_root()) {
                broadcast_update(session.comm.as_ref(), theta)?;
            }
        }
        self.write_parameters(theta)?;
        self.parameters_changed(state)
    }

    fn write_parameters(&mut self, theta: &[f64]) -> anyhow::Result<()> {
        check_dim("parameter vector", self.num_params(), theta.len())?;
        let core = &mut self.core;
        let (head, rest) = theta.split_at(core.posterior.num_params());
        core.posterior.set_params(head)?;
        let (head, rest) = rest.split_at(core.prior.num_params());
        core.prior.set_params(head)?;
        let (head, rest) = rest.split_at(core.kernel.num_params());
        core.kernel.set_params(head)?;
        core.likelihood.set_params(rest)?;
        Ok(())
    }

    /// Recompute the bound and every gradient from the current
    /// parameters
    pub(crate) fn parameters_changed(&mut self, state: SessionState) -> anyhow::Result<()> {
        let shard = match (state, &self.session) {
            (SessionState::Optimizing, Some(session)) => Some(session.shard()),
            _ => None,
        };

        let terms = if self.inference.computes_own_kl() {
            self.inference.update_gradients(&mut self.core, shard)?
        } else {
            let core = &mut self.core;
            let (data_fit, grad) = self.inference.inference(core)?;
            let kl = core.prior.kl_divergence(&core.posterior)?;

            // kernel expectations first, then the KL on top
            let (d_mean, d_var, d_gamma) = core
                .kernel
                .expectation_gradients(&core.posterior, &core.z, &grad)?;
            core.posterior.set_gradients(d_mean, d_var, d_gamma)?;
            core.prior.update_gradients_kl(&mut core.posterior)?;

            if core.prior.learn_pi() {
                let pi_grad = core.prior.pi_gradient(&core.posterior)?;
                core.prior.set_pi_gradient(pi_grad)?;
            } else {
                core.prior.reset_pi_gradient();
            }

            let mut hyper = core
                .kernel
                .hyper_gradients_expectations(&core.posterior, &core.z, &grad)?;
            let kmm_hyper = core.kernel.hyper_gradients_kmm(&grad.dl_dkmm, &core.z)?;
            hyper.iter_mut().zip(kmm_hyper).for_each(|(a, b)| *a += b);
            core.kernel.set_hyper_gradients(hyper)?;
            core.likelihood.set_gradient(grad.dl_dnoise);

            BoundTerms { data_fit, kl }
        };

        if !terms.evidence().is_finite() {
            return Err(LentilError::Numerical(format!(
                "evidence is not finite: data fit {}, KL {}",
                terms.data_fit, terms.kl
            ))
            .into());
        }
        debug!(
            "evidence {} = {} - {}",
            terms.evidence(),
            terms.data_fit,
            terms.kl
        );
        self.terms = terms;
        Ok(())
    }

    /// Maximise the evidence.
    ///
    /// Without a communicator, or on rank 0, `optimizer` runs here and
    /// the best parameters found are kept. Rank 0 then releases the
    /// other workers, which meanwhile mirror its every update.
    pub fn optimize(&mut self, optimizer: &mut dyn Optimizer) -> anyhow::Result<()> {
        let comm = self.session.as_ref().map(|s| Arc::clone(&s.comm));

        if let Some(comm) = comm.as_ref().filter(|c| c.rank() != ROOT_RANK) {
            let updates = follow(comm.as_ref(), self)?;
            info!("worker {} mirrored {} updates", comm.rank(), updates);
            return Ok(());
        }

        let start = self.parameters();
        let best = optimizer.optimize(&mut NegativeEvidence { model: self }, start);
        let result = best.and_then(|best| self.set_parameters(&best, SessionState::Optimizing));

        if let Some(comm) = comm {
            let stopped = broadcast_stop(comm.as_ref());
            result?;
            stopped?;
        } else {
            result?;
        }

        info!(
            "evidence after optimisation: {} (KL {})",
            self.evidence(),
            self.kl()
        );
        Ok(())
    }

    /// `data_evidence() - kl()`
    pub fn evidence(&self) -> f64 {
        self.terms.evidence()
    }

    /// The sparse GP part of the bound
    pub fn data_evidence(&self) -> f64 {
        self.terms.data_fit
    }

    /// `KL(q(X) || p(X))`
    pub fn kl(&self) -> f64 {
        self.terms.kl
    }

    /// Relevance of each latent dimension: the kernel's ARD weights, or
    /// the prior inclusion probabilities for a kernel without ARD
    pub fn input_sensitivity(&self) -> DVec {
        if self.core.kernel.is_ard() {
            self.core.kernel.input_sensitivity()
        } else {
            self.core.prior.pi().clone()
        }
    }

    /// `E[x] = gamma * mu`
    pub fn latent_mean(&self) -> Mat {
        self.core.posterior.expected_latent()
    }

    pub fn posterior(&self) -> &SpikeSlabPosterior {
        &self.core.posterior
    }

    pub fn prior(&self) -> &SpikeSlabPrior {
        &self.core.prior
    }

    pub fn kernel(&self) -> &dyn Kernel {
        self.core.kernel.as_ref()
    }

    pub fn likelihood(&self) -> &GaussianNoise {
        &self.core.likelihood
    }

    pub fn inducing_inputs(&self) -> &Mat {
        &self.core.z
    }

    pub fn observations(&self) -> &Mat {
        &self.core.y
    }

    pub fn inference_method(&self) -> &dyn InferenceMethod {
        self.inference.as_ref()
    }

    /// Rank within the worker group; 0 when running alone
    pub fn rank(&self) -> usize {
        self.session.as_ref().map_or(ROOT_RANK, |s| s.comm.rank())
    }

    pub fn partition(&self) -> Option<&RowPartition> {
        self.session.as_ref().map(|s| &s.partition)
    }
}

impl Replica for SsGplvm {
    fn apply_parameters(&mut self, theta: &[f64]) -> anyhow::Result<()> {
        self.write_parameters(theta)?;
        self.parameters_changed(SessionState::Optimizing)
    }
}

struct NegativeEvidence<'a> {
    model: &'a mut SsGplvm,
}

impl Objective for NegativeEvidence<'_> {
    fn evaluate(&mut self, theta: &[f64]) -> anyhow::Result<(f64, Vec<f64>)> {
        self.model.set_parameters(theta, SessionState::Optimizing)?;
        let grad = self.model.gradients().iter().map(|g| -g).collect();
        Ok((-self.model.evidence(), grad))
    }
}
