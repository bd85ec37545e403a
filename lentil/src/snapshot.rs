use crate::common::*;
use crate::error::check_dim;
use crate::inference::{BoundTerms, InferenceMethod};
use crate::kernel::Kernel;
use crate::likelihood::GaussianNoise;
use crate::model::{ModelCore, SessionState, SsGplvm};

use matrix_util::common_io::{mkdir_parent, open_buf_reader, open_buf_writer};
use serde::{Deserialize, Serialize};
use std::io::Write;

/// A dense matrix in column-major order
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct MatData {
    pub nrows: usize,
    pub ncols: usize,
    pub data: Vec<f64>,
}

impl From<&Mat> for MatData {
    fn from(m: &Mat) -> Self {
        Self {
            nrows: m.nrows(),
            ncols: m.ncols(),
            data: m.as_slice().to_vec(),
        }
    }
}

impl MatData {
    pub fn to_mat(&self) -> anyhow::Result<Mat> {
        check_dim("matrix entries", self.nrows * self.ncols, self.data.len())?;
        Ok(Mat::from_column_slice(self.nrows, self.ncols, &self.data))
    }
}

/// Everything needed to rebuild a fitted model in another process.
/// Worker-group state is not part of it.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ModelSnapshot {
    pub observations: MatData,
    pub mean: MatData,
    pub variance: MatData,
    pub binary_prob: MatData,
    pub group_spike: bool,
    pub pi: Vec<f64>,
    pub slab_variance: f64,
    pub learn_pi: bool,
    pub inducing_inputs: MatData,
    pub kernel: String,
    pub kernel_params: Vec<f64>,
    pub noise_variance: f64,
    pub evidence: f64,
}

impl ModelSnapshot {
    pub fn save_json(&self, file_path: &str) -> anyhow::Result<()> {
        mkdir_parent(file_path)?;
        let mut writer = open_buf_writer(file_path)?;
        serde_json::to_writer_pretty(&mut writer, self)?;
        writer.flush()?;
        info!("saved model snapshot: {}", file_path);
        Ok(())
    }

    pub fn load_json(file_path: &str) -> anyhow::Result<Self> {
        let reader = open_buf_reader(file_path)?;
        Ok(serde_json::from_reader(reader)?)
    }
}

impl SsGplvm {
    pub fn snapshot(&self) -> ModelSnapshot {
        let core = &self.core;
        ModelSnapshot {
            observations: (&core.y).into(),
            mean: core.posterior.mean().into(),
            variance: core.posterior.variance().into(),
            binary_prob: core.posterior.binary_prob().into(),
            group_spike: core.posterior.group_spike(),
            pi: core.prior.pi().iter().cloned().collect(),
            slab_variance: core.prior.slab_variance(),
            learn_pi: core.prior.learn_pi(),
            inducing_inputs: (&core.z).into(),
            kernel: core.kernel.name().to_string(),
            kernel_params: core.kernel.params(),
            noise_variance: core.likelihood.variance(),
            evidence: self.evidence(),
        }
    }

    /// Rebuild a single-process model from `snapshot`.
    ///
    /// `kernel` must be of the kind recorded in the snapshot; its
    /// hyperparameters are overwritten.
    pub fn restore(
        snapshot: &ModelSnapshot,
        mut kernel: Box<dyn Kernel>,
        inference: Box<dyn InferenceMethod>,
    ) -> anyhow::Result<Self> {
        if kernel.name() != snapshot.kernel {
            anyhow::bail!(
                "snapshot holds a {} kernel, not {}",
                snapshot.kernel,
                kernel.name()
            );
        }
        kernel.set_params(&snapshot.kernel_params)?;
        kernel.set_group_spike(snapshot.group_spike);

        let posterior = SpikeSlabPosterior::new(
            snapshot.mean.to_mat()?,
            snapshot.variance.to_mat()?,
            snapshot.binary_prob.to_mat()?,
            snapshot.group_spike,
        )?;

        let mut prior = SpikeSlabPrior::new(DVec::from_column_slice(&snapshot.pi))?
            .with_slab_variance(snapshot.slab_variance)?;
        prior.set_group_spike(snapshot.group_spike);
        prior.set_learn_pi(snapshot.learn_pi);

        let y = snapshot.observations.to_mat()?;
        check_dim("rows of Y vs. q(X)", posterior.nrows(), y.nrows())?;

        let mut model = SsGplvm {
            core: ModelCore {
                y,
                posterior,
                prior,
                kernel,
                z: snapshot.inducing_inputs.to_mat()?,
                likelihood: GaussianNoise::new(snapshot.noise_variance)?,
            },
            inference,
            session: None,
            terms: BoundTerms {
                data_fit: 0.0,
                kl: 0.0,
            },
        };
        model.refresh()?;
        Ok(model)
    }

    /// Recompute the bound without touching any worker group
    pub fn refresh(&mut self) -> anyhow::Result<()> {
        self.parameters_changed(SessionState::Idle)
    }
}
