use crate::spike_slab_posterior::SpikeSlabPosterior;
use log::info;
use matrix_util::traits::IoOps;

/// consolidated output
pub trait ParamIo {
    /// Write posterior statistics into `{header}.{stat}.tsv.gz` files
    fn to_tsv(&self, header: &str) -> anyhow::Result<()>;
}

impl ParamIo for SpikeSlabPosterior {
    fn to_tsv(&self, header: &str) -> anyhow::Result<()> {
        self.mean().to_tsv(&(header.to_string() + ".mean.tsv.gz"))?;
        self.variance()
            .to_tsv(&(header.to_string() + ".variance.tsv.gz"))?;
        self.binary_prob()
            .to_tsv(&(header.to_string() + ".gamma.tsv.gz"))?;
        self.expected_latent()
            .to_tsv(&(header.to_string() + ".latent.tsv.gz"))?;
        info!("wrote posterior statistics: {}.*.tsv.gz", header);
        Ok(())
    }
}
