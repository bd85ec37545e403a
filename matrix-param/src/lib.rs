//! Variational parameter matrices for spike-and-slab latent variable
//! models.
//!
//! A latent entry is modelled as `x = b * s` with a Bernoulli "spike"
//! `b ~ Bern(gamma)` and a Gaussian "slab" `s ~ N(mu, S)`.

/// Error kinds raised by parameter containers
pub mod error;

/// Output of posterior statistics
pub mod io;

/// Spike-and-slab variational posterior over the latent matrix
pub mod spike_slab_posterior;

/// Spike-and-slab prior and its KL divergence
pub mod spike_slab_prior;

/// Flat parameter vectors and parameter transforms
pub mod traits;

pub use error::ParamError;
pub use spike_slab_posterior::{GradientSlots, SpikeSlabPosterior, BINARY_PROB_EPS};
pub use spike_slab_prior::SpikeSlabPrior;
pub use traits::ParamVector;
