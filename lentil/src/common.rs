pub use log::{debug, info, warn};

pub type Mat = nalgebra::DMatrix<f64>;
pub type DVec = nalgebra::DVector<f64>;

pub use crate::error::LentilError;
pub use matrix_param::{ParamVector, SpikeSlabPosterior, SpikeSlabPrior};

/// added to the diagonal of K(Z, Z)
pub const DEFAULT_JITTER: f64 = 1e-6;
pub const DEFAULT_NUM_INDUCING: usize = 10;
pub const DEFAULT_BATCH_SIZE: usize = 256;

/// Rank of the worker that owns the authoritative parameter vector
pub const ROOT_RANK: usize = 0;
