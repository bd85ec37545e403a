//! Spike-and-slab Gaussian process latent variable model.
//!
//! A sparse variational GPLVM whose latent coordinates follow a
//! spike-and-slab prior, fitted by maximising a collapsed lower bound
//! on the marginal likelihood. Fitting can be spread over several
//! workers, each owning a block of rows.

pub mod common;
pub mod error;
pub mod inference;
pub mod init;
pub mod kernel;
pub mod likelihood;
pub mod model;
pub mod optimize;
pub mod simulate;
pub mod snapshot;
pub mod sync;

pub use error::LentilError;
pub use inference::{BoundTerms, GradDict, InferenceMethod, VarDtc, VarDtcMinibatch};
pub use init::{initialize_latent, InitMethod};
pub use kernel::{Kernel, LinearArd, PsiStatistics};
pub use likelihood::GaussianNoise;
pub use model::{ModelCore, ModelInputs, SessionState, SsGplvm, SsGplvmOptions};
pub use optimize::{Adam, AdamOptions, Objective, Optimizer};
pub use snapshot::{MatData, ModelSnapshot};
pub use sync::{
    broadcast_stop, broadcast_update, divide_rows, follow, Communicator, DistributedSession,
    LocalComm, Replica, RowPartition,
};
