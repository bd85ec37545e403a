/// Failures of the SS-GPLVM engine.
///
/// Raised through `anyhow::Error`; recover the kind with
/// `err.downcast_ref::<LentilError>()`.
#[derive(Debug, thiserror::Error)]
pub enum LentilError {
    #[error("dimension mismatch for {what}: expected {expected}, got {actual}")]
    DimensionMismatch {
        what: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("malformed {what}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        what: &'static str,
        expected: (usize, usize),
        actual: (usize, usize),
    },
    #[error("worker {rank} received unrecognised synchronisation signal {signal}")]
    Protocol { rank: usize, signal: i32 },
    #[error("numerical failure: {0}")]
    Numerical(String),
    #[error("transport failure: {0}")]
    Transport(String),
}

pub(crate) fn check_dim(what: &'static str, expected: usize, actual: usize) -> anyhow::Result<()> {
    if expected != actual {
        return Err(LentilError::DimensionMismatch {
            what,
            expected,
            actual,
        }
        .into());
    }
    Ok(())
}

pub(crate) fn check_shape(
    what: &'static str,
    expected: (usize, usize),
    actual: (usize, usize),
) -> anyhow::Result<()> {
    if expected != actual {
        return Err(LentilError::ShapeMismatch {
            what,
            expected,
            actual,
        }
        .into());
    }
    Ok(())
}
