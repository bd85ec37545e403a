/// Configuration errors raised while building or updating parameters
#[derive(Debug, thiserror::Error)]
pub enum ParamError {
    #[error("shape mismatch for {what}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        what: &'static str,
        expected: (usize, usize),
        actual: (usize, usize),
    },
    #[error("parameter vector length for {what}: expected {expected}, got {actual}")]
    LengthMismatch {
        what: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("rows {start}..{end} outside 0..{nrows}")]
    RowRange {
        start: usize,
        end: usize,
        nrows: usize,
    },
    #[error("invalid value for {what}: {message}")]
    InvalidValue { what: &'static str, message: String },
}

pub(crate) fn check_shape(
    what: &'static str,
    expected: (usize, usize),
    actual: (usize, usize),
) -> Result<(), ParamError> {
    if expected != actual {
        return Err(ParamError::ShapeMismatch {
            what,
            expected,
            actual,
        });
    }
    Ok(())
}

pub(crate) fn check_length(
    what: &'static str,
    expected: usize,
    actual: usize,
) -> Result<(), ParamError> {
    if expected != actual {
        return Err(ParamError::LengthMismatch {
            what,
            expected,
            actual,
        });
    }
    Ok(())
}
