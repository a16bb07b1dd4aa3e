use thiserror::Error;

/// Errors raised by the correction pipeline before any numerical work.
///
/// Non-convergence of the displacement inversion is deliberately not an
/// error; it is reported per frame through
/// [`InversionReport`](crate::invert::InversionReport).
#[derive(Debug, Error)]
pub enum CorrectionError {
    #[error("geometry mismatch between volumes {first} and {second}: {detail}")]
    GeometryMismatch {
        first: usize,
        second: usize,
        detail: String,
    },

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
}
