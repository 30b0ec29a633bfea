//! Error types for multi-echo fitting
//!
//! Only configuration and I/O problems are errors. Numeric pathology in the
//! data (non-positive samples, failed fits, singular optimizer steps) is
//! recovered inside the pipeline and reported through the quality mask.

use thiserror::Error;

/// Result type for multi-echo operations
pub type Result<T> = std::result::Result<T, MeFitError>;

/// Errors that abort a run before any output is produced
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MeFitError {
    /// Number of echoes outside the supported 2..=9 range
    #[error("number of echoes must be between 2 and 9, got {0}")]
    InvalidEchoCount(usize),

    /// Echo time that is zero, negative or not finite
    #[error("echo time {index} is not a positive finite value: {value}")]
    InvalidEchoTime { index: usize, value: f64 },

    /// Echo-time vector and signal cube disagree on the echo count
    #[error("echo count mismatch: {echo_times} echo times for {echoes} echo volumes")]
    EchoCountMismatch { echo_times: usize, echoes: usize },

    /// Data buffer does not match the declared geometry
    #[error("data length mismatch: expected {expected}, got {actual}")]
    DataLengthMismatch { expected: usize, actual: usize },

    /// Echo inputs with different geometry
    #[error("mismatched input images: echo {echo} has dims {actual:?}, expected {expected:?}")]
    GeometryMismatch {
        echo: usize,
        expected: (usize, usize, usize, usize),
        actual: (usize, usize, usize, usize),
    },

    /// Single-slice mode pointing outside the volume
    #[error("selected slice {slice} is outside the volume (nz = {nz})")]
    InvalidSlice { slice: usize, nz: usize },

    /// Frame selection that is empty or longer than the series
    #[error("invalid frame selection: {requested} frames requested, {available} available")]
    InvalidFrameSelection { requested: usize, available: usize },

    /// Reference echo time for the fitted signal is unusable
    #[error("reference echo time must be positive and finite, got {0}")]
    InvalidReferenceTe(f64),

    /// Parameter outside its admissible range
    #[error("invalid parameter '{name}': {reason}")]
    InvalidParameter { name: &'static str, reason: String },

    /// NIfTI read/write failure
    #[error("NIfTI I/O error: {0}")]
    Nifti(String),
}

impl From<std::io::Error> for MeFitError {
    fn from(e: std::io::Error) -> Self {
        MeFitError::Nifti(e.to_string())
    }
}
