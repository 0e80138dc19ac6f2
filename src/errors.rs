
use std::fmt;
use std::io;
use std::path::PathBuf;

/// All of the failure modes that are reported before (or instead of) a numerical result.
/// Numerical faults that arise mid-computation (e.g. a zero diagonal in a resampled similarity matrix) are
/// not errors, they show up as non-finite values in the output vectors.
#[derive(Debug)]
pub enum CorrectionError {
    /// A matrix, tensor, or vector does not have the dimensions its partner inputs require
    InvalidShape(String),
    /// A parameter is outside of its allowed range
    InvalidParameter(String),
    /// The input has no reads to work with, normalization would divide by zero
    DegenerateInput(String),
    /// A pooled bootstrap trial never reported back
    WorkerFailure(String),
    /// File I/O error with the path that caused it
    Io {
        /// the offending path
        path: PathBuf,
        /// the underlying error
        source: io::Error
    },
    /// A `.npy` file that we could not interpret
    NumpyFormat(String)
}

/// Result type used throughout the crate
pub type Result<T> = std::result::Result<T, CorrectionError>;

impl fmt::Display for CorrectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CorrectionError::InvalidShape(msg) => write!(f, "invalid shape: {}", msg),
            CorrectionError::InvalidParameter(msg) => write!(f, "invalid parameter: {}", msg),
            CorrectionError::DegenerateInput(msg) => write!(f, "degenerate input: {}", msg),
            CorrectionError::WorkerFailure(msg) => write!(f, "worker failure: {}", msg),
            CorrectionError::Io { path, source } => write!(f, "{}: {}", path.display(), source),
            CorrectionError::NumpyFormat(msg) => write!(f, "numpy format error: {}", msg)
        }
    }
}

impl std::error::Error for CorrectionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CorrectionError::Io { source, .. } => Some(source),
            _ => None
        }
    }
}
