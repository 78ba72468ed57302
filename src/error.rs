//! Error types for mrpt-rs.

use thiserror::Error;

/// Errors that can occur while building, tuning, or persisting an index.
#[derive(Debug, Error)]
pub enum MrptError {
    /// Invalid build or tuning parameter.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// Underlying filesystem error during save/load.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// A persisted index file was truncated or internally inconsistent.
    #[error("corrupt index file: {0}")]
    CorruptIndex(String),
}

/// Result type alias for mrpt-rs operations.
pub type Result<T> = std::result::Result<T, MrptError>;
