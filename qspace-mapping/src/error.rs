//! Mapping-specific error types.

use thiserror::Error;

/// Result type for mapping operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Mapping-specific error types.
#[derive(Error, Debug)]
pub enum Error {
    /// Detector geometry is unusable for mapping.
    #[error("invalid detector geometry: {0}")]
    Geometry(String),

    /// Instrument configuration could not be interpreted.
    #[error("invalid instrument configuration: {0}")]
    Config(String),

    /// JSON parsing error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// No orientation matrix has been set.
    #[error("no orientation matrix has been set")]
    NoOrientationMatrix,

    /// I/O error.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Core library error.
    #[error("core error: {0}")]
    CoreError(#[from] qspace_core::Error),
}
