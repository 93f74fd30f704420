//! Error types for qspace-core.

use thiserror::Error;

/// Result type alias for qspace operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for qspace operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// Matrix cannot be inverted.
    #[error("singular matrix: determinant {determinant:e} is too small to invert")]
    SingularMatrix { determinant: f64 },

    /// Matrix contains NaN or infinite entries.
    #[error("matrix contains non-finite entries")]
    NonFiniteMatrix,

    /// Vector cannot be normalized.
    #[error("zero-length vector cannot be normalized")]
    ZeroVector,

    /// Configuration error.
    #[error("configuration error: {0}")]
    ConfigError(String),

    /// Event arrays of different lengths.
    #[error("event arrays differ in length: {tofs} tofs, {pixel_ids} pixel ids")]
    LengthMismatch { tofs: usize, pixel_ids: usize },
}
