//! Error types for qspace-histogram.

use thiserror::Error;

/// Result type alias for histogram operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Histogram error types.
#[derive(Error, Debug)]
pub enum Error {
    /// Binning parameters are unusable (empty range, zero bins, coplanar axes).
    #[error("invalid binning: {0}")]
    InvalidBinning(String),

    /// Integration radii are unusable.
    #[error("invalid radii: {0}")]
    InvalidRadii(String),

    /// No grid could be allocated even after repeated halving.
    #[error("cannot allocate histogram grid {nx}x{ny}x{nz}: {reason}")]
    AllocationFailed {
        /// Bins along the first axis at the last attempt.
        nx: usize,
        /// Bins along the second axis at the last attempt.
        ny: usize,
        /// Bins along the third axis at the last attempt.
        nz: usize,
        /// Why the last attempt failed.
        reason: String,
    },

    /// Core type error (e.g. singular orientation matrix).
    #[error("core error: {0}")]
    CoreError(#[from] qspace_core::Error),
}
