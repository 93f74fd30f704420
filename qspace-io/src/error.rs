//! I/O error types.

use std::time::Duration;
use thiserror::Error;

/// Result type for I/O operations.
pub type Result<T> = std::result::Result<T, Error>;

/// I/O error types.
#[derive(Error, Debug)]
pub enum Error {
    /// File or socket I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid file format.
    #[error("invalid file format: {0}")]
    InvalidFormat(String),

    /// A UDP packet that cannot be decoded.
    #[error("malformed packet: {0}")]
    MalformedPacket(String),

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// A command needs state that has not been set up.
    #[error("{0} has not been initialized")]
    NotReady(&'static str),

    /// A worker job panicked; the batch was abandoned.
    #[error("worker failed on job {job} after {completed} of {total} jobs: {message}")]
    WorkerFailed {
        /// Index of the failed job.
        job: usize,
        /// Jobs finished before the failure was seen.
        completed: usize,
        /// Jobs in the batch.
        total: usize,
        /// Panic message.
        message: String,
    },

    /// A batch did not finish in time.
    #[error("batch timed out after {waited:?} with {completed} of {total} jobs done")]
    WorkerTimeout {
        /// Jobs finished before the deadline.
        completed: usize,
        /// Jobs in the batch.
        total: usize,
        /// How long the batch was waited on.
        waited: Duration,
    },

    /// Core library error.
    #[error("core error: {0}")]
    CoreError(#[from] qspace_core::Error),

    /// Mapping error.
    #[error("mapping error: {0}")]
    MappingError(#[from] qspace_mapping::Error),

    /// Histogram error.
    #[error("histogram error: {0}")]
    HistogramError(#[from] qspace_histogram::Error),
}
