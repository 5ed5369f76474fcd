//! Crate-level error type and `Result` alias for stable, structured error handling.
//! Converts underlying I/O, JSON, CSV and row-source errors, and provides semantic
//! variants for the batch lifecycle (submission, polling, dataset checks).
use thiserror::Error;

use crate::io::openai::ApiError;
use crate::types::BatchStatus;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Row source error: {0}")]
    Source(#[from] crate::io::SourceReadError),

    #[error("Batch API error: {0}")]
    Api(#[from] ApiError),

    /// The external API rejected or never received a submission. Status and
    /// retry budget of the batch are untouched.
    #[error("Submission of batch {seq} failed: {source}")]
    Submission { seq: u32, source: ApiError },

    /// Status query or result download failed transiently. Retry the poll.
    #[error("Polling batch {seq} failed: {source}")]
    Poll { seq: u32, source: ApiError },

    #[error("Dataset mismatch: registry was built for {registry} items, row source has {rows}")]
    DatasetMismatch { registry: usize, rows: usize },

    #[error("Registry is corrupt: {0}")]
    RegistryCorrupt(String),

    #[error("Batch {seq} cannot move from {from} to {to}")]
    InvalidTransition {
        seq: u32,
        from: BatchStatus,
        to: BatchStatus,
    },

    #[error("Cannot {operation} batch {seq} while it is {status}")]
    WrongState {
        seq: u32,
        status: BatchStatus,
        operation: &'static str,
    },

    #[error("No batch with sequence number {0}")]
    UnknownBatch(u32),

    #[error("Invalid argument: {arg}={value}")]
    InvalidArgument { arg: &'static str, value: String },

    #[error("Size must be greater than 0, got: {size}")]
    ZeroSize { size: usize },

    #[error("Missing required argument: {arg}")]
    MissingArgument { arg: String },
}

impl Error {
    /// True for failures that leave the registry untouched and may succeed on
    /// a later attempt.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Submission { .. } | Error::Poll { .. })
    }
}
