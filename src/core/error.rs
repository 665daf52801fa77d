//! Error types for the scheduler

use thiserror::Error;

/// Failure of a single chunk download.
///
/// Stored on the failed chunk as its error payload; never propagated into
/// scheduler control flow.
#[derive(Debug, Clone, Error, serde::Serialize, serde::Deserialize)]
pub enum DownloadError {
    /// Network failure or non-2xx response from the remote source.
    #[error("transport error: {0}")]
    Transport(String),

    /// The bytes arrived but could not be decoded.
    #[error("decode error: {0}")]
    Decode(String),

    /// The download was cancelled. Not a failure; the scheduler discards
    /// cancelled settlements instead of marking the chunk failed.
    #[error("download cancelled")]
    Cancelled,
}

/// Failure of a main-context request for a chunk's raw bytes.
#[derive(Debug, Clone, Error)]
pub enum RetrieveError {
    #[error("unknown source {0}")]
    UnknownSource(u32),

    #[error("unknown chunk")]
    UnknownChunk,

    #[error("chunk is not resident in worker memory")]
    NotResident,

    #[error("worker context is gone")]
    WorkerGone,
}
