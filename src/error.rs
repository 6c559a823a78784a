//! Error types for rollsync.

use thiserror::Error;

use crate::transport::TransportError;

/// Errors surfaced by the queue, cache and sync layers.
#[derive(Debug, Error)]
pub enum RollsyncError {
    /// A storage operation failed for a reason other than lock contention.
    #[error("Database error: {0}")]
    Database(String),

    /// The store stayed locked through every backoff attempt.
    #[error("Database is busy: gave up after {attempts} attempts")]
    StoreBusy {
        /// How many times the statement was tried.
        attempts: u32,
    },

    /// Invalid or unreadable configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// JSON encoding or decoding failed.
    #[error("Parse error: {0}")]
    Parse(#[from] serde_json::Error),

    /// Filesystem failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A queued payload could not be decoded for upload.
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    /// The server refused an individual item. Displays the bare server message.
    #[error("{0}")]
    Rejected(String),

    /// The transport collaborator failed.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// A sync cycle is already running.
    #[error("Sync already in progress")]
    SyncInProgress,

    /// The device is offline.
    #[error("Device is offline")]
    Offline,

    /// A queued operation or cached record does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// A background task panicked or was aborted.
    #[error("Task failed: {0}")]
    Task(String),
}

impl From<r2d2::Error> for RollsyncError {
    fn from(err: r2d2::Error) -> Self {
        Self::Database(format!("Connection pool error: {err}"))
    }
}

impl From<tokio::task::JoinError> for RollsyncError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::Task(err.to_string())
    }
}
