//! Server collaborator contract.
//!
//! The sync core only consumes this interface: a bulk upload per operation
//! kind, a reference-data download, and connectivity. [`HttpTransport`] is the
//! concrete JSON-over-HTTP implementation; tests substitute a mock.

mod http;
mod network;
mod types;

use async_trait::async_trait;
use thiserror::Error;

use crate::features::sync::OperationType;

pub use http::HttpTransport;
pub use network::NetworkMonitor;
pub(crate) use network::wait_for_reconnect;
pub use types::{ItemOutcome, OutcomeStatus, ReferenceData, UploadItem, UploadResponse};

/// Failures reported by a transport.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// No connectivity; nothing was sent.
    #[error("device is offline")]
    Offline,

    /// Connection could not be established or was dropped.
    #[error("network failure: {0}")]
    Network(String),

    /// The request did not complete in time.
    #[error("request timed out")]
    Timeout,

    /// The server failed to handle the request (5xx, 429).
    #[error("server error {status}: {message}")]
    Server { status: u16, message: String },

    /// The server refused the whole request (other 4xx).
    #[error("request rejected {status}: {message}")]
    Rejected { status: u16, message: String },

    /// The response body could not be understood.
    #[error("unreadable response: {0}")]
    Decode(String),
}

impl TransportError {
    /// Whether retrying later might succeed without changing the request.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Offline | Self::Network(_) | Self::Timeout | Self::Server { .. }
        )
    }
}

/// The server of record, as seen by the sync core.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    /// Upload one batch of operations of a single kind.
    ///
    /// The response carries one outcome per natural key, in any order.
    async fn upload_batch(
        &self,
        kind: OperationType,
        items: Vec<UploadItem>,
    ) -> Result<UploadResponse, TransportError>;

    /// Download reference data for an organizational scope.
    async fn download_reference_data(&self, scope_id: String)
        -> Result<ReferenceData, TransportError>;

    /// Probe the server; `true` when reachable.
    async fn check_connectivity(&self) -> bool;
}

/// Stand-in used when no server is configured. Every call reports
/// [`TransportError::Offline`], so work stays queued.
#[derive(Debug, Clone, Copy, Default)]
pub struct Disconnected;

#[async_trait]
impl Transport for Disconnected {
    async fn upload_batch(
        &self,
        _kind: OperationType,
        _items: Vec<UploadItem>,
    ) -> Result<UploadResponse, TransportError> {
        Err(TransportError::Offline)
    }

    async fn download_reference_data(
        &self,
        _scope_id: String,
    ) -> Result<ReferenceData, TransportError> {
        Err(TransportError::Offline)
    }

    async fn check_connectivity(&self) -> bool {
        false
    }
}
