//! Notification fan-out.
//!
//! Components publish [`SyncEvent`]s on a shared [`EventBus`]; callers register
//! with [`EventBus::subscribe`] and receive every event published while their
//! receiver is alive. Delivery order is preserved per publisher call site, but
//! nothing is promised across distinct event kinds.

use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tracing::trace;

use crate::features::sync::SyncResult;

/// Stage of a sync cycle, reported with progress events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStage {
    Registrations,
    Verifications,
    RecordUpdates,
    CacheRefresh,
    Cleanup,
    Done,
}

/// Everything the sync and cache layers announce.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SyncEvent {
    /// A cycle advanced.
    SyncProgress {
        stage: SyncStage,
        percent: u8,
        message: String,
    },
    /// A cycle finished (possibly with failures).
    SyncCompleted(SyncResult),
    /// A cycle or background run could not complete.
    SyncError { message: String },
    /// A cache category was replaced.
    CacheUpdated { category: String, record_count: u64 },
    /// Cached categories exceeded their expiry.
    RefreshNeeded { categories: Vec<String> },
    /// Offline continuity readiness flipped.
    ContinuityChanged { ready: bool },
    /// Connectivity flipped.
    NetworkChanged { online: bool },
}

/// Observer registry shared by every component. Cheap to clone.
#[derive(Clone, Default)]
pub struct EventBus {
    subscribers: Arc<Mutex<Vec<UnboundedSender<SyncEvent>>>>,
}

impl EventBus {
    /// Create an empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new observer.
    #[must_use]
    pub fn subscribe(&self) -> UnboundedReceiver<SyncEvent> {
        let (tx, rx) = unbounded_channel();
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }

    /// Deliver `event` to every live observer, dropping closed ones.
    pub fn publish(&self, event: SyncEvent) {
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
        trace!(subscribers = subscribers.len(), ?event, "published event");
    }

    /// Number of live observers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        subscribers.retain(|tx| !tx.is_closed());
        subscribers.len()
    }
}
