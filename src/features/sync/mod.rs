//! Durable operation queue and synchronization.
//!
//! Operations captured offline are appended to [`SyncQueue`] and survive
//! restarts. [`SyncOrchestrator`] drains them to the server in priority
//! order, and [`BackgroundScheduler`] runs cycles unattended.

pub mod gate;
pub mod manager;
pub mod operation;
pub mod orchestrator;
pub mod queue;
pub mod scheduler;

#[cfg(test)]
pub(crate) mod testing;

pub use gate::{SyncGate, SyncGuard};
pub use manager::{BatchResult, ItemError, QueueManager};
pub use operation::{
    Operation, OperationPayload, OperationStatus, OperationType, RecordUpdatePayload,
    RegistrationPayload, VerificationPayload, DEFAULT_MAX_ATTEMPTS,
};
pub use orchestrator::{CategoryResult, CycleOptions, SyncOrchestrator, SyncResult, SyncStatus};
pub use queue::{QueueStatistics, SyncQueue};
pub use scheduler::BackgroundScheduler;
