//! Synchronization orchestrator.
//!
//! One cycle uploads queued operations kind by kind, reconciles the server's
//! per-item outcomes by natural key, refreshes reference data, and purges
//! finished operations. A single [`SyncGate`] guarantees that at most one
//! cycle runs at a time.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::gate::{SyncGate, SyncGuard};
use super::manager::QueueManager;
use super::operation::{Operation, OperationType};
use super::queue::SyncQueue;
use crate::config::SyncConfig;
use crate::error::RollsyncError;
use crate::events::{EventBus, SyncEvent, SyncStage};
use crate::features::cache::{CacheManager, CacheStore, EntitySyncStatus, STUDENTS};
use crate::storage::blocking;
use crate::transport::{NetworkMonitor, OutcomeStatus, Transport, UploadItem, UploadResponse};

/// Error recorded when the server's response omits an uploaded item.
pub const NO_OUTCOME: &str = "no outcome returned";

/// Per-kind counts for one cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CategoryResult {
    /// Items claimed and sent (or found corrupt)
    pub attempted: usize,
    pub synced: usize,
    pub failed: usize,
    /// Items returned to pending because the server was unreachable
    pub deferred: usize,
    pub errors: Vec<String>,
}

impl CategoryResult {
    fn fail(&mut self, key: &str, message: &str) {
        self.failed += 1;
        self.errors.push(format!("{key}: {message}"));
    }
}

/// Aggregate outcome of one cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncResult {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: i64,
    pub registrations: CategoryResult,
    pub verifications: CategoryResult,
    pub record_updates: CategoryResult,
    /// Failed or stale items put back into the pending pool
    pub retried: usize,
    pub cache_refreshed: bool,
    pub cache_error: Option<String>,
    pub cleaned_up: usize,
    pub cancelled: bool,
    pub success: bool,
    pub message: String,
}

impl SyncResult {
    fn new(started_at: DateTime<Utc>) -> Self {
        Self {
            started_at,
            finished_at: started_at,
            duration_ms: 0,
            registrations: CategoryResult::default(),
            verifications: CategoryResult::default(),
            record_updates: CategoryResult::default(),
            retried: 0,
            cache_refreshed: false,
            cache_error: None,
            cleaned_up: 0,
            cancelled: false,
            success: false,
            message: String::new(),
        }
    }

    /// Counts for one operation kind.
    #[must_use]
    pub const fn category(&self, kind: OperationType) -> &CategoryResult {
        match kind {
            OperationType::Registration => &self.registrations,
            OperationType::Verification => &self.verifications,
            OperationType::RecordUpdate => &self.record_updates,
        }
    }

    fn category_mut(&mut self, kind: OperationType) -> &mut CategoryResult {
        match kind {
            OperationType::Registration => &mut self.registrations,
            OperationType::Verification => &mut self.verifications,
            OperationType::RecordUpdate => &mut self.record_updates,
        }
    }

    fn categories(&self) -> [&CategoryResult; 3] {
        [&self.registrations, &self.verifications, &self.record_updates]
    }

    /// Items accepted by the server.
    #[must_use]
    pub fn total_synced(&self) -> usize {
        self.categories().iter().map(|c| c.synced).sum()
    }

    /// Items that recorded a failed attempt.
    #[must_use]
    pub fn total_failed(&self) -> usize {
        self.categories().iter().map(|c| c.failed).sum()
    }

    /// Items returned to pending untouched.
    #[must_use]
    pub fn total_deferred(&self) -> usize {
        self.categories().iter().map(|c| c.deferred).sum()
    }

    /// Items claimed this cycle.
    #[must_use]
    pub fn total_attempted(&self) -> usize {
        self.categories().iter().map(|c| c.attempted).sum()
    }

    fn finish(&mut self) {
        self.finished_at = Utc::now();
        self.duration_ms = (self.finished_at - self.started_at).num_milliseconds();

        let failed = self.total_failed();
        let deferred = self.total_deferred();
        self.success = failed == 0 && deferred == 0 && !self.cancelled;
        self.message = if self.cancelled {
            "Sync cancelled".to_string()
        } else if failed > 0 {
            format!("Sync completed with {failed} failures")
        } else if deferred > 0 {
            "Sync deferred: server unreachable".to_string()
        } else if self.total_attempted() == 0 {
            "Nothing to sync".to_string()
        } else {
            format!("Sync completed successfully ({} synced)", self.total_synced())
        };
    }
}

/// Snapshot of the orchestrator's state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncStatus {
    pub running: bool,
    pub last_attempt: Option<DateTime<Utc>>,
    pub last_success: Option<DateTime<Utc>>,
    pub last_message: Option<String>,
}

/// How one cycle pages through the queue.
#[derive(Debug, Clone)]
pub struct CycleOptions {
    pub batch_size: usize,
    /// Pause between full batches
    pub inter_batch_delay: Duration,
    /// Requeue retryable items after the primary pass and upload them too
    pub include_retryable: bool,
    pub cancel: Option<CancellationToken>,
}

impl CycleOptions {
    /// Options for a manual cycle.
    #[must_use]
    pub const fn manual(config: &SyncConfig) -> Self {
        Self {
            batch_size: config.orchestrator_batch_size,
            inter_batch_delay: Duration::ZERO,
            include_retryable: false,
            cancel: None,
        }
    }

    /// Options for an unattended background run.
    #[must_use]
    pub const fn background(config: &SyncConfig, cancel: CancellationToken) -> Self {
        Self {
            batch_size: config.scheduler_batch_size,
            inter_batch_delay: config.batch_delay(),
            include_retryable: true,
            cancel: Some(cancel),
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(CancellationToken::is_cancelled)
    }

    /// Sleep for the inter-batch delay. Returns `false` if cancelled.
    async fn pause(&self) -> bool {
        if self.inter_batch_delay.is_zero() {
            return !self.is_cancelled();
        }
        match &self.cancel {
            Some(token) => tokio::select! {
                () = token.cancelled() => false,
                () = tokio::time::sleep(self.inter_batch_delay) => true,
            },
            None => {
                tokio::time::sleep(self.inter_batch_delay).await;
                true
            }
        }
    }
}

/// Progress band of each step, in percent.
const fn progress_band(kind: OperationType) -> (u8, u8, SyncStage) {
    match kind {
        OperationType::Registration => (0, 40, SyncStage::Registrations),
        OperationType::Verification => (40, 65, SyncStage::Verifications),
        OperationType::RecordUpdate => (65, 80, SyncStage::RecordUpdates),
    }
}

enum BatchOutcome {
    Reconciled,
    Deferred,
}

/// Runs sync cycles. Cheap to clone.
#[derive(Clone)]
pub struct SyncOrchestrator {
    manager: QueueManager,
    transport: Arc<dyn Transport>,
    network: NetworkMonitor,
    cache: Option<CacheManager>,
    events: EventBus,
    gate: SyncGate,
    config: SyncConfig,
    status: Arc<Mutex<SyncStatus>>,
}

impl SyncOrchestrator {
    /// Create an orchestrator.
    #[must_use]
    pub fn new(
        manager: QueueManager,
        transport: Arc<dyn Transport>,
        network: NetworkMonitor,
        events: EventBus,
        config: SyncConfig,
    ) -> Self {
        Self {
            manager,
            transport,
            network,
            cache: None,
            events,
            gate: SyncGate::new(),
            config,
            status: Arc::new(Mutex::new(SyncStatus::default())),
        }
    }

    /// Refresh reference data as part of every cycle.
    #[must_use]
    pub fn with_cache(mut self, cache: CacheManager) -> Self {
        self.cache = Some(cache);
        self
    }

    /// The gate every trigger must pass.
    #[must_use]
    pub const fn gate(&self) -> &SyncGate {
        &self.gate
    }

    /// Sync settings in effect.
    #[must_use]
    pub const fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Connectivity source.
    #[must_use]
    pub const fn network(&self) -> &NetworkMonitor {
        &self.network
    }

    /// Event bus cycles report on.
    #[must_use]
    pub const fn events(&self) -> &EventBus {
        &self.events
    }

    /// Current state.
    #[must_use]
    pub fn status(&self) -> SyncStatus {
        self.status
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Record a cycle that died without producing a result.
    pub(crate) fn mark_interrupted(&self, message: &str) {
        let mut status = self.status.lock().unwrap_or_else(PoisonError::into_inner);
        status.running = false;
        status.last_message = Some(message.to_string());
    }

    fn queue(&self) -> SyncQueue {
        self.manager.queue().clone()
    }

    /// Run one manual cycle.
    ///
    /// # Errors
    ///
    /// Returns `RollsyncError::SyncInProgress` immediately if a cycle is
    /// running, and a store error if the queue becomes unusable.
    pub async fn run_cycle(&self) -> Result<SyncResult, RollsyncError> {
        let guard = self
            .gate
            .try_acquire()
            .ok_or(RollsyncError::SyncInProgress)?;
        self.run_cycle_guarded(guard, CycleOptions::manual(&self.config))
            .await
    }

    /// Run one cycle with a gate already held.
    ///
    /// # Errors
    ///
    /// Returns a store error if the queue becomes unusable. Upload and cache
    /// failures are reported in the result instead.
    pub async fn run_cycle_guarded(
        &self,
        guard: SyncGuard,
        options: CycleOptions,
    ) -> Result<SyncResult, RollsyncError> {
        let started_at = Utc::now();
        {
            let mut status = self.status.lock().unwrap_or_else(PoisonError::into_inner);
            status.running = true;
            status.last_attempt = Some(started_at);
        }
        info!(batch_size = options.batch_size, "sync cycle started");

        let outcome = self.execute(started_at, &options).await;

        {
            let mut status = self.status.lock().unwrap_or_else(PoisonError::into_inner);
            status.running = false;
            match &outcome {
                Ok(result) => {
                    if result.success {
                        status.last_success = Some(result.finished_at);
                    }
                    status.last_message = Some(result.message.clone());
                }
                Err(e) => status.last_message = Some(e.to_string()),
            }
        }
        drop(guard);

        match &outcome {
            Ok(result) => {
                info!(
                    duration_ms = result.duration_ms,
                    synced = result.total_synced(),
                    failed = result.total_failed(),
                    deferred = result.total_deferred(),
                    "{}",
                    result.message
                );
                self.events.publish(SyncEvent::SyncCompleted(result.clone()));
            }
            Err(e) => {
                error!(error = %e, "sync cycle failed");
                self.events.publish(SyncEvent::SyncError {
                    message: e.to_string(),
                });
            }
        }
        outcome
    }

    async fn execute(
        &self,
        started_at: DateTime<Utc>,
        options: &CycleOptions,
    ) -> Result<SyncResult, RollsyncError> {
        let mut result = SyncResult::new(started_at);
        let queue = self.queue();
        let stale_after = self.config.stale_syncing_after();

        let recovered = {
            let queue = queue.clone();
            blocking(move || queue.recover_stale(stale_after)).await?
        };
        if recovered > 0 {
            warn!(count = recovered, "reclaimed operations left syncing by an earlier run");
        }

        let mut deferred = self.upload_all(started_at, options, &mut result).await?;

        if options.include_retryable && !result.cancelled && !deferred {
            let queue = queue.clone();
            result.retried = blocking(move || queue.requeue_retryable(stale_after)).await?;
            if result.retried > 0 {
                info!(count = result.retried, "requeued retryable operations");
                deferred = self.upload_all(started_at, options, &mut result).await?;
            }
        }
        debug!(deferred, "upload passes finished");

        if !result.cancelled {
            self.refresh_cache(&mut result).await;
        }

        if !result.cancelled {
            self.progress(SyncStage::Cleanup, 95, "Removing finished operations");
            let retention_days = self.config.retention_days;
            let queue = queue.clone();
            result.cleaned_up = blocking(move || queue.cleanup(retention_days)).await?;
        }

        result.finish();
        self.progress(SyncStage::Done, 100, &result.message);
        Ok(result)
    }

    /// Upload every kind in priority order. Returns `true` if the server was
    /// unreachable at any point.
    async fn upload_all(
        &self,
        started_at: DateTime<Utc>,
        options: &CycleOptions,
        result: &mut SyncResult,
    ) -> Result<bool, RollsyncError> {
        let mut deferred = false;
        for kind in OperationType::ALL {
            if result.cancelled || options.is_cancelled() {
                result.cancelled = true;
                break;
            }
            if deferred {
                break;
            }
            deferred = self.upload_kind(kind, started_at, options, result).await?;
        }
        Ok(deferred)
    }

    /// Page through one kind's pending items.
    async fn upload_kind(
        &self,
        kind: OperationType,
        started_at: DateTime<Utc>,
        options: &CycleOptions,
        result: &mut SyncResult,
    ) -> Result<bool, RollsyncError> {
        let (low, high, stage) = progress_band(kind);
        self.progress(stage, low, &format!("Uploading {}s", kind.as_str()));

        let expected = {
            let stats = self.manager.get_statistics().await?;
            let pending = match kind {
                OperationType::Registration => stats.pending_registrations,
                OperationType::Verification => stats.pending_verifications,
                OperationType::RecordUpdate => stats.pending_record_updates,
            };
            usize::try_from(pending).unwrap_or(usize::MAX).max(1)
        };

        let mut done = 0usize;
        let mut first = true;
        loop {
            if !first && !options.pause().await {
                result.cancelled = true;
                break;
            }
            if options.is_cancelled() {
                result.cancelled = true;
                break;
            }
            first = false;

            let queue = self.queue();
            let limit = options.batch_size;
            let batch = blocking(move || queue.dequeue_batch_of(kind, limit, Some(started_at)))
                .await?;
            if batch.is_empty() {
                break;
            }

            let full = batch.len() >= limit;
            done += batch.len();
            let outcome = self.upload_batch(kind, batch, result.category_mut(kind)).await?;

            let span = usize::from(high - low);
            let step = u8::try_from(span * done.min(expected) / expected).unwrap_or(high - low);
            self.progress(
                stage,
                low + step,
                &format!("Uploaded {done} {}s", kind.as_str()),
            );

            if matches!(outcome, BatchOutcome::Deferred) {
                return Ok(true);
            }
            if !full {
                break;
            }
        }

        Ok(false)
    }

    /// Send one batch and apply the server's verdicts.
    async fn upload_batch(
        &self,
        kind: OperationType,
        batch: Vec<Operation>,
        category: &mut CategoryResult,
    ) -> Result<BatchOutcome, RollsyncError> {
        category.attempted += batch.len();

        let mut keyed = Vec::with_capacity(batch.len());
        let mut items = Vec::with_capacity(batch.len());
        let mut corrupt = Vec::new();
        for op in batch {
            match op
                .checked_natural_key()
                .and_then(|key| Ok((key, op.payload_value()?)))
            {
                Ok((key, payload)) => {
                    items.push(UploadItem {
                        natural_key: key.clone(),
                        payload,
                    });
                    keyed.push((op.id, key));
                }
                Err(e) => {
                    error!(operation_id = op.id, error = %e, "queued payload is unreadable");
                    corrupt.push((op.id, e.to_string()));
                }
            }
        }

        if !corrupt.is_empty() {
            let queue = self.queue();
            let marked = corrupt.clone();
            blocking(move || {
                for (id, message) in &marked {
                    queue.mark_failed(*id, message)?;
                }
                Ok(())
            })
            .await?;
            for (id, message) in &corrupt {
                category.fail(&format!("#{id}"), message);
            }
        }

        if items.is_empty() {
            return Ok(BatchOutcome::Reconciled);
        }

        debug!(kind = kind.as_str(), batch_size = items.len(), "uploading batch");
        match self.transport.upload_batch(kind, items).await {
            Ok(response) => {
                let queue = self.queue();
                let cache = self.cache.as_ref().map(|c| c.store().clone());
                let applied =
                    blocking(move || reconcile(&queue, cache.as_ref(), kind, &keyed, &response))
                        .await?;
                category.synced += applied.synced;
                for (key, message) in applied.failures {
                    category.fail(&key, &message);
                }
                Ok(BatchOutcome::Reconciled)
            }
            Err(e) if e.is_transient() => {
                warn!(kind = kind.as_str(), error = %e, "server unreachable, deferring batch");
                let count = keyed.len();
                let queue = self.queue();
                blocking(move || {
                    for (id, _) in &keyed {
                        queue.release(*id)?;
                    }
                    Ok(())
                })
                .await?;
                category.deferred += count;
                Ok(BatchOutcome::Deferred)
            }
            Err(e) => {
                warn!(kind = kind.as_str(), error = %e, "batch rejected");
                let message = e.to_string();
                let queue = self.queue();
                let marked = keyed.clone();
                let reason = message.clone();
                blocking(move || {
                    for (id, _) in &marked {
                        queue.mark_failed(*id, &reason)?;
                    }
                    Ok(())
                })
                .await?;
                for (_, key) in &keyed {
                    category.fail(key, &message);
                }
                Ok(BatchOutcome::Reconciled)
            }
        }
    }

    /// Best-effort reference-data refresh.
    async fn refresh_cache(&self, result: &mut SyncResult) {
        let Some(cache) = &self.cache else {
            return;
        };
        if cache.scope_id().is_none() {
            debug!("no scope configured, skipping cache refresh");
            return;
        }

        self.progress(SyncStage::CacheRefresh, 80, "Refreshing reference data");
        match cache.refresh().await {
            Ok(report) => {
                result.cache_refreshed = true;
                debug!(
                    students = report.students,
                    organizations = report.organizations,
                    "cache refreshed during sync"
                );
            }
            Err(e) => {
                warn!(error = %e, "cache refresh failed");
                result.cache_error = Some(e.to_string());
            }
        }
    }

    fn progress(&self, stage: SyncStage, percent: u8, message: &str) {
        self.events.publish(SyncEvent::SyncProgress {
            stage,
            percent: percent.min(100),
            message: message.to_string(),
        });
    }
}

struct Applied {
    synced: usize,
    failures: Vec<(String, String)>,
}

/// Apply per-item verdicts, matched by natural key rather than position.
fn reconcile(
    queue: &SyncQueue,
    cache: Option<&CacheStore>,
    kind: OperationType,
    keyed: &[(i64, String)],
    response: &UploadResponse,
) -> Result<Applied, RollsyncError> {
    let outcomes: HashMap<&str, _> = response.by_key();
    let mut applied = Applied {
        synced: 0,
        failures: Vec::new(),
    };

    for (id, key) in keyed {
        let failure = match outcomes.get(key.as_str()) {
            Some(outcome) if outcome.status == OutcomeStatus::Success => {
                queue.mark_success(*id)?;
                applied.synced += 1;
                if kind == OperationType::RecordUpdate {
                    if let Some(cache) = cache {
                        cache.set_status(STUDENTS, key, EntitySyncStatus::Synced)?;
                    }
                }
                continue;
            }
            Some(outcome) => RollsyncError::Rejected(
                outcome
                    .error
                    .clone()
                    .unwrap_or_else(|| "rejected by server".to_string()),
            ),
            None => RollsyncError::Rejected(NO_OUTCOME.to_string()),
        };

        let message = failure.to_string();
        queue.mark_failed(*id, &message)?;
        applied.failures.push((key.clone(), message));
    }

    Ok(applied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::sync::operation::{OperationStatus, VerificationPayload};
    use crate::features::sync::testing::ScriptedTransport;
    use crate::storage::Database;
    use crate::transport::{ItemOutcome, MockTransport, TransportError};

    fn orchestrator_with(
        transport: Arc<dyn Transport>,
        max_attempts: u32,
    ) -> (SyncOrchestrator, QueueManager) {
        let db = Database::open_in_memory().unwrap();
        let manager = QueueManager::new(
            SyncQueue::with_database(db.clone()).with_max_attempts(max_attempts),
        )
        .with_cache(CacheStore::with_database(db));
        let orchestrator = SyncOrchestrator::new(
            manager.clone(),
            transport,
            NetworkMonitor::new(true),
            EventBus::new(),
            SyncConfig::default(),
        );
        (orchestrator, manager)
    }

    async fn queue_verifications(manager: &QueueManager, rolls: &[&str]) -> Vec<i64> {
        let mut ids = Vec::new();
        for roll in rolls {
            ids.push(
                manager
                    .queue_verification(&VerificationPayload {
                        roll_number: (*roll).to_string(),
                        matched: true,
                        score: None,
                        session_id: None,
                        verified_at: Utc::now(),
                    })
                    .await
                    .unwrap(),
            );
        }
        ids
    }

    fn get(manager: &QueueManager, id: i64) -> Operation {
        manager.queue().get(id).unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_duplicate_outcome_scenario() {
        let transport = ScriptedTransport::new().respond_with(vec![
            ItemOutcome::success("A"),
            ItemOutcome::failure("B", "duplicate"),
            ItemOutcome::success("C"),
        ]);
        let (orchestrator, manager) = orchestrator_with(Arc::new(transport), 3);
        let ids = queue_verifications(&manager, &["A", "B", "C"]).await;

        let result = orchestrator.run_cycle().await.unwrap();

        assert_eq!(get(&manager, ids[0]).status, OperationStatus::Synced);
        assert_eq!(get(&manager, ids[2]).status, OperationStatus::Synced);
        let b = get(&manager, ids[1]);
        assert_eq!(b.status, OperationStatus::Pending);
        assert_eq!(b.attempts, 1);
        assert_eq!(b.last_error.as_deref(), Some("duplicate"));

        assert_eq!(result.verifications.synced, 2);
        assert_eq!(result.verifications.failed, 1);
        assert!(!result.success);
        assert_eq!(result.message, "Sync completed with 1 failures");
    }

    #[tokio::test]
    async fn test_single_attempt_budget_fails_terminally() {
        let transport = ScriptedTransport::new().respond_with(vec![
            ItemOutcome::success("A"),
            ItemOutcome::failure("B", "duplicate"),
            ItemOutcome::success("C"),
        ]);
        let (orchestrator, manager) = orchestrator_with(Arc::new(transport), 1);
        let ids = queue_verifications(&manager, &["A", "B", "C"]).await;

        orchestrator.run_cycle().await.unwrap();

        let b = get(&manager, ids[1]);
        assert_eq!(b.status, OperationStatus::Failed);
        assert_eq!(b.attempts, 1);
    }

    #[tokio::test]
    async fn test_scrambled_outcomes_match_by_key() {
        let transport = ScriptedTransport::new().respond_with(vec![
            ItemOutcome::failure("K3", "bad template"),
            ItemOutcome::success("K1"),
            ItemOutcome::failure("K2", "unknown roll"),
            ItemOutcome::success("K4"),
        ]);
        let (orchestrator, manager) = orchestrator_with(Arc::new(transport), 3);
        let ids = queue_verifications(&manager, &["K1", "K2", "K3", "K4"]).await;

        orchestrator.run_cycle().await.unwrap();

        assert_eq!(get(&manager, ids[0]).status, OperationStatus::Synced);
        assert_eq!(
            get(&manager, ids[1]).last_error.as_deref(),
            Some("unknown roll")
        );
        assert_eq!(
            get(&manager, ids[2]).last_error.as_deref(),
            Some("bad template")
        );
        assert_eq!(get(&manager, ids[3]).status, OperationStatus::Synced);
    }

    #[tokio::test]
    async fn test_missing_outcome_is_a_failure() {
        let transport = ScriptedTransport::new().respond_with(vec![ItemOutcome::success("A")]);
        let (orchestrator, manager) = orchestrator_with(Arc::new(transport), 3);
        let ids = queue_verifications(&manager, &["A", "B"]).await;

        orchestrator.run_cycle().await.unwrap();

        let b = get(&manager, ids[1]);
        assert_eq!(b.status, OperationStatus::Pending);
        assert_eq!(b.attempts, 1);
        assert_eq!(b.last_error.as_deref(), Some(NO_OUTCOME));
    }

    #[tokio::test]
    async fn test_unreachable_server_defers_without_consuming_attempts() {
        let transport = ScriptedTransport::new().fail_with(TransportError::Network(
            "connection refused".to_string(),
        ));
        let (orchestrator, manager) = orchestrator_with(Arc::new(transport), 3);
        let ids = queue_verifications(&manager, &["A", "B"]).await;

        let result = orchestrator.run_cycle().await.unwrap();

        for id in ids {
            let op = get(&manager, id);
            assert_eq!(op.status, OperationStatus::Pending);
            assert_eq!(op.attempts, 0);
        }
        assert_eq!(result.verifications.deferred, 2);
        assert_eq!(result.message, "Sync deferred: server unreachable");
        assert!(!result.success);
    }

    #[tokio::test]
    async fn test_rejected_batch_fails_every_item() {
        let transport = ScriptedTransport::new().fail_with(TransportError::Rejected {
            status: 400,
            message: "malformed batch".to_string(),
        });
        let (orchestrator, manager) = orchestrator_with(Arc::new(transport), 3);
        let ids = queue_verifications(&manager, &["A", "B"]).await;

        let result = orchestrator.run_cycle().await.unwrap();

        for id in ids {
            assert_eq!(get(&manager, id).attempts, 1);
        }
        assert_eq!(result.verifications.failed, 2);
    }

    #[tokio::test]
    async fn test_corrupt_payload_fails_only_that_item() {
        let transport = ScriptedTransport::new().respond_with(vec![ItemOutcome::success("GOOD")]);
        let (orchestrator, manager) = orchestrator_with(Arc::new(transport), 3);
        let good = queue_verifications(&manager, &["GOOD"]).await[0];
        let bad = manager
            .queue()
            .enqueue(OperationType::Verification, "{not json", 1)
            .unwrap();

        let result = orchestrator.run_cycle().await.unwrap();

        assert_eq!(get(&manager, good).status, OperationStatus::Synced);
        let bad = get(&manager, bad);
        assert_eq!(bad.attempts, 1);
        assert!(bad.last_error.unwrap().contains("Invalid payload"));
        assert_eq!(result.verifications.synced, 1);
        assert_eq!(result.verifications.failed, 1);
    }

    #[tokio::test]
    async fn test_payload_of_wrong_shape_is_not_uploaded() {
        let transport = ScriptedTransport::new();
        let sizes = transport.batch_sizes();
        let (orchestrator, manager) = orchestrator_with(Arc::new(transport), 3);
        let good = queue_verifications(&manager, &["GOOD"]).await[0];
        let bad = manager
            .queue()
            .enqueue(
                OperationType::Verification,
                r#"{"roll_number":"BAD","matched":"maybe"}"#,
                1,
            )
            .unwrap();

        let result = orchestrator.run_cycle().await.unwrap();

        assert_eq!(*sizes.lock().unwrap(), vec![1]);
        assert_eq!(get(&manager, good).status, OperationStatus::Synced);
        let bad = get(&manager, bad);
        assert_eq!(bad.status, OperationStatus::Pending);
        assert_eq!(bad.attempts, 1);
        assert!(bad.last_error.unwrap().contains("Invalid payload"));
        assert_eq!(result.verifications.failed, 1);
    }

    #[tokio::test]
    async fn test_cycle_reclaims_abandoned_claims() {
        let transport = ScriptedTransport::new();
        let sizes = transport.batch_sizes();
        let (orchestrator, manager) = orchestrator_with(Arc::new(transport), 3);
        let ids = queue_verifications(&manager, &["STUCK", "LIVE"]).await;
        let (stuck, live) = (ids[0], ids[1]);

        // Both claimed by a run that never finished; only one claim is old.
        assert_eq!(manager.queue().dequeue_batch(2).unwrap().len(), 2);
        let abandoned = Utc::now() - chrono::Duration::hours(1);
        manager
            .queue()
            .database()
            .with_connection("backdate claim", |conn| {
                conn.execute(
                    "UPDATE sync_operations SET claimed_at = ?1 WHERE id = ?2",
                    rusqlite::params![crate::storage::format_timestamp(abandoned), stuck],
                )
            })
            .unwrap();

        let result = orchestrator.run_cycle().await.unwrap();

        assert_eq!(get(&manager, stuck).status, OperationStatus::Synced);
        assert_eq!(get(&manager, stuck).attempts, 0);
        assert_eq!(get(&manager, live).status, OperationStatus::Syncing);
        assert_eq!(*sizes.lock().unwrap(), vec![1]);
        assert_eq!(result.verifications.synced, 1);
    }

    #[tokio::test]
    async fn test_nothing_to_sync() {
        let mut transport = MockTransport::new();
        transport.expect_upload_batch().never();
        let (orchestrator, _manager) = orchestrator_with(Arc::new(transport), 3);

        let result = orchestrator.run_cycle().await.unwrap();

        assert!(result.success);
        assert_eq!(result.message, "Nothing to sync");
    }

    #[tokio::test]
    async fn test_registrations_upload_before_verifications() {
        let mut transport = MockTransport::new();
        let mut seq = mockall::Sequence::new();
        transport
            .expect_upload_batch()
            .withf(|kind, _| *kind == OperationType::Registration)
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, items| {
                Ok(UploadResponse {
                    per_item: items.iter().map(|i| ItemOutcome::success(&i.natural_key)).collect(),
                })
            });
        transport
            .expect_upload_batch()
            .withf(|kind, _| *kind == OperationType::Verification)
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, items| {
                Ok(UploadResponse {
                    per_item: items.iter().map(|i| ItemOutcome::success(&i.natural_key)).collect(),
                })
            });
        let (orchestrator, manager) = orchestrator_with(Arc::new(transport), 3);
        queue_verifications(&manager, &["V"]).await;
        manager
            .queue_registration(&crate::features::sync::RegistrationPayload {
                roll_number: "R".to_string(),
                full_name: "Reg".to_string(),
                organization_id: "ORG".to_string(),
                template: "AA".to_string(),
                quality: None,
                captured_at: Utc::now(),
            })
            .await
            .unwrap();

        let result = orchestrator.run_cycle().await.unwrap();

        assert_eq!(result.message, "Sync completed successfully (2 synced)");
    }

    #[tokio::test]
    async fn test_failed_item_is_not_retried_in_same_cycle() {
        let transport = ScriptedTransport::new().respond_with(vec![ItemOutcome::failure(
            "A",
            "duplicate",
        )]);
        let calls = transport.calls();
        let (orchestrator, manager) = orchestrator_with(Arc::new(transport), 3);
        queue_verifications(&manager, &["A"]).await;

        let mut options = CycleOptions::manual(orchestrator.config());
        options.batch_size = 1;
        let guard = orchestrator.gate().try_acquire().unwrap();
        orchestrator.run_cycle_guarded(guard, options).await.unwrap();

        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cycle_in_progress_is_rejected() {
        let (orchestrator, _manager) = orchestrator_with(Arc::new(ScriptedTransport::new()), 3);
        let _held = orchestrator.gate().try_acquire().unwrap();

        assert!(matches!(
            orchestrator.run_cycle().await,
            Err(RollsyncError::SyncInProgress)
        ));
    }

    #[tokio::test]
    async fn test_batches_are_bounded() {
        let transport = ScriptedTransport::new();
        let sizes = transport.batch_sizes();
        let (orchestrator, manager) = orchestrator_with(Arc::new(transport), 3);
        let rolls: Vec<String> = (0..5).map(|i| format!("V{i}")).collect();
        let refs: Vec<&str> = rolls.iter().map(String::as_str).collect();
        queue_verifications(&manager, &refs).await;

        let mut options = CycleOptions::manual(orchestrator.config());
        options.batch_size = 2;
        let guard = orchestrator.gate().try_acquire().unwrap();
        let result = orchestrator.run_cycle_guarded(guard, options).await.unwrap();

        assert_eq!(*sizes.lock().unwrap(), vec![2, 2, 1]);
        assert_eq!(result.verifications.synced, 5);
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let (orchestrator, manager) = orchestrator_with(Arc::new(ScriptedTransport::new()), 3);
        queue_verifications(&manager, &["A"]).await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let guard = orchestrator.gate().try_acquire().unwrap();
        let result = orchestrator
            .run_cycle_guarded(guard, CycleOptions::background(orchestrator.config(), cancel))
            .await
            .unwrap();

        assert!(result.cancelled);
        assert_eq!(result.message, "Sync cancelled");
        assert_eq!(manager.get_statistics().await.unwrap().pending_verifications, 1);
    }

    #[tokio::test]
    async fn test_background_run_retries_retryable_failures() {
        let transport = ScriptedTransport::new();
        let (orchestrator, manager) = orchestrator_with(Arc::new(transport), 3);
        let id = queue_verifications(&manager, &["A"]).await[0];
        manager
            .queue()
            .database()
            .with_connection("force retryable failure", |conn| {
                conn.execute(
                    "UPDATE sync_operations SET status = 'failed', attempts = 1 WHERE id = ?1",
                    [id],
                )
            })
            .unwrap();

        let guard = orchestrator.gate().try_acquire().unwrap();
        let mut options = CycleOptions::background(orchestrator.config(), CancellationToken::new());
        options.inter_batch_delay = Duration::ZERO;
        let result = orchestrator.run_cycle_guarded(guard, options).await.unwrap();

        assert_eq!(result.retried, 1);
        assert_eq!(get(&manager, id).status, OperationStatus::Synced);
    }

    #[tokio::test]
    async fn test_events_and_status() {
        let transport = ScriptedTransport::new();
        let (orchestrator, manager) = orchestrator_with(Arc::new(transport), 3);
        let mut rx = orchestrator.events().subscribe();
        queue_verifications(&manager, &["A"]).await;

        orchestrator.run_cycle().await.unwrap();

        let mut percents = Vec::new();
        let mut completed = false;
        while let Ok(event) = rx.try_recv() {
            match event {
                SyncEvent::SyncProgress { percent, .. } => percents.push(percent),
                SyncEvent::SyncCompleted(result) => completed = result.success,
                _ => {}
            }
        }
        assert!(completed);
        assert_eq!(percents.last(), Some(&100));
        assert!(percents.windows(2).all(|w| w[0] <= w[1]));

        let status = orchestrator.status();
        assert!(!status.running);
        assert!(status.last_success.is_some());
        assert_eq!(
            status.last_message.as_deref(),
            Some("Sync completed successfully (1 synced)")
        );
    }
}
