//! Queue manager.
//!
//! Typed entry points that fix the priority policy, statistics, and a batch
//! processor that isolates every item's failure from its peers.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use serde::Serialize;
use tracing::{debug, warn};

use super::operation::{
    natural_key_of, Operation, OperationPayload, OperationStatus, RecordUpdatePayload,
    RegistrationPayload, VerificationPayload,
};
use super::queue::{QueueStatistics, SyncQueue};
use crate::error::RollsyncError;
use crate::features::cache::{CacheStore, STUDENTS};
use crate::storage::blocking;

/// Audit action recorded for every enqueue.
pub const AUDIT_ENQUEUE: &str = "enqueue";

/// Failure of one item inside a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ItemError {
    pub id: i64,
    pub message: String,
}

/// Aggregate outcome of [`QueueManager::process_batch`].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchResult {
    pub total_processed: usize,
    pub success_count: usize,
    pub failed_count: usize,
    pub errors: Vec<ItemError>,
    pub succeeded_ids: Vec<i64>,
}

impl BatchResult {
    /// Fraction of processed items that succeeded, `0.0` for an empty batch.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn success_rate(&self) -> f64 {
        if self.total_processed == 0 {
            0.0
        } else {
            self.success_count as f64 / self.total_processed as f64
        }
    }

    fn failed(&mut self, id: i64, message: String) {
        self.failed_count += 1;
        self.errors.push(ItemError { id, message });
    }
}

/// Typed facade over the queue store. Cheap to clone.
#[derive(Clone)]
pub struct QueueManager {
    queue: SyncQueue,
    cache: Option<CacheStore>,
}

impl QueueManager {
    /// Create a manager over `queue`.
    #[must_use]
    pub const fn new(queue: SyncQueue) -> Self {
        Self { queue, cache: None }
    }

    /// Tag cached students when record updates are queued against them.
    #[must_use]
    pub fn with_cache(mut self, cache: CacheStore) -> Self {
        self.cache = Some(cache);
        self
    }

    /// The underlying store.
    #[must_use]
    pub const fn queue(&self) -> &SyncQueue {
        &self.queue
    }

    /// Queue a biometric enrollment (priority 2).
    ///
    /// # Errors
    ///
    /// Returns `RollsyncError::InvalidPayload` for an empty roll number and
    /// storage errors otherwise.
    pub async fn queue_registration(
        &self,
        payload: &RegistrationPayload,
    ) -> Result<i64, RollsyncError> {
        self.enqueue_payload(payload).await
    }

    /// Queue a verification outcome (priority 1).
    ///
    /// # Errors
    ///
    /// Returns `RollsyncError::InvalidPayload` for an empty roll number and
    /// storage errors otherwise.
    pub async fn queue_verification(
        &self,
        payload: &VerificationPayload,
    ) -> Result<i64, RollsyncError> {
        self.enqueue_payload(payload).await
    }

    /// Queue a record edit (priority 0) and apply it to the cached student.
    ///
    /// # Errors
    ///
    /// Returns `RollsyncError::InvalidPayload` for an empty roll number and
    /// storage errors otherwise.
    pub async fn queue_record_update(
        &self,
        payload: &RecordUpdatePayload,
    ) -> Result<i64, RollsyncError> {
        let id = self.enqueue_payload(payload).await?;

        if let Some(cache) = self.cache.clone() {
            let key = payload.roll_number.trim().to_string();
            let changes = payload.changes.clone();
            let tagged =
                blocking(move || cache.apply_local_edit(STUDENTS, &key, &changes)).await?;
            debug!(operation_id = id, tagged, "record update applied to cache");
        }
        Ok(id)
    }

    /// Serialize, enqueue at the type's priority, and audit.
    async fn enqueue_payload<P: OperationPayload>(&self, payload: &P) -> Result<i64, RollsyncError> {
        let json = serde_json::to_string(payload)?;
        natural_key_of(&json)?;

        let queue = self.queue.clone();
        blocking(move || {
            let id = queue.enqueue(P::KIND, &json, P::KIND.priority())?;
            queue.record_audit(AUDIT_ENQUEUE, Some(P::KIND), 1)?;
            Ok(id)
        })
        .await
    }

    /// Pending counts per type plus failure counts.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub async fn get_statistics(&self) -> Result<QueueStatistics, RollsyncError> {
        let queue = self.queue.clone();
        blocking(move || queue.stats()).await
    }

    /// Claim up to `limit` eligible operations of any type.
    ///
    /// # Errors
    ///
    /// Returns an error if the store transaction fails.
    pub async fn get_batch(&self, limit: usize) -> Result<Vec<Operation>, RollsyncError> {
        let queue = self.queue.clone();
        blocking(move || queue.dequeue_batch(limit)).await
    }

    /// Mark an operation synced.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    pub async fn mark_success(&self, id: i64) -> Result<(), RollsyncError> {
        let queue = self.queue.clone();
        blocking(move || queue.mark_success(id)).await
    }

    /// Record a failed attempt.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    pub async fn mark_failed(&self, id: i64, error: String) -> Result<OperationStatus, RollsyncError> {
        let queue = self.queue.clone();
        blocking(move || queue.mark_failed(id, &error)).await
    }

    /// Run `process` on every item and record its outcome.
    ///
    /// `Ok(true)` marks the item synced; `Ok(false)`, an error or a panic
    /// records a failed attempt. No item's failure stops the rest.
    pub async fn process_batch<F, Fut>(&self, items: Vec<Operation>, mut process: F) -> BatchResult
    where
        F: FnMut(Operation) -> Fut,
        Fut: Future<Output = Result<bool, RollsyncError>>,
    {
        let mut result = BatchResult::default();

        for item in items {
            let id = item.id;
            result.total_processed += 1;

            let outcome = match AssertUnwindSafe(process(item)).catch_unwind().await {
                Ok(Ok(true)) => Ok(()),
                Ok(Ok(false)) => Err("processing reported failure".to_string()),
                Ok(Err(e)) => Err(e.to_string()),
                Err(panic) => Err(format!("processing panicked: {}", panic_message(&*panic))),
            };

            match outcome {
                Ok(()) => match self.mark_success(id).await {
                    Ok(()) => {
                        result.success_count += 1;
                        result.succeeded_ids.push(id);
                    }
                    Err(e) => result.failed(id, e.to_string()),
                },
                Err(message) => {
                    warn!(operation_id = id, error = %message, "batch item failed");
                    if let Err(e) = self.mark_failed(id, message.clone()).await {
                        warn!(operation_id = id, error = %e, "could not record failure");
                    }
                    result.failed(id, message);
                }
            }
        }

        result
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::cache::{EntitySyncStatus, StudentRecord};
    use crate::features::sync::operation::OperationType;
    use crate::storage::Database;
    use chrono::Utc;

    fn manager() -> QueueManager {
        let db = Database::open_in_memory().unwrap();
        QueueManager::new(SyncQueue::with_database(db.clone()))
            .with_cache(CacheStore::with_database(db))
    }

    fn registration(roll: &str) -> RegistrationPayload {
        RegistrationPayload {
            roll_number: roll.to_string(),
            full_name: format!("Person {roll}"),
            organization_id: "ORG-1".to_string(),
            template: "AAEC".to_string(),
            quality: Some(70),
            captured_at: Utc::now(),
        }
    }

    fn verification(roll: &str) -> VerificationPayload {
        VerificationPayload {
            roll_number: roll.to_string(),
            matched: true,
            score: Some(0.9),
            session_id: None,
            verified_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_typed_entry_points_fix_priority() {
        let manager = manager();

        let reg = manager.queue_registration(&registration("R")).await.unwrap();
        let ver = manager.queue_verification(&verification("V")).await.unwrap();
        let upd = manager
            .queue_record_update(&RecordUpdatePayload {
                roll_number: "U".to_string(),
                changes: serde_json::Map::new(),
                edited_at: Utc::now(),
            })
            .await
            .unwrap();

        let queue = manager.queue();
        assert_eq!(queue.get(reg).unwrap().unwrap().priority, 2);
        assert_eq!(queue.get(ver).unwrap().unwrap().priority, 1);
        assert_eq!(queue.get(upd).unwrap().unwrap().priority, 0);
        assert_eq!(queue.audit_total(AUDIT_ENQUEUE).unwrap(), 3);
    }

    #[tokio::test]
    async fn test_empty_natural_key_rejected() {
        let manager = manager();

        let result = manager.queue_registration(&registration(" ")).await;

        assert!(matches!(result, Err(RollsyncError::InvalidPayload(_))));
        assert_eq!(manager.get_statistics().await.unwrap().total_pending(), 0);
    }

    #[tokio::test]
    async fn test_three_registrations_then_verification() {
        let manager = manager();
        for roll in ["R1", "R2", "R3"] {
            manager.queue_registration(&registration(roll)).await.unwrap();
        }
        for roll in ["V1", "V2"] {
            manager.queue_verification(&verification(roll)).await.unwrap();
        }

        let batch = manager.get_batch(4).await.unwrap();
        let keys: Vec<String> = batch.iter().map(|op| op.natural_key().unwrap()).collect();

        assert_eq!(keys, vec!["R1", "R2", "R3", "V1"]);
        assert_eq!(batch[3].operation_type, OperationType::Verification);
    }

    #[tokio::test]
    async fn test_record_update_tags_cached_student() {
        let manager = manager();
        let cache = CacheStore::with_database(manager.queue().database().clone());
        cache
            .replace_category(&[StudentRecord {
                roll_number: "S1".to_string(),
                name: "Old Name".to_string(),
                organization_id: "ORG-1".to_string(),
                enrolled: true,
                updated_at: None,
            }])
            .unwrap();

        let mut changes = serde_json::Map::new();
        changes.insert("name".to_string(), serde_json::json!("New Name"));
        manager
            .queue_record_update(&RecordUpdatePayload {
                roll_number: "S1".to_string(),
                changes,
                edited_at: Utc::now(),
            })
            .await
            .unwrap();

        let cached = cache.get::<StudentRecord>("S1").unwrap().unwrap();
        assert_eq!(cached.sync_status, EntitySyncStatus::Pending);
        assert_eq!(cached.data.name, "New Name");
    }

    #[tokio::test]
    async fn test_statistics_by_type() {
        let manager = manager();
        manager.queue_registration(&registration("R1")).await.unwrap();
        manager.queue_verification(&verification("V1")).await.unwrap();
        manager.queue_verification(&verification("V2")).await.unwrap();

        let stats = manager.get_statistics().await.unwrap();

        assert_eq!(stats.pending_registrations, 1);
        assert_eq!(stats.pending_verifications, 2);
        assert_eq!(stats.pending_record_updates, 0);
        assert_eq!(stats.failed_retryable, 0);
    }

    #[tokio::test]
    async fn test_process_batch_isolates_failures() {
        let manager = manager();
        for roll in ["OK", "FALSE", "ERR", "PANIC", "OK2"] {
            manager.queue_verification(&verification(roll)).await.unwrap();
        }
        let items = manager.get_batch(10).await.unwrap();

        let result = manager
            .process_batch(items, |op| async move {
                match op.natural_key()?.as_str() {
                    "FALSE" => Ok(false),
                    "ERR" => Err(RollsyncError::Rejected("server said no".to_string())),
                    "PANIC" => panic!("scanner exploded"),
                    _ => Ok(true),
                }
            })
            .await;

        assert_eq!(result.total_processed, 5);
        assert_eq!(result.success_count, 2);
        assert_eq!(result.failed_count, 3);
        assert_eq!(result.succeeded_ids.len(), 2);
        assert!((result.success_rate() - 0.4).abs() < f64::EPSILON);
        assert!(result
            .errors
            .iter()
            .any(|e| e.message == "server said no"));
        assert!(result
            .errors
            .iter()
            .any(|e| e.message.contains("scanner exploded")));

        let stats = manager.get_statistics().await.unwrap();
        assert_eq!(stats.synced, 2);
        assert_eq!(stats.pending_verifications, 3);

        let err_item = result
            .errors
            .iter()
            .find(|e| e.message == "server said no")
            .unwrap();
        let stored = manager.queue().get(err_item.id).unwrap().unwrap();
        assert_eq!(stored.attempts, 1);
        assert_eq!(stored.last_error.as_deref(), Some("server said no"));
    }

    #[test]
    fn test_success_rate_empty_batch() {
        assert!(BatchResult::default().success_rate().abs() < f64::EPSILON);
    }
}
