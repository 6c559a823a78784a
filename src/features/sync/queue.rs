//! Persistent queue store.
//!
//! Durable, transactional storage of queued operations. Every mutating call
//! runs through [`Database::with_connection`], so lock contention is retried
//! with backoff before it reaches the caller.

use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, OptionalExtension, Row, TransactionBehavior};
use serde::Serialize;
use tracing::{debug, info, warn};

use super::operation::{Operation, OperationStatus, OperationType, DEFAULT_MAX_ATTEMPTS};
use crate::error::RollsyncError;
use crate::storage::{format_timestamp, parse_timestamp, Database};

const COLUMNS: &str = "id, operation_type, payload, priority, created_at, scheduled_at, \
                       attempts, max_attempts, last_error, status, synced_at, claimed_at, \
                       last_attempt_at";

/// `now - age`, clamped to the earliest representable instant.
fn cutoff_before_now(age: Duration) -> DateTime<Utc> {
    Utc::now()
        .checked_sub_signed(age)
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Sync queue for managing offline operations.
#[derive(Clone)]
pub struct SyncQueue {
    db: Database,
    max_attempts: u32,
}

impl SyncQueue {
    /// Create a sync queue with an existing database connection.
    #[must_use]
    pub const fn with_database(db: Database) -> Self {
        Self {
            db,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    /// Set the attempt budget given to newly enqueued operations.
    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = if max_attempts == 0 { 1 } else { max_attempts };
        self
    }

    /// The underlying database handle.
    #[must_use]
    pub const fn database(&self) -> &Database {
        &self.db
    }

    /// Append a new pending operation, eligible immediately.
    ///
    /// # Errors
    ///
    /// Returns an error if the operation cannot be saved.
    pub fn enqueue(
        &self,
        operation_type: OperationType,
        payload: &str,
        priority: i64,
    ) -> Result<i64, RollsyncError> {
        self.enqueue_scheduled(operation_type, payload, priority, Utc::now())
    }

    /// Append a new pending operation that becomes eligible at `scheduled_at`.
    ///
    /// # Errors
    ///
    /// Returns an error if the operation cannot be saved.
    pub fn enqueue_scheduled(
        &self,
        operation_type: OperationType,
        payload: &str,
        priority: i64,
        scheduled_at: DateTime<Utc>,
    ) -> Result<i64, RollsyncError> {
        let created_at = format_timestamp(Utc::now());
        let scheduled_at = format_timestamp(scheduled_at);

        let id = self.db.with_connection("Failed to enqueue operation", |conn| {
            conn.execute(
                r"INSERT INTO sync_operations
                  (operation_type, payload, priority, created_at, scheduled_at,
                   attempts, max_attempts, status)
                  VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6, 'pending')",
                params![
                    operation_type.as_str(),
                    payload,
                    priority,
                    created_at,
                    scheduled_at,
                    self.max_attempts,
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })?;

        debug!(operation_id = id, kind = operation_type.as_str(), priority, "enqueued operation");
        Ok(id)
    }

    /// Claim up to `limit` eligible pending operations of any type.
    ///
    /// # Errors
    ///
    /// Returns an error if the transaction fails.
    pub fn dequeue_batch(&self, limit: usize) -> Result<Vec<Operation>, RollsyncError> {
        self.claim(None, limit, None)
    }

    /// Claim up to `limit` eligible pending operations of one type.
    ///
    /// Items whose last outcome was applied at or after `attempted_before`
    /// are skipped, so a cycle never picks up an item it already tried.
    ///
    /// # Errors
    ///
    /// Returns an error if the transaction fails.
    pub fn dequeue_batch_of(
        &self,
        operation_type: OperationType,
        limit: usize,
        attempted_before: Option<DateTime<Utc>>,
    ) -> Result<Vec<Operation>, RollsyncError> {
        self.claim(Some(operation_type), limit, attempted_before)
    }

    /// Select and flip to `syncing` inside one IMMEDIATE transaction, so two
    /// callers can never claim the same row.
    fn claim(
        &self,
        operation_type: Option<OperationType>,
        limit: usize,
        attempted_before: Option<DateTime<Utc>>,
    ) -> Result<Vec<Operation>, RollsyncError> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let now = Utc::now();
        let now_str = format_timestamp(now);
        let kind = operation_type.map(|t| t.as_str());
        let watermark = attempted_before.map(format_timestamp);
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let select = format!(
            r"SELECT {COLUMNS} FROM sync_operations
              WHERE status = 'pending'
                AND scheduled_at <= ?1
                AND (?2 IS NULL OR operation_type = ?2)
                AND (?3 IS NULL OR last_attempt_at IS NULL OR last_attempt_at < ?3)
              ORDER BY priority DESC, created_at ASC, id ASC
              LIMIT ?4"
        );

        let mut operations = self.db.with_connection("Failed to dequeue batch", |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let operations = {
                let mut stmt = tx.prepare(&select)?;
                let rows =
                    stmt.query_map(params![now_str, kind, watermark, limit], row_to_operation)?;
                rows.collect::<Result<Vec<_>, _>>()?
            };
            {
                let mut update = tx.prepare(
                    r"UPDATE sync_operations SET status = 'syncing', claimed_at = ?1
                      WHERE id = ?2 AND status = 'pending'",
                )?;
                for op in &operations {
                    update.execute(params![now_str, op.id])?;
                }
            }
            tx.commit()?;
            Ok(operations)
        })?;

        for op in &mut operations {
            op.status = OperationStatus::Syncing;
            op.claimed_at = Some(now);
        }

        if !operations.is_empty() {
            debug!(
                batch_size = operations.len(),
                kind = kind.unwrap_or("any"),
                "claimed batch"
            );
        }
        Ok(operations)
    }

    /// Mark a pending or syncing operation as synced.
    ///
    /// # Errors
    ///
    /// Returns `RollsyncError::NotFound` if no such operation is pending or
    /// syncing.
    pub fn mark_success(&self, id: i64) -> Result<(), RollsyncError> {
        let now = format_timestamp(Utc::now());

        let rows = self.db.with_connection("Failed to mark operation synced", |conn| {
            conn.execute(
                r"UPDATE sync_operations SET
                  status = 'synced',
                  synced_at = ?1,
                  last_attempt_at = ?1,
                  last_error = NULL,
                  claimed_at = NULL
                  WHERE id = ?2 AND status IN ('pending', 'syncing')",
                params![now, id],
            )
        })?;

        if rows == 0 {
            return Err(RollsyncError::NotFound(format!("pending or syncing operation {id}")));
        }
        Ok(())
    }

    /// Record a failed attempt.
    ///
    /// Increments `attempts`; the operation becomes `failed` once the budget
    /// is spent and returns to `pending` otherwise. Terminal operations are
    /// left untouched. Returns the resulting status.
    ///
    /// # Errors
    ///
    /// Returns `RollsyncError::NotFound` if the operation does not exist.
    pub fn mark_failed(&self, id: i64, error: &str) -> Result<OperationStatus, RollsyncError> {
        let now = format_timestamp(Utc::now());

        let status = self.db.with_connection("Failed to mark operation failed", |conn| {
            let updated: Option<String> = conn
                .query_row(
                    r"UPDATE sync_operations SET
                      attempts = MIN(attempts + 1, max_attempts),
                      status = CASE WHEN attempts + 1 >= max_attempts
                                    THEN 'failed' ELSE 'pending' END,
                      last_error = ?1,
                      last_attempt_at = ?2,
                      claimed_at = NULL
                      WHERE id = ?3 AND status IN ('pending', 'syncing')
                      RETURNING status",
                    params![error, now, id],
                    |row| row.get(0),
                )
                .optional()?;

            match updated {
                Some(status) => Ok(Some(status)),
                None => conn
                    .query_row(
                        "SELECT status FROM sync_operations WHERE id = ?1",
                        [id],
                        |row| row.get(0),
                    )
                    .optional(),
            }
        })?;

        let status = status.ok_or_else(|| RollsyncError::NotFound(format!("operation {id}")))?;
        let status = OperationStatus::from_str(&status)?;
        if status == OperationStatus::Failed {
            warn!(operation_id = id, error, "operation failed permanently");
        }
        Ok(status)
    }

    /// Return a claimed operation to `pending` without consuming an attempt.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    pub fn release(&self, id: i64) -> Result<bool, RollsyncError> {
        let rows = self.db.with_connection("Failed to release operation", |conn| {
            conn.execute(
                r"UPDATE sync_operations SET status = 'pending', claimed_at = NULL
                  WHERE id = ?1 AND status = 'syncing'",
                [id],
            )
        })?;
        Ok(rows > 0)
    }

    /// Operations eligible for another try: failed items with attempts left
    /// and items stuck in `syncing` longer than `stale_after`.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn list_retryable(&self, stale_after: Duration) -> Result<Vec<Operation>, RollsyncError> {
        let cutoff = format_timestamp(cutoff_before_now(stale_after));
        let sql = format!(
            r"SELECT {COLUMNS} FROM sync_operations
              WHERE (status = 'failed' AND attempts < max_attempts)
                 OR (status = 'syncing' AND claimed_at < ?1)
              ORDER BY priority DESC, created_at ASC, id ASC"
        );

        self.db.with_connection("Failed to list retryable operations", |conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map([&cutoff], row_to_operation)?;
            rows.collect()
        })
    }

    /// Reclaim operations left in `syncing` longer than `stale_after`.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    pub fn recover_stale(&self, stale_after: Duration) -> Result<usize, RollsyncError> {
        let cutoff = format_timestamp(cutoff_before_now(stale_after));

        let rows = self.db.with_connection("Failed to recover stale operations", |conn| {
            conn.execute(
                r"UPDATE sync_operations SET status = 'pending', claimed_at = NULL
                  WHERE status = 'syncing' AND claimed_at < ?1",
                [&cutoff],
            )
        })?;

        if rows > 0 {
            info!(count = rows, "recovered stale syncing operations");
        }
        Ok(rows)
    }

    /// Move everything [`Self::list_retryable`] reports back to `pending`.
    ///
    /// # Errors
    ///
    /// Returns an error if the transaction fails.
    pub fn requeue_retryable(&self, stale_after: Duration) -> Result<usize, RollsyncError> {
        let cutoff = format_timestamp(cutoff_before_now(stale_after));

        self.db.with_connection("Failed to requeue retryable operations", |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let failed = tx.execute(
                r"UPDATE sync_operations SET status = 'pending'
                  WHERE status = 'failed' AND attempts < max_attempts",
                [],
            )?;
            let stale = tx.execute(
                r"UPDATE sync_operations SET status = 'pending', claimed_at = NULL
                  WHERE status = 'syncing' AND claimed_at < ?1",
                [&cutoff],
            )?;
            tx.commit()?;
            Ok(failed + stale)
        })
    }

    /// Administrative reset of a terminally failed operation.
    ///
    /// # Errors
    ///
    /// Returns `RollsyncError::NotFound` if no failed operation has this id.
    pub fn reset_failed(&self, id: i64) -> Result<(), RollsyncError> {
        let rows = self.db.with_connection("Failed to reset operation", |conn| {
            conn.execute(
                r"UPDATE sync_operations SET
                  status = 'pending', attempts = 0, last_error = NULL, claimed_at = NULL
                  WHERE id = ?1 AND status = 'failed'",
                [id],
            )
        })?;

        if rows == 0 {
            return Err(RollsyncError::NotFound(format!("failed operation {id}")));
        }
        info!(operation_id = id, "reset failed operation");
        Ok(())
    }

    /// Administrative reset of every failed operation.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    pub fn reset_all_failed(&self) -> Result<usize, RollsyncError> {
        self.db.with_connection("Failed to reset failed operations", |conn| {
            conn.execute(
                r"UPDATE sync_operations SET
                  status = 'pending', attempts = 0, last_error = NULL, claimed_at = NULL
                  WHERE status = 'failed'",
                [],
            )
        })
    }

    /// Withdraw a pending or failed operation.
    ///
    /// # Errors
    ///
    /// Returns `RollsyncError::NotFound` if no cancellable operation has this id.
    pub fn cancel(&self, id: i64) -> Result<(), RollsyncError> {
        let rows = self.db.with_connection("Failed to cancel operation", |conn| {
            conn.execute(
                r"UPDATE sync_operations SET status = 'cancelled', claimed_at = NULL
                  WHERE id = ?1 AND status IN ('pending', 'failed')",
                [id],
            )
        })?;

        if rows == 0 {
            return Err(RollsyncError::NotFound(format!("cancellable operation {id}")));
        }
        Ok(())
    }

    /// Delete synced and cancelled operations older than `retention_days`.
    ///
    /// # Errors
    ///
    /// Returns an error if the delete fails.
    pub fn cleanup(&self, retention_days: u32) -> Result<usize, RollsyncError> {
        let age = Duration::try_days(i64::from(retention_days)).unwrap_or(Duration::MAX);
        self.cleanup_before(cutoff_before_now(age))
    }

    /// Delete synced and cancelled operations that finished before `cutoff`.
    ///
    /// Synced items age from `synced_at`, cancelled items from `created_at`.
    ///
    /// # Errors
    ///
    /// Returns an error if the delete fails.
    pub fn cleanup_before(&self, cutoff: DateTime<Utc>) -> Result<usize, RollsyncError> {
        let cutoff = format_timestamp(cutoff);

        let rows = self.db.with_connection("Failed to cleanup operations", |conn| {
            conn.execute(
                r"DELETE FROM sync_operations
                  WHERE (status = 'synced' AND COALESCE(synced_at, created_at) < ?1)
                     OR (status = 'cancelled' AND created_at < ?1)",
                [&cutoff],
            )
        })?;

        if rows > 0 {
            info!(count = rows, "purged finished operations");
        }
        Ok(rows)
    }

    /// Get a specific operation by ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn get(&self, id: i64) -> Result<Option<Operation>, RollsyncError> {
        let sql = format!("SELECT {COLUMNS} FROM sync_operations WHERE id = ?1");

        self.db.with_connection("Failed to query operation", |conn| {
            conn.query_row(&sql, [id], row_to_operation).optional()
        })
    }

    /// List operations in dequeue order, optionally filtered by status.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn list(
        &self,
        status: Option<OperationStatus>,
        limit: usize,
    ) -> Result<Vec<Operation>, RollsyncError> {
        let status = status.map(|s| s.as_str());
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let sql = format!(
            r"SELECT {COLUMNS} FROM sync_operations
              WHERE (?1 IS NULL OR status = ?1)
              ORDER BY priority DESC, created_at ASC, id ASC
              LIMIT ?2"
        );

        self.db.with_connection("Failed to list operations", |conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params![status, limit], row_to_operation)?;
            rows.collect()
        })
    }

    /// Number of pending operations, eligible or not.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn pending_count(&self) -> Result<usize, RollsyncError> {
        let count: i64 = self.db.with_connection("Failed to count pending", |conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM sync_operations WHERE status = 'pending'",
                [],
                |row| row.get(0),
            )
        })?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    /// Get queue statistics.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn stats(&self) -> Result<QueueStatistics, RollsyncError> {
        self.db.with_connection("Failed to read queue statistics", |conn| {
            let mut stats = QueueStatistics::default();

            let mut stmt = conn.prepare(
                r"SELECT operation_type, status, attempts < max_attempts, COUNT(*)
                  FROM sync_operations
                  GROUP BY operation_type, status, attempts < max_attempts",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, bool>(2)?,
                    row.get::<_, i64>(3)?,
                ))
            })?;

            for row in rows {
                let (kind, status, has_attempts_left, count) = row?;
                stats.record(&kind, &status, has_attempts_left, count);
            }

            let oldest: Option<String> = conn
                .query_row(
                    r"SELECT created_at FROM sync_operations
                      WHERE status = 'pending' ORDER BY created_at ASC LIMIT 1",
                    [],
                    |row| row.get(0),
                )
                .optional()?;
            stats.oldest_pending = oldest.map(|s| parse_timestamp(0, &s)).transpose()?;

            Ok(stats)
        })
    }

    /// Append an audit log entry.
    ///
    /// # Errors
    ///
    /// Returns an error if the insert fails.
    pub fn record_audit(
        &self,
        action: &str,
        operation_type: Option<OperationType>,
        item_count: usize,
    ) -> Result<(), RollsyncError> {
        let now = format_timestamp(Utc::now());
        let count = i64::try_from(item_count).unwrap_or(i64::MAX);

        self.db.with_connection("Failed to write audit entry", |conn| {
            conn.execute(
                r"INSERT INTO audit_log (action, operation_type, item_count, created_at)
                  VALUES (?1, ?2, ?3, ?4)",
                params![action, operation_type.map(|t| t.as_str()), count, now],
            )
        })?;
        Ok(())
    }

    /// Sum of `item_count` over audit entries with this action.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn audit_total(&self, action: &str) -> Result<i64, RollsyncError> {
        self.db.with_connection("Failed to read audit log", |conn| {
            conn.query_row(
                "SELECT COALESCE(SUM(item_count), 0) FROM audit_log WHERE action = ?1",
                [action],
                |row| row.get(0),
            )
        })
    }
}

/// Queue statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStatistics {
    /// Pending registrations
    pub pending_registrations: u64,
    /// Pending verifications
    pub pending_verifications: u64,
    /// Pending record updates
    pub pending_record_updates: u64,
    /// Operations claimed by a batch
    pub syncing: u64,
    /// Operations accepted by the server
    pub synced: u64,
    /// Operations out of attempts
    pub failed: u64,
    /// Failed operations that still have attempts left
    pub failed_retryable: u64,
    /// Withdrawn operations
    pub cancelled: u64,
    /// Oldest pending operation timestamp
    pub oldest_pending: Option<DateTime<Utc>>,
}

impl QueueStatistics {
    /// Pending operations across all types.
    #[must_use]
    pub const fn total_pending(&self) -> u64 {
        self.pending_registrations + self.pending_verifications + self.pending_record_updates
    }

    fn record(&mut self, kind: &str, status: &str, has_attempts_left: bool, count: i64) {
        let count = u64::try_from(count).unwrap_or(0);
        match (status, OperationType::from_str(kind).ok()) {
            ("pending", Some(OperationType::Registration)) => self.pending_registrations += count,
            ("pending", Some(OperationType::Verification)) => self.pending_verifications += count,
            ("pending", Some(OperationType::RecordUpdate)) => self.pending_record_updates += count,
            ("syncing", _) => self.syncing += count,
            ("synced", _) => self.synced += count,
            ("failed", _) => {
                self.failed += count;
                if has_attempts_left {
                    self.failed_retryable += count;
                }
            }
            ("cancelled", _) => self.cancelled += count,
            _ => {}
        }
    }
}

fn parse_column<T: FromStr<Err = RollsyncError>>(idx: usize, s: &str) -> rusqlite::Result<T> {
    s.parse().map_err(|e: RollsyncError| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn row_to_operation(row: &Row<'_>) -> Result<Operation, rusqlite::Error> {
    let operation_type: String = row.get(1)?;
    let created_at: String = row.get(4)?;
    let scheduled_at: String = row.get(5)?;
    let status: String = row.get(9)?;
    let synced_at: Option<String> = row.get(10)?;
    let claimed_at: Option<String> = row.get(11)?;
    let last_attempt_at: Option<String> = row.get(12)?;

    Ok(Operation {
        id: row.get(0)?,
        operation_type: parse_column(1, &operation_type)?,
        payload: row.get(2)?,
        priority: row.get(3)?,
        created_at: parse_timestamp(4, &created_at)?,
        scheduled_at: parse_timestamp(5, &scheduled_at)?,
        attempts: row.get(6)?,
        max_attempts: row.get(7)?,
        last_error: row.get(8)?,
        status: parse_column(9, &status)?,
        synced_at: synced_at.map(|s| parse_timestamp(10, &s)).transpose()?,
        claimed_at: claimed_at.map(|s| parse_timestamp(11, &s)).transpose()?,
        last_attempt_at: last_attempt_at.map(|s| parse_timestamp(12, &s)).transpose()?,
    })
}
