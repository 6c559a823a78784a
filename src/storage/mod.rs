//! Storage layer for rollsync.
//!
//! This module provides SQLite-based persistence for:
//! - The offline operation queue
//! - The reference-data cache and its metadata
//! - The audit log

mod database;
mod migrations;

use chrono::{DateTime, SecondsFormat, Utc};

pub use database::Database;

use crate::error::RollsyncError;

/// Format a timestamp for storage.
///
/// Fixed-width UTC with microseconds, so lexical order is chronological and
/// `ORDER BY` / range comparisons work directly on the text column.
#[must_use]
pub fn format_timestamp(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Run a blocking store call on the blocking thread pool.
///
/// # Errors
///
/// Returns the closure's error, or `RollsyncError::Task` if the blocking
/// task panicked.
pub async fn blocking<T, F>(f: F) -> Result<T, RollsyncError>
where
    F: FnOnce() -> Result<T, RollsyncError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f).await?
}

/// Parse a stored timestamp inside a row mapper.
pub(crate) fn parse_timestamp(idx: usize, s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}
