//! Output formatting for rollsync.
//!
//! This module provides formatters for queue, sync, and cache results.

mod json;
mod pretty;

use crate::cli::args::OutputFormat;
use crate::error::RollsyncError;
use crate::events::SyncEvent;
use crate::features::cache::{CacheStatistics, RefreshReport};
use crate::features::sync::{Operation, QueueStatistics, SyncResult};

pub use json::*;
pub use pretty::*;

/// Format queue statistics based on output format
///
/// # Errors
///
/// Returns `RollsyncError::Parse` if JSON serialization fails.
pub fn format_queue_stats(
    stats: &QueueStatistics,
    format: OutputFormat,
) -> Result<String, RollsyncError> {
    match format {
        OutputFormat::Pretty => Ok(format_queue_stats_pretty(stats)),
        OutputFormat::Json => format_queue_stats_json(stats),
    }
}

/// Format operations based on output format
///
/// # Errors
///
/// Returns `RollsyncError::Parse` if JSON serialization fails.
pub fn format_operations(
    operations: &[Operation],
    title: &str,
    format: OutputFormat,
) -> Result<String, RollsyncError> {
    match format {
        OutputFormat::Pretty => Ok(format_operations_pretty(operations, title)),
        OutputFormat::Json => format_operations_json(operations),
    }
}

/// Format a sync cycle result based on output format
///
/// # Errors
///
/// Returns `RollsyncError::Parse` if JSON serialization fails.
pub fn format_sync_result(result: &SyncResult, format: OutputFormat) -> Result<String, RollsyncError> {
    match format {
        OutputFormat::Pretty => Ok(format_sync_result_pretty(result)),
        OutputFormat::Json => to_json(result),
    }
}

/// Format cache statistics based on output format
///
/// # Errors
///
/// Returns `RollsyncError::Parse` if JSON serialization fails.
pub fn format_cache_stats(
    stats: &CacheStatistics,
    format: OutputFormat,
) -> Result<String, RollsyncError> {
    match format {
        OutputFormat::Pretty => Ok(format_cache_stats_pretty(stats)),
        OutputFormat::Json => to_json(stats),
    }
}

/// Format a refresh report based on output format
///
/// # Errors
///
/// Returns `RollsyncError::Parse` if JSON serialization fails.
pub fn format_refresh(report: &RefreshReport, format: OutputFormat) -> Result<String, RollsyncError> {
    match format {
        OutputFormat::Pretty => Ok(format_refresh_pretty(report)),
        OutputFormat::Json => to_json(report),
    }
}

/// Format one event as a single line
///
/// # Errors
///
/// Returns `RollsyncError::Parse` if JSON serialization fails.
pub fn format_event(event: &SyncEvent, format: OutputFormat) -> Result<String, RollsyncError> {
    match format {
        OutputFormat::Pretty => Ok(format_event_pretty(event)),
        OutputFormat::Json => Ok(serde_json::to_string(event)?),
    }
}
