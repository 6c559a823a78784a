//! Queue command implementation.
//!
//! Handles inspection and administration of the operation queue.

use std::str::FromStr;

use serde_json::json;

use super::Context;
use crate::cli::args::{OutputFormat, QueueCommands};
use crate::error::RollsyncError;
use crate::features::sync::{
    OperationStatus, OperationType, QueueManager, RecordUpdatePayload, RegistrationPayload,
    VerificationPayload,
};
use crate::output::{format_operations, format_queue_stats, to_json};
use crate::storage::blocking;

/// Execute queue subcommands.
///
/// # Errors
///
/// Returns an error if the database cannot be opened or the command fails.
pub async fn queue(ctx: &Context, cmd: QueueCommands) -> Result<String, RollsyncError> {
    let service = ctx.service()?;
    let manager = service.manager();
    let format = ctx.format;

    match cmd {
        QueueCommands::Status => {
            let stats = manager.get_statistics().await?;
            format_queue_stats(&stats, format)
        }
        QueueCommands::List { status, limit } => {
            let status = status.as_deref().map(OperationStatus::from_str).transpose()?;
            let queue = manager.queue().clone();
            let operations = blocking(move || queue.list(status, limit)).await?;
            let title = status.map_or_else(
                || "All operations".to_string(),
                |s| format!("{} operations", capitalize(s.as_str())),
            );
            format_operations(&operations, &title, format)
        }
        QueueCommands::Add { kind, payload } => add_operation(manager, &kind, &payload, format).await,
        QueueCommands::Retry { all, id } => {
            let queue = manager.queue().clone();
            match (id, all) {
                (Some(id), _) => {
                    blocking(move || queue.reset_failed(id)).await?;
                    match format {
                        OutputFormat::Json => to_json(&json!({ "reset": [id] })),
                        OutputFormat::Pretty => Ok(format!("Reset operation {id} for retry")),
                    }
                }
                (None, true) => {
                    let count = blocking(move || queue.reset_all_failed()).await?;
                    match format {
                        OutputFormat::Json => to_json(&json!({ "reset": count })),
                        OutputFormat::Pretty => {
                            Ok(format!("Reset {count} failed operations for retry"))
                        }
                    }
                }
                (None, false) => Err(RollsyncError::Config(
                    "Specify --all or provide an operation ID".to_string(),
                )),
            }
        }
        QueueCommands::Cancel { id } => {
            let queue = manager.queue().clone();
            blocking(move || queue.cancel(id)).await?;
            match format {
                OutputFormat::Json => to_json(&json!({ "cancelled": id })),
                OutputFormat::Pretty => Ok(format!("Cancelled operation {id}")),
            }
        }
        QueueCommands::Clean { older_than_days } => {
            let days = older_than_days.unwrap_or(ctx.config.sync.retention_days);
            let queue = manager.queue().clone();
            let count = blocking(move || queue.cleanup(days)).await?;
            match format {
                OutputFormat::Json => to_json(&json!({ "removed": count, "older_than_days": days })),
                OutputFormat::Pretty => Ok(format!(
                    "Removed {count} synced or cancelled operations older than {days} days"
                )),
            }
        }
    }
}

/// Decode `payload` as the typed body for `kind` and queue it.
async fn add_operation(
    manager: &QueueManager,
    kind: &str,
    payload: &str,
    format: OutputFormat,
) -> Result<String, RollsyncError> {
    let kind = OperationType::from_str(kind)?;
    let id = match kind {
        OperationType::Registration => {
            let payload: RegistrationPayload = serde_json::from_str(payload)?;
            manager.queue_registration(&payload).await?
        }
        OperationType::Verification => {
            let payload: VerificationPayload = serde_json::from_str(payload)?;
            manager.queue_verification(&payload).await?
        }
        OperationType::RecordUpdate => {
            let payload: RecordUpdatePayload = serde_json::from_str(payload)?;
            manager.queue_record_update(&payload).await?
        }
    };

    match format {
        OutputFormat::Json => to_json(&json!({ "id": id, "kind": kind.as_str() })),
        OutputFormat::Pretty => Ok(format!(
            "Queued {} operation (ID: {id})",
            kind.display_name()
        )),
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    chars.next().map_or_else(String::new, |first| {
        first.to_uppercase().chain(chars).collect()
    })
}
