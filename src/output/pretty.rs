use chrono::{DateTime, Utc};
use colored::Colorize;

use crate::events::SyncEvent;
use crate::features::cache::{CacheStatistics, RefreshReport};
use crate::features::sync::{
    CategoryResult, Operation, OperationStatus, OperationType, QueueStatistics, SyncResult,
};

fn age(since: DateTime<Utc>) -> String {
    let age = Utc::now().signed_duration_since(since);
    if age.num_days() > 0 {
        format!("{} days ago", age.num_days())
    } else if age.num_hours() > 0 {
        format!("{} hours ago", age.num_hours())
    } else if age.num_minutes() > 0 {
        format!("{} minutes ago", age.num_minutes())
    } else {
        "just now".to_string()
    }
}

/// Format queue statistics
pub fn format_queue_stats_pretty(stats: &QueueStatistics) -> String {
    let mut lines = Vec::new();

    lines.push("Sync Queue Status".bold().to_string());
    lines.push("─".repeat(40));

    lines.push(format!(
        "  Pending:    {} {}",
        stats.total_pending(),
        if stats.total_pending() > 0 {
            "operations waiting".dimmed()
        } else {
            "".dimmed()
        }
    ));
    for (kind, count) in [
        (OperationType::Registration, stats.pending_registrations),
        (OperationType::Verification, stats.pending_verifications),
        (OperationType::RecordUpdate, stats.pending_record_updates),
    ] {
        lines.push(format!("    {:<16} {count}", kind.display_name()));
    }
    lines.push(format!("  Syncing:    {}", stats.syncing));
    lines.push(format!("  Synced:     {} {}", stats.synced, "operations".dimmed()));
    lines.push(format!(
        "  Failed:     {} {}",
        stats.failed,
        if stats.failed > 0 {
            "operations need attention".red()
        } else {
            "".normal()
        }
    ));
    if stats.failed_retryable > 0 {
        lines.push(format!(
            "    {} will be retried automatically",
            stats.failed_retryable
        ));
    }
    lines.push(format!("  Cancelled:  {}", stats.cancelled));

    if let Some(oldest) = stats.oldest_pending {
        lines.push(format!("  Oldest:     {}", age(oldest).dimmed()));
    }

    if stats.total_pending() > 0 {
        lines.push(String::new());
        lines.push(
            "Run 'rollsync sync run' to upload pending operations"
                .dimmed()
                .to_string(),
        );
    }

    lines.join("\n")
}

fn status_icon(status: OperationStatus) -> String {
    match status {
        OperationStatus::Pending => "…".to_string(),
        OperationStatus::Syncing => "▶".cyan().to_string(),
        OperationStatus::Synced => "✓".green().to_string(),
        OperationStatus::Failed => "✗".red().to_string(),
        OperationStatus::Cancelled => "○".yellow().to_string(),
    }
}

/// Format a list of operations as a table
pub fn format_operations_pretty(operations: &[Operation], title: &str) -> String {
    if operations.is_empty() {
        return format!("{title} (0 items)\n  No operations");
    }

    let mut lines = Vec::new();
    lines.push(format!("{} ({} items)", title, operations.len()));
    lines.push("─".repeat(72));
    lines.push(format!(
        "{:<6} {:<16} {:<14} {:<17} {:<9} {}",
        "ID", "Type", "Roll", "Created", "Attempts", "Status"
    ));
    lines.push("─".repeat(72));

    for op in operations {
        let roll = op.natural_key().unwrap_or_else(|_| "?".to_string());
        lines.push(format!(
            "{:<6} {:<16} {:<14} {:<17} {:<9} {}",
            op.id,
            op.operation_type.display_name(),
            roll,
            op.created_at.format("%Y-%m-%d %H:%M"),
            format!("{}/{}", op.attempts, op.max_attempts),
            status_icon(op.status)
        ));
        if let Some(error) = &op.last_error {
            lines.push(format!("       {}", error.red()));
        }
    }

    lines.join("\n")
}

fn category_line(label: &str, category: &CategoryResult) -> String {
    let mut line = format!(
        "  {label:<16} {} synced, {} failed",
        category.synced.to_string().green(),
        if category.failed > 0 {
            category.failed.to_string().red()
        } else {
            category.failed.to_string().normal()
        }
    );
    if category.deferred > 0 {
        line.push_str(&format!(", {} deferred", category.deferred.to_string().yellow()));
    }
    line
}

/// Format the outcome of a sync cycle
pub fn format_sync_result_pretty(result: &SyncResult) -> String {
    let mut lines = Vec::new();

    let headline = if result.success {
        result.message.green().bold()
    } else if result.total_failed() > 0 {
        result.message.red().bold()
    } else {
        result.message.yellow().bold()
    };
    lines.push(headline.to_string());
    lines.push("─".repeat(40));

    lines.push(category_line("Registrations", &result.registrations));
    lines.push(category_line("Verifications", &result.verifications));
    lines.push(category_line("Record updates", &result.record_updates));

    if result.retried > 0 {
        lines.push(format!("  Retried:         {}", result.retried));
    }
    if result.cleaned_up > 0 {
        lines.push(format!("  Cleaned up:      {}", result.cleaned_up));
    }
    match (&result.cache_error, result.cache_refreshed) {
        (Some(error), _) => lines.push(format!("  Cache:           {}", error.yellow())),
        (None, true) => lines.push(format!("  Cache:           {}", "refreshed".green())),
        (None, false) => {}
    }
    lines.push(format!("  Duration:        {} ms", result.duration_ms));

    let errors: Vec<&String> = [
        &result.registrations,
        &result.verifications,
        &result.record_updates,
    ]
    .into_iter()
    .flat_map(|c| c.errors.iter())
    .collect();
    if !errors.is_empty() {
        lines.push(String::new());
        lines.push("Errors:".red().to_string());
        for error in errors {
            lines.push(format!("  • {error}"));
        }
    }

    lines.join("\n")
}

/// Format cache statistics
pub fn format_cache_stats_pretty(stats: &CacheStatistics) -> String {
    let mut lines = Vec::new();

    lines.push("Reference Cache".bold().to_string());
    lines.push("─".repeat(40));
    lines.push(format!(
        "  Scope:      {}",
        stats.scope_id.as_deref().unwrap_or("(not configured)")
    ));

    for category in &stats.categories {
        let updated = category
            .last_updated
            .map_or_else(|| "never".to_string(), age);
        let freshness = if category.stale {
            "stale".yellow()
        } else {
            "fresh".green()
        };
        lines.push(format!(
            "  {:<14} {:>6} records  {}  {}",
            category.category,
            category.record_count,
            updated.dimmed(),
            freshness
        ));
    }

    lines.push(String::new());
    if stats.continuity_ready {
        lines.push(format!("  Offline ready: {}", "yes".green().bold()));
    } else {
        lines.push(format!("  Offline ready: {}", "no".red().bold()));
        lines.push(
            "Run 'rollsync cache refresh' while online"
                .dimmed()
                .to_string(),
        );
    }

    lines.join("\n")
}

/// Format the counts written by a refresh
pub fn format_refresh_pretty(report: &RefreshReport) -> String {
    format!(
        "Cache refreshed: {} students, {} organizations",
        report.students, report.organizations
    )
}

/// Format an event as one log-style line
pub fn format_event_pretty(event: &SyncEvent) -> String {
    let stamp = Utc::now().format("%H:%M:%S").to_string().dimmed();
    let body = match event {
        SyncEvent::SyncProgress { percent, message, .. } => {
            format!("{:>3}% {message}", percent)
        }
        SyncEvent::SyncCompleted(result) => {
            if result.success {
                result.message.green().to_string()
            } else {
                result.message.yellow().to_string()
            }
        }
        SyncEvent::SyncError { message } => format!("{} {message}", "sync error:".red()),
        SyncEvent::CacheUpdated {
            category,
            record_count,
        } => format!("cache updated: {category} ({record_count} records)"),
        SyncEvent::RefreshNeeded { categories } => {
            format!("{} {}", "cache stale:".yellow(), categories.join(", "))
        }
        SyncEvent::ContinuityChanged { ready } => {
            if *ready {
                "offline ready".green().to_string()
            } else {
                "offline not ready".red().to_string()
            }
        }
        SyncEvent::NetworkChanged { online } => {
            if *online {
                "online".green().to_string()
            } else {
                "offline".yellow().to_string()
            }
        }
    };
    format!("{stamp} {body}")
}
