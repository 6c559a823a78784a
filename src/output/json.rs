//! JSON output formatting for rollsync.

use serde::Serialize;
use serde_json::json;

use crate::error::RollsyncError;
use crate::features::sync::{Operation, QueueStatistics};

/// Format queue statistics as JSON, with the pending total included.
///
/// # Errors
///
/// Returns `RollsyncError::Parse` if JSON serialization fails.
pub fn format_queue_stats_json(stats: &QueueStatistics) -> Result<String, RollsyncError> {
    let output = json!({
        "total_pending": stats.total_pending(),
        "stats": stats,
    });
    Ok(serde_json::to_string_pretty(&output)?)
}

/// Format operations as JSON
///
/// # Errors
///
/// Returns `RollsyncError::Parse` if JSON serialization fails.
pub fn format_operations_json(operations: &[Operation]) -> Result<String, RollsyncError> {
    let output = json!({
        "count": operations.len(),
        "items": operations
    });
    Ok(serde_json::to_string_pretty(&output)?)
}

/// Generic JSON formatter for any serializable type
///
/// # Errors
///
/// Returns `RollsyncError::Parse` if JSON serialization fails.
pub fn to_json<T: Serialize>(value: &T) -> Result<String, RollsyncError> {
    Ok(serde_json::to_string_pretty(value)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_stats_json_has_total() {
        let stats = QueueStatistics {
            pending_registrations: 2,
            pending_verifications: 3,
            ..QueueStatistics::default()
        };

        let parsed: serde_json::Value =
            serde_json::from_str(&format_queue_stats_json(&stats).unwrap()).unwrap();

        assert_eq!(parsed["total_pending"], 5);
        assert_eq!(parsed["stats"]["pending_verifications"], 3);
    }

    #[test]
    fn test_empty_operations_json() {
        let parsed: serde_json::Value =
            serde_json::from_str(&format_operations_json(&[]).unwrap()).unwrap();

        assert_eq!(parsed["count"], 0);
        assert!(parsed["items"].as_array().unwrap().is_empty());
    }
}
