//! Wire types shared by every transport.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::features::cache::{OrganizationRecord, StudentRecord};

/// One queued operation as sent to the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadItem {
    pub natural_key: String,
    pub payload: serde_json::Value,
}

/// Per-item verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutcomeStatus {
    Success,
    Failure,
}

/// The server's verdict for one natural key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemOutcome {
    pub natural_key: String,
    pub status: OutcomeStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ItemOutcome {
    /// Accepted item.
    #[must_use]
    pub fn success(natural_key: impl Into<String>) -> Self {
        Self {
            natural_key: natural_key.into(),
            status: OutcomeStatus::Success,
            error: None,
        }
    }

    /// Refused item.
    #[must_use]
    pub fn failure(natural_key: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            natural_key: natural_key.into(),
            status: OutcomeStatus::Failure,
            error: Some(error.into()),
        }
    }
}

/// Bulk upload response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadResponse {
    #[serde(rename = "results", default)]
    pub per_item: Vec<ItemOutcome>,
}

impl UploadResponse {
    /// Index outcomes by natural key. Later duplicates win.
    #[must_use]
    pub fn by_key(&self) -> HashMap<&str, &ItemOutcome> {
        self.per_item
            .iter()
            .map(|outcome| (outcome.natural_key.as_str(), outcome))
            .collect()
    }
}

/// Reference data for one organizational scope.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReferenceData {
    #[serde(default)]
    pub students: Vec<StudentRecord>,
    #[serde(default)]
    pub organizations: Vec<OrganizationRecord>,
}
