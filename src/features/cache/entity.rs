//! Cached reference records.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::error::RollsyncError;

/// Category holding person records.
pub const STUDENTS: &str = "students";

/// Category holding organizational units.
pub const ORGANIZATIONS: &str = "organizations";

/// A reference record that can live in the cache.
pub trait Cacheable: Clone + Send + Sync + Serialize + DeserializeOwned {
    /// Unique identifier within the category.
    fn cache_key(&self) -> String;

    /// Category name used for storage and metadata.
    fn category() -> &'static str;
}

/// A person in the directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StudentRecord {
    pub roll_number: String,
    pub name: String,
    pub organization_id: String,
    #[serde(default)]
    pub enrolled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Cacheable for StudentRecord {
    fn cache_key(&self) -> String {
        self.roll_number.clone()
    }

    fn category() -> &'static str {
        STUDENTS
    }
}

/// An organizational unit (department, class, site).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrganizationRecord {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
}

impl Cacheable for OrganizationRecord {
    fn cache_key(&self) -> String {
        self.id.clone()
    }

    fn category() -> &'static str {
        ORGANIZATIONS
    }
}

/// Local sync state of a cached record, independent of the operation queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntitySyncStatus {
    /// Server copy, untouched locally
    Cached,
    /// Local edits are queued against it
    Pending,
    /// Local edits were accepted by the server
    Synced,
}

impl EntitySyncStatus {
    /// Storage identifier.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Cached => "cached",
            Self::Pending => "pending",
            Self::Synced => "synced",
        }
    }
}

impl FromStr for EntitySyncStatus {
    type Err = RollsyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cached" => Ok(Self::Cached),
            "pending" => Ok(Self::Pending),
            "synced" => Ok(Self::Synced),
            other => Err(RollsyncError::Database(format!(
                "Unknown cache sync status: {other}"
            ))),
        }
    }
}

/// A stored record with its cache bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedEntity<T> {
    pub data: T,
    pub sync_status: EntitySyncStatus,
    pub cached_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_keys() {
        let student = StudentRecord {
            roll_number: "CS-1".to_string(),
            name: "Lin".to_string(),
            organization_id: "ORG".to_string(),
            enrolled: false,
            updated_at: None,
        };
        assert_eq!(student.cache_key(), "CS-1");
        assert_eq!(StudentRecord::category(), STUDENTS);

        let org = OrganizationRecord {
            id: "ORG".to_string(),
            name: "Computing".to_string(),
            parent_id: None,
        };
        assert_eq!(org.cache_key(), "ORG");
        assert_eq!(OrganizationRecord::category(), ORGANIZATIONS);
    }

    #[test]
    fn test_sync_status_parse() {
        for status in [
            EntitySyncStatus::Cached,
            EntitySyncStatus::Pending,
            EntitySyncStatus::Synced,
        ] {
            assert_eq!(status.as_str().parse::<EntitySyncStatus>().unwrap(), status);
        }
        assert!("stale".parse::<EntitySyncStatus>().is_err());
    }

    #[test]
    fn test_student_defaults() {
        let student: StudentRecord =
            serde_json::from_str(r#"{"roll_number":"A","name":"B","organization_id":"C"}"#)
                .unwrap();
        assert!(!student.enrolled);
        assert!(student.updated_at.is_none());
    }
}
