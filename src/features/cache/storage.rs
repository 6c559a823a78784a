//! Cache tables.
//!
//! `cached_entities` holds one JSON document per record; `cache_metadata`
//! holds one row per category stamped on every successful replace.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row, TransactionBehavior};
use serde::Serialize;
use tracing::debug;

use super::entity::{CachedEntity, Cacheable, EntitySyncStatus};
use crate::error::RollsyncError;
use crate::storage::{format_timestamp, parse_timestamp, Database};

/// Bookkeeping for one cache category.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheMetadata {
    pub category: String,
    pub record_count: u64,
    pub last_updated: DateTime<Utc>,
}

/// Cache persistence on the shared database.
#[derive(Clone)]
pub struct CacheStore {
    db: Database,
}

impl CacheStore {
    /// Create a cache store on an existing database.
    #[must_use]
    pub const fn with_database(db: Database) -> Self {
        Self { db }
    }

    /// Replace a category's contents and stamp its metadata, in one transaction.
    ///
    /// Records tagged `pending` keep their local data. Returns the category's
    /// record count afterwards.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the transaction fails.
    pub fn replace_category<T: Cacheable>(&self, records: &[T]) -> Result<u64, RollsyncError> {
        self.replace_category_at(records, Utc::now())
    }

    /// [`Self::replace_category`] with an explicit timestamp.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the transaction fails.
    pub fn replace_category_at<T: Cacheable>(
        &self,
        records: &[T],
        now: DateTime<Utc>,
    ) -> Result<u64, RollsyncError> {
        let category = T::category();
        let now = format_timestamp(now);
        let rows = records
            .iter()
            .map(|record| Ok((record.cache_key(), serde_json::to_string(record)?)))
            .collect::<Result<Vec<_>, RollsyncError>>()?;

        let count: i64 = self.db.with_connection("Failed to replace cache category", |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            tx.execute(
                "DELETE FROM cached_entities WHERE category = ?1 AND sync_status != 'pending'",
                [category],
            )?;
            {
                let mut insert = tx.prepare(
                    r"INSERT INTO cached_entities (category, entity_key, data, sync_status, cached_at)
                      VALUES (?1, ?2, ?3, 'cached', ?4)
                      ON CONFLICT(category, entity_key) DO NOTHING",
                )?;
                for (key, data) in &rows {
                    insert.execute(params![category, key, data, now])?;
                }
            }
            let count: i64 = tx.query_row(
                "SELECT COUNT(*) FROM cached_entities WHERE category = ?1",
                [category],
                |row| row.get(0),
            )?;
            tx.execute(
                r"INSERT INTO cache_metadata (category, record_count, last_updated)
                  VALUES (?1, ?2, ?3)
                  ON CONFLICT(category) DO UPDATE SET
                    record_count = excluded.record_count,
                    last_updated = excluded.last_updated",
                params![category, count, now],
            )?;
            tx.commit()?;
            Ok(count)
        })?;

        debug!(category, record_count = count, "replaced cache category");
        Ok(u64::try_from(count).unwrap_or(0))
    }

    /// Insert or overwrite a single record.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the write fails.
    pub fn put<T: Cacheable>(
        &self,
        record: &T,
        status: EntitySyncStatus,
    ) -> Result<(), RollsyncError> {
        let data = serde_json::to_string(record)?;
        let key = record.cache_key();
        let now = format_timestamp(Utc::now());

        self.db.with_connection("Failed to cache record", |conn| {
            conn.execute(
                r"INSERT INTO cached_entities (category, entity_key, data, sync_status, cached_at)
                  VALUES (?1, ?2, ?3, ?4, ?5)
                  ON CONFLICT(category, entity_key) DO UPDATE SET
                    data = excluded.data,
                    sync_status = excluded.sync_status,
                    cached_at = excluded.cached_at",
                params![T::category(), key, data, status.as_str(), now],
            )
        })?;
        Ok(())
    }

    /// Look up a record by key.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or the stored record does not decode.
    pub fn get<T: Cacheable>(&self, key: &str) -> Result<Option<CachedEntity<T>>, RollsyncError> {
        let row = self.db.with_connection("Failed to read cached record", |conn| {
            conn.query_row(
                r"SELECT data, sync_status, cached_at FROM cached_entities
                  WHERE category = ?1 AND entity_key = ?2",
                params![T::category(), key],
                raw_entity,
            )
            .optional()
        })?;

        row.map(decode_entity).transpose()
    }

    /// Every record in `T`'s category, ordered by key.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or a stored record does not decode.
    pub fn list<T: Cacheable>(&self) -> Result<Vec<CachedEntity<T>>, RollsyncError> {
        let rows = self.db.with_connection("Failed to list cached records", |conn| {
            let mut stmt = conn.prepare(
                r"SELECT data, sync_status, cached_at FROM cached_entities
                  WHERE category = ?1 ORDER BY entity_key",
            )?;
            let rows = stmt.query_map([T::category()], raw_entity)?;
            rows.collect::<Result<Vec<_>, _>>()
        })?;

        rows.into_iter().map(decode_entity).collect()
    }

    /// Merge `changes` into a cached record and tag it `pending`.
    ///
    /// Returns `false` when the record is not cached.
    ///
    /// # Errors
    ///
    /// Returns an error if the stored record is not a JSON object or the
    /// write fails.
    pub fn apply_local_edit(
        &self,
        category: &str,
        key: &str,
        changes: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<bool, RollsyncError> {
        let now = format_timestamp(Utc::now());

        let merged = self.db.with_connection("Failed to apply local edit", |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let data: Option<String> = tx
                .query_row(
                    "SELECT data FROM cached_entities WHERE category = ?1 AND entity_key = ?2",
                    params![category, key],
                    |row| row.get(0),
                )
                .optional()?;
            let Some(data) = data else {
                return Ok(None);
            };

            let merged = match serde_json::from_str::<serde_json::Value>(&data) {
                Ok(serde_json::Value::Object(mut object)) => {
                    for (field, value) in changes {
                        object.insert(field.clone(), value.clone());
                    }
                    serde_json::Value::Object(object).to_string()
                }
                _ => return Ok(Some(false)),
            };

            tx.execute(
                r"UPDATE cached_entities SET data = ?1, sync_status = 'pending', cached_at = ?2
                  WHERE category = ?3 AND entity_key = ?4",
                params![merged, now, category, key],
            )?;
            tx.commit()?;
            Ok(Some(true))
        })?;

        match merged {
            None => Ok(false),
            Some(true) => Ok(true),
            Some(false) => Err(RollsyncError::InvalidPayload(format!(
                "Cached {category} record {key} is not a JSON object"
            ))),
        }
    }

    /// Set a record's sync tag. Returns `false` when the record is not cached.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    pub fn set_status(
        &self,
        category: &str,
        key: &str,
        status: EntitySyncStatus,
    ) -> Result<bool, RollsyncError> {
        let rows = self.db.with_connection("Failed to update cache status", |conn| {
            conn.execute(
                r"UPDATE cached_entities SET sync_status = ?1
                  WHERE category = ?2 AND entity_key = ?3",
                params![status.as_str(), category, key],
            )
        })?;
        Ok(rows > 0)
    }

    /// Number of records in a category.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn count(&self, category: &str) -> Result<u64, RollsyncError> {
        let count: i64 = self.db.with_connection("Failed to count cached records", |conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM cached_entities WHERE category = ?1",
                [category],
                |row| row.get(0),
            )
        })?;
        Ok(u64::try_from(count).unwrap_or(0))
    }

    /// Metadata for one category.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn metadata(&self, category: &str) -> Result<Option<CacheMetadata>, RollsyncError> {
        self.db.with_connection("Failed to read cache metadata", |conn| {
            conn.query_row(
                r"SELECT category, record_count, last_updated FROM cache_metadata
                  WHERE category = ?1",
                [category],
                row_to_metadata,
            )
            .optional()
        })
    }

    /// Metadata for every category that was ever refreshed.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn all_metadata(&self) -> Result<Vec<CacheMetadata>, RollsyncError> {
        self.db.with_connection("Failed to read cache metadata", |conn| {
            let mut stmt = conn.prepare(
                "SELECT category, record_count, last_updated FROM cache_metadata ORDER BY category",
            )?;
            let rows = stmt.query_map([], row_to_metadata)?;
            rows.collect()
        })
    }
}

type RawEntity = (String, String, DateTime<Utc>);

fn raw_entity(row: &Row<'_>) -> rusqlite::Result<RawEntity> {
    let cached_at: String = row.get(2)?;
    Ok((row.get(0)?, row.get(1)?, parse_timestamp(2, &cached_at)?))
}

fn decode_entity<T: Cacheable>(
    (data, status, cached_at): RawEntity,
) -> Result<CachedEntity<T>, RollsyncError> {
    Ok(CachedEntity {
        data: serde_json::from_str(&data)?,
        sync_status: status.parse()?,
        cached_at,
    })
}

fn row_to_metadata(row: &Row<'_>) -> rusqlite::Result<CacheMetadata> {
    let record_count: i64 = row.get(1)?;
    let last_updated: String = row.get(2)?;
    Ok(CacheMetadata {
        category: row.get(0)?,
        record_count: u64::try_from(record_count).unwrap_or(0),
        last_updated: parse_timestamp(2, &last_updated)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::cache::entity::{OrganizationRecord, StudentRecord, STUDENTS};

    fn store() -> CacheStore {
        CacheStore::with_database(Database::open_in_memory().unwrap())
    }

    fn student(roll: &str, name: &str) -> StudentRecord {
        StudentRecord {
            roll_number: roll.to_string(),
            name: name.to_string(),
            organization_id: "ORG-1".to_string(),
            enrolled: true,
            updated_at: None,
        }
    }

    #[test]
    fn test_replace_category_stamps_metadata() {
        let store = store();
        assert!(store.metadata(STUDENTS).unwrap().is_none());

        let count = store
            .replace_category(&[student("A", "Ann"), student("B", "Ben")])
            .unwrap();

        assert_eq!(count, 2);
        let meta = store.metadata(STUDENTS).unwrap().unwrap();
        assert_eq!(meta.record_count, 2);
        assert_eq!(store.count(STUDENTS).unwrap(), 2);
    }

    #[test]
    fn test_replace_drops_records_missing_from_server() {
        let store = store();
        store
            .replace_category(&[student("A", "Ann"), student("B", "Ben")])
            .unwrap();

        store.replace_category(&[student("B", "Ben")]).unwrap();

        assert!(store.get::<StudentRecord>("A").unwrap().is_none());
        assert_eq!(store.count(STUDENTS).unwrap(), 1);
    }

    #[test]
    fn test_pending_records_survive_refresh() {
        let store = store();
        store.replace_category(&[student("A", "Ann")]).unwrap();

        let mut changes = serde_json::Map::new();
        changes.insert("name".to_string(), serde_json::json!("Annabel"));
        assert!(store.apply_local_edit(STUDENTS, "A", &changes).unwrap());

        store.replace_category(&[student("A", "Ann")]).unwrap();

        let cached = store.get::<StudentRecord>("A").unwrap().unwrap();
        assert_eq!(cached.data.name, "Annabel");
        assert_eq!(cached.sync_status, EntitySyncStatus::Pending);

        store
            .set_status(STUDENTS, "A", EntitySyncStatus::Synced)
            .unwrap();
        store.replace_category(&[student("A", "Ann")]).unwrap();

        let cached = store.get::<StudentRecord>("A").unwrap().unwrap();
        assert_eq!(cached.data.name, "Ann");
        assert_eq!(cached.sync_status, EntitySyncStatus::Cached);
    }

    #[test]
    fn test_local_edit_on_uncached_record() {
        let store = store();
        let changes = serde_json::Map::new();
        assert!(!store.apply_local_edit(STUDENTS, "nobody", &changes).unwrap());
    }

    #[test]
    fn test_categories_are_independent() {
        let store = store();
        store.replace_category(&[student("A", "Ann")]).unwrap();
        store
            .replace_category(&[OrganizationRecord {
                id: "ORG-1".to_string(),
                name: "Science".to_string(),
                parent_id: None,
            }])
            .unwrap();
        store.replace_category::<OrganizationRecord>(&[]).unwrap();

        assert_eq!(store.count(STUDENTS).unwrap(), 1);
        assert_eq!(store.all_metadata().unwrap().len(), 2);
        assert_eq!(store.list::<StudentRecord>().unwrap().len(), 1);
    }

    #[test]
    fn test_put_overwrites() {
        let store = store();
        store
            .put(&student("A", "Ann"), EntitySyncStatus::Cached)
            .unwrap();
        store
            .put(&student("A", "Anne"), EntitySyncStatus::Synced)
            .unwrap();

        let cached = store.get::<StudentRecord>("A").unwrap().unwrap();
        assert_eq!(cached.data.name, "Anne");
        assert_eq!(cached.sync_status, EntitySyncStatus::Synced);
    }
}
