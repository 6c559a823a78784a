//! Reference-data cache.
//!
//! Keeps a local copy of the people and organizational units for the
//! device's scope so enrollment and verification keep working offline.

pub mod entity;
pub mod manager;
pub mod storage;

pub use entity::{
    CachedEntity, Cacheable, EntitySyncStatus, OrganizationRecord, StudentRecord, ORGANIZATIONS,
    STUDENTS,
};
pub use manager::{CacheManager, CacheStatistics, CategoryStatistics, CheckOutcome, RefreshReport};
pub use storage::{CacheMetadata, CacheStore};
