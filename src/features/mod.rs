//! Feature implementations for rollsync.
//!
//! - Sync queue, orchestration, and background scheduling
//! - Reference-data cache

pub mod cache;
pub mod sync;
