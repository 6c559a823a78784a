//! rollsync - offline-first queue and sync
//!
//! This crate keeps attendance operations captured offline in a durable
//! SQLite queue, uploads them to the server of record when connectivity
//! returns, and caches reference data for offline use.

#![deny(unsafe_code)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod cli;
pub mod config;
pub mod error;
pub mod events;
pub mod features;
pub mod logging;
pub mod output;
pub mod service;
pub mod storage;
pub mod transport;

pub use cli::args::{Cli, Commands, OutputFormat};
pub use error::RollsyncError;
pub use events::{EventBus, SyncEvent};
pub use service::OfflineSync;
