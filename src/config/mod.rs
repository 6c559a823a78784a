//! Configuration management for rollsync.
//!
//! This module handles loading and saving configuration from `~/.rollsync/`.

mod paths;
mod settings;

pub use paths::{Paths, HOME_ENV};
pub use settings::{
    CacheConfig, ColorSetting, Config, GeneralConfig, ServerConfig, StorageConfig, SyncConfig,
};
