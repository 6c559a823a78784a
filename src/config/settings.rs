//! Configuration settings for rollsync.
//!
//! Settings are loaded from `~/.rollsync/config.yaml`. Every field has a
//! default, so a partial file only needs to name what it changes.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cli::args::OutputFormat;
use crate::config::Paths;
use crate::error::RollsyncError;

/// Main configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// General settings.
    pub general: GeneralConfig,
    /// Server of record.
    pub server: ServerConfig,
    /// Queue and synchronization settings.
    pub sync: SyncConfig,
    /// Reference-data cache settings.
    pub cache: CacheConfig,
    /// Storage settings.
    pub storage: StorageConfig,
}

/// General application settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Default output format.
    #[serde(default = "default_output_format")]
    pub default_output: OutputFormat,
    /// Color output setting.
    #[serde(default)]
    pub color: ColorSetting,
}

/// Color output setting.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ColorSetting {
    /// Auto-detect based on terminal.
    #[default]
    Auto,
    /// Always use colors.
    Always,
    /// Never use colors.
    Never,
}

/// Server of record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Base URL, e.g. `https://attendance.example.org`.
    pub base_url: Option<String>,
    /// Scope (organizational unit id) used for reference-data downloads.
    pub scope_id: Option<String>,
    /// Per-request timeout in seconds.
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    /// Name of the environment variable holding the bearer token.
    #[serde(default = "default_api_token_env")]
    pub api_token_env: String,
}

/// Queue and synchronization settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Minutes between scheduled sync runs.
    #[serde(default = "default_interval_minutes")]
    pub interval_minutes: u64,
    /// Batch size for manual and orchestrated cycles.
    #[serde(default = "default_orchestrator_batch_size")]
    pub orchestrator_batch_size: usize,
    /// Batch size for unattended background runs.
    #[serde(default = "default_scheduler_batch_size")]
    pub scheduler_batch_size: usize,
    /// Attempts before an operation becomes terminally failed.
    #[serde(default = "default_max_retry_attempts")]
    pub max_retry_attempts: u32,
    /// Days to keep synced and cancelled operations.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
    /// Pause between background batches, in milliseconds.
    #[serde(default = "default_batch_delay_ms")]
    pub batch_delay_ms: u64,
    /// Timer ticks are skipped when the last attempt is younger than this.
    #[serde(default = "default_min_sync_gap_seconds")]
    pub min_sync_gap_seconds: u64,
    /// Operations left syncing longer than this are reclaimed.
    #[serde(default = "default_stale_syncing_minutes")]
    pub stale_syncing_minutes: u64,
    /// Upper bound on how long shutdown waits for an in-flight run.
    #[serde(default = "default_shutdown_timeout_seconds")]
    pub shutdown_timeout_seconds: u64,
}

/// Reference-data cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Hours before cached data counts as stale.
    #[serde(default = "default_expiry_hours")]
    pub expiry_hours: u64,
    /// Days cached data may sustain offline operation.
    #[serde(default = "default_continuity_window_days")]
    pub continuity_window_days: u64,
    /// Minutes between staleness checks.
    #[serde(default = "default_check_interval_minutes")]
    pub check_interval_minutes: u64,
    /// Categories that must be populated for offline continuity.
    #[serde(default = "default_required_categories")]
    pub required_categories: Vec<String>,
}

/// Storage settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Maximum pooled connections.
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,
    /// Attempts for a statement that hits a locked database.
    #[serde(default = "default_busy_retries")]
    pub busy_retries: u32,
    /// Initial backoff between contention retries, doubled each attempt.
    #[serde(default = "default_busy_backoff_ms")]
    pub busy_backoff_ms: u64,
}

// Default value functions for serde
const fn default_output_format() -> OutputFormat {
    OutputFormat::Pretty
}

const fn default_timeout_seconds() -> u64 {
    30
}

fn default_api_token_env() -> String {
    "ROLLSYNC_API_TOKEN".to_string()
}

const fn default_interval_minutes() -> u64 {
    5
}

const fn default_orchestrator_batch_size() -> usize {
    50
}

const fn default_scheduler_batch_size() -> usize {
    20
}

const fn default_max_retry_attempts() -> u32 {
    3
}

const fn default_retention_days() -> u32 {
    7
}

const fn default_batch_delay_ms() -> u64 {
    500
}

const fn default_min_sync_gap_seconds() -> u64 {
    60
}

const fn default_stale_syncing_minutes() -> u64 {
    15
}

const fn default_shutdown_timeout_seconds() -> u64 {
    30
}

const fn default_expiry_hours() -> u64 {
    24
}

const fn default_continuity_window_days() -> u64 {
    7
}

const fn default_check_interval_minutes() -> u64 {
    30
}

fn default_required_categories() -> Vec<String> {
    vec!["students".to_string(), "organizations".to_string()]
}

const fn default_pool_size() -> u32 {
    4
}

const fn default_busy_retries() -> u32 {
    5
}

const fn default_busy_backoff_ms() -> u64 {
    20
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            default_output: default_output_format(),
            color: ColorSetting::Auto,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            scope_id: None,
            timeout_seconds: default_timeout_seconds(),
            api_token_env: default_api_token_env(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval_minutes: default_interval_minutes(),
            orchestrator_batch_size: default_orchestrator_batch_size(),
            scheduler_batch_size: default_scheduler_batch_size(),
            max_retry_attempts: default_max_retry_attempts(),
            retention_days: default_retention_days(),
            batch_delay_ms: default_batch_delay_ms(),
            min_sync_gap_seconds: default_min_sync_gap_seconds(),
            stale_syncing_minutes: default_stale_syncing_minutes(),
            shutdown_timeout_seconds: default_shutdown_timeout_seconds(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            expiry_hours: default_expiry_hours(),
            continuity_window_days: default_continuity_window_days(),
            check_interval_minutes: default_check_interval_minutes(),
            required_categories: default_required_categories(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            pool_size: default_pool_size(),
            busy_retries: default_busy_retries(),
            busy_backoff_ms: default_busy_backoff_ms(),
        }
    }
}

impl SyncConfig {
    /// Timer period for scheduled runs.
    #[must_use]
    pub const fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_minutes.saturating_mul(60))
    }

    /// Pause between background batches.
    #[must_use]
    pub const fn batch_delay(&self) -> Duration {
        Duration::from_millis(self.batch_delay_ms)
    }

    /// Minimum age of the last attempt before a timer tick may run again.
    #[must_use]
    pub const fn min_sync_gap(&self) -> Duration {
        Duration::from_secs(self.min_sync_gap_seconds)
    }

    /// Age after which a syncing claim is considered abandoned.
    #[must_use]
    pub fn stale_syncing_after(&self) -> chrono::Duration {
        i64::try_from(self.stale_syncing_minutes)
            .ok()
            .and_then(chrono::Duration::try_minutes)
            .unwrap_or(chrono::Duration::MAX)
    }

    /// Bounded wait used by scheduler shutdown.
    #[must_use]
    pub const fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_seconds)
    }
}

impl CacheConfig {
    /// Age after which a category is stale.
    #[must_use]
    pub fn expiry(&self) -> chrono::Duration {
        i64::try_from(self.expiry_hours)
            .ok()
            .and_then(chrono::Duration::try_hours)
            .unwrap_or(chrono::Duration::MAX)
    }

    /// Age under which cached data still sustains offline operation.
    #[must_use]
    pub fn continuity_window(&self) -> chrono::Duration {
        i64::try_from(self.continuity_window_days)
            .ok()
            .and_then(chrono::Duration::try_days)
            .unwrap_or(chrono::Duration::MAX)
    }

    /// Period of the staleness check.
    #[must_use]
    pub const fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_minutes.saturating_mul(60))
    }
}

impl StorageConfig {
    /// Initial contention backoff.
    #[must_use]
    pub const fn busy_backoff(&self) -> Duration {
        Duration::from_millis(self.busy_backoff_ms)
    }
}

impl Config {
    /// Load configuration from the default path.
    ///
    /// If the config file doesn't exist, returns default configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed.
    pub fn load() -> Result<Self, RollsyncError> {
        let paths = Paths::new()?;
        Self::load_from_path(&paths.config_file)
    }

    /// Load configuration from a specific path.
    ///
    /// If the config file doesn't exist, returns default configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed or
    /// holds out-of-range values.
    pub fn load_from_path(path: &std::path::Path) -> Result<Self, RollsyncError> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let contents = std::fs::read_to_string(path).map_err(|e| {
            RollsyncError::Config(format!(
                "Failed to read config file {}: {e}",
                path.display()
            ))
        })?;

        let config: Self = serde_yaml::from_str(&contents).map_err(|e| {
            RollsyncError::Config(format!(
                "Failed to parse config file {}: {e}",
                path.display()
            ))
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a specific path.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file cannot be written.
    pub fn save_to_path(&self, path: &std::path::Path) -> Result<(), RollsyncError> {
        let contents = serde_yaml::to_string(self)
            .map_err(|e| RollsyncError::Config(format!("Failed to serialize config: {e}")))?;

        std::fs::write(path, contents).map_err(|e| {
            RollsyncError::Config(format!(
                "Failed to write config file {}: {e}",
                path.display()
            ))
        })
    }

    /// Reject values the queue and scheduler cannot work with.
    ///
    /// # Errors
    ///
    /// Returns `RollsyncError::Config` naming the first invalid field.
    pub fn validate(&self) -> Result<(), RollsyncError> {
        if self.sync.orchestrator_batch_size == 0 || self.sync.scheduler_batch_size == 0 {
            return Err(RollsyncError::Config(
                "Batch sizes must be greater than zero".to_string(),
            ));
        }
        if self.sync.max_retry_attempts == 0 {
            return Err(RollsyncError::Config(
                "sync.max_retry_attempts must be at least 1".to_string(),
            ));
        }
        if self.sync.interval_minutes == 0 {
            return Err(RollsyncError::Config(
                "sync.interval_minutes must be at least 1".to_string(),
            ));
        }
        check_max("sync.interval_minutes", self.sync.interval_minutes, MAX_MINUTES)?;
        check_max(
            "sync.stale_syncing_minutes",
            self.sync.stale_syncing_minutes,
            MAX_MINUTES,
        )?;
        check_max(
            "sync.retention_days",
            u64::from(self.sync.retention_days),
            MAX_DAYS,
        )?;
        check_max(
            "cache.check_interval_minutes",
            self.cache.check_interval_minutes,
            MAX_MINUTES,
        )?;
        check_max("cache.expiry_hours", self.cache.expiry_hours, MAX_DAYS * 24)?;
        check_max(
            "cache.continuity_window_days",
            self.cache.continuity_window_days,
            MAX_DAYS,
        )?;
        if self.storage.pool_size == 0 {
            return Err(RollsyncError::Config(
                "storage.pool_size must be at least 1".to_string(),
            ));
        }
        if self.cache.continuity_window() < self.cache.expiry() {
            return Err(RollsyncError::Config(
                "cache.continuity_window_days must not be shorter than cache.expiry_hours"
                    .to_string(),
            ));
        }
        Ok(())
    }
}

/// Ten years, the longest retention or cache window accepted.
const MAX_DAYS: u64 = 3650;
/// One year, the longest interval or stale threshold accepted.
const MAX_MINUTES: u64 = 365 * 24 * 60;

fn check_max(field: &str, value: u64, max: u64) -> Result<(), RollsyncError> {
    if value > max {
        return Err(RollsyncError::Config(format!(
            "{field} must be at most {max} (got {value})"
        )));
    }
    Ok(())
}
