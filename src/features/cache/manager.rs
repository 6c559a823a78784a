//! Cache manager.
//!
//! Downloads reference data for the configured scope, tracks how old each
//! category is, and decides whether the device can keep working offline.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::entity::{OrganizationRecord, StudentRecord};
use super::storage::CacheStore;
use crate::config::CacheConfig;
use crate::error::RollsyncError;
use crate::events::{EventBus, SyncEvent};
use crate::features::sync::SyncGate;
use crate::storage::blocking;
use crate::transport::{NetworkMonitor, Transport};

/// Record counts written by one refresh.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RefreshReport {
    pub students: u64,
    pub organizations: u64,
}

/// Age and size of one category.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CategoryStatistics {
    pub category: String,
    pub record_count: u64,
    pub last_updated: Option<DateTime<Utc>>,
    pub age_seconds: Option<i64>,
    pub stale: bool,
}

/// Snapshot of the whole cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheStatistics {
    pub scope_id: Option<String>,
    pub categories: Vec<CategoryStatistics>,
    pub continuity_ready: bool,
}

/// What a periodic check found and did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckOutcome {
    pub stale: Vec<String>,
    pub refreshed: bool,
}

/// Reference-data cache with staleness and continuity tracking. Cheap to clone.
#[derive(Clone)]
pub struct CacheManager {
    store: CacheStore,
    transport: Arc<dyn Transport>,
    network: NetworkMonitor,
    events: EventBus,
    config: CacheConfig,
    scope_id: Option<String>,
    refresh_gate: SyncGate,
    continuity: Arc<Mutex<bool>>,
    monitor: Arc<Mutex<Option<(CancellationToken, JoinHandle<()>)>>>,
}

impl CacheManager {
    /// Create a cache manager.
    #[must_use]
    pub fn new(
        store: CacheStore,
        transport: Arc<dyn Transport>,
        network: NetworkMonitor,
        events: EventBus,
        config: CacheConfig,
        scope_id: Option<String>,
    ) -> Self {
        Self {
            store,
            transport,
            network,
            events,
            config,
            scope_id,
            refresh_gate: SyncGate::new(),
            continuity: Arc::new(Mutex::new(false)),
            monitor: Arc::new(Mutex::new(None)),
        }
    }

    /// The underlying store.
    #[must_use]
    pub const fn store(&self) -> &CacheStore {
        &self.store
    }

    /// Scope refreshed by [`Self::refresh`].
    #[must_use]
    pub fn scope_id(&self) -> Option<&str> {
        self.scope_id.as_deref()
    }

    /// Refresh the configured scope.
    ///
    /// # Errors
    ///
    /// Returns `RollsyncError::Config` if no scope is configured, otherwise
    /// whatever [`Self::refresh_scope`] returns.
    pub async fn refresh(&self) -> Result<RefreshReport, RollsyncError> {
        let scope_id = self
            .scope_id
            .clone()
            .ok_or_else(|| RollsyncError::Config("server.scope_id is not set".to_string()))?;
        self.refresh_scope(&scope_id).await
    }

    /// Download reference data for `scope_id` and replace every category.
    ///
    /// # Errors
    ///
    /// Returns `RollsyncError::SyncInProgress` if a refresh is already
    /// running, `RollsyncError::Offline` when offline, and transport or
    /// storage errors otherwise.
    pub async fn refresh_scope(&self, scope_id: &str) -> Result<RefreshReport, RollsyncError> {
        let Some(_guard) = self.refresh_gate.try_acquire() else {
            return Err(RollsyncError::SyncInProgress);
        };
        if !self.network.is_online() {
            return Err(RollsyncError::Offline);
        }

        debug!(scope_id, "refreshing reference data");
        let data = self
            .transport
            .download_reference_data(scope_id.to_string())
            .await?;

        let store = self.store.clone();
        let report = blocking(move || {
            Ok(RefreshReport {
                students: store.replace_category::<StudentRecord>(&data.students)?,
                organizations: store.replace_category::<OrganizationRecord>(&data.organizations)?,
            })
        })
        .await?;

        self.events.publish(SyncEvent::CacheUpdated {
            category: super::entity::STUDENTS.to_string(),
            record_count: report.students,
        });
        self.events.publish(SyncEvent::CacheUpdated {
            category: super::entity::ORGANIZATIONS.to_string(),
            record_count: report.organizations,
        });
        info!(
            students = report.students,
            organizations = report.organizations,
            "reference data refreshed"
        );

        self.evaluate_continuity().await?;
        Ok(report)
    }

    /// Whether `category` is missing or older than the expiry.
    ///
    /// # Errors
    ///
    /// Returns an error if metadata cannot be read.
    pub async fn is_stale(&self, category: &str) -> Result<bool, RollsyncError> {
        self.is_stale_at(category, Utc::now()).await
    }

    /// [`Self::is_stale`] evaluated at `now`.
    ///
    /// # Errors
    ///
    /// Returns an error if metadata cannot be read.
    pub async fn is_stale_at(
        &self,
        category: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, RollsyncError> {
        let store = self.store.clone();
        let category = category.to_string();
        let metadata = blocking(move || store.metadata(&category)).await?;

        Ok(metadata.map_or(true, |meta| now - meta.last_updated > self.config.expiry()))
    }

    /// Required categories that are stale at `now`.
    ///
    /// # Errors
    ///
    /// Returns an error if metadata cannot be read.
    pub async fn stale_categories_at(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<String>, RollsyncError> {
        let mut stale = Vec::new();
        for category in &self.config.required_categories {
            if self.is_stale_at(category, now).await? {
                stale.push(category.clone());
            }
        }
        Ok(stale)
    }

    /// Whether every required category is populated and inside the
    /// continuity window.
    ///
    /// # Errors
    ///
    /// Returns an error if the cache cannot be read.
    pub async fn is_offline_continuity_ready(&self) -> Result<bool, RollsyncError> {
        self.is_offline_continuity_ready_at(Utc::now()).await
    }

    /// [`Self::is_offline_continuity_ready`] evaluated at `now`.
    ///
    /// # Errors
    ///
    /// Returns an error if the cache cannot be read.
    pub async fn is_offline_continuity_ready_at(
        &self,
        now: DateTime<Utc>,
    ) -> Result<bool, RollsyncError> {
        let store = self.store.clone();
        let categories = self.config.required_categories.clone();
        let window = self.config.continuity_window();

        blocking(move || {
            if categories.is_empty() {
                return Ok(false);
            }
            for category in &categories {
                let Some(meta) = store.metadata(category)? else {
                    return Ok(false);
                };
                if store.count(category)? == 0 || now - meta.last_updated > window {
                    return Ok(false);
                }
            }
            Ok(true)
        })
        .await
    }

    /// Per-category sizes and ages plus continuity readiness.
    ///
    /// # Errors
    ///
    /// Returns an error if the cache cannot be read.
    pub async fn statistics(&self) -> Result<CacheStatistics, RollsyncError> {
        let now = Utc::now();
        let store = self.store.clone();
        let expiry = self.config.expiry();
        let mut names = self.config.required_categories.clone();

        let categories = blocking(move || {
            for meta in store.all_metadata()? {
                if !names.contains(&meta.category) {
                    names.push(meta.category);
                }
            }

            names
                .into_iter()
                .map(|category| {
                    let meta = store.metadata(&category)?;
                    let record_count = store.count(&category)?;
                    let age = meta.as_ref().map(|m| now - m.last_updated);
                    Ok(CategoryStatistics {
                        stale: age.map_or(true, |age| age > expiry),
                        age_seconds: age.map(|age| age.num_seconds()),
                        last_updated: meta.map(|m| m.last_updated),
                        record_count,
                        category,
                    })
                })
                .collect::<Result<Vec<_>, RollsyncError>>()
        })
        .await?;

        Ok(CacheStatistics {
            scope_id: self.scope_id.clone(),
            categories,
            continuity_ready: self.is_offline_continuity_ready_at(now).await?,
        })
    }

    /// Evaluate staleness once: announce stale categories and refresh them
    /// when online.
    ///
    /// # Errors
    ///
    /// Returns an error if the cache cannot be read. Refresh failures are
    /// logged, not returned.
    pub async fn check_now(&self) -> Result<CheckOutcome, RollsyncError> {
        let stale = self.stale_categories_at(Utc::now()).await?;
        let mut refreshed = false;

        if !stale.is_empty() {
            self.events.publish(SyncEvent::RefreshNeeded {
                categories: stale.clone(),
            });

            if self.network.is_online() && self.scope_id.is_some() {
                match self.refresh().await {
                    Ok(_) => refreshed = true,
                    Err(RollsyncError::SyncInProgress) => {
                        debug!("refresh already running");
                    }
                    Err(e) => warn!(error = %e, "automatic cache refresh failed"),
                }
            }
        }

        self.evaluate_continuity().await?;
        Ok(CheckOutcome { stale, refreshed })
    }

    /// Recompute continuity readiness and announce it if it flipped.
    ///
    /// # Errors
    ///
    /// Returns an error if the cache cannot be read.
    pub async fn evaluate_continuity(&self) -> Result<bool, RollsyncError> {
        let ready = self.is_offline_continuity_ready().await?;
        let flipped = {
            let mut last = self
                .continuity
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            let flipped = *last != ready;
            *last = ready;
            flipped
        };

        if flipped {
            info!(ready, "offline continuity changed");
            self.events.publish(SyncEvent::ContinuityChanged { ready });
        }
        Ok(ready)
    }

    /// Run [`Self::check_now`] every `period` and on every reconnect until
    /// [`Self::stop_monitoring`] is called. A second call is a no-op.
    pub fn start_monitoring(&self, period: Duration) {
        let mut monitor = self.monitor.lock().unwrap_or_else(PoisonError::into_inner);
        if monitor.is_some() {
            warn!("cache monitoring already running");
            return;
        }

        let cancel = CancellationToken::new();
        let manager = self.clone();
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            let mut network_rx = manager.network.subscribe();
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    _ = ticker.tick() => {}
                    reconnected = crate::transport::wait_for_reconnect(&mut network_rx) => {
                        if !reconnected {
                            break;
                        }
                    }
                }
                if let Err(e) = manager.check_now().await {
                    error!(error = %e, "cache check failed");
                }
            }
            debug!("cache monitoring stopped");
        });

        *monitor = Some((cancel, handle));
        info!(period_secs = period.as_secs(), "cache monitoring started");
    }

    /// Stop the monitoring task and wait for it to exit.
    pub async fn stop_monitoring(&self) {
        let monitor = self
            .monitor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some((cancel, handle)) = monitor {
            cancel.cancel();
            if let Err(e) = handle.await {
                error!(error = %e, "cache monitoring task failed");
            }
        }
    }

    /// Whether the monitoring task is running.
    #[must_use]
    pub fn is_monitoring(&self) -> bool {
        self.monitor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }
}
