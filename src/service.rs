//! Offline sync service.
//!
//! [`OfflineSync`] wires the queue, orchestrator, scheduler, and cache over
//! one database and one event bus, and is what callers hold on to.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::{Config, Paths};
use crate::error::RollsyncError;
use crate::events::{EventBus, SyncEvent};
use crate::features::cache::{CacheManager, CacheStatistics, CacheStore};
use crate::features::sync::{
    BackgroundScheduler, QueueManager, QueueStatistics, RecordUpdatePayload, RegistrationPayload,
    SyncOrchestrator, SyncQueue, SyncResult, VerificationPayload,
};
use crate::storage::Database;
use crate::transport::{NetworkMonitor, Transport};

/// How often a started service probes the server.
pub const PROBE_PERIOD: Duration = Duration::from_secs(30);

type Probe = (CancellationToken, JoinHandle<()>);

/// The offline-first sync subsystem.
pub struct OfflineSync {
    config: Config,
    manager: QueueManager,
    orchestrator: SyncOrchestrator,
    scheduler: BackgroundScheduler,
    cache: CacheManager,
    transport: Arc<dyn Transport>,
    network: NetworkMonitor,
    events: EventBus,
    probe: Mutex<Option<Probe>>,
}

impl OfflineSync {
    /// Open the database under `paths` and wire the stack.
    ///
    /// `network` should publish on `events` (see
    /// [`NetworkMonitor::with_events`]).
    ///
    /// # Errors
    ///
    /// Returns an error if the data directory or database cannot be opened.
    pub fn open(
        config: Config,
        paths: &Paths,
        transport: Arc<dyn Transport>,
        network: NetworkMonitor,
        events: EventBus,
    ) -> Result<Self, RollsyncError> {
        paths.ensure_dirs()?;
        let db = Database::open_at(&paths.database, &config.storage)?;
        Ok(Self::with_database(db, config, transport, network, events))
    }

    /// Wire the stack over an already open database.
    #[must_use]
    pub fn with_database(
        db: Database,
        config: Config,
        transport: Arc<dyn Transport>,
        network: NetworkMonitor,
        events: EventBus,
    ) -> Self {
        let cache_store = CacheStore::with_database(db.clone());
        let queue = SyncQueue::with_database(db).with_max_attempts(config.sync.max_retry_attempts);
        let manager = QueueManager::new(queue).with_cache(cache_store.clone());

        let cache = CacheManager::new(
            cache_store,
            Arc::clone(&transport),
            network.clone(),
            events.clone(),
            config.cache.clone(),
            config.server.scope_id.clone(),
        );
        let orchestrator = SyncOrchestrator::new(
            manager.clone(),
            Arc::clone(&transport),
            network.clone(),
            events.clone(),
            config.sync.clone(),
        )
        .with_cache(cache.clone());
        let scheduler = BackgroundScheduler::new(orchestrator.clone());

        Self {
            config,
            manager,
            orchestrator,
            scheduler,
            cache,
            transport,
            network,
            events,
            probe: Mutex::new(None),
        }
    }

    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.config
    }

    #[must_use]
    pub const fn manager(&self) -> &QueueManager {
        &self.manager
    }

    #[must_use]
    pub const fn orchestrator(&self) -> &SyncOrchestrator {
        &self.orchestrator
    }

    #[must_use]
    pub const fn scheduler(&self) -> &BackgroundScheduler {
        &self.scheduler
    }

    #[must_use]
    pub const fn cache(&self) -> &CacheManager {
        &self.cache
    }

    #[must_use]
    pub const fn network(&self) -> &NetworkMonitor {
        &self.network
    }

    /// Queue a biometric enrollment.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload has no roll number or cannot be saved.
    pub async fn queue_registration(
        &self,
        payload: &RegistrationPayload,
    ) -> Result<i64, RollsyncError> {
        self.manager.queue_registration(payload).await
    }

    /// Queue a verification result.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload has no roll number or cannot be saved.
    pub async fn queue_verification(
        &self,
        payload: &VerificationPayload,
    ) -> Result<i64, RollsyncError> {
        self.manager.queue_verification(payload).await
    }

    /// Queue an edit to a student record.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload has no roll number or cannot be saved.
    pub async fn queue_record_update(
        &self,
        payload: &RecordUpdatePayload,
    ) -> Result<i64, RollsyncError> {
        self.manager.queue_record_update(payload).await
    }

    /// # Errors
    ///
    /// Returns an error if the queue cannot be read.
    pub async fn get_queue_statistics(&self) -> Result<QueueStatistics, RollsyncError> {
        self.manager.get_statistics().await
    }

    /// Run a full cycle now and wait for it.
    ///
    /// # Errors
    ///
    /// Returns `RollsyncError::Offline` when offline,
    /// `RollsyncError::SyncInProgress` if a cycle is already running, and
    /// store errors otherwise.
    pub async fn force_sync_now(&self) -> Result<SyncResult, RollsyncError> {
        if !self.network.is_online() {
            return Err(RollsyncError::Offline);
        }
        self.orchestrator.run_cycle().await
    }

    /// # Errors
    ///
    /// Returns an error if cache metadata cannot be read.
    pub async fn get_cache_statistics(&self) -> Result<CacheStatistics, RollsyncError> {
        self.cache.statistics().await
    }

    /// Receive every event published from now on.
    #[must_use]
    pub fn subscribe(&self) -> UnboundedReceiver<SyncEvent> {
        self.events.subscribe()
    }

    /// Probe connectivity once and record the result.
    pub async fn probe_connectivity(&self) -> bool {
        let online = self.transport.check_connectivity().await;
        self.network.set_online(online);
        online
    }

    /// Start the connectivity probe, the background scheduler, and cache
    /// monitoring. Calling it again while started is a no-op.
    pub fn start(&self) {
        {
            let mut probe = self.probe.lock().unwrap_or_else(PoisonError::into_inner);
            if probe.is_none() {
                let cancel = CancellationToken::new();
                let network = self.network.clone();
                let transport = Arc::clone(&self.transport);
                let token = cancel.clone();
                let handle = tokio::spawn(async move {
                    network.run_probe(transport, PROBE_PERIOD, token).await;
                });
                *probe = Some((cancel, handle));
            }
        }

        self.scheduler.start(self.config.sync.interval_minutes);
        self.cache.start_monitoring(self.config.cache.check_interval());
        info!("offline sync started");
    }

    /// Stop background work. Waits for an in-flight sync run up to the
    /// configured shutdown timeout.
    pub async fn shutdown(&self) {
        self.scheduler.stop().await;
        self.cache.stop_monitoring().await;

        let probe = self
            .probe
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some((cancel, handle)) = probe {
            cancel.cancel();
            if let Err(e) = handle.await {
                error!(error = %e, "connectivity probe failed");
            }
        }
        info!("offline sync stopped");
    }
}
