//! Background sync scheduler.
//!
//! Runs unattended cycles on a fixed interval, on every offline-to-online
//! transition, and once at start when online. Every trigger passes the
//! orchestrator's gate before a task is spawned, so overlapping triggers
//! collapse into the run already in flight.

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use super::manager::panic_message;
use super::orchestrator::{CycleOptions, SyncOrchestrator};
use crate::events::SyncEvent;
use crate::transport::wait_for_reconnect;

struct Running {
    cancel: CancellationToken,
    trigger_loop: JoinHandle<()>,
}

/// Supervises background sync runs. Cheap to clone.
#[derive(Clone)]
pub struct BackgroundScheduler {
    orchestrator: SyncOrchestrator,
    tracker: TaskTracker,
    running: Arc<Mutex<Option<Running>>>,
}

impl BackgroundScheduler {
    #[must_use]
    pub fn new(orchestrator: SyncOrchestrator) -> Self {
        Self {
            orchestrator,
            tracker: TaskTracker::new(),
            running: Arc::new(Mutex::new(None)),
        }
    }

    /// Start with an interval in minutes.
    ///
    /// Returns `false` if already running.
    pub fn start(&self, interval_minutes: u64) -> bool {
        self.start_with_period(Duration::from_secs(interval_minutes.max(1).saturating_mul(60)))
    }

    /// Start with an explicit interval.
    ///
    /// Returns `false` if already running.
    pub fn start_with_period(&self, period: Duration) -> bool {
        let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        if running.is_some() {
            warn!("background sync already running");
            return false;
        }

        let cancel = CancellationToken::new();
        let scheduler = self.clone();
        let token = cancel.clone();
        let trigger_loop = tokio::spawn(async move { scheduler.trigger_loop(period, token).await });

        *running = Some(Running {
            cancel,
            trigger_loop,
        });
        info!(period_secs = period.as_secs(), "background sync started");
        true
    }

    /// Whether the trigger loop is active.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Request an immediate run.
    ///
    /// Returns `false` when offline or when a run is already in flight.
    pub fn trigger_now(&self) -> bool {
        let cancel = self
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|r| r.cancel.clone())
            .unwrap_or_default();
        self.trigger("manual", &cancel)
    }

    /// Cancel the trigger loop and wait for in-flight runs, up to the
    /// configured shutdown timeout.
    pub async fn stop(&self) {
        let running = self
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        let Some(running) = running else {
            return;
        };
        running.cancel.cancel();

        let timeout = self.orchestrator.config().shutdown_timeout();
        let started = tokio::time::Instant::now();
        let mut trigger_loop = running.trigger_loop;
        match tokio::time::timeout(timeout, &mut trigger_loop).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(error = %e, "background sync loop failed"),
            Err(_) => {
                warn!("background sync loop did not exit before shutdown timeout");
                trigger_loop.abort();
            }
        }

        self.tracker.close();
        let remaining = timeout.saturating_sub(started.elapsed());
        if tokio::time::timeout(remaining, self.tracker.wait()).await.is_err() {
            warn!(
                timeout_secs = timeout.as_secs(),
                "background sync did not finish before shutdown timeout"
            );
        }
        self.tracker.reopen();
        info!("background sync stopped");
    }

    async fn trigger_loop(&self, period: Duration, cancel: CancellationToken) {
        let network = self.orchestrator.network().clone();
        let mut network_rx = network.subscribe();

        if network.is_online() {
            self.trigger("startup", &cancel);
        }

        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker.tick().await;

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if self.ran_recently() {
                        debug!("skipping interval trigger, last attempt too recent");
                        continue;
                    }
                    self.trigger("interval", &cancel);
                }
                reconnected = wait_for_reconnect(&mut network_rx) => {
                    if !reconnected {
                        cancel.cancelled().await;
                        break;
                    }
                    self.trigger("reconnect", &cancel);
                }
            }
        }
        debug!("background sync loop exited");
    }

    fn ran_recently(&self) -> bool {
        let gap = self.orchestrator.config().min_sync_gap();
        self.orchestrator
            .status()
            .last_attempt
            .is_some_and(|last| (Utc::now() - last).to_std().is_ok_and(|elapsed| elapsed < gap))
    }

    /// Acquire the gate, then spawn the run.
    fn trigger(&self, reason: &str, cancel: &CancellationToken) -> bool {
        if !self.orchestrator.network().is_online() {
            debug!(reason, "offline, sync trigger ignored");
            return false;
        }
        let Some(guard) = self.orchestrator.gate().try_acquire() else {
            debug!(reason, "sync already in progress, trigger ignored");
            return false;
        };

        info!(reason, "background sync triggered");
        let orchestrator = self.orchestrator.clone();
        let options = CycleOptions::background(orchestrator.config(), cancel.child_token());
        self.tracker.spawn(async move {
            let run = AssertUnwindSafe(orchestrator.run_cycle_guarded(guard, options))
                .catch_unwind()
                .await;
            match run {
                Ok(Ok(result)) => debug!(message = %result.message, "background sync finished"),
                // Already logged and published by the orchestrator.
                Ok(Err(_)) => {}
                Err(panic) => {
                    let message = format!("sync panicked: {}", panic_message(&*panic));
                    error!("{message}");
                    orchestrator.mark_interrupted(&message);
                    orchestrator.events().publish(SyncEvent::SyncError { message });
                }
            }
        });
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncConfig;
    use crate::events::EventBus;
    use crate::features::sync::operation::{OperationStatus, VerificationPayload};
    use crate::features::sync::testing::ScriptedTransport;
    use crate::features::sync::{QueueManager, SyncQueue};
    use crate::storage::Database;
    use crate::transport::{MockTransport, NetworkMonitor, Transport};

    const HOUR: Duration = Duration::from_secs(3600);

    fn scheduler_with(
        transport: Arc<dyn Transport>,
        online: bool,
        config: SyncConfig,
    ) -> (BackgroundScheduler, QueueManager, NetworkMonitor) {
        let db = Database::open_in_memory().unwrap();
        let manager = QueueManager::new(SyncQueue::with_database(db));
        let network = NetworkMonitor::new(online);
        let orchestrator = SyncOrchestrator::new(
            manager.clone(),
            transport,
            network.clone(),
            EventBus::new(),
            config,
        );
        (BackgroundScheduler::new(orchestrator), manager, network)
    }

    fn quick_config() -> SyncConfig {
        SyncConfig {
            batch_delay_ms: 0,
            min_sync_gap_seconds: 0,
            ..SyncConfig::default()
        }
    }

    async fn queue_one(manager: &QueueManager, roll: &str) -> i64 {
        manager
            .queue_verification(&VerificationPayload {
                roll_number: roll.to_string(),
                matched: true,
                score: Some(0.9),
                session_id: None,
                verified_at: Utc::now(),
            })
            .await
            .unwrap()
    }

    async fn wait_for_status(manager: &QueueManager, id: i64, status: OperationStatus) -> bool {
        for _ in 0..100 {
            if manager.queue().get(id).unwrap().unwrap().status == status {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let (scheduler, _manager, _network) =
            scheduler_with(Arc::new(ScriptedTransport::new()), false, quick_config());

        assert!(scheduler.start_with_period(HOUR));
        assert!(!scheduler.start_with_period(HOUR));
        assert!(scheduler.is_running());

        scheduler.stop().await;
        assert!(!scheduler.is_running());
        assert!(scheduler.start_with_period(HOUR));
        scheduler.stop().await;
    }

    #[tokio::test]
    async fn test_runs_immediately_when_online() {
        let (scheduler, manager, _network) =
            scheduler_with(Arc::new(ScriptedTransport::new()), true, quick_config());
        let id = queue_one(&manager, "R-1").await;

        scheduler.start_with_period(HOUR);

        assert!(wait_for_status(&manager, id, OperationStatus::Synced).await);
        scheduler.stop().await;
    }

    #[tokio::test]
    async fn test_offline_start_waits_for_reconnect() {
        let transport = ScriptedTransport::new();
        let calls = transport.calls();
        let (scheduler, manager, network) =
            scheduler_with(Arc::new(transport), false, quick_config());
        let id = queue_one(&manager, "R-1").await;

        scheduler.start_with_period(HOUR);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 0);
        assert!(!scheduler.trigger_now());

        network.set_online(true);

        assert!(wait_for_status(&manager, id, OperationStatus::Synced).await);
        scheduler.stop().await;
    }

    #[tokio::test]
    async fn test_interval_picks_up_new_work() {
        let (scheduler, manager, _network) =
            scheduler_with(Arc::new(ScriptedTransport::new()), true, quick_config());

        scheduler.start_with_period(Duration::from_millis(50));
        tokio::time::sleep(Duration::from_millis(30)).await;
        let id = queue_one(&manager, "R-1").await;

        assert!(wait_for_status(&manager, id, OperationStatus::Synced).await);
        scheduler.stop().await;
    }

    #[tokio::test]
    async fn test_trigger_ignored_while_gate_held() {
        let (scheduler, _manager, _network) =
            scheduler_with(Arc::new(ScriptedTransport::new()), true, quick_config());

        let _held = scheduler.orchestrator.gate().try_acquire().unwrap();

        assert!(!scheduler.trigger_now());
    }

    #[tokio::test]
    async fn test_panicking_run_is_contained() {
        let mut transport = MockTransport::new();
        transport
            .expect_upload_batch()
            .returning(|_, _| panic!("transport exploded"));
        let (scheduler, manager, _network) =
            scheduler_with(Arc::new(transport), true, quick_config());
        let mut events = scheduler.orchestrator.events().subscribe();
        queue_one(&manager, "R-1").await;

        assert!(scheduler.trigger_now());

        let message = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if let Some(SyncEvent::SyncError { message }) = events.recv().await {
                    return message;
                }
            }
        })
        .await
        .unwrap();
        assert!(message.contains("transport exploded"));

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!scheduler.orchestrator.gate().is_busy());
        assert!(!scheduler.orchestrator.status().running);
    }

    #[tokio::test]
    async fn test_stop_waits_for_in_flight_run() {
        let transport = ScriptedTransport::new().with_delay(Duration::from_millis(300));
        let (scheduler, manager, _network) =
            scheduler_with(Arc::new(transport), true, quick_config());
        let id = queue_one(&manager, "R-1").await;

        scheduler.start_with_period(HOUR);
        assert!(wait_for_status(&manager, id, OperationStatus::Syncing).await);
        assert!(scheduler.orchestrator.gate().is_busy());

        scheduler.stop().await;

        assert_eq!(
            manager.queue().get(id).unwrap().unwrap().status,
            OperationStatus::Synced
        );
        assert!(!scheduler.orchestrator.gate().is_busy());
        assert!(!scheduler.is_running());
    }

    #[tokio::test]
    async fn test_stop_gives_up_after_shutdown_timeout() {
        let transport = ScriptedTransport::new().with_delay(HOUR);
        let config = SyncConfig {
            shutdown_timeout_seconds: 1,
            ..quick_config()
        };
        let (scheduler, manager, _network) = scheduler_with(Arc::new(transport), true, config);
        let id = queue_one(&manager, "R-1").await;

        scheduler.start_with_period(HOUR);
        assert!(wait_for_status(&manager, id, OperationStatus::Syncing).await);

        let started = std::time::Instant::now();
        scheduler.stop().await;
        let elapsed = started.elapsed();

        assert!(elapsed >= Duration::from_millis(900), "returned after {elapsed:?}");
        assert!(elapsed < Duration::from_secs(3), "returned after {elapsed:?}");
        assert!(!scheduler.is_running());
        assert_eq!(
            manager.queue().get(id).unwrap().unwrap().status,
            OperationStatus::Syncing
        );
    }
}
