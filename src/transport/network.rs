//! Connectivity state.
//!
//! [`NetworkMonitor`] holds the current online flag in a `watch` channel.
//! Readers poll [`NetworkMonitor::is_online`] or subscribe to transitions.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::Transport;
use crate::events::{EventBus, SyncEvent};

/// Shared connectivity flag. Cheap to clone.
#[derive(Clone)]
pub struct NetworkMonitor {
    tx: Arc<watch::Sender<bool>>,
    events: Option<EventBus>,
}

impl NetworkMonitor {
    /// Create a monitor with an initial state.
    #[must_use]
    pub fn new(online: bool) -> Self {
        let (tx, _rx) = watch::channel(online);
        Self {
            tx: Arc::new(tx),
            events: None,
        }
    }

    /// Announce flips on `events` as [`SyncEvent::NetworkChanged`].
    #[must_use]
    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    /// Current connectivity.
    #[must_use]
    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    /// Record connectivity. Subscribers are only woken on an actual change.
    pub fn set_online(&self, online: bool) {
        let changed = self.tx.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });

        if changed {
            info!(online, "network status changed");
            if let Some(events) = &self.events {
                events.publish(SyncEvent::NetworkChanged { online });
            }
        }
    }

    /// Receiver for status changes. The current value counts as seen.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    /// Probe `transport` every `period` until `cancel` fires.
    pub async fn run_probe(
        &self,
        transport: Arc<dyn Transport>,
        period: Duration,
        cancel: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(period);
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let online = transport.check_connectivity().await;
                    self.set_online(online);
                }
            }
        }
    }
}

/// Wait for the next offline-to-online transition.
///
/// Returns `false` if the monitor was dropped.
pub(crate) async fn wait_for_reconnect(rx: &mut watch::Receiver<bool>) -> bool {
    let mut was_online = *rx.borrow_and_update();
    loop {
        if rx.changed().await.is_err() {
            return false;
        }
        let online = *rx.borrow_and_update();
        if online && !was_online {
            return true;
        }
        was_online = online;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockTransport;

    #[test]
    fn test_set_online_only_notifies_on_change() {
        let monitor = NetworkMonitor::new(false);
        let mut rx = monitor.subscribe();

        monitor.set_online(false);
        assert!(!rx.has_changed().unwrap());

        monitor.set_online(true);
        assert!(rx.has_changed().unwrap());
        assert!(*rx.borrow_and_update());
        assert!(monitor.is_online());
    }

    #[tokio::test]
    async fn test_network_changed_event() {
        let events = EventBus::new();
        let mut rx = events.subscribe();
        let monitor = NetworkMonitor::new(true).with_events(events);

        monitor.set_online(false);

        assert!(matches!(
            rx.recv().await,
            Some(SyncEvent::NetworkChanged { online: false })
        ));
    }

    #[tokio::test]
    async fn test_wait_for_reconnect() {
        let monitor = NetworkMonitor::new(true);
        let mut rx = monitor.subscribe();

        let waiter = tokio::spawn(async move { wait_for_reconnect(&mut rx).await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        monitor.set_online(false);
        tokio::time::sleep(Duration::from_millis(20)).await;
        monitor.set_online(true);

        let reconnected = tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(reconnected);
    }

    #[tokio::test]
    async fn test_probe_updates_status() {
        let mut transport = MockTransport::new();
        transport.expect_check_connectivity().returning(|| false);

        let monitor = NetworkMonitor::new(true);
        let cancel = CancellationToken::new();
        let probe = {
            let monitor = monitor.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                monitor
                    .run_probe(Arc::new(transport), Duration::from_millis(10), cancel)
                    .await;
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        probe.await.unwrap();

        assert!(!monitor.is_online());
    }
}
