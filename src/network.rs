//! Remote reachability tracking.
//!
//! The cached status starts offline and only changes through a probe.
//! Listeners hear about transitions, never about repeated identical probes.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info};

use crate::api::RemoteStore;

pub type ListenerId = u64;

type Listener = Arc<dyn Fn(bool) + Send + Sync>;

pub struct NetworkMonitor {
    remote: Arc<dyn RemoteStore>,
    probe_timeout: Duration,
    status: watch::Sender<bool>,
    listeners: Mutex<Vec<(ListenerId, Listener)>>,
    next_id: AtomicU64,
}

impl NetworkMonitor {
    pub fn new(remote: Arc<dyn RemoteStore>, probe_timeout: Duration) -> Self {
        let (status, _) = watch::channel(false);
        Self {
            remote,
            probe_timeout,
            status,
            listeners: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Probe the remote store now. A failed or timed-out probe is offline.
    pub async fn is_online(&self) -> bool {
        let online = match time::timeout(self.probe_timeout, self.remote.ping()).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                debug!("Probe failed: {e}");
                false
            }
            Err(_) => {
                debug!(timeout_ms = self.probe_timeout.as_millis() as u64, "Probe timed out");
                false
            }
        };
        self.set_status(online);
        online
    }

    /// Cached status from the last probe.
    pub fn current_status(&self) -> bool {
        *self.status.borrow()
    }

    /// Register a listener. It is called once right away with the current
    /// status, then on every transition.
    pub fn subscribe(&self, listener: impl Fn(bool) + Send + Sync + 'static) -> ListenerId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let listener: Listener = Arc::new(listener);
        self.listeners
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push((id, Arc::clone(&listener)));
        listener(self.current_status());
        id
    }

    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.lock().unwrap_or_else(|p| p.into_inner());
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len() != before
    }

    /// Channel form of the status, for tasks that await transitions.
    pub fn watch(&self) -> watch::Receiver<bool> {
        self.status.subscribe()
    }

    fn set_status(&self, online: bool) {
        let changed = self.status.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
        if !changed {
            return;
        }
        info!(online, "Network status changed");

        // Listeners run without the registry lock held
        let listeners: Vec<Listener> = self
            .listeners
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();
        for listener in listeners {
            listener(online);
        }
    }

    /// Probe on a fixed interval until `shutdown` fires.
    pub fn spawn_poller(
        self: &Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(interval_secs = interval.as_secs(), "Network poller started");
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        monitor.is_online().await;
                    }
                    _ = shutdown.changed() => break,
                }
            }
            debug!("Network poller stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeRemote;

    fn monitor(remote: &Arc<FakeRemote>) -> NetworkMonitor {
        NetworkMonitor::new(remote.clone(), Duration::from_millis(200))
    }

    #[tokio::test]
    async fn starts_offline_until_probed() {
        let remote = FakeRemote::new();
        let monitor = monitor(&remote);
        assert!(!monitor.current_status());
        assert!(monitor.is_online().await);
        assert!(monitor.current_status());
    }

    #[tokio::test]
    async fn listeners_hear_transitions_only() {
        let remote = FakeRemote::new();
        let monitor = monitor(&remote);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let id = monitor.subscribe(move |online| sink.lock().unwrap().push(online));

        monitor.is_online().await;
        monitor.is_online().await;
        remote.set_online(false);
        monitor.is_online().await;
        monitor.is_online().await;

        assert_eq!(*seen.lock().unwrap(), vec![false, true, false]);

        assert!(monitor.unsubscribe(id));
        assert!(!monitor.unsubscribe(id));
        remote.set_online(true);
        monitor.is_online().await;
        assert_eq!(seen.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn probe_timeout_counts_as_offline() {
        let remote = FakeRemote::new();
        let monitor = monitor(&remote);
        monitor.is_online().await;
        remote.set_stalled(true);
        assert!(!monitor.is_online().await);
        assert!(!monitor.current_status());
    }

    #[tokio::test]
    async fn watch_receivers_see_changes() {
        let remote = FakeRemote::new();
        let monitor = monitor(&remote);
        let mut rx = monitor.watch();
        monitor.is_online().await;
        rx.changed().await.expect("status change");
        assert!(*rx.borrow());
    }

    #[tokio::test]
    async fn poller_stops_on_shutdown() {
        let remote = FakeRemote::new();
        let monitor = Arc::new(monitor(&remote));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = monitor.spawn_poller(Duration::from_millis(10), shutdown_rx);

        let mut rx = monitor.watch();
        rx.changed().await.expect("first probe");
        assert!(monitor.current_status());

        shutdown_tx.send(true).expect("signal shutdown");
        handle.await.expect("poller joins");
    }
}
