//! Periodic liveness sweep over every registered connection.

use crate::connection::{ConnectionId, CLOSE_GOING_AWAY};
use crate::dispatch::Dispatcher;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Close reason sent to evicted connections.
pub const TIMEOUT_REASON: &str = "heartbeat timeout";

struct Running {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Evicts idle connections and pings the rest on a fixed period.
pub struct HeartbeatMonitor {
    dispatcher: Arc<Dispatcher>,
    interval: Duration,
    timeout: Duration,
    running: Mutex<Option<Running>>,
}

impl HeartbeatMonitor {
    pub fn new(dispatcher: Arc<Dispatcher>, interval: Duration, timeout: Duration) -> Self {
        Self {
            dispatcher,
            // tokio::time::interval panics on a zero period
            interval: interval.max(Duration::from_millis(1)),
            timeout,
            running: Mutex::new(None),
        }
    }

    /// Start the sweep task. Returns `false` if it was already running.
    pub fn start(self: &Arc<Self>) -> bool {
        let mut running = self.running.lock();
        if running.is_some() {
            return false;
        }

        let cancel = CancellationToken::new();
        let monitor = Arc::clone(self);
        let token = cancel.clone();
        let task = tokio::spawn(async move {
            let mut ticker = time::interval(monitor.interval);
            // Skip missed ticks to prevent backlog under load
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // First tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        monitor.sweep();
                    }
                    () = token.cancelled() => break,
                }
            }
        });

        *running = Some(Running { cancel, task });
        info!(
            interval_ms = self.interval.as_millis() as u64,
            timeout_ms = self.timeout.as_millis() as u64,
            "Heartbeat monitor started"
        );
        true
    }

    /// Stop the sweep task and wait for it to finish. No-op when stopped.
    pub async fn stop(&self) {
        let running = self.running.lock().take();
        if let Some(Running { cancel, task }) = running {
            cancel.cancel();
            let _ = task.await;
            info!("Heartbeat monitor stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Run one sweep now. Returns the evicted connection ids.
    pub fn sweep(&self) -> Vec<ConnectionId> {
        self.sweep_at(Instant::now())
    }

    /// Run one sweep as if the current time were `now`.
    pub fn sweep_at(&self, now: Instant) -> Vec<ConnectionId> {
        let mut evicted = Vec::new();

        for conn in self.dispatcher.registry().snapshot() {
            let idle = conn.idle_for(now);
            if idle > self.timeout {
                info!(
                    connection_id = %conn.id,
                    idle_ms = idle.as_millis() as u64,
                    "Evicting idle connection"
                );
                conn.close(CLOSE_GOING_AWAY, TIMEOUT_REASON);
                let _ = self.dispatcher.disconnect(&conn.id);
                evicted.push(conn.id);
            } else if !conn.ping() {
                // Not evicted here; the idle check catches it later
                warn!(connection_id = %conn.id, "Heartbeat ping failed");
            }
        }

        if !evicted.is_empty() {
            debug!(count = evicted.len(), "Heartbeat sweep evicted connections");
        }
        evicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ConnectionRegistry, Outbound};
    use crate::envelope::Envelope;
    use crate::state::{AgentStore, StatePatch};
    use tokio::sync::mpsc;

    fn setup(timeout_ms: u64) -> (Arc<Dispatcher>, Arc<HeartbeatMonitor>) {
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::new(ConnectionRegistry::new()),
            Arc::new(AgentStore::new()),
            16,
        ));
        let monitor = Arc::new(HeartbeatMonitor::new(
            Arc::clone(&dispatcher),
            Duration::from_millis(20),
            Duration::from_millis(timeout_ms),
        ));
        (dispatcher, monitor)
    }

    fn disconnect_notices(rx: &mut mpsc::Receiver<Outbound>, agent_id: &str) -> usize {
        let mut count = 0;
        while let Ok(frame) = rx.try_recv() {
            if let Outbound::Text(text) = frame {
                let envelope: Envelope = serde_json::from_str(&text).unwrap();
                if envelope.disconnected_agent() == Some(agent_id) {
                    count += 1;
                }
            }
        }
        count
    }

    #[tokio::test]
    async fn active_connection_gets_pinged() {
        let (dispatcher, monitor) = setup(100);
        let (tx, mut rx) = mpsc::channel(8);
        let conn = dispatcher.registry().register(tx);

        let evicted = monitor.sweep();

        assert!(evicted.is_empty());
        assert_eq!(rx.try_recv().unwrap(), Outbound::Ping);
        assert!(dispatcher.registry().get(&conn.id).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn idle_connection_evicted_with_cleanup() {
        let (dispatcher, monitor) = setup(100);
        let (tx, mut idle_rx) = mpsc::channel(8);
        let idle = dispatcher.registry().register(tx);
        dispatcher.registry().bind_agent(&idle.id, "a1");
        dispatcher.update_agent_state("a1", &StatePatch::default());

        tokio::time::advance(Duration::from_millis(150)).await;
        let (tx, _observer_rx) = mpsc::channel(8);
        let observer = dispatcher.registry().register(tx);

        let evicted = monitor.sweep();

        assert_eq!(evicted, vec![idle.id]);
        assert!(dispatcher.registry().get(&observer.id).is_some());
        assert!(dispatcher.registry().get(&idle.id).is_none());
        assert!(dispatcher.registry().find_by_agent("a1").is_none());
        assert!(dispatcher.store().get("a1").is_none());
        assert!(idle.is_closing());

        let mut saw_close = false;
        while let Ok(frame) = idle_rx.try_recv() {
            if let Outbound::Close { code, reason } = frame {
                assert_eq!(code, CLOSE_GOING_AWAY);
                assert_eq!(reason, TIMEOUT_REASON);
                saw_close = true;
            }
        }
        assert!(saw_close);
    }

    #[tokio::test(start_paused = true)]
    async fn eviction_broadcasts_disconnect_exactly_once() {
        let (dispatcher, monitor) = setup(100);
        let (tx, _idle_rx) = mpsc::channel(8);
        let idle = dispatcher.registry().register(tx);
        dispatcher.registry().bind_agent(&idle.id, "a1");

        tokio::time::advance(Duration::from_millis(101)).await;
        let (tx, mut observer_rx) = mpsc::channel(8);
        let _observer = dispatcher.registry().register(tx);

        monitor.sweep();
        monitor.sweep();

        assert_eq!(disconnect_notices(&mut observer_rx, "a1"), 1);
        assert!(dispatcher.registry().get(&idle.id).is_none());
    }

    #[tokio::test]
    async fn unbound_idle_connection_is_removed() {
        let (dispatcher, monitor) = setup(100);
        let (tx, _rx) = mpsc::channel(8);
        let conn = dispatcher.registry().register(tx);

        let later = conn.last_activity() + Duration::from_millis(500);
        assert_eq!(monitor.sweep_at(later), vec![conn.id]);
        assert!(dispatcher.registry().is_empty());
    }

    #[tokio::test]
    async fn timeout_is_strict() {
        let (dispatcher, monitor) = setup(100);
        let (tx, _rx) = mpsc::channel(8);
        let conn = dispatcher.registry().register(tx);

        let exactly = conn.last_activity() + Duration::from_millis(100);
        assert!(monitor.sweep_at(exactly).is_empty());

        let past = conn.last_activity() + Duration::from_millis(101);
        assert_eq!(monitor.sweep_at(past), vec![conn.id]);
    }

    #[tokio::test]
    async fn ping_failure_does_not_evict() {
        let (dispatcher, monitor) = setup(100);
        let (tx, rx) = mpsc::channel(8);
        let conn = dispatcher.registry().register(tx);
        drop(rx);

        assert!(monitor.sweep().is_empty());
        assert!(dispatcher.registry().get(&conn.id).is_some());
    }

    #[tokio::test]
    async fn start_and_stop_are_idempotent() {
        let (_dispatcher, monitor) = setup(100);

        assert!(monitor.start());
        assert!(!monitor.start());
        assert!(monitor.is_running());

        monitor.stop().await;
        monitor.stop().await;
        assert!(!monitor.is_running());

        assert!(monitor.start());
        monitor.stop().await;
    }

    #[tokio::test]
    async fn running_monitor_evicts_idle_connection() {
        let (dispatcher, monitor) = setup(50);
        let (tx, _rx) = mpsc::channel(64);
        let conn = dispatcher.registry().register(tx);
        dispatcher.registry().bind_agent(&conn.id, "a1");

        monitor.start();
        tokio::time::sleep(Duration::from_millis(200)).await;
        monitor.stop().await;

        assert!(dispatcher.registry().get(&conn.id).is_none());
    }
}
