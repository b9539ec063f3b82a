//! A single live WebSocket connection as seen by the rest of the server.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub type ConnectionId = Uuid;

/// WebSocket close code for "going away" (idle eviction, server shutdown).
pub const CLOSE_GOING_AWAY: u16 = 1001;
/// WebSocket close code for a normal close.
pub const CLOSE_NORMAL: u16 = 1000;

/// Frame queued for the connection's writer task.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Text(Arc<str>),
    Ping,
    Close { code: u16, reason: String },
}

/// Represents a connected client.
pub struct Connection {
    /// Unique connection ID (UUIDv7, generated at accept time).
    pub id: ConnectionId,
    /// Agent this connection speaks for; set at most once.
    agent_id: OnceLock<String>,
    /// Send channel to the connection's writer task.
    tx: mpsc::Sender<Outbound>,
    /// When this connection was established.
    pub connected_at: Instant,
    /// Last inbound message or pong.
    last_activity: Mutex<Instant>,
    /// Cancelled once the connection is closing.
    closed: CancellationToken,
    /// Frames dropped because the outbound queue was full or gone.
    dropped_frames: AtomicU64,
}

impl Connection {
    pub fn new(id: ConnectionId, tx: mpsc::Sender<Outbound>) -> Self {
        let now = Instant::now();
        Self {
            id,
            agent_id: OnceLock::new(),
            tx,
            connected_at: now,
            last_activity: Mutex::new(now),
            closed: CancellationToken::new(),
            dropped_frames: AtomicU64::new(0),
        }
    }

    /// Bound agent id, if any.
    pub fn agent_id(&self) -> Option<&str> {
        self.agent_id.get().map(String::as_str)
    }

    /// Bind to `agent_id` if unbound. Returns `true` only for the call that set it.
    pub(crate) fn bind_agent(&self, agent_id: &str) -> bool {
        self.agent_id.set(agent_id.to_string()).is_ok()
    }

    /// Record activity now.
    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    pub fn last_activity(&self) -> Instant {
        *self.last_activity.lock()
    }

    /// Inactivity measured against `now`.
    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity())
    }

    /// Whether frames can still be delivered.
    pub fn is_open(&self) -> bool {
        !self.closed.is_cancelled() && !self.tx.is_closed()
    }

    /// Queue a text frame.
    ///
    /// Never waits: returns `false` if the queue is full or closed and counts
    /// the frame as dropped.
    pub fn send(&self, text: Arc<str>) -> bool {
        self.enqueue(Outbound::Text(text))
    }

    /// Queue a liveness probe.
    pub fn ping(&self) -> bool {
        self.enqueue(Outbound::Ping)
    }

    /// Start closing the connection. Later calls are no-ops.
    pub fn close(&self, code: u16, reason: &str) {
        if self.closed.is_cancelled() {
            return;
        }
        let _ = self.tx.try_send(Outbound::Close {
            code,
            reason: reason.to_string(),
        });
        self.closed.cancel();
    }

    pub fn is_closing(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once [`Connection::close`] has been called.
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    pub fn dropped_frames(&self) -> u64 {
        self.dropped_frames.load(Ordering::Relaxed)
    }

    fn enqueue(&self, frame: Outbound) -> bool {
        if self.closed.is_cancelled() {
            return false;
        }
        if self.tx.try_send(frame).is_ok() {
            true
        } else {
            let _ = self.dropped_frames.fetch_add(1, Ordering::Relaxed);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_connection(capacity: usize) -> (Connection, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Connection::new(Uuid::now_v7(), tx), rx)
    }

    #[tokio::test]
    async fn send_message_success() {
        let (conn, mut rx) = make_connection(8);
        assert!(conn.send(Arc::from("hello")));
        assert_eq!(rx.recv().await.unwrap(), Outbound::Text(Arc::from("hello")));
    }

    #[test]
    fn send_to_full_queue_counts_drop() {
        let (conn, _rx) = make_connection(1);
        assert!(conn.send(Arc::from("one")));
        assert!(!conn.send(Arc::from("two")));
        assert_eq!(conn.dropped_frames(), 1);
    }

    #[test]
    fn send_to_closed_channel_returns_false() {
        let (conn, rx) = make_connection(8);
        drop(rx);
        assert!(!conn.is_open());
        assert!(!conn.send(Arc::from("hello")));
        assert!(!conn.ping());
    }

    #[test]
    fn bind_agent_is_first_writer_wins() {
        let (conn, _rx) = make_connection(8);
        assert!(conn.agent_id().is_none());
        assert!(conn.bind_agent("a1"));
        assert!(!conn.bind_agent("a2"));
        assert_eq!(conn.agent_id(), Some("a1"));
    }

    #[tokio::test]
    async fn close_queues_frame_once() {
        let (conn, mut rx) = make_connection(8);
        conn.close(CLOSE_GOING_AWAY, "bye");
        conn.close(CLOSE_NORMAL, "again");

        assert!(conn.is_closing());
        assert!(!conn.is_open());
        assert_eq!(
            rx.recv().await.unwrap(),
            Outbound::Close {
                code: CLOSE_GOING_AWAY,
                reason: "bye".to_string()
            }
        );
        assert!(rx.try_recv().is_err());
        // Resolves immediately once closed
        conn.closed().await;
    }

    #[test]
    fn closed_connection_rejects_frames() {
        let (conn, _rx) = make_connection(8);
        conn.close(CLOSE_NORMAL, "done");
        assert!(!conn.send(Arc::from("late")));
    }

    #[tokio::test(start_paused = true)]
    async fn touch_resets_idle_time() {
        let (conn, _rx) = make_connection(8);
        tokio::time::advance(Duration::from_millis(500)).await;
        assert!(conn.idle_for(Instant::now()) >= Duration::from_millis(500));

        conn.touch();
        assert_eq!(conn.idle_for(Instant::now()), Duration::ZERO);
    }
}
