//! Client-side connection manager.
//!
//! Holds at most one socket at a time, mirrors agent state into a local
//! [`AgentStore`] and reconnects after unexpected drops.

use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::timer::ReconnectTimer;
use agentsync::envelope::Info;
use agentsync::{AgentState, AgentStore, Envelope, Message, MessageType, StatePatch};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const CLOSE_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Open,
    Closed,
}

/// Notifications delivered to [`ConnectionManager::subscribe`] receivers.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    Connected { url: String },
    Disconnected,
    /// A connection attempt failed before the socket opened
    ConnectFailed(String),
    /// Merged state after a `state` or `reset` envelope
    StateChanged { agent_id: String, state: AgentState },
    AgentRemoved { agent_id: String },
    /// `error` envelope from the server; local state is untouched
    ServerError(String),
    /// Unparseable or invalid frame from the server, dropped
    LocalError(String),
    /// Any other valid envelope (actions, notices, welcome)
    Message(Envelope),
    Reconnecting { attempt: u32 },
    /// Reconnection gave up; nothing further is scheduled
    ReconnectExhausted { attempts: u32 },
}

struct Socket {
    generation: u64,
    tx: mpsc::Sender<WsMessage>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

struct Shared {
    config: ClientConfig,
    state: Mutex<ConnectionState>,
    store: Arc<AgentStore>,
    events: broadcast::Sender<ClientEvent>,
    socket: Mutex<Option<Socket>>,
    /// Bumped by every connect attempt and every teardown; stale attempts compare against it
    generation: AtomicU64,
    reconnect_attempts: AtomicU32,
    manual: AtomicBool,
    timer: Mutex<Option<ReconnectTimer>>,
    url: Mutex<Option<String>>,
}

/// Cheaply cloneable handle to one logical client connection.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Shared>,
}

impl ConnectionManager {
    pub fn new(config: ClientConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            inner: Arc::new(Shared {
                config,
                state: Mutex::new(ConnectionState::Idle),
                store: Arc::new(AgentStore::new()),
                events,
                socket: Mutex::new(None),
                generation: AtomicU64::new(0),
                reconnect_attempts: AtomicU32::new(0),
                manual: AtomicBool::new(false),
                timer: Mutex::new(None),
                url: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Open a socket to `url`, replacing any existing one.
    ///
    /// Resolves once the socket is open. A failure here is returned to the
    /// caller and does not trigger automatic reconnection.
    pub async fn connect(&self, url: impl Into<String>) -> Result<(), ClientError> {
        let shared = &self.inner;
        shared.manual.store(false, Ordering::SeqCst);
        shared.cancel_timer();
        if let Some(old) = shared.take_socket() {
            debug!("Replacing existing socket");
            close_socket(old).await;
            shared.emit(ClientEvent::Disconnected);
        }
        shared.open(url.into()).await
    }

    /// Connect to the URL derived from the configuration.
    pub async fn connect_default(&self) -> Result<(), ClientError> {
        let url = self.inner.config.resolve_url();
        self.connect(url).await
    }

    /// Close the socket and cancel any pending reconnection.
    pub async fn disconnect(&self) {
        let shared = &self.inner;
        shared.manual.store(true, Ordering::SeqCst);
        shared.cancel_timer();

        let socket = shared.take_socket();
        let was_open = socket.is_some();
        if let Some(socket) = socket {
            close_socket(socket).await;
        }
        shared.set_state(ConnectionState::Closed);
        if was_open {
            shared.emit(ClientEvent::Disconnected);
            info!("Disconnected");
        }
    }

    /// Queue an envelope on the open socket.
    pub fn send(&self, envelope: &Envelope) -> Result<(), ClientError> {
        let text = envelope.to_json()?;
        let slot = self.inner.socket.lock();
        let socket = match slot.as_ref() {
            Some(socket) if self.state() == ConnectionState::Open => socket,
            _ => return Err(ClientError::NotConnected),
        };
        match socket.tx.try_send(WsMessage::text(text)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                warn!(capacity = self.inner.config.outbound_buffer, "Outbound queue full, frame dropped");
                Err(ClientError::QueueFull {
                    capacity: self.inner.config.outbound_buffer,
                })
            }
            Err(TrySendError::Closed(_)) => Err(ClientError::NotConnected),
        }
    }

    pub fn send_state(&self, agent_id: &str, patch: &StatePatch) -> Result<(), ClientError> {
        self.send(&Envelope::new(MessageType::State, agent_id, patch.to_map()))
    }

    pub fn send_action(&self, agent_id: &str, data: Map<String, Value>) -> Result<(), ClientError> {
        self.send(&Envelope::new(MessageType::Action, agent_id, data))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.inner.events.subscribe()
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.lock()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Local mirror of an agent's state.
    pub fn agent_state(&self, agent_id: &str) -> Option<AgentState> {
        self.inner.store.get(agent_id)
    }

    pub fn store(&self) -> &Arc<AgentStore> {
        &self.inner.store
    }

    /// Reconnection attempts since the last successful open.
    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.reconnect_attempts.load(Ordering::SeqCst)
    }

    /// Whether a reconnection is waiting on its backoff timer.
    pub fn reconnect_pending(&self) -> bool {
        self.inner
            .timer
            .lock()
            .as_ref()
            .is_some_and(|t| !t.is_cancelled() && !t.is_finished())
    }
}

impl Shared {
    fn emit(&self, event: ClientEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.lock() = state;
    }

    fn cancel_timer(&self) {
        if let Some(timer) = self.timer.lock().take() {
            timer.cancel();
        }
    }

    /// Detach the current socket and invalidate in-flight attempts.
    fn take_socket(&self) -> Option<Socket> {
        let mut slot = self.socket.lock();
        self.generation.fetch_add(1, Ordering::SeqCst);
        slot.take()
    }

    async fn open(self: &Arc<Self>, url: String) -> Result<(), ClientError> {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        *self.url.lock() = Some(url.clone());
        self.set_state(ConnectionState::Connecting);

        if url.starts_with("wss://") {
            // Already installed is fine
            let _ = rustls::crypto::ring::default_provider().install_default();
        }

        debug!(url = %url, "Connecting");
        let ws = match self.dial(&url).await {
            Ok(ws) => ws,
            Err(e) => {
                if self.generation.load(Ordering::SeqCst) != generation {
                    return Err(ClientError::Aborted { url });
                }
                self.set_state(ConnectionState::Closed);
                warn!(url = %url, error = %e, "Connection failed");
                self.emit(ClientEvent::ConnectFailed(e.to_string()));
                return Err(e);
            }
        };

        let mut slot = self.socket.lock();
        if self.generation.load(Ordering::SeqCst) != generation {
            debug!(url = %url, "Connection attempt superseded");
            return Err(ClientError::Aborted { url });
        }

        self.reconnect_attempts.store(0, Ordering::SeqCst);
        self.set_state(ConnectionState::Open);
        self.emit(ClientEvent::Connected { url: url.clone() });

        let (tx, rx) = mpsc::channel(self.config.outbound_buffer.max(1));
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_socket(
            Arc::clone(self),
            generation,
            ws,
            rx,
            cancel.clone(),
        ));
        *slot = Some(Socket {
            generation,
            tx,
            cancel,
            task,
        });

        info!(url = %url, "Connected");
        Ok(())
    }

    async fn dial(&self, url: &str) -> Result<WsStream, ClientError> {
        match timeout(self.config.connect_timeout(), connect_async(url)).await {
            Ok(Ok((ws, _response))) => Ok(ws),
            Ok(Err(e)) => Err(ClientError::Connect {
                url: url.to_string(),
                source: Box::new(e),
            }),
            Err(_) => Err(ClientError::ConnectTimeout {
                url: url.to_string(),
                timeout_ms: self.config.connect_timeout_ms,
            }),
        }
    }

    /// Socket task ended on its own (server close, error or EOF).
    fn on_closed(self: &Arc<Self>, generation: u64) {
        {
            let mut slot = self.socket.lock();
            match slot.as_ref() {
                Some(socket) if socket.generation == generation => {
                    slot.take();
                }
                // Torn down deliberately
                _ => return,
            }
        }

        self.set_state(ConnectionState::Closed);
        self.emit(ClientEvent::Disconnected);
        info!("Connection closed by peer");

        self.schedule_reconnect();
    }

    fn schedule_reconnect(self: &Arc<Self>) {
        let mut timer = self.timer.lock();
        if self.manual.load(Ordering::SeqCst) {
            return;
        }

        let max = self.config.max_reconnect_attempts;
        let attempts = self.reconnect_attempts.load(Ordering::SeqCst);
        if attempts >= max {
            warn!(attempts, "Giving up on reconnection");
            *timer = None;
            self.emit(ClientEvent::ReconnectExhausted { attempts });
            return;
        }

        let attempt = self.reconnect_attempts.fetch_add(1, Ordering::SeqCst) + 1;
        let delay = self.config.reconnect_interval();
        info!(attempt, max, delay_ms = delay.as_millis() as u64, "Scheduling reconnect");
        self.emit(ClientEvent::Reconnecting { attempt });

        let shared = Arc::clone(self);
        let next = ReconnectTimer::schedule(delay, async move { shared.reconnect().await });
        if let Some(previous) = timer.replace(next) {
            previous.cancel();
        }
    }

    async fn reconnect(self: Arc<Self>) {
        if self.manual.load(Ordering::SeqCst) {
            return;
        }
        let Some(url) = self.url.lock().clone() else {
            return;
        };

        match self.open(url).await {
            Ok(()) => {}
            Err(ClientError::Aborted { .. }) => {}
            Err(_) => self.schedule_reconnect(),
        }
    }

    fn handle_inbound(&self, text: &str) {
        let raw: Value = match serde_json::from_str(text) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(error = %e, "Dropping non-JSON frame");
                self.emit(ClientEvent::LocalError(format!("invalid JSON: {}", e)));
                return;
            }
        };
        let envelope = match Envelope::from_value(raw) {
            Ok(envelope) => envelope,
            Err(report) => {
                warn!(error = %report.message(), "Dropping invalid envelope");
                self.emit(ClientEvent::LocalError(report.message()));
                return;
            }
        };
        let message = match Message::try_from(envelope.clone()) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "Dropping malformed envelope");
                self.emit(ClientEvent::LocalError(e.to_string()));
                return;
            }
        };

        match message {
            Message::Error { error, .. } => {
                debug!(error = %error, "Server reported error");
                self.emit(ClientEvent::ServerError(error));
            }
            Message::Info {
                info: Info::AgentDisconnected(agent_id),
                ..
            } => {
                self.store.remove(&agent_id);
                self.emit(ClientEvent::AgentRemoved { agent_id });
            }
            Message::State { agent_id, patch } => {
                let state = self.store.update(&agent_id, &patch);
                self.emit(ClientEvent::StateChanged { agent_id, state });
            }
            Message::Reset { agent_id, patch } => {
                let state = self.store.reset(&agent_id, &patch);
                self.emit(ClientEvent::StateChanged { agent_id, state });
            }
            _ => self.emit(ClientEvent::Message(envelope)),
        }
    }
}

async fn close_socket(mut socket: Socket) {
    socket.cancel.cancel();
    if timeout(CLOSE_GRACE, &mut socket.task).await.is_err() {
        socket.task.abort();
    }
}

/// Pump one socket until it closes or is cancelled.
async fn run_socket(
    shared: Arc<Shared>,
    generation: u64,
    ws: WsStream,
    mut outbound: mpsc::Receiver<WsMessage>,
    cancel: CancellationToken,
) {
    let (mut sink, mut stream) = ws.split();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = sink.close().await;
                return;
            }
            Some(frame) = outbound.recv() => {
                if let Err(e) = sink.send(frame).await {
                    warn!(error = %e, "Send failed");
                    break;
                }
            }
            frame = stream.next() => match frame {
                Some(Ok(WsMessage::Text(text))) => shared.handle_inbound(text.as_str()),
                Some(Ok(WsMessage::Close(frame))) => {
                    debug!(frame = ?frame, "Server closed connection");
                    break;
                }
                // Pings are answered by the protocol layer
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(error = %e, "Socket error");
                    break;
                }
                None => break,
            },
        }
    }

    shared.on_closed(generation);
}
