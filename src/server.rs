//! Owned server handle: listener, heartbeat and shared state.

use crate::api::{create_router, AppState};
use crate::config::{SyncConfig, TlsConfig};
use crate::connection::{ConnectionRegistry, CLOSE_GOING_AWAY};
use crate::dispatch::{AgentAction, Dispatcher};
use crate::envelope::Envelope;
use crate::error::ServerError;
use crate::heartbeat::HeartbeatMonitor;
use crate::state::{AgentState, AgentStore, StateChange, StatePatch};
use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use axum_server::Handle;
use parking_lot::Mutex;
use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Close reason sent to every client when the server stops.
pub const SHUTDOWN_REASON: &str = "server shutting down";

const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

struct Running {
    handle: Handle,
    shutdown: CancellationToken,
    serve: JoinHandle<std::io::Result<()>>,
    local_addr: SocketAddr,
}

/// Agent state sync server.
///
/// Each instance owns its own registry, store and heartbeat, so several can
/// run side by side (tests do this on port 0).
pub struct SyncServer {
    config: SyncConfig,
    registry: Arc<ConnectionRegistry>,
    store: Arc<AgentStore>,
    dispatcher: Arc<Dispatcher>,
    heartbeat: Arc<HeartbeatMonitor>,
    started_at: Instant,
    running: Mutex<Option<Running>>,
}

impl SyncServer {
    pub fn new(config: SyncConfig) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        let store = Arc::new(AgentStore::new());
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&registry),
            Arc::clone(&store),
            config.server.action_channel_capacity,
        ));
        let heartbeat = Arc::new(HeartbeatMonitor::new(
            Arc::clone(&dispatcher),
            config.server.heartbeat_interval(),
            config.server.idle_timeout(),
        ));

        Self {
            config,
            registry,
            store,
            dispatcher,
            heartbeat,
            started_at: Instant::now(),
            running: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Start listening. Returns `false` (and logs why) if the server could not start.
    pub async fn start(&self) -> bool {
        match self.try_start().await {
            Ok(_) => true,
            Err(e) => {
                error!(error = %e, "Failed to start server");
                false
            }
        }
    }

    /// Start listening and return the bound address.
    pub async fn try_start(&self) -> Result<SocketAddr, ServerError> {
        let mut running = self.running.lock();
        if running.is_some() {
            return Err(ServerError::AlreadyRunning);
        }

        let tls = if self.config.server.secure {
            Some(RustlsConfig::from_config(Arc::new(tls_config(&self.config.tls)?)))
        } else {
            None
        };

        let addr = self.config.server.bind_addr();
        let bind_error = |source| ServerError::Bind {
            addr: addr.clone(),
            source,
        };
        let listener = TcpListener::bind(&addr).map_err(bind_error)?;
        listener.set_nonblocking(true).map_err(bind_error)?;
        let local_addr = listener.local_addr().map_err(bind_error)?;

        let shutdown = CancellationToken::new();
        let app = create_router(self.app_state(shutdown.clone()));
        let handle = Handle::new();

        let serve = match tls {
            Some(tls) => {
                let server = axum_server::tls_rustls::from_tcp_rustls(listener, tls)
                    .handle(handle.clone());
                tokio::spawn(async move { server.serve(app.into_make_service()).await })
            }
            None => {
                let server = axum_server::from_tcp(listener).handle(handle.clone());
                tokio::spawn(async move { server.serve(app.into_make_service()).await })
            }
        };

        *running = Some(Running {
            handle,
            shutdown,
            serve,
            local_addr,
        });
        drop(running);

        self.heartbeat.start();

        let scheme = if self.config.server.secure { "wss" } else { "ws" };
        info!(addr = %local_addr, "Sync server listening on {}://{}", scheme, local_addr);
        Ok(local_addr)
    }

    /// Stop the server: heartbeat first, then every connection, then the listener.
    ///
    /// Registry and store are cleared afterwards. No-op when not running.
    pub async fn stop(&self) {
        let Some(running) = self.running.lock().take() else {
            return;
        };

        self.heartbeat.stop().await;

        let open = self.registry.snapshot();
        for conn in &open {
            conn.close(CLOSE_GOING_AWAY, SHUTDOWN_REASON);
        }
        running.shutdown.cancel();
        running.handle.graceful_shutdown(Some(SHUTDOWN_GRACE));

        match running.serve.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "Server exited with error"),
            Err(e) => warn!(error = %e, "Server task failed"),
        }

        let _ = self.registry.drain();
        self.store.clear();
        info!(closed = open.len(), "Sync server stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Address the listener is bound to while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().as_ref().map(|r| r.local_addr)
    }

    /// Router serving this instance's state, for embedding or in-process requests.
    pub fn router(&self) -> Router {
        create_router(self.app_state(CancellationToken::new()))
    }

    pub fn agent_state(&self, agent_id: &str) -> Option<AgentState> {
        self.store.get(agent_id)
    }

    /// Merge a patch into an agent's state and publish it (broadcast + unicast).
    pub fn update_agent_state(&self, agent_id: &str, patch: &StatePatch) -> AgentState {
        self.dispatcher.update_agent_state(agent_id, patch)
    }

    pub fn reset_agent_state(&self, agent_id: &str, patch: &StatePatch) -> AgentState {
        self.dispatcher.reset_agent_state(agent_id, patch)
    }

    /// Send an envelope to every open connection.
    pub fn broadcast(&self, envelope: &Envelope) -> usize {
        self.dispatcher.broadcast(envelope, None)
    }

    pub fn send_to_agent(&self, agent_id: &str, envelope: &Envelope) -> bool {
        self.dispatcher.send_to_agent(agent_id, envelope)
    }

    pub fn connection_count(&self) -> usize {
        self.registry.len()
    }

    /// `action` envelopes received from clients.
    pub fn subscribe_actions(&self) -> broadcast::Receiver<AgentAction> {
        self.dispatcher.subscribe_actions()
    }

    /// Every state update or reset applied to the store.
    pub fn subscribe_state_changes(&self) -> broadcast::Receiver<StateChange> {
        self.store.subscribe()
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn heartbeat(&self) -> &Arc<HeartbeatMonitor> {
        &self.heartbeat
    }

    fn app_state(&self, shutdown: CancellationToken) -> Arc<AppState> {
        Arc::new(AppState {
            dispatcher: Arc::clone(&self.dispatcher),
            shutdown,
            started_at: self.started_at,
            outbound_buffer: self.config.server.outbound_buffer,
        })
    }
}

/// Build the rustls server config from PEM files.
fn tls_config(tls: &TlsConfig) -> Result<rustls::ServerConfig, ServerError> {
    use rustls::pki_types::pem::PemObject;
    use rustls::pki_types::{CertificateDer, PrivateKeyDer};

    let (Some(cert_path), Some(key_path)) = (&tls.cert_path, &tls.key_path) else {
        return Err(ServerError::Tls(
            "secure mode requires tls.cert_path and tls.key_path".to_string(),
        ));
    };

    let certs = CertificateDer::pem_file_iter(cert_path)
        .and_then(|iter| iter.collect::<Result<Vec<_>, _>>())
        .map_err(|e| ServerError::Tls(format!("read certificates {}: {}", cert_path.display(), e)))?;
    let key = PrivateKeyDer::from_pem_file(key_path)
        .map_err(|e| ServerError::Tls(format!("read private key {}: {}", key_path.display(), e)))?;

    let mut config =
        rustls::ServerConfig::builder_with_provider(rustls::crypto::ring::default_provider().into())
            .with_safe_default_protocol_versions()
            .map_err(|e| ServerError::Tls(e.to_string()))?
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| ServerError::Tls(e.to_string()))?;
    // WebSocket upgrades need HTTP/1.1
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(config)
}
