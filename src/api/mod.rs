// HTTP and WebSocket surface

pub mod health;
pub mod websocket;

pub use health::{health_handler, HealthResponse};
pub use websocket::{run_session, ws_handler};

use crate::dispatch::Dispatcher;
use axum::{routing::get, Router};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

/// Shared application state for the sync endpoints
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
    /// Cancelled when the server is stopping
    pub shutdown: CancellationToken,
    pub started_at: Instant,
    /// Per-connection outbound queue size
    pub outbound_buffer: usize,
}

/// Create the server router.
///
/// `GET /health` answers JSON; every other path accepts the WebSocket upgrade.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .fallback(ws_handler)
        .with_state(state)
}
