//! WebSocket session lifecycle, from upgrade through disconnect.

use super::AppState;
use crate::connection::{Outbound, CLOSE_NORMAL};
use crate::dispatch::handle_text;
use crate::envelope::Envelope;
use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// How long the writer gets to flush queued frames after the reader ends.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// WebSocket upgrade handler, mounted on every path except `/health`
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    debug!("WebSocket upgrade request received");
    ws.on_upgrade(move |socket| run_session(socket, state))
}

/// Run one client session.
///
/// Registers the connection, greets it with a `connection` envelope, feeds
/// inbound text frames to the dispatcher in arrival order and runs the full
/// disconnect cleanup when the socket ends, is evicted, or the server stops.
pub async fn run_session(socket: WebSocket, state: Arc<AppState>) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let dispatcher = Arc::clone(&state.dispatcher);

    let (send_tx, mut send_rx) = mpsc::channel::<Outbound>(state.outbound_buffer.max(1));
    let connection = dispatcher.registry().register(send_tx);
    let connection_id = connection.id;
    info!(connection_id = %connection_id, "Client connected");

    dispatcher.send_to_connection(&connection, &Envelope::connected(&connection_id.to_string()));

    // Outbound forwarder: drains the connection's queue into the socket
    let writer = tokio::spawn(async move {
        while let Some(frame) = send_rx.recv().await {
            let (message, last) = match frame {
                Outbound::Text(text) => (Message::Text(text.to_string()), false),
                Outbound::Ping => (Message::Ping(Vec::new()), false),
                Outbound::Close { code, reason } => (
                    Message::Close(Some(CloseFrame {
                        code,
                        reason: Cow::Owned(reason),
                    })),
                    true,
                ),
            };
            if ws_tx.send(message).await.is_err() || last {
                break;
            }
        }
        let _ = ws_tx.close().await;
    });

    loop {
        tokio::select! {
            // Eviction and shutdown win over frames already waiting
            biased;
            () = connection.closed() => {
                debug!(connection_id = %connection_id, "Connection closed by server");
                break;
            }
            () = state.shutdown.cancelled() => break,
            msg = ws_rx.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    handle_text(&dispatcher, &connection, &text);
                }
                Some(Ok(Message::Binary(data))) => match std::str::from_utf8(&data) {
                    Ok(text) => {
                        handle_text(&dispatcher, &connection, text);
                    }
                    Err(_) => {
                        connection.touch();
                        debug!(connection_id = %connection_id, len = data.len(), "Ignoring non-UTF8 binary frame");
                    }
                },
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => connection.touch(),
                Some(Ok(Message::Close(_))) => {
                    info!(connection_id = %connection_id, "Client sent close frame");
                    break;
                }
                Some(Err(e)) => {
                    warn!(connection_id = %connection_id, error = %e, "WebSocket error");
                    break;
                }
                None => break,
            }
        }
    }

    let agent_id = dispatcher.disconnect(&connection_id);
    connection.close(CLOSE_NORMAL, "connection closed");

    let abort = writer.abort_handle();
    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, writer).await.is_err() {
        abort.abort();
    }

    info!(
        connection_id = %connection_id,
        agent_id = agent_id.as_deref().unwrap_or(""),
        "Client disconnected"
    );
}
