//! Fan-out of envelopes to connected clients.
//!
//! The dispatcher is the only writer of the connection registry and agent
//! store outside the heartbeat monitor. All sends are fire-and-forget: a slow
//! or broken connection is logged and skipped, never waited on.

mod handler;

pub use handler::{handle_text, HandleOutcome};

use crate::connection::{Connection, ConnectionId, ConnectionRegistry};
use crate::envelope::Envelope;
use crate::state::{AgentState, AgentStore, StatePatch};
use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// An `action` envelope received from a client, published to server-side subscribers.
#[derive(Clone, Debug, Serialize)]
pub struct AgentAction {
    pub connection_id: ConnectionId,
    pub agent_id: String,
    pub data: Map<String, Value>,
}

pub struct Dispatcher {
    registry: Arc<ConnectionRegistry>,
    store: Arc<AgentStore>,
    action_tx: broadcast::Sender<AgentAction>,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        store: Arc<AgentStore>,
        action_capacity: usize,
    ) -> Self {
        let (action_tx, _) = broadcast::channel(action_capacity.max(1));
        Self {
            registry,
            store,
            action_tx,
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn store(&self) -> &Arc<AgentStore> {
        &self.store
    }

    /// Send `envelope` to every open connection except `exclude`.
    ///
    /// Returns the number of connections the frame was queued for.
    pub fn broadcast(&self, envelope: &Envelope, exclude: Option<ConnectionId>) -> usize {
        match encode(envelope) {
            Some(text) => self.broadcast_text(&text, exclude),
            None => 0,
        }
    }

    /// Send `envelope` to the connection bound to `agent_id`.
    ///
    /// Returns `false` when no connection is bound or its socket is not open.
    pub fn send_to_agent(&self, agent_id: &str, envelope: &Envelope) -> bool {
        match encode(envelope) {
            Some(text) => self.send_text_to_agent(agent_id, &text),
            None => false,
        }
    }

    /// Send `envelope` to one specific connection.
    pub fn send_to_connection(&self, connection: &Connection, envelope: &Envelope) -> bool {
        let Some(text) = encode(envelope) else {
            return false;
        };
        if !connection.send(text) {
            warn!(connection_id = %connection.id, msg_type = %envelope.msg_type, "Failed to send to connection");
            return false;
        }
        true
    }

    /// Merge `patch` into the agent's state and publish the full result.
    ///
    /// The `state` envelope is broadcast to everyone and also unicast to the
    /// agent's own connection so it sees the merged canonical value.
    ///
    /// Frames are queued while the agent's store entry is locked, so every
    /// connection sees one agent's updates in the order they were committed.
    pub fn update_agent_state(&self, agent_id: &str, patch: &StatePatch) -> AgentState {
        self.store
            .update_with(agent_id, patch, |state| self.publish_state(agent_id, state))
    }

    /// Replace the agent's state with defaults merged with `patch`, then publish it.
    pub fn reset_agent_state(&self, agent_id: &str, patch: &StatePatch) -> AgentState {
        self.store
            .reset_with(agent_id, patch, |state| self.publish_state(agent_id, state))
    }

    /// Tear down a connection: unregister it, drop its agent's state and
    /// announce the disconnect to everyone else.
    ///
    /// Safe to call more than once; the cascade runs only the first time.
    pub fn disconnect(&self, id: &ConnectionId) -> Option<String> {
        let agent_id = self.registry.unregister(id)?;

        let _ = self.store.remove(&agent_id);
        let notified = self.broadcast(&Envelope::agent_disconnected(agent_id.as_str()), None);
        info!(connection_id = %id, agent_id = %agent_id, notified, "Agent disconnected");

        Some(agent_id)
    }

    /// Subscribe to `action` envelopes received from clients.
    pub fn subscribe_actions(&self) -> broadcast::Receiver<AgentAction> {
        self.action_tx.subscribe()
    }

    pub(crate) fn publish_action(&self, action: AgentAction) {
        // No subscribers is fine
        let _ = self.action_tx.send(action);
    }

    fn publish_state(&self, agent_id: &str, state: &AgentState) {
        let Some(text) = encode(&Envelope::state(agent_id, state)) else {
            return;
        };
        let recipients = self.broadcast_text(&text, None);
        let echoed = self.send_text_to_agent(agent_id, &text);
        debug!(agent_id = %agent_id, recipients, echoed, "Published agent state");
    }

    fn broadcast_text(&self, text: &Arc<str>, exclude: Option<ConnectionId>) -> usize {
        let mut delivered = 0;
        for conn in self.registry.snapshot() {
            if Some(conn.id) == exclude || !conn.is_open() {
                continue;
            }
            if conn.send(Arc::clone(text)) {
                delivered += 1;
            } else {
                warn!(connection_id = %conn.id, dropped = conn.dropped_frames(), "Failed to send broadcast to client");
            }
        }
        delivered
    }

    fn send_text_to_agent(&self, agent_id: &str, text: &Arc<str>) -> bool {
        let Some(conn) = self.registry.connection_for_agent(agent_id) else {
            debug!(agent_id = %agent_id, "No connection bound to agent");
            return false;
        };
        if !conn.is_open() {
            return false;
        }
        if !conn.send(Arc::clone(text)) {
            warn!(connection_id = %conn.id, agent_id = %agent_id, "Failed to send to agent");
            return false;
        }
        true
    }
}

fn encode(envelope: &Envelope) -> Option<Arc<str>> {
    match envelope.to_json() {
        Ok(json) => Some(Arc::from(json)),
        Err(e) => {
            warn!(msg_type = %envelope.msg_type, error = %e, "Failed to serialize envelope");
            None
        }
    }
}

#[cfg(test)]
mod tests;
