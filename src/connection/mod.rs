// Connection registry: live connections and their agent bindings

mod handle;

pub use handle::{Connection, ConnectionId, Outbound, CLOSE_GOING_AWAY, CLOSE_NORMAL};

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

/// Tracks every live connection.
pub struct ConnectionRegistry {
    /// Primary storage: connection_id -> Connection
    connections: DashMap<ConnectionId, Arc<Connection>>,
    /// Secondary index: agent_id -> connection_id (for unicast)
    agents: DashMap<String, ConnectionId>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
            agents: DashMap::new(),
        }
    }

    /// Register a new connection writing to `tx`.
    ///
    /// The record gets a fresh id, the current timestamp and no agent binding.
    pub fn register(&self, tx: mpsc::Sender<Outbound>) -> Arc<Connection> {
        let connection = Arc::new(Connection::new(Uuid::now_v7(), tx));
        self.connections
            .insert(connection.id, Arc::clone(&connection));
        debug!(connection_id = %connection.id, "Connection registered");
        connection
    }

    pub fn get(&self, id: &ConnectionId) -> Option<Arc<Connection>> {
        self.connections.get(id).map(|c| Arc::clone(c.value()))
    }

    /// Update last activity. Returns `false` for unknown ids.
    pub fn touch(&self, id: &ConnectionId) -> bool {
        match self.connections.get(id) {
            Some(conn) => {
                conn.touch();
                true
            }
            None => false,
        }
    }

    /// Bind a connection to an agent id if it is not bound yet.
    ///
    /// Returns `true` only when this call created the binding. The first
    /// connection to claim an agent id owns the reverse-lookup entry.
    pub fn bind_agent(&self, id: &ConnectionId, agent_id: &str) -> bool {
        let Some(conn) = self.get(id) else {
            return false;
        };
        if !conn.bind_agent(agent_id) {
            return false;
        }

        self.agents.entry(agent_id.to_string()).or_insert(*id);

        // Lost a race with unregister: don't leave a dangling index entry
        if !self.connections.contains_key(id) {
            self.agents.remove_if(agent_id, |_, owner| owner == id);
            return false;
        }

        info!(connection_id = %id, agent_id = %agent_id, "Connection bound to agent");
        true
    }

    /// Remove a connection. Returns its bound agent id, if any.
    ///
    /// Only the first call for a given id returns `Some`, so callers can
    /// cascade cleanup exactly once.
    pub fn unregister(&self, id: &ConnectionId) -> Option<String> {
        let (_, conn) = self.connections.remove(id)?;
        debug!(connection_id = %id, "Connection unregistered");

        let agent_id = conn.agent_id()?.to_string();

        if self
            .agents
            .remove_if(&agent_id, |_, owner| owner == id)
            .is_some()
        {
            // Hand the index to another connection claiming the same agent
            if let Some(other) = self
                .connections
                .iter()
                .find(|c| c.agent_id() == Some(agent_id.as_str()))
            {
                self.agents.insert(agent_id.clone(), other.id);
            }
        }

        Some(agent_id)
    }

    /// Reverse lookup for unicast targeting.
    pub fn find_by_agent(&self, agent_id: &str) -> Option<ConnectionId> {
        self.agents.get(agent_id).map(|id| *id.value())
    }

    pub fn connection_for_agent(&self, agent_id: &str) -> Option<Arc<Connection>> {
        self.find_by_agent(agent_id).and_then(|id| self.get(&id))
    }

    /// Point-in-time copy of all connections.
    pub fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.connections
            .iter()
            .map(|c| Arc::clone(c.value()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Remove everything and hand back the removed connections.
    pub fn drain(&self) -> Vec<Arc<Connection>> {
        let drained = self.snapshot();
        self.connections.clear();
        self.agents.clear();
        drained
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
