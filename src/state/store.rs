use crate::state::agent::{AgentRemoved, AgentState, StateChange, StatePatch};
use chrono::Utc;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info};

/// Canonical map from agent id to last known state.
///
/// Every mutation holds the agent's shard lock for the whole read-merge-write,
/// so no reader ever observes a half-applied patch.
pub struct AgentStore {
    /// Lock-free concurrent map for fast reads
    pub(crate) agents: Arc<DashMap<String, AgentState>>,

    /// Broadcast channel for state change events
    state_tx: broadcast::Sender<StateChange>,

    /// Broadcast channel for agent removal events
    removal_tx: broadcast::Sender<AgentRemoved>,
}

impl AgentStore {
    /// Create new store with broadcast channels
    pub fn new() -> Self {
        let (state_tx, _) = broadcast::channel(1000);
        let (removal_tx, _) = broadcast::channel(100);

        Self {
            agents: Arc::new(DashMap::new()),
            state_tx,
            removal_tx,
        }
    }

    /// Get agent state by id
    pub fn get(&self, agent_id: &str) -> Option<AgentState> {
        self.agents.get(agent_id).map(|s| s.clone())
    }

    /// Merge `patch` into the stored state (or the default state) and return the result
    pub fn update(&self, agent_id: &str, patch: &StatePatch) -> AgentState {
        self.update_with(agent_id, patch, |_| {})
    }

    /// Like [`update`](Self::update), but runs `publish` on the merged state
    /// while the agent's entry is still locked.
    ///
    /// Concurrent updates to one agent therefore publish in commit order.
    /// `publish` must not touch this store.
    pub fn update_with<F>(&self, agent_id: &str, patch: &StatePatch, publish: F) -> AgentState
    where
        F: FnOnce(&AgentState),
    {
        let mut entry = self.agents.entry(agent_id.to_string()).or_default();
        entry.apply(patch);
        publish(entry.value());
        self.notify(agent_id, entry.value());

        debug!(agent_id = %agent_id, "Agent state updated");
        entry.value().clone()
    }

    /// Replace the stored state with defaults merged with `patch`.
    ///
    /// Custom fields from the previous state are discarded.
    pub fn reset(&self, agent_id: &str, patch: &StatePatch) -> AgentState {
        self.reset_with(agent_id, patch, |_| {})
    }

    /// Reset counterpart of [`update_with`](Self::update_with).
    pub fn reset_with<F>(&self, agent_id: &str, patch: &StatePatch, publish: F) -> AgentState
    where
        F: FnOnce(&AgentState),
    {
        let mut entry = self.agents.entry(agent_id.to_string()).or_default();
        *entry = AgentState::default().merged(patch);
        publish(entry.value());
        self.notify(agent_id, entry.value());

        info!(agent_id = %agent_id, "Agent state reset");
        entry.value().clone()
    }

    /// Delete agent from state
    pub fn remove(&self, agent_id: &str) -> Option<AgentState> {
        let removed = self.agents.remove(agent_id).map(|(_, state)| state);

        if removed.is_some() {
            let _ = self.removal_tx.send(AgentRemoved {
                agent_id: agent_id.to_string(),
                timestamp: Utc::now(),
            });
            info!(agent_id = %agent_id, "Agent state removed");
        }

        removed
    }

    /// Get all agents
    pub fn all(&self) -> Vec<(String, AgentState)> {
        self.agents
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    pub fn contains(&self, agent_id: &str) -> bool {
        self.agents.contains_key(agent_id)
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    /// Drop every agent without emitting removal events
    pub fn clear(&self) {
        self.agents.clear();
    }

    /// Subscribe to state updates
    pub fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.state_tx.subscribe()
    }

    /// Subscribe to agent removal events
    pub fn subscribe_removals(&self) -> broadcast::Receiver<AgentRemoved> {
        self.removal_tx.subscribe()
    }

    fn notify(&self, agent_id: &str, state: &AgentState) {
        // No subscribers is fine
        let _ = self.state_tx.send(StateChange {
            agent_id: agent_id.to_string(),
            state: state.clone(),
            timestamp: Utc::now(),
        });
    }
}

impl Default for AgentStore {
    fn default() -> Self {
        Self::new()
    }
}
