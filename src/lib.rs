// Wire envelope model and validation
pub mod envelope;

// Agent state model and canonical store
pub mod state;

// Live connections and agent bindings
pub mod connection;

// Fan-out and inbound frame routing
pub mod dispatch;

// Idle eviction
pub mod heartbeat;

// HTTP and WebSocket APIs
pub mod api;

pub mod config;
pub mod error;
pub mod server;

pub use config::SyncConfig;
pub use envelope::{Envelope, Message, MessageType};
pub use error::{ServerError, StateError};
pub use server::SyncServer;
pub use state::{AgentState, AgentStore, StatePatch};
