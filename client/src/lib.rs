//! Client side of the agent sync protocol.
//!
//! [`ConnectionManager`] keeps one WebSocket open to a sync server, mirrors
//! agent state locally with the same merge rules the server uses, and
//! reconnects after unexpected drops with a bounded number of attempts.

pub mod config;
pub mod error;
pub mod manager;
pub mod timer;

pub use config::ClientConfig;
pub use error::ClientError;
pub use manager::{ClientEvent, ConnectionManager, ConnectionState};
pub use timer::ReconnectTimer;
