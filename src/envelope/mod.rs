use crate::error::StateError;
use crate::state::{AgentState, StatePatch};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

mod validation;

pub use validation::{validate, ValidationError, ValidationReport};

/// Closed set of envelope types carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    State,
    Action,
    Reset,
    Info,
    Error,
    Connection,
}

impl MessageType {
    pub const ALL: [MessageType; 6] = [
        MessageType::State,
        MessageType::Action,
        MessageType::Reset,
        MessageType::Info,
        MessageType::Error,
        MessageType::Connection,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::State => "state",
            MessageType::Action => "action",
            MessageType::Reset => "reset",
            MessageType::Info => "info",
            MessageType::Error => "error",
            MessageType::Connection => "connection",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == value)
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Envelope is the single frame exchanged over a sync connection.
///
/// Every text frame is exactly one envelope:
/// `{ "type": <enum>, "agentId": <string>, "data": <object> }`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub msg_type: MessageType,

    /// Agent this envelope concerns (may be empty for server notices)
    #[serde(rename = "agentId")]
    pub agent_id: String,

    /// Type-specific payload
    pub data: Map<String, Value>,
}

impl Envelope {
    pub fn new(msg_type: MessageType, agent_id: impl Into<String>, data: Map<String, Value>) -> Self {
        Self {
            msg_type,
            agent_id: agent_id.into(),
            data,
        }
    }

    /// Full-state envelope for an agent.
    pub fn state(agent_id: impl Into<String>, state: &AgentState) -> Self {
        Self::new(MessageType::State, agent_id, state.to_map())
    }

    /// Error envelope: `data = { error }`.
    pub fn error(agent_id: impl Into<String>, message: impl Into<String>) -> Self {
        let mut data = Map::new();
        data.insert("error".to_string(), Value::String(message.into()));
        Self::new(MessageType::Error, agent_id, data)
    }

    /// Error envelope answering a rejected inbound frame.
    ///
    /// `data.error` joins every violation; `data.details` lists them individually.
    pub fn rejection(agent_id: impl Into<String>, report: &ValidationReport) -> Self {
        let details: Vec<Value> = report
            .errors
            .iter()
            .map(|e| Value::String(e.to_string()))
            .collect();
        let mut envelope = Self::error(agent_id, report.message());
        envelope
            .data
            .insert("details".to_string(), Value::Array(details));
        envelope
    }

    /// Info envelope announcing that an agent's connection went away.
    pub fn agent_disconnected(agent_id: impl Into<String>) -> Self {
        let agent_id = agent_id.into();
        let mut data = Map::new();
        data.insert(
            "agentDisconnected".to_string(),
            Value::String(agent_id.clone()),
        );
        Self::new(MessageType::Info, agent_id, data)
    }

    /// Connection notice sent to a freshly accepted socket.
    pub fn connected(connection_id: &str) -> Self {
        let mut data = Map::new();
        data.insert(
            "connectionId".to_string(),
            Value::String(connection_id.to_string()),
        );
        data.insert("status".to_string(), Value::String("connected".to_string()));
        Self::new(MessageType::Connection, "", data)
    }

    /// Validate a raw JSON value and convert it into an envelope.
    ///
    /// Returns the full validation report when the value does not conform.
    pub fn from_value(raw: Value) -> Result<Self, ValidationReport> {
        let report = validate(&raw);
        if !report.valid {
            return Err(report);
        }
        serde_json::from_value(raw).map_err(|e| ValidationReport::single(ValidationError::Malformed(e.to_string())))
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// The `agentDisconnected` id carried by an `info` envelope, if any.
    pub fn disconnected_agent(&self) -> Option<&str> {
        if self.msg_type != MessageType::Info {
            return None;
        }
        self.data.get("agentDisconnected").and_then(|v| v.as_str())
    }
}

/// Informational payloads.
#[derive(Clone, Debug, PartialEq)]
pub enum Info {
    /// The named agent's connection is gone and its state was dropped
    AgentDisconnected(String),
    /// Free-form informational message
    Notice(Map<String, Value>),
}

/// Typed view of an envelope, keyed by message type.
#[derive(Clone, Debug, PartialEq)]
pub enum Message {
    State { agent_id: String, patch: StatePatch },
    Action { agent_id: String, data: Map<String, Value> },
    Reset { agent_id: String, patch: StatePatch },
    Info { agent_id: String, info: Info },
    Error { agent_id: String, error: String },
    Connection { agent_id: String, data: Map<String, Value> },
}

impl Message {
    pub fn agent_id(&self) -> &str {
        match self {
            Message::State { agent_id, .. }
            | Message::Action { agent_id, .. }
            | Message::Reset { agent_id, .. }
            | Message::Info { agent_id, .. }
            | Message::Error { agent_id, .. }
            | Message::Connection { agent_id, .. } => agent_id,
        }
    }

    pub fn msg_type(&self) -> MessageType {
        match self {
            Message::State { .. } => MessageType::State,
            Message::Action { .. } => MessageType::Action,
            Message::Reset { .. } => MessageType::Reset,
            Message::Info { .. } => MessageType::Info,
            Message::Error { .. } => MessageType::Error,
            Message::Connection { .. } => MessageType::Connection,
        }
    }
}

impl TryFrom<Envelope> for Message {
    type Error = StateError;

    fn try_from(envelope: Envelope) -> Result<Self, StateError> {
        let Envelope {
            msg_type,
            agent_id,
            data,
        } = envelope;

        let message = match msg_type {
            MessageType::State => Message::State {
                agent_id,
                patch: StatePatch::from_map(&data)?,
            },
            MessageType::Reset => Message::Reset {
                agent_id,
                patch: StatePatch::from_map(&data)?,
            },
            MessageType::Action => Message::Action { agent_id, data },
            MessageType::Info => {
                let info = match data.get("agentDisconnected").and_then(|v| v.as_str()) {
                    Some(gone) => Info::AgentDisconnected(gone.to_string()),
                    None => Info::Notice(data),
                };
                Message::Info { agent_id, info }
            }
            MessageType::Error => {
                // Servers send { error: "..." }; anything else is kept as its JSON text
                let error = match data.get("error") {
                    Some(Value::String(s)) => s.clone(),
                    _ => Value::Object(data).to_string(),
                };
                Message::Error { agent_id, error }
            }
            MessageType::Connection => Message::Connection { agent_id, data },
        };

        Ok(message)
    }
}

impl From<Message> for Envelope {
    fn from(message: Message) -> Self {
        match message {
            Message::State { agent_id, patch } => {
                Envelope::new(MessageType::State, agent_id, patch.to_map())
            }
            Message::Reset { agent_id, patch } => {
                Envelope::new(MessageType::Reset, agent_id, patch.to_map())
            }
            Message::Action { agent_id, data } => Envelope::new(MessageType::Action, agent_id, data),
            Message::Info { agent_id, info } => match info {
                Info::AgentDisconnected(gone) => {
                    let mut envelope = Envelope::agent_disconnected(gone);
                    envelope.agent_id = agent_id;
                    envelope
                }
                Info::Notice(data) => Envelope::new(MessageType::Info, agent_id, data),
            },
            Message::Error { agent_id, error } => Envelope::error(agent_id, error),
            Message::Connection { agent_id, data } => {
                Envelope::new(MessageType::Connection, agent_id, data)
            }
        }
    }
}
