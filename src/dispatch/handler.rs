use super::{AgentAction, Dispatcher};
use crate::connection::Connection;
use crate::envelope::{Envelope, Info, Message};
use crate::state::AgentState;
use serde_json::Value;
use tracing::{debug, warn};

/// What happened to one inbound text frame.
#[derive(Debug, Clone, PartialEq)]
pub enum HandleOutcome {
    /// The frame was answered with an `error` envelope; nothing was mutated.
    Rejected,
    /// A `state` or `reset` was applied; carries the resulting full state.
    StateApplied(AgentState),
    /// The envelope was relayed to this many other connections.
    Relayed(usize),
    /// The connection is closing or already unregistered; the frame was dropped.
    Ignored,
}

/// Process one inbound text frame from `connection`.
pub fn handle_text(dispatcher: &Dispatcher, connection: &Connection, text: &str) -> HandleOutcome {
    // An evicted connection must not resurrect its agent
    if connection.is_closing() || dispatcher.registry().get(&connection.id).is_none() {
        debug!(connection_id = %connection.id, "Dropping frame from closing connection");
        return HandleOutcome::Ignored;
    }
    connection.touch();

    let raw: Value = match serde_json::from_str(text) {
        Ok(raw) => raw,
        Err(e) => {
            debug!(connection_id = %connection.id, error = %e, "Invalid JSON frame");
            reject(dispatcher, connection, Envelope::error("", format!("invalid JSON: {}", e)));
            return HandleOutcome::Rejected;
        }
    };

    let sender_agent = raw
        .get("agentId")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let envelope = match Envelope::from_value(raw) {
        Ok(envelope) => envelope,
        Err(report) => {
            debug!(connection_id = %connection.id, errors = %report.message(), "Envelope rejected");
            reject(dispatcher, connection, Envelope::rejection(sender_agent, &report));
            return HandleOutcome::Rejected;
        }
    };

    let message = match Message::try_from(envelope.clone()) {
        Ok(message) => message,
        Err(e) => {
            reject(dispatcher, connection, Envelope::error(sender_agent, e.to_string()));
            return HandleOutcome::Rejected;
        }
    };

    if let Message::Info {
        info: Info::AgentDisconnected(_),
        ..
    } = &message
    {
        warn!(connection_id = %connection.id, "Client sent a disconnect notice");
        reject(
            dispatcher,
            connection,
            Envelope::error(sender_agent, "agentDisconnected notices are sent by the server only"),
        );
        return HandleOutcome::Rejected;
    }

    if !envelope.agent_id.is_empty() {
        dispatcher
            .registry()
            .bind_agent(&connection.id, &envelope.agent_id);
    }

    match message {
        Message::State { agent_id, .. } | Message::Reset { agent_id, .. } if agent_id.is_empty() => {
            reject(
                dispatcher,
                connection,
                Envelope::error("", format!("{} requires a non-empty agentId", envelope.msg_type)),
            );
            HandleOutcome::Rejected
        }
        Message::State { agent_id, patch } => {
            HandleOutcome::StateApplied(dispatcher.update_agent_state(&agent_id, &patch))
        }
        Message::Reset { agent_id, patch } => {
            HandleOutcome::StateApplied(dispatcher.reset_agent_state(&agent_id, &patch))
        }
        Message::Action { agent_id, data } => {
            dispatcher.publish_action(AgentAction {
                connection_id: connection.id,
                agent_id,
                data,
            });
            HandleOutcome::Relayed(dispatcher.broadcast(&envelope, Some(connection.id)))
        }
        _ => HandleOutcome::Relayed(dispatcher.broadcast(&envelope, Some(connection.id))),
    }
}

fn reject(dispatcher: &Dispatcher, connection: &Connection, reply: Envelope) {
    if !dispatcher.send_to_connection(connection, &reply) {
        warn!(connection_id = %connection.id, "Error reply dropped");
    }
}
