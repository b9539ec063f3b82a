use super::MessageType;
use serde_json::Value;
use std::fmt;

/// Envelope validation failures
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationError {
    NotAnObject,
    MissingField(&'static str),
    InvalidType(String),
    AgentIdNotString,
    DataNotObject,
    InvalidVector(&'static str),
    /// Shape passed validation but could not be decoded
    Malformed(String),
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationError::NotAnObject => write!(f, "message must be an object"),
            ValidationError::MissingField(field) => write!(f, "message missing '{}' field", field),
            ValidationError::InvalidType(t) => {
                let allowed: Vec<&str> = MessageType::ALL.iter().map(|t| t.as_str()).collect();
                write!(
                    f,
                    "invalid message type: {}. Must be one of: {}",
                    t,
                    allowed.join(", ")
                )
            }
            ValidationError::AgentIdNotString => write!(f, "agentId must be a string"),
            ValidationError::DataNotObject => write!(f, "data must be an object"),
            ValidationError::InvalidVector(field) => {
                write!(f, "{} must be an array of 3 numbers", field)
            }
            ValidationError::Malformed(reason) => write!(f, "malformed envelope: {}", reason),
        }
    }
}

impl std::error::Error for ValidationError {}

/// Outcome of validating one inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationReport {
    pub valid: bool,
    pub errors: Vec<ValidationError>,
}

impl ValidationReport {
    fn from_errors(errors: Vec<ValidationError>) -> Self {
        Self {
            valid: errors.is_empty(),
            errors,
        }
    }

    pub(crate) fn single(error: ValidationError) -> Self {
        Self::from_errors(vec![error])
    }

    /// All violations joined into one line.
    pub fn message(&self) -> String {
        self.errors
            .iter()
            .map(|e| e.to_string())
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Validates the shape of a raw inbound envelope.
///
/// Validation rules:
/// - The frame must be a JSON object
/// - Required fields: type, agentId, data
/// - type: one of state, action, reset, info, error, connection
/// - agentId: string
/// - data: object (arrays are rejected)
/// - For `state`: position/rotation, when present, are arrays of exactly 3 numbers
///
/// Never fails; every violation found is collected into the report.
pub fn validate(raw: &Value) -> ValidationReport {
    let message = match raw.as_object() {
        Some(obj) => obj,
        None => return ValidationReport::single(ValidationError::NotAnObject),
    };

    let mut errors = Vec::new();

    let msg_type = message.get("type");
    let agent_id = message.get("agentId");
    let data = message.get("data");

    if msg_type.is_none() {
        errors.push(ValidationError::MissingField("type"));
    }
    if agent_id.is_none() {
        errors.push(ValidationError::MissingField("agentId"));
    }
    if data.is_none() {
        errors.push(ValidationError::MissingField("data"));
    }

    let parsed_type = match msg_type {
        Some(Value::String(s)) => match MessageType::parse(s) {
            Some(t) => Some(t),
            None => {
                errors.push(ValidationError::InvalidType(s.clone()));
                None
            }
        },
        Some(other) => {
            errors.push(ValidationError::InvalidType(other.to_string()));
            None
        }
        None => None,
    };

    if let Some(id) = agent_id {
        if !id.is_string() {
            errors.push(ValidationError::AgentIdNotString);
        }
    }

    let data = match data {
        Some(Value::Object(map)) => Some(map),
        Some(_) => {
            errors.push(ValidationError::DataNotObject);
            None
        }
        None => None,
    };

    if let (Some(MessageType::State), Some(data)) = (parsed_type, data) {
        if let Some(position) = data.get("position") {
            if !is_vec3(position) {
                errors.push(ValidationError::InvalidVector("position"));
            }
        }
        if let Some(rotation) = data.get("rotation") {
            if !is_vec3(rotation) {
                errors.push(ValidationError::InvalidVector("rotation"));
            }
        }
    }

    ValidationReport::from_errors(errors)
}

/// Checks for an `[x, y, z]` numeric array.
pub(crate) fn is_vec3(value: &Value) -> bool {
    match value.as_array() {
        Some(items) => items.len() == 3 && items.iter().all(|v| v.is_number()),
        None => false,
    }
}
