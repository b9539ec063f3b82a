use crate::error::StateError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// `[x, y, z]`
pub type Vec3 = [f64; 3];

/// Last known state of one agent.
///
/// The five named fields always exist; anything else a producer sends is
/// kept in `extra` and round-trips untouched.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentState {
    pub position: Vec3,
    pub rotation: Vec3,
    pub action: String,
    pub reward: f64,
    pub done: bool,

    /// Domain-specific fields (extension point)
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for AgentState {
    fn default() -> Self {
        Self {
            position: [0.0, 0.0, 0.0],
            rotation: [0.0, 0.0, 0.0],
            action: String::new(),
            reward: 0.0,
            done: false,
            extra: Map::new(),
        }
    }
}

impl AgentState {
    /// Shallow merge: fields present in `patch` overwrite, absent fields stay.
    pub fn apply(&mut self, patch: &StatePatch) {
        if let Some(position) = patch.position {
            self.position = position;
        }
        if let Some(rotation) = patch.rotation {
            self.rotation = rotation;
        }
        if let Some(action) = &patch.action {
            self.action = action.clone();
        }
        if let Some(reward) = patch.reward {
            self.reward = reward;
        }
        if let Some(done) = patch.done {
            self.done = done;
        }
        for (key, value) in &patch.extra {
            self.extra.insert(key.clone(), value.clone());
        }
    }

    pub fn merged(mut self, patch: &StatePatch) -> Self {
        self.apply(patch);
        self
    }

    /// Wire form used as the `data` of a `state` envelope.
    pub fn to_map(&self) -> Map<String, Value> {
        let mut map = Map::new();
        // Extension fields first so the named fields always win
        for (key, value) in &self.extra {
            map.insert(key.clone(), value.clone());
        }
        map.insert("position".to_string(), vec3_value(&self.position));
        map.insert("rotation".to_string(), vec3_value(&self.rotation));
        map.insert("action".to_string(), Value::String(self.action.clone()));
        map.insert("reward".to_string(), number_value(self.reward));
        map.insert("done".to_string(), Value::Bool(self.done));
        map
    }
}

/// Partial update for an [`AgentState`].
///
/// `None` means "field absent from the payload", never "clear the field".
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StatePatch {
    pub position: Option<Vec3>,
    pub rotation: Option<Vec3>,
    pub action: Option<String>,
    pub reward: Option<f64>,
    pub done: Option<bool>,
    pub extra: Map<String, Value>,
}

impl StatePatch {
    /// Decode a payload object. Known fields must carry the right shape;
    /// unknown fields go to `extra` as-is.
    pub fn from_map(data: &Map<String, Value>) -> Result<Self, StateError> {
        let mut patch = StatePatch::default();

        for (key, value) in data {
            match key.as_str() {
                "position" => patch.position = Some(parse_vec3(key, value)?),
                "rotation" => patch.rotation = Some(parse_vec3(key, value)?),
                "action" => {
                    let action = value.as_str().ok_or_else(|| invalid(key, "a string"))?;
                    patch.action = Some(action.to_string());
                }
                "reward" => {
                    let reward = value.as_f64().ok_or_else(|| invalid(key, "a number"))?;
                    patch.reward = Some(reward);
                }
                "done" => {
                    let done = value.as_bool().ok_or_else(|| invalid(key, "a boolean"))?;
                    patch.done = Some(done);
                }
                _ => {
                    patch.extra.insert(key.clone(), value.clone());
                }
            }
        }

        Ok(patch)
    }

    pub fn to_map(&self) -> Map<String, Value> {
        let mut map = self.extra.clone();
        if let Some(position) = &self.position {
            map.insert("position".to_string(), vec3_value(position));
        }
        if let Some(rotation) = &self.rotation {
            map.insert("rotation".to_string(), vec3_value(rotation));
        }
        if let Some(action) = &self.action {
            map.insert("action".to_string(), Value::String(action.clone()));
        }
        if let Some(reward) = self.reward {
            map.insert("reward".to_string(), number_value(reward));
        }
        if let Some(done) = self.done {
            map.insert("done".to_string(), Value::Bool(done));
        }
        map
    }

    pub fn is_empty(&self) -> bool {
        self.position.is_none()
            && self.rotation.is_none()
            && self.action.is_none()
            && self.reward.is_none()
            && self.done.is_none()
            && self.extra.is_empty()
    }
}

impl From<&AgentState> for StatePatch {
    fn from(state: &AgentState) -> Self {
        Self {
            position: Some(state.position),
            rotation: Some(state.rotation),
            action: Some(state.action.clone()),
            reward: Some(state.reward),
            done: Some(state.done),
            extra: state.extra.clone(),
        }
    }
}

/// State change broadcast to store subscribers
#[derive(Clone, Debug, Serialize)]
pub struct StateChange {
    pub agent_id: String,
    pub state: AgentState,
    pub timestamp: DateTime<Utc>,
}

/// Agent removal broadcast to store subscribers
#[derive(Clone, Debug, Serialize)]
pub struct AgentRemoved {
    pub agent_id: String,
    pub timestamp: DateTime<Utc>,
}

fn invalid(field: &str, expected: &'static str) -> StateError {
    StateError::InvalidField {
        field: field.to_string(),
        expected,
    }
}

fn parse_vec3(field: &str, value: &Value) -> Result<Vec3, StateError> {
    let expected = "an array of 3 numbers";
    let items = value.as_array().ok_or_else(|| invalid(field, expected))?;
    match items.as_slice() {
        [x, y, z] => {
            let x = x.as_f64().ok_or_else(|| invalid(field, expected))?;
            let y = y.as_f64().ok_or_else(|| invalid(field, expected))?;
            let z = z.as_f64().ok_or_else(|| invalid(field, expected))?;
            Ok([x, y, z])
        }
        _ => Err(invalid(field, expected)),
    }
}

fn vec3_value(v: &Vec3) -> Value {
    Value::Array(v.iter().map(|c| number_value(*c)).collect())
}

// Non-finite floats have no JSON form
fn number_value(n: f64) -> Value {
    serde_json::Number::from_f64(n)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}
