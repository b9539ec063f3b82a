// Agent state model and canonical store

mod agent;
mod store;

pub use agent::{AgentRemoved, AgentState, StateChange, StatePatch, Vec3};
pub use store::AgentStore;
