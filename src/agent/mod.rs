pub mod base_agent;
pub mod state;

pub use base_agent::{Agent, AgentCore, AgentOptions};
pub use state::{AgentState, StateMap};
