//! Process-local agent runtime for the fitness/social application.
//!
//! Application behavior is decomposed into independently-initialized agents
//! that communicate exclusively through typed messages routed by a central
//! [`MessageBus`]; the [`AgentManager`] owns the bus, brings agents up in
//! dependency order, and runs the periodic health sweep. Delivery is a
//! direct awaited call chain on one cooperative runtime; there is no
//! mailbox and no cross-thread parallelism of handlers.

pub mod agent;
pub mod agents;
pub mod bus;
pub mod error;
pub mod manager;
pub mod telemetry;

pub use agent::{Agent, AgentCore, AgentOptions, AgentState, StateMap};
pub use bus::{
    AgentResponse, BroadcastDelivery, BusConfig, BusEvent, BusStats, HistoryFilter, Message,
    MessageBus, MessageType, SYSTEM_SENDER,
};
pub use error::{Error, Result, agent_error::AgentError};
pub use manager::{AgentDefinition, AgentManager, FaultSink, ManagerConfig, ManagerState};
