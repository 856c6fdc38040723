pub mod agent_manager;

pub use agent_manager::{
    AgentDefinition, AgentFactory, AgentManager, FaultSink, ManagerConfig, ManagerState,
};
