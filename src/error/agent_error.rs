#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("duplicate agent name: {0}")]
    DuplicateAgent(String),

    #[error("agent not found: {0}")]
    AgentNotFound(String),

    #[error("unknown sender: {0}")]
    UnknownSender(String),

    #[error("unknown recipient: {0}")]
    UnknownRecipient(String),

    #[error("agent {agent} requires dependency {dependency} which is not registered")]
    MissingDependency { agent: String, dependency: String },

    #[error("agent {agent} requires dependency {dependency} which is not initialized")]
    DependencyNotReady { agent: String, dependency: String },

    #[error("agent {agent} declares dependency {dependency} which is not part of the roster")]
    UnknownDependency { agent: String, dependency: String },

    #[error("dependency cycle among agents: {0}")]
    DependencyCycle(String),

    #[error("definition {expected} produced an agent named {actual}")]
    DefinitionMismatch { expected: String, actual: String },

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("handler of agent {agent} failed: {reason}")]
    HandlerFailure { agent: String, reason: String },

    #[error("health check timed out for agent {0}")]
    HealthCheckTimeout(String),

    #[error("agent system is not ready for {0}")]
    NotReady(&'static str),

    #[error("agent {agent} failed to shut down: {reason}")]
    ShutdownError { agent: String, reason: String },

    #[error(transparent)]
    Serde(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
