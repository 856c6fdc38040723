use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::agent::state::{AgentState, StateMap};
use crate::bus::{AgentResponse, BroadcastDelivery, Message, MessageBus, MessageType};
use crate::error::{Result, agent_error::AgentError};

/// Behavior every agent in the runtime satisfies.
///
/// Concrete agents are constructed through an async `spawn(bus, options)`
/// associated function that registers with the bus before returning: an
/// agent cannot exist without being known to the bus.
#[async_trait]
pub trait Agent: Send + Sync {
    /// Shared plumbing; identity, bus access and state live here.
    fn core(&self) -> &AgentCore;

    fn name(&self) -> &str {
        self.core().name()
    }

    fn version(&self) -> &str {
        self.core().version()
    }

    /// Agents that must be initialized before this one's `initialize` runs.
    fn dependencies(&self) -> &[String] {
        self.core().dependencies()
    }

    fn is_initialized(&self) -> bool {
        self.core().is_initialized()
    }

    /// Verify dependencies, subscribe to message types, mark initialized.
    /// Idempotent: a second call while initialized is a no-op.
    async fn initialize(&self) -> Result<()>;

    /// Per-agent router for directed sends and broadcast delivery. An
    /// unhandled type yields a failure response, never an error; agents
    /// routinely receive broadcasts they do not care about.
    async fn handle_message(&self, message: &Message) -> Result<AgentResponse>;

    /// Unregister from the bus and drop all subscriptions. The instance is
    /// inert afterwards; resuming service requires a new instance.
    async fn destroy(&self) -> Result<()> {
        self.core().teardown().await
    }

    /// Snapshot for monitoring and debugging.
    async fn status_report(&self) -> serde_json::Value {
        serde_json::json!({
            "name": self.name(),
            "version": self.version(),
            "initialized": self.is_initialized(),
            "state": self.core().state_snapshot().await,
        })
    }
}

/// Construction options accepted by every concrete agent.
#[derive(Debug, Clone, Default)]
pub struct AgentOptions {
    /// Override the agent's canonical name
    pub name: Option<String>,
    /// Seed entries merged over the agent's initial state
    pub initial_state: StateMap,
}

/// Common plumbing embedded in every concrete agent.
pub struct AgentCore {
    name: String,
    version: String,
    dependencies: Vec<String>,
    bus: Arc<MessageBus>,
    initialized: AtomicBool,
    state: Arc<AgentState>,
}

impl AgentCore {
    pub fn new(
        name: impl Into<String>,
        version: impl Into<String>,
        dependencies: Vec<String>,
        bus: Arc<MessageBus>,
        initial_state: StateMap,
    ) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            dependencies,
            bus,
            initialized: AtomicBool::new(false),
            state: Arc::new(AgentState::new(initial_state)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn dependencies(&self) -> &[String] {
        &self.dependencies
    }

    pub fn bus(&self) -> &Arc<MessageBus> {
        &self.bus
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    /// Idempotence gate plus dependency verification. Returns `false` when
    /// already initialized (the caller should no-op), `true` when the agent
    /// may proceed with its own initialization.
    pub async fn begin_initialize(&self) -> Result<bool> {
        if self.is_initialized() {
            debug!("Agent {} already initialized", self.name);
            return Ok(false);
        }
        self.ensure_dependencies().await?;
        Ok(true)
    }

    /// Flip both the local flag and the bus registry flag. Call only after
    /// subscriptions and any setup work succeeded.
    pub async fn finish_initialize(&self) -> Result<()> {
        self.bus.set_initialized(&self.name, true).await?;
        self.initialized.store(true, Ordering::SeqCst);
        info!("Agent {} initialized", self.name);
        Ok(())
    }

    /// Dependencies must be initialized, not merely registered: every agent
    /// registers at construction, long before its own `initialize` ran.
    async fn ensure_dependencies(&self) -> Result<()> {
        for dependency in &self.dependencies {
            if !self.bus.is_agent_registered(dependency).await {
                return Err(AgentError::MissingDependency {
                    agent: self.name.clone(),
                    dependency: dependency.clone(),
                }
                .into());
            }
            if !self.bus.is_agent_initialized(dependency).await {
                return Err(AgentError::DependencyNotReady {
                    agent: self.name.clone(),
                    dependency: dependency.clone(),
                }
                .into());
            }
        }
        Ok(())
    }

    /// Directed send stamped with this agent's name.
    pub async fn send(
        &self,
        to: &str,
        message_type: MessageType,
        payload: serde_json::Value,
    ) -> Result<AgentResponse> {
        self.bus
            .send(Message::new(&self.name, Some(to), message_type, payload))
            .await
    }

    /// Broadcast stamped with this agent's name.
    pub async fn broadcast(
        &self,
        message_type: MessageType,
        payload: serde_json::Value,
    ) -> Result<Vec<BroadcastDelivery>> {
        self.bus
            .broadcast(Message::broadcast(&self.name, message_type, payload))
            .await
    }

    /// Subscribe to a message type on behalf of this agent.
    pub async fn subscribe<F>(&self, message_type: MessageType, handler: F) -> Result<()>
    where
        F: Fn(Message) -> BoxFuture<'static, Result<AgentResponse>> + Send + Sync + 'static,
    {
        self.bus.subscribe(&self.name, message_type, handler).await
    }

    /// The only sanctioned state mutation path: shallow-merge and notify
    /// observers. Returns the resulting snapshot.
    pub async fn set_state(&self, patch: StateMap) -> StateMap {
        self.state.merge(patch).await
    }

    pub async fn state_snapshot(&self) -> StateMap {
        self.state.snapshot().await
    }

    pub async fn state_value(&self, key: &str) -> Option<serde_json::Value> {
        self.state.get(key).await
    }

    pub fn observe_state(&self) -> watch::Receiver<StateMap> {
        self.state.observe()
    }

    /// Owning handle to the state, for subscription closures that outlive
    /// the borrow of `self`.
    pub fn state_handle(&self) -> Arc<AgentState> {
        Arc::clone(&self.state)
    }

    /// Standard answer to a health probe.
    pub fn health_response(&self, message: &Message) -> AgentResponse {
        AgentResponse::ok(
            serde_json::json!({
                "name": self.name,
                "version": self.version,
                "initialized": self.is_initialized(),
            }),
            message.correlation_id.clone(),
        )
    }

    /// Unregister from the bus (dropping all subscriptions) and reset the
    /// initialized flag.
    pub async fn teardown(&self) -> Result<()> {
        self.bus.unregister_agent(&self.name).await;
        self.initialized.store(false, Ordering::SeqCst);
        info!("Agent {} destroyed", self.name);
        Ok(())
    }
}
