use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::json;
use tokio::{
    sync::{Mutex, RwLock, mpsc},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};

use crate::agent::Agent;
use crate::bus::{
    AgentResponse, BroadcastDelivery, BusConfig, Message, MessageBus, MessageType, SYSTEM_SENDER,
};
use crate::error::{Result, agent_error::AgentError};

/// Agent manager configuration
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub bus: BusConfig,
    /// Cadence of the periodic health sweep
    pub health_check_interval: Duration,
    /// Per-agent health probe timeout
    pub health_check_timeout: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            bus: BusConfig::default(),
            health_check_interval: Duration::from_secs(30),
            health_check_timeout: Duration::from_secs(5),
        }
    }
}

/// Manager lifecycle state. `Ready` is the only state in which
/// `send_message`/`broadcast`/`restart_agent` are meaningful.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerState {
    Uninitialized,
    Initializing,
    Ready,
    ShuttingDown,
}

/// Async constructor for one agent; must register the agent with the bus
/// before returning.
pub type AgentFactory =
    Arc<dyn Fn(Arc<MessageBus>) -> BoxFuture<'static, Result<Arc<dyn Agent>>> + Send + Sync>;

/// Roster entry: a name plus the factory that builds (and rebuilds, on
/// restart) the agent of that name.
#[derive(Clone)]
pub struct AgentDefinition {
    name: String,
    factory: AgentFactory,
}

impl AgentDefinition {
    pub fn new<F, Fut>(name: impl Into<String>, factory: F) -> Self
    where
        F: Fn(Arc<MessageBus>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Arc<dyn Agent>>> + Send + 'static,
    {
        Self {
            name: name.into(),
            factory: Arc::new(move |bus| Box::pin(factory(bus))),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

struct Fault {
    source: String,
    detail: String,
}

/// Handle for background tasks to report otherwise-unobserved failures.
/// Reports are re-broadcast as `SystemError` so agents can react.
#[derive(Clone)]
pub struct FaultSink {
    tx: Option<mpsc::UnboundedSender<Fault>>,
}

impl FaultSink {
    pub fn report(&self, source: impl Into<String>, detail: impl Into<String>) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(Fault {
                source: source.into(),
                detail: detail.into(),
            });
        }
    }
}

/// System-wide lifecycle orchestrator and the only entry point application
/// code should use for sending and broadcasting.
///
/// There is no shared global instance: construct one and pass it around.
pub struct AgentManager {
    bus: Arc<MessageBus>,
    definitions: Vec<AgentDefinition>,
    instances: RwLock<HashMap<String, Arc<dyn Agent>>>,
    startup_order: RwLock<Vec<String>>,
    state: RwLock<ManagerState>,
    config: ManagerConfig,
    sweep_handle: Mutex<Option<JoinHandle<()>>>,
    fault_handle: Mutex<Option<JoinHandle<()>>>,
    fault_tx: Mutex<Option<mpsc::UnboundedSender<Fault>>>,
}

impl AgentManager {
    pub fn new(config: ManagerConfig) -> Self {
        Self {
            bus: Arc::new(MessageBus::new(config.bus.clone())),
            definitions: Vec::new(),
            instances: RwLock::new(HashMap::new()),
            startup_order: RwLock::new(Vec::new()),
            state: RwLock::new(ManagerState::Uninitialized),
            config,
            sweep_handle: Mutex::new(None),
            fault_handle: Mutex::new(None),
            fault_tx: Mutex::new(None),
        }
    }

    /// Add a roster entry. Builder-style; call before `initialize`.
    pub fn with_agent(mut self, definition: AgentDefinition) -> Self {
        self.definitions.push(definition);
        self
    }

    pub fn bus(&self) -> Arc<MessageBus> {
        Arc::clone(&self.bus)
    }

    pub async fn state(&self) -> ManagerState {
        *self.state.read().await
    }

    pub async fn fault_sink(&self) -> FaultSink {
        FaultSink {
            tx: self.fault_tx.lock().await.clone(),
        }
    }

    /// Look up a running agent instance by name.
    pub async fn agent(&self, name: &str) -> Option<Arc<dyn Agent>> {
        self.instances.read().await.get(name).cloned()
    }

    /// Bring the whole system up. Idempotent once `Ready`.
    ///
    /// Fail-fast: a construction failure, an unresolvable dependency graph
    /// or a failed agent `initialize` aborts the entire startup, tears down
    /// whatever was constructed and propagates the error. The system never
    /// starts partially ready.
    pub async fn initialize(&self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            match *state {
                ManagerState::Ready => {
                    debug!("Agent system already initialized");
                    return Ok(());
                }
                ManagerState::Initializing | ManagerState::ShuttingDown => {
                    return Err(AgentError::NotReady("initialize").into());
                }
                ManagerState::Uninitialized => *state = ManagerState::Initializing,
            }
        }

        match self.startup().await {
            Ok(()) => {
                *self.state.write().await = ManagerState::Ready;
                info!("Agent system ready with {} agents", self.definitions.len());
                Ok(())
            }
            Err(e) => {
                error!("Startup aborted: {}", e);
                self.abort_startup().await;
                *self.state.write().await = ManagerState::Uninitialized;
                Err(e)
            }
        }
    }

    async fn startup(&self) -> Result<()> {
        // Construct every declared agent; each registers with the bus from
        // its own constructor.
        for definition in &self.definitions {
            let agent = (definition.factory)(Arc::clone(&self.bus)).await?;
            if agent.name() != definition.name() {
                let mismatch = AgentError::DefinitionMismatch {
                    expected: definition.name().to_string(),
                    actual: agent.name().to_string(),
                };
                let _ = agent.destroy().await;
                return Err(mismatch.into());
            }
            self.instances
                .write()
                .await
                .insert(definition.name().to_string(), agent);
        }

        // The startup order is computed from the declared dependency graph,
        // never hand-maintained, so the two cannot drift apart.
        let graph: Vec<(String, Vec<String>)> = {
            let instances = self.instances.read().await;
            let mut graph = Vec::with_capacity(self.definitions.len());
            for definition in &self.definitions {
                let agent = instances
                    .get(definition.name())
                    .cloned()
                    .ok_or_else(|| AgentError::AgentNotFound(definition.name().to_string()))?;
                graph.push((definition.name().to_string(), agent.dependencies().to_vec()));
            }
            graph
        };
        let order = topological_order(&graph)?;
        debug!("Computed startup order: {:?}", order);

        for name in &order {
            let agent = self
                .instances
                .read()
                .await
                .get(name)
                .cloned()
                .ok_or_else(|| AgentError::AgentNotFound(name.clone()))?;
            agent.initialize().await?;
        }
        *self.startup_order.write().await = order;

        self.spawn_fault_monitor().await;
        self.spawn_health_sweep().await;

        if let Err(e) = self
            .bus
            .broadcast(Message::broadcast(
                SYSTEM_SENDER,
                MessageType::SystemReady,
                json!({}),
            ))
            .await
        {
            warn!("System-ready announcement failed: {}", e);
        }
        Ok(())
    }

    async fn abort_startup(&self) {
        let drained: Vec<(String, Arc<dyn Agent>)> =
            self.instances.write().await.drain().collect();
        for (name, agent) in drained {
            if let Err(e) = agent.destroy().await {
                warn!("Teardown of {} after aborted startup failed: {}", name, e);
                self.bus.unregister_agent(&name).await;
            }
        }
        self.startup_order.write().await.clear();
    }

    /// Pass-through send with `from` stamped as the reserved system sender.
    pub async fn send_message(
        &self,
        agent_name: &str,
        message_type: MessageType,
        payload: serde_json::Value,
    ) -> Result<AgentResponse> {
        self.ensure_ready("send_message").await?;
        self.bus
            .send(Message::new(
                SYSTEM_SENDER,
                Some(agent_name),
                message_type,
                payload,
            ))
            .await
    }

    /// Pass-through broadcast with `from` stamped as the reserved system
    /// sender.
    pub async fn broadcast(
        &self,
        message_type: MessageType,
        payload: serde_json::Value,
    ) -> Result<Vec<BroadcastDelivery>> {
        self.ensure_ready("broadcast").await?;
        self.bus
            .broadcast(Message::broadcast(SYSTEM_SENDER, message_type, payload))
            .await
    }

    /// Cold restart: destroy the current instance, build a fresh one from
    /// the same definition, re-initialize it. Accumulated state is
    /// discarded. Errors propagate and leave the agent absent from the
    /// registry until the restart is retried.
    pub async fn restart_agent(&self, name: &str) -> Result<()> {
        self.ensure_ready("restart_agent").await?;

        let definition = self
            .definitions
            .iter()
            .find(|d| d.name() == name)
            .cloned()
            .ok_or_else(|| AgentError::AgentNotFound(name.to_string()))?;

        if let Some(old) = self.instances.write().await.remove(name) {
            if let Err(e) = old.destroy().await {
                // The misbehaving instance is still forced out of the
                // registry so the name is free for a retried restart.
                self.bus.unregister_agent(name).await;
                return Err(e);
            }
        }

        let agent = (definition.factory)(Arc::clone(&self.bus)).await?;
        if let Err(e) = agent.initialize().await {
            let _ = agent.destroy().await;
            return Err(e);
        }

        self.instances
            .write()
            .await
            .insert(name.to_string(), agent);
        info!("Agent {} restarted", name);
        Ok(())
    }

    /// Probe every registered agent with a bounded timeout; broadcast a
    /// `HealthWarning` naming the unhealthy set when it is non-empty.
    ///
    /// Detection and remediation are deliberately decoupled: this never
    /// restarts an agent. Returns the unhealthy names.
    pub async fn perform_health_check(&self) -> Result<Vec<String>> {
        self.ensure_ready("perform_health_check").await?;
        let unhealthy = Self::sweep(&self.bus, self.config.health_check_timeout).await;
        if !unhealthy.is_empty() {
            warn!("Unhealthy agents detected: {:?}", unhealthy);
            let _ = self
                .bus
                .broadcast(Message::broadcast(
                    SYSTEM_SENDER,
                    MessageType::HealthWarning,
                    json!({ "unhealthy": unhealthy }),
                ))
                .await;
        }
        Ok(unhealthy)
    }

    async fn sweep(bus: &Arc<MessageBus>, timeout: Duration) -> Vec<String> {
        let mut unhealthy = Vec::new();
        for name in bus.registered_agents().await {
            let probe = Message::new(
                SYSTEM_SENDER,
                Some(name.as_str()),
                MessageType::HealthCheck,
                json!({}),
            );
            // The probe runs in its own task so a timeout does not cancel
            // the in-flight handler; a late completion only touches the
            // slow agent's own state. Documented race, not a bug.
            let bus_for_probe = Arc::clone(bus);
            let in_flight = tokio::spawn(async move { bus_for_probe.send(probe).await });
            match tokio::time::timeout(timeout, in_flight).await {
                Ok(Ok(Ok(response))) if response.success => {}
                Ok(Ok(Ok(_))) => {
                    warn!("Agent {} reported unhealthy", name);
                    unhealthy.push(name);
                }
                Ok(Ok(Err(e))) => {
                    warn!("Health probe of {} failed: {}", name, e);
                    unhealthy.push(name);
                }
                Ok(Err(join_error)) => {
                    warn!("Health probe task for {} died: {}", name, join_error);
                    unhealthy.push(name);
                }
                Err(_) => {
                    warn!("{}", AgentError::HealthCheckTimeout(name.clone()));
                    unhealthy.push(name);
                }
            }
        }
        unhealthy
    }

    async fn spawn_health_sweep(&self) {
        let bus = Arc::clone(&self.bus);
        let interval = self.config.health_check_interval;
        let timeout = self.config.health_check_timeout;
        let sink = self.fault_sink().await;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick fires immediately; skip it so the sweep starts
            // one full interval after startup.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let unhealthy = AgentManager::sweep(&bus, timeout).await;
                if unhealthy.is_empty() {
                    continue;
                }
                warn!("Health sweep flagged {:?}", unhealthy);
                let warning = Message::broadcast(
                    SYSTEM_SENDER,
                    MessageType::HealthWarning,
                    json!({ "unhealthy": unhealthy }),
                );
                if let Err(e) = bus.broadcast(warning).await {
                    sink.report("health-sweep", e.to_string());
                }
            }
        });
        *self.sweep_handle.lock().await = Some(handle);
    }

    async fn spawn_fault_monitor(&self) {
        let (tx, mut rx) = mpsc::unbounded_channel::<Fault>();
        *self.fault_tx.lock().await = Some(tx);

        let bus = Arc::clone(&self.bus);
        let handle = tokio::spawn(async move {
            while let Some(fault) = rx.recv().await {
                error!("Background fault from {}: {}", fault.source, fault.detail);
                let message = Message::broadcast(
                    SYSTEM_SENDER,
                    MessageType::SystemError,
                    json!({ "source": fault.source, "error": fault.detail }),
                );
                if let Err(e) = bus.broadcast(message).await {
                    error!("Failed to broadcast system error: {}", e);
                }
            }
        });
        *self.fault_handle.lock().await = Some(handle);
    }

    /// Tear the whole system down. No-op unless `Ready`.
    ///
    /// Agents are destroyed in reverse startup order; an individual destroy
    /// failure is logged and swallowed so one misbehaving agent cannot
    /// block teardown of the rest.
    pub async fn shutdown(&self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state != ManagerState::Ready {
                debug!("Shutdown requested while not ready; ignoring");
                return Ok(());
            }
            *state = ManagerState::ShuttingDown;
        }

        if let Err(e) = self
            .bus
            .broadcast(Message::broadcast(
                SYSTEM_SENDER,
                MessageType::SystemShutdown,
                json!({}),
            ))
            .await
        {
            warn!("Shutdown notice failed: {}", e);
        }

        if let Some(handle) = self.sweep_handle.lock().await.take() {
            handle.abort();
        }
        *self.fault_tx.lock().await = None;
        if let Some(handle) = self.fault_handle.lock().await.take() {
            handle.abort();
        }

        let order = std::mem::take(&mut *self.startup_order.write().await);
        let mut instances = std::mem::take(&mut *self.instances.write().await);
        for name in order.iter().rev() {
            let Some(agent) = instances.remove(name) else {
                continue;
            };
            if let Err(e) = agent.destroy().await {
                let failure = AgentError::ShutdownError {
                    agent: name.clone(),
                    reason: e.to_string(),
                };
                error!("{}", failure);
                // Force the registry entry out so teardown completes.
                self.bus.unregister_agent(name).await;
            }
        }
        for (name, agent) in instances {
            if let Err(e) = agent.destroy().await {
                error!("Straggler {} failed to shut down: {}", name, e);
                self.bus.unregister_agent(&name).await;
            }
        }

        self.bus.clear_history().await;
        *self.state.write().await = ManagerState::Uninitialized;
        info!("Agent system shut down");
        Ok(())
    }

    /// Status summary of the manager, its agents and the bus.
    pub async fn status(&self) -> serde_json::Value {
        let state = *self.state.read().await;
        let mut agents = Vec::new();
        for agent in self.instances.read().await.values() {
            agents.push(agent.status_report().await);
        }
        json!({
            "state": format!("{state:?}"),
            "agents": agents,
            "bus": self.bus.stats().await,
        })
    }

    async fn ensure_ready(&self, operation: &'static str) -> Result<()> {
        if *self.state.read().await != ManagerState::Ready {
            return Err(AgentError::NotReady(operation).into());
        }
        Ok(())
    }
}

/// Deterministic Kahn walk over the declared dependency graph, visiting
/// agents in declaration order. Unknown dependency names and cycles are
/// startup errors.
fn topological_order(graph: &[(String, Vec<String>)]) -> Result<Vec<String>> {
    let known: HashSet<&str> = graph.iter().map(|(name, _)| name.as_str()).collect();
    for (name, dependencies) in graph {
        for dependency in dependencies {
            if !known.contains(dependency.as_str()) {
                return Err(AgentError::UnknownDependency {
                    agent: name.clone(),
                    dependency: dependency.clone(),
                }
                .into());
            }
        }
    }

    let mut remaining: Vec<(&str, &[String])> = graph
        .iter()
        .map(|(name, dependencies)| (name.as_str(), dependencies.as_slice()))
        .collect();
    let mut placed: HashSet<&str> = HashSet::new();
    let mut order: Vec<String> = Vec::with_capacity(graph.len());

    while !remaining.is_empty() {
        let before = order.len();
        remaining.retain(|(name, dependencies)| {
            if dependencies.iter().all(|d| placed.contains(d.as_str())) {
                placed.insert(*name);
                order.push((*name).to_string());
                false
            } else {
                true
            }
        });
        if order.len() == before {
            let cycle: Vec<&str> = remaining.iter().map(|(name, _)| *name).collect();
            return Err(AgentError::DependencyCycle(cycle.join(", ")).into());
        }
    }

    Ok(order)
}
