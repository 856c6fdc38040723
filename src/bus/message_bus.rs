use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::Serialize;
use tokio::sync::{RwLock, broadcast};
use tracing::{debug, info, warn};

use crate::agent::Agent;
use crate::bus::message::{AgentResponse, HistoryFilter, Message, MessageType};
use crate::error::{Result, agent_error::AgentError};

/// Reserved sender name for manager-originated traffic. The manager is not
/// an agent, so it never appears in the registry; the bus accepts this name
/// as a valid `from` without a registry entry.
pub const SYSTEM_SENDER: &str = "agent-manager";

/// Message bus configuration
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Bounded message history size; oldest entries are dropped silently
    pub history_capacity: usize,
    /// Observability event channel capacity
    pub event_capacity: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            history_capacity: 1000,
            event_capacity: 256,
        }
    }
}

/// Diagnostic events emitted for external logging consumers. Consumers must
/// not mutate bus or agent internals in reaction to them.
#[derive(Debug, Clone)]
pub enum BusEvent {
    AgentRegistered { name: String },
    AgentUnregistered { name: String },
    MessageSent { message: Message },
    MessageBroadcast { message: Message },
}

/// Bus traffic counters
#[derive(Debug, Clone, Default, Serialize)]
pub struct BusStats {
    pub total_messages: u64,
    pub direct_messages: u64,
    pub broadcast_messages: u64,
    pub failed_deliveries: u64,
}

/// Handler installed via [`MessageBus::subscribe`]. Build one from an async
/// closure with `FutureExt::boxed`.
pub type SubscriptionHandler =
    Arc<dyn Fn(Message) -> BoxFuture<'static, Result<AgentResponse>> + Send + Sync>;

struct Subscription {
    agent_name: String,
    handler: SubscriptionHandler,
}

struct RegisteredAgent {
    handle: Arc<dyn Agent>,
    initialized: bool,
}

/// Per-recipient outcome of a broadcast.
#[derive(Debug, Clone)]
pub struct BroadcastDelivery {
    pub agent: String,
    pub success: bool,
    pub response: Option<AgentResponse>,
    pub error: Option<String>,
}

impl BroadcastDelivery {
    fn delivered(agent: String, response: AgentResponse) -> Self {
        Self {
            agent,
            success: true,
            response: Some(response),
            error: None,
        }
    }

    fn failed(agent: String, error: String) -> Self {
        Self {
            agent,
            success: false,
            response: None,
            error: Some(error),
        }
    }
}

/// Central router owning the agent registry, the type-keyed subscription
/// table and the bounded message history.
///
/// Dispatch is a direct awaited call chain: `send` invokes the target's
/// handler and returns its response to the caller. The bus is re-entrant
/// (a handler may itself call `send`/`broadcast`) because no internal lock
/// is ever held across a handler await; every dispatch path snapshots what
/// it needs under the lock and releases it before awaiting.
pub struct MessageBus {
    agents: RwLock<HashMap<String, RegisteredAgent>>,
    subscriptions: RwLock<HashMap<MessageType, Vec<Subscription>>>,
    history: RwLock<VecDeque<Message>>,
    stats: RwLock<BusStats>,
    events_tx: broadcast::Sender<BusEvent>,
    config: BusConfig,
}

impl MessageBus {
    pub fn new(config: BusConfig) -> Self {
        let (events_tx, _) = broadcast::channel(config.event_capacity);

        Self {
            agents: RwLock::new(HashMap::new()),
            subscriptions: RwLock::new(HashMap::new()),
            history: RwLock::new(VecDeque::with_capacity(config.history_capacity)),
            stats: RwLock::new(BusStats::default()),
            events_tx,
            config,
        }
    }

    /// Insert an agent into the registry under its name.
    ///
    /// A name collision is fatal to the caller: the registry retains the
    /// first registration and the duplicate is rejected.
    pub async fn register_agent(&self, agent: Arc<dyn Agent>) -> Result<()> {
        let name = agent.name().to_string();

        {
            let mut agents = self.agents.write().await;
            if agents.contains_key(&name) {
                warn!("Rejecting duplicate registration for agent {}", name);
                return Err(AgentError::DuplicateAgent(name).into());
            }
            agents.insert(
                name.clone(),
                RegisteredAgent {
                    handle: agent,
                    initialized: false,
                },
            );
        }

        info!("Agent {} registered", name);
        let _ = self.events_tx.send(BusEvent::AgentRegistered { name });
        Ok(())
    }

    /// Remove an agent and drop all of its subscriptions. Idempotent.
    pub async fn unregister_agent(&self, name: &str) {
        let removed = self.agents.write().await.remove(name).is_some();

        {
            let mut subscriptions = self.subscriptions.write().await;
            for handlers in subscriptions.values_mut() {
                handlers.retain(|s| s.agent_name != name);
            }
            subscriptions.retain(|_, handlers| !handlers.is_empty());
        }

        if removed {
            info!("Agent {} unregistered", name);
            let _ = self.events_tx.send(BusEvent::AgentUnregistered {
                name: name.to_string(),
            });
        }
    }

    pub async fn is_agent_registered(&self, name: &str) -> bool {
        self.agents.read().await.contains_key(name)
    }

    /// Registration and initialization are distinct: an agent is registered
    /// from construction, but only initialized once its `initialize` has
    /// completed. Dependency checks gate on this flag.
    pub async fn is_agent_initialized(&self, name: &str) -> bool {
        self.agents
            .read()
            .await
            .get(name)
            .map(|entry| entry.initialized)
            .unwrap_or(false)
    }

    pub async fn set_initialized(&self, name: &str, initialized: bool) -> Result<()> {
        let mut agents = self.agents.write().await;
        let entry = agents
            .get_mut(name)
            .ok_or_else(|| AgentError::AgentNotFound(name.to_string()))?;
        entry.initialized = initialized;
        Ok(())
    }

    pub async fn registered_agents(&self) -> Vec<String> {
        self.agents.read().await.keys().cloned().collect()
    }

    /// Directed delivery. Invokes the recipient's handler and returns its
    /// response. A handler error is caught and converted into a failure
    /// response, never propagated to the sender as an error, so one
    /// agent's bug cannot crash the caller or the bus.
    pub async fn send(&self, message: Message) -> Result<AgentResponse> {
        let Some(to) = message.to.clone() else {
            self.stats.write().await.failed_deliveries += 1;
            return Err(AgentError::UnknownRecipient("<broadcast>".to_string()).into());
        };

        if message.from != SYSTEM_SENDER && !self.is_agent_registered(&message.from).await {
            self.stats.write().await.failed_deliveries += 1;
            return Err(AgentError::UnknownSender(message.from.clone()).into());
        }

        let target = {
            let agents = self.agents.read().await;
            agents.get(&to).map(|entry| Arc::clone(&entry.handle))
        };
        let Some(target) = target else {
            self.stats.write().await.failed_deliveries += 1;
            return Err(AgentError::UnknownRecipient(to).into());
        };

        self.push_history(message.clone()).await;
        {
            let mut stats = self.stats.write().await;
            stats.total_messages += 1;
            stats.direct_messages += 1;
        }
        let _ = self.events_tx.send(BusEvent::MessageSent {
            message: message.clone(),
        });
        debug!(
            "Dispatching {} from {} to {}",
            message.message_type, message.from, to
        );

        match target.handle_message(&message).await {
            Ok(response) => Ok(response),
            Err(e) => {
                self.stats.write().await.failed_deliveries += 1;
                let failure = AgentError::HandlerFailure {
                    agent: to,
                    reason: e.to_string(),
                };
                warn!("{}", failure);
                Ok(AgentResponse::fail(
                    failure.to_string(),
                    message.correlation_id.clone(),
                ))
            }
        }
    }

    /// Untargeted delivery to every other registered agent's handler AND,
    /// independently, to every non-sender subscription handler for the
    /// message type.
    ///
    /// The two paths are deliberately not deduplicated: an agent that both
    /// handles the type in `handle_message` and holds a subscription for it
    /// observes the message twice. One path is "always route through my
    /// handler", the other is "I want only this type".
    ///
    /// Each recipient's failure is caught per-recipient; one failing
    /// recipient never blocks delivery to the rest.
    pub async fn broadcast(&self, message: Message) -> Result<Vec<BroadcastDelivery>> {
        if message.from != SYSTEM_SENDER && !self.is_agent_registered(&message.from).await {
            self.stats.write().await.failed_deliveries += 1;
            return Err(AgentError::UnknownSender(message.from.clone()).into());
        }

        let mut entry = message;
        entry.to = None;

        self.push_history(entry.clone()).await;
        {
            let mut stats = self.stats.write().await;
            stats.total_messages += 1;
            stats.broadcast_messages += 1;
        }
        let _ = self.events_tx.send(BusEvent::MessageBroadcast {
            message: entry.clone(),
        });
        debug!("Broadcasting {} from {}", entry.message_type, entry.from);

        let recipients: Vec<(String, Arc<dyn Agent>)> = {
            let agents = self.agents.read().await;
            agents
                .iter()
                .filter(|(name, _)| name.as_str() != entry.from)
                .map(|(name, registered)| (name.clone(), Arc::clone(&registered.handle)))
                .collect()
        };

        let mut deliveries = Vec::with_capacity(recipients.len());
        for (name, agent) in recipients {
            match agent.handle_message(&entry).await {
                Ok(response) => deliveries.push(BroadcastDelivery::delivered(name, response)),
                Err(e) => {
                    self.stats.write().await.failed_deliveries += 1;
                    warn!("Broadcast delivery to {} failed: {}", name, e);
                    deliveries.push(BroadcastDelivery::failed(name, e.to_string()));
                }
            }
        }

        let handlers: Vec<(String, SubscriptionHandler)> = {
            let subscriptions = self.subscriptions.read().await;
            subscriptions
                .get(&entry.message_type)
                .map(|list| {
                    list.iter()
                        .filter(|s| s.agent_name != entry.from)
                        .map(|s| (s.agent_name.clone(), Arc::clone(&s.handler)))
                        .collect()
                })
                .unwrap_or_default()
        };

        for (name, handler) in handlers {
            match handler(entry.clone()).await {
                Ok(response) => deliveries.push(BroadcastDelivery::delivered(name, response)),
                Err(e) => {
                    self.stats.write().await.failed_deliveries += 1;
                    warn!("Subscription handler of {} failed: {}", name, e);
                    deliveries.push(BroadcastDelivery::failed(name, e.to_string()));
                }
            }
        }

        Ok(deliveries)
    }

    /// Register a typed handler for broadcasts of `message_type`. Handlers
    /// are retained and invoked in registration order. The agent must be
    /// registered first.
    pub async fn subscribe<F>(
        &self,
        agent_name: &str,
        message_type: MessageType,
        handler: F,
    ) -> Result<()>
    where
        F: Fn(Message) -> BoxFuture<'static, Result<AgentResponse>> + Send + Sync + 'static,
    {
        if !self.is_agent_registered(agent_name).await {
            return Err(AgentError::AgentNotFound(agent_name.to_string()).into());
        }

        debug!("Agent {} subscribed to {}", agent_name, message_type);
        self.subscriptions
            .write()
            .await
            .entry(message_type)
            .or_default()
            .push(Subscription {
                agent_name: agent_name.to_string(),
                handler: Arc::new(handler),
            });
        Ok(())
    }

    /// Shallow copy of the history buffer, optionally filtered. Pure.
    pub async fn get_history(&self, filter: Option<HistoryFilter>) -> Vec<Message> {
        let history = self.history.read().await;
        match filter {
            Some(filter) => history.iter().filter(|m| filter.matches(m)).cloned().collect(),
            None => history.iter().cloned().collect(),
        }
    }

    /// Truncate history. Used during full-system shutdown.
    pub async fn clear_history(&self) {
        self.history.write().await.clear();
    }

    pub async fn stats(&self) -> BusStats {
        self.stats.read().await.clone()
    }

    /// Observability tap; the channel is lossy and carries no correctness
    /// guarantee.
    pub fn subscribe_events(&self) -> broadcast::Receiver<BusEvent> {
        self.events_tx.subscribe()
    }

    async fn push_history(&self, message: Message) {
        let mut history = self.history.write().await;
        if history.len() >= self.config.history_capacity {
            history.pop_front();
        }
        history.push_back(message);
    }
}
