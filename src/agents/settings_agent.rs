use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::{debug, info};

use crate::agent::{Agent, AgentCore, AgentOptions, StateMap};
use crate::bus::{AgentResponse, Message, MessageBus, MessageType};
use crate::error::{Result, agent_error::AgentError};

/// Canonical registry name of the settings agent.
pub const SETTINGS_AGENT: &str = "settings";

/// Owns the user preference blob. Other agents read it with `SettingsGet`
/// and patch it with `SettingsUpdate`; every accepted patch is announced
/// with a `SettingsChanged` broadcast.
pub struct SettingsAgent {
    core: AgentCore,
}

impl SettingsAgent {
    pub async fn spawn(bus: Arc<MessageBus>, options: AgentOptions) -> Result<Arc<Self>> {
        let name = options.name.unwrap_or_else(|| SETTINGS_AGENT.to_string());
        let mut initial_state = options.initial_state;
        initial_state
            .entry("preferences".to_string())
            .or_insert_with(|| {
                json!({
                    "theme": "light",
                    "units": "metric",
                    "feed_page_size": 20,
                })
            });

        let agent = Arc::new(Self {
            core: AgentCore::new(name, "1.0.0", vec![], Arc::clone(&bus), initial_state),
        });
        bus.register_agent(agent.clone() as Arc<dyn Agent>).await?;
        Ok(agent)
    }

    async fn handle_get(&self, message: &Message) -> Result<AgentResponse> {
        let preferences = self
            .core
            .state_value("preferences")
            .await
            .unwrap_or_else(|| json!({}));
        Ok(AgentResponse::ok(
            preferences,
            message.correlation_id.clone(),
        ))
    }

    async fn handle_update(&self, message: &Message) -> Result<AgentResponse> {
        let patch = message.payload.as_object().ok_or_else(|| {
            AgentError::InvalidPayload("settings update expects an object".to_string())
        })?;

        let mut preferences = self
            .core
            .state_value("preferences")
            .await
            .and_then(|v| v.as_object().cloned())
            .unwrap_or_default();
        for (key, value) in patch {
            preferences.insert(key.clone(), value.clone());
        }
        let preferences = Value::Object(preferences);

        self.core
            .set_state(StateMap::from([(
                "preferences".to_string(),
                preferences.clone(),
            )]))
            .await;
        info!("Settings updated: {} keys patched", patch.len());

        // Re-entrant broadcast from inside a handler; the bus holds no lock
        // across handler awaits, so this is safe.
        self.core
            .broadcast(MessageType::SettingsChanged, preferences.clone())
            .await?;

        Ok(AgentResponse::ok(
            preferences,
            message.correlation_id.clone(),
        ))
    }
}

#[async_trait]
impl Agent for SettingsAgent {
    fn core(&self) -> &AgentCore {
        &self.core
    }

    async fn initialize(&self) -> Result<()> {
        if !self.core.begin_initialize().await? {
            return Ok(());
        }
        // Everything this agent cares about arrives through handle_message.
        self.core.finish_initialize().await
    }

    async fn handle_message(&self, message: &Message) -> Result<AgentResponse> {
        debug!("SettingsAgent handling {}", message.message_type);
        match &message.message_type {
            MessageType::SettingsGet => self.handle_get(message).await,
            MessageType::SettingsUpdate => self.handle_update(message).await,
            MessageType::HealthCheck => Ok(self.core.health_response(message)),
            _ => Ok(AgentResponse::unknown_type(message)),
        }
    }
}
