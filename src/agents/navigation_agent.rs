use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use serde_json::json;
use tracing::debug;

use crate::agent::{Agent, AgentCore, AgentOptions, StateMap};
use crate::agents::settings_agent::SETTINGS_AGENT;
use crate::bus::{AgentResponse, Message, MessageBus, MessageType};
use crate::error::{Result, agent_error::AgentError};

/// Canonical registry name of the navigation agent.
pub const NAVIGATION_AGENT: &str = "navigation";

/// Tracks the current route and the visit trail of the session. Route
/// changes are announced with `RouteChanged`; the trail resets when the
/// user session ends.
pub struct NavigationAgent {
    core: AgentCore,
}

impl NavigationAgent {
    pub async fn spawn(bus: Arc<MessageBus>, options: AgentOptions) -> Result<Arc<Self>> {
        let name = options.name.unwrap_or_else(|| NAVIGATION_AGENT.to_string());
        let mut initial_state = options.initial_state;
        initial_state
            .entry("current_route".to_string())
            .or_insert_with(|| json!("/"));
        initial_state
            .entry("trail".to_string())
            .or_insert_with(|| json!([]));

        let agent = Arc::new(Self {
            core: AgentCore::new(
                name,
                "1.0.0",
                vec![SETTINGS_AGENT.to_string()],
                Arc::clone(&bus),
                initial_state,
            ),
        });
        bus.register_agent(agent.clone() as Arc<dyn Agent>).await?;
        Ok(agent)
    }

    async fn handle_navigate(&self, message: &Message) -> Result<AgentResponse> {
        let route = message
            .payload
            .get("route")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                AgentError::InvalidPayload("navigation expects a route string".to_string())
            })?
            .to_string();

        let previous = self
            .core
            .state_value("current_route")
            .await
            .unwrap_or_else(|| json!("/"));
        let mut trail = self
            .core
            .state_value("trail")
            .await
            .and_then(|v| v.as_array().cloned())
            .unwrap_or_default();
        trail.push(json!(route));

        self.core
            .set_state(StateMap::from([
                ("current_route".to_string(), json!(route)),
                ("trail".to_string(), json!(trail)),
            ]))
            .await;
        debug!("Route changed {} -> {}", previous, route);

        self.core
            .broadcast(
                MessageType::RouteChanged,
                json!({ "from": previous, "to": route }),
            )
            .await?;

        Ok(AgentResponse::ok(
            json!({ "route": route }),
            message.correlation_id.clone(),
        ))
    }
}

#[async_trait]
impl Agent for NavigationAgent {
    fn core(&self) -> &AgentCore {
        &self.core
    }

    async fn initialize(&self) -> Result<()> {
        if !self.core.begin_initialize().await? {
            return Ok(());
        }

        // Session teardown clears the visit trail without routing through
        // the full handler.
        let state = self.core.state_handle();
        self.core
            .subscribe(MessageType::SessionEnded, move |message| {
                let state = Arc::clone(&state);
                async move {
                    state
                        .merge(StateMap::from([("trail".to_string(), json!([]))]))
                        .await;
                    Ok(AgentResponse::ok(
                        json!({ "trail_cleared": true }),
                        message.correlation_id,
                    ))
                }
                .boxed()
            })
            .await?;

        self.core.finish_initialize().await
    }

    async fn handle_message(&self, message: &Message) -> Result<AgentResponse> {
        match &message.message_type {
            MessageType::NavigateTo => self.handle_navigate(message).await,
            MessageType::HealthCheck => Ok(self.core.health_response(message)),
            _ => Ok(AgentResponse::unknown_type(message)),
        }
    }
}
