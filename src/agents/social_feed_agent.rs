use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use serde_json::json;
use tracing::debug;

use crate::agent::{Agent, AgentCore, AgentOptions, StateMap};
use crate::agents::navigation_agent::NAVIGATION_AGENT;
use crate::agents::settings_agent::SETTINGS_AGENT;
use crate::bus::{AgentResponse, Message, MessageBus, MessageType};
use crate::error::Result;

/// Canonical registry name of the social feed agent.
pub const SOCIAL_FEED_AGENT: &str = "social-feed";

const DEFAULT_PAGE_SIZE: u64 = 20;

/// Holds the visible slice of the social feed. `FeedRefresh` replaces the
/// entries (truncated to the configured page size) and announces the new
/// feed with `FeedUpdated`.
pub struct SocialFeedAgent {
    core: AgentCore,
}

impl SocialFeedAgent {
    pub async fn spawn(bus: Arc<MessageBus>, options: AgentOptions) -> Result<Arc<Self>> {
        let name = options.name.unwrap_or_else(|| SOCIAL_FEED_AGENT.to_string());
        let mut initial_state = options.initial_state;
        initial_state
            .entry("entries".to_string())
            .or_insert_with(|| json!([]));
        initial_state
            .entry("page_size".to_string())
            .or_insert_with(|| json!(DEFAULT_PAGE_SIZE));

        let agent = Arc::new(Self {
            core: AgentCore::new(
                name,
                "1.0.0",
                vec![SETTINGS_AGENT.to_string(), NAVIGATION_AGENT.to_string()],
                Arc::clone(&bus),
                initial_state,
            ),
        });
        bus.register_agent(agent.clone() as Arc<dyn Agent>).await?;
        Ok(agent)
    }

    async fn handle_refresh(&self, message: &Message) -> Result<AgentResponse> {
        let page_size = self
            .core
            .state_value("page_size")
            .await
            .and_then(|v| v.as_u64())
            .unwrap_or(DEFAULT_PAGE_SIZE) as usize;

        let mut entries = message
            .payload
            .get("entries")
            .and_then(|v| v.as_array().cloned())
            .unwrap_or_default();
        entries.truncate(page_size);
        debug!("Feed refreshed with {} entries", entries.len());

        self.core
            .set_state(StateMap::from([("entries".to_string(), json!(entries))]))
            .await;

        self.core
            .broadcast(MessageType::FeedUpdated, json!({ "count": entries.len() }))
            .await?;

        Ok(AgentResponse::ok(
            json!({ "count": entries.len() }),
            message.correlation_id.clone(),
        ))
    }
}

#[async_trait]
impl Agent for SocialFeedAgent {
    fn core(&self) -> &AgentCore {
        &self.core
    }

    async fn initialize(&self) -> Result<()> {
        if !self.core.begin_initialize().await? {
            return Ok(());
        }

        // Track the preferred page size without handling the full settings
        // vocabulary in handle_message.
        let state = self.core.state_handle();
        self.core
            .subscribe(MessageType::SettingsChanged, move |message| {
                let state = Arc::clone(&state);
                async move {
                    if let Some(page_size) =
                        message.payload.get("feed_page_size").and_then(|v| v.as_u64())
                    {
                        state
                            .merge(StateMap::from([(
                                "page_size".to_string(),
                                json!(page_size),
                            )]))
                            .await;
                    }
                    Ok(AgentResponse::ok(json!({}), message.correlation_id))
                }
                .boxed()
            })
            .await?;

        self.core.finish_initialize().await
    }

    async fn handle_message(&self, message: &Message) -> Result<AgentResponse> {
        match &message.message_type {
            MessageType::FeedRefresh => self.handle_refresh(message).await,
            MessageType::HealthCheck => Ok(self.core.health_response(message)),
            _ => Ok(AgentResponse::unknown_type(message)),
        }
    }
}
