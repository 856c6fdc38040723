pub mod navigation_agent;
pub mod settings_agent;
pub mod social_feed_agent;

pub use navigation_agent::{NAVIGATION_AGENT, NavigationAgent};
pub use settings_agent::{SETTINGS_AGENT, SettingsAgent};
pub use social_feed_agent::{SOCIAL_FEED_AGENT, SocialFeedAgent};

use std::sync::Arc;

use crate::agent::{Agent, AgentOptions};
use crate::manager::AgentDefinition;

/// The application roster: every agent the manager constructs at startup.
/// Declaration order does not matter; the startup order is computed from
/// the declared dependencies.
pub fn default_definitions() -> Vec<AgentDefinition> {
    vec![
        AgentDefinition::new(SOCIAL_FEED_AGENT, |bus| async move {
            let agent: Arc<dyn Agent> =
                SocialFeedAgent::spawn(bus, AgentOptions::default()).await?;
            Ok(agent)
        }),
        AgentDefinition::new(NAVIGATION_AGENT, |bus| async move {
            let agent: Arc<dyn Agent> =
                NavigationAgent::spawn(bus, AgentOptions::default()).await?;
            Ok(agent)
        }),
        AgentDefinition::new(SETTINGS_AGENT, |bus| async move {
            let agent: Arc<dyn Agent> = SettingsAgent::spawn(bus, AgentOptions::default()).await?;
            Ok(agent)
        }),
    ]
}
