use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Message type vocabulary shared by every agent in the runtime.
///
/// The set is closed apart from `Custom`, which exists so embedding code can
/// route application-specific events without touching this crate.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    /// The whole agent system finished startup.
    SystemReady,
    /// The agent system is about to tear down.
    SystemShutdown,
    /// A background task failed; payload carries source and detail.
    SystemError,
    /// Liveness probe.
    HealthCheck,
    /// One or more agents failed their health check.
    HealthWarning,
    /// Request a route change.
    NavigateTo,
    /// A route change happened.
    RouteChanged,
    /// A user session began.
    SessionStarted,
    /// A user session ended.
    SessionEnded,
    /// Read the current preferences.
    SettingsGet,
    /// Patch the current preferences.
    SettingsUpdate,
    /// Preferences changed.
    SettingsChanged,
    /// Rebuild the social feed.
    FeedRefresh,
    /// The social feed changed.
    FeedUpdated,
    /// Application-defined message
    Custom(String),
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageType::SystemReady => write!(f, "system.ready"),
            MessageType::SystemShutdown => write!(f, "system.shutdown"),
            MessageType::SystemError => write!(f, "system.error"),
            MessageType::HealthCheck => write!(f, "health.check"),
            MessageType::HealthWarning => write!(f, "health.warning"),
            MessageType::NavigateTo => write!(f, "nav.goto"),
            MessageType::RouteChanged => write!(f, "nav.changed"),
            MessageType::SessionStarted => write!(f, "session.started"),
            MessageType::SessionEnded => write!(f, "session.ended"),
            MessageType::SettingsGet => write!(f, "settings.get"),
            MessageType::SettingsUpdate => write!(f, "settings.update"),
            MessageType::SettingsChanged => write!(f, "settings.changed"),
            MessageType::FeedRefresh => write!(f, "feed.refresh"),
            MessageType::FeedUpdated => write!(f, "feed.updated"),
            MessageType::Custom(name) => write!(f, "custom.{name}"),
        }
    }
}

/// The immutable unit of communication between agents.
///
/// A message is never mutated once it has been handed to the bus; the bus
/// keeps the only long-lived record of it in its history buffer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Message ID
    pub id: String,
    /// Sender agent name
    pub from: String,
    /// Recipient agent name; `None` is the broadcast sentinel
    pub to: Option<String>,
    /// Message type
    pub message_type: MessageType,
    /// Message content
    pub payload: serde_json::Value,
    /// Correlates a request with its response; generated when not supplied
    pub correlation_id: String,
    /// Creation instant
    pub timestamp: DateTime<Utc>,
}

impl Message {
    /// Create a new directed message. A fresh correlation id is generated;
    /// use [`Message::with_correlation`] to thread an existing one through.
    pub fn new(
        from: impl Into<String>,
        to: Option<&str>,
        message_type: MessageType,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            from: from.into(),
            to: to.map(str::to_string),
            message_type,
            payload,
            correlation_id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
        }
    }

    /// Create a broadcast message.
    pub fn broadcast(
        from: impl Into<String>,
        message_type: MessageType,
        payload: serde_json::Value,
    ) -> Self {
        Self::new(from, None, message_type, payload)
    }

    /// Thread an existing correlation id through this message.
    pub fn with_correlation(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = correlation_id.into();
        self
    }

    /// Whether this message targets every other agent.
    pub fn is_broadcast(&self) -> bool {
        self.to.is_none()
    }
}

/// Result of one agent handling one message.
///
/// Exactly one of `data`/`error` is populated; the constructors are the only
/// sanctioned construction paths and maintain that invariant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentResponse {
    pub success: bool,
    pub data: Option<serde_json::Value>,
    pub error: Option<String>,
    /// Echoes the originating message's correlation id
    pub correlation_id: String,
    pub timestamp: DateTime<Utc>,
}

impl AgentResponse {
    /// Successful response carrying `data`.
    pub fn ok(data: serde_json::Value, correlation_id: impl Into<String>) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            correlation_id: correlation_id.into(),
            timestamp: Utc::now(),
        }
    }

    /// Failed response carrying `error`.
    pub fn fail(error: impl Into<String>, correlation_id: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.into()),
            correlation_id: correlation_id.into(),
            timestamp: Utc::now(),
        }
    }

    /// Graceful failure for a message type the agent does not handle.
    /// Receiving one is a normal occurrence, not an error condition.
    pub fn unknown_type(message: &Message) -> Self {
        Self::fail(
            format!("unknown message type: {}", message.message_type),
            message.correlation_id.clone(),
        )
    }
}

/// Filter over the bus history buffer.
#[derive(Debug, Clone, Default)]
pub struct HistoryFilter {
    pub from: Option<String>,
    pub to: Option<String>,
    pub message_type: Option<MessageType>,
    /// Inclusive timestamp lower bound
    pub since: Option<DateTime<Utc>>,
}

impl HistoryFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_sender(mut self, from: impl Into<String>) -> Self {
        self.from = Some(from.into());
        self
    }

    pub fn to_recipient(mut self, to: impl Into<String>) -> Self {
        self.to = Some(to.into());
        self
    }

    pub fn with_type(mut self, message_type: MessageType) -> Self {
        self.message_type = Some(message_type);
        self
    }

    pub fn since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }

    pub fn matches(&self, message: &Message) -> bool {
        if let Some(ref from) = self.from {
            if &message.from != from {
                return false;
            }
        }

        if let Some(ref to) = self.to {
            if message.to.as_deref() != Some(to.as_str()) {
                return false;
            }
        }

        if let Some(ref message_type) = self.message_type {
            if &message.message_type != message_type {
                return false;
            }
        }

        if let Some(since) = self.since {
            if message.timestamp < since {
                return false;
            }
        }

        true
    }
}
