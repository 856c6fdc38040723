pub mod message;
pub mod message_bus;

pub use message::{AgentResponse, HistoryFilter, Message, MessageType};
pub use message_bus::{
    BroadcastDelivery, BusConfig, BusEvent, BusStats, MessageBus, SYSTEM_SENDER,
    SubscriptionHandler,
};
