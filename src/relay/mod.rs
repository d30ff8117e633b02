//! Cross-instance pub/sub for ephemeral events. Every gateway instance,
//! including the publisher, receives each published event.

mod memory;
mod redis;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::broadcast;

pub use self::{memory::MemoryRelay, redis::RedisRelay};

/// Events buffered per local subscriber before it starts lagging.
pub const RELAY_CAPACITY: usize = 1024;

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Redis error: {0}")]
    Redis(#[from] ::redis::RedisError),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    Message,
    Typing,
    Presence,
    MessageStatus,
    GroupEvents,
}

impl Topic {
    pub const ALL: [Topic; 5] = [
        Topic::Message,
        Topic::Typing,
        Topic::Presence,
        Topic::MessageStatus,
        Topic::GroupEvents,
    ];

    pub fn channel(self) -> &'static str {
        match self {
            Topic::Message => "message",
            Topic::Typing => "typing",
            Topic::Presence => "presence",
            Topic::MessageStatus => "message_status",
            Topic::GroupEvents => "group_events",
        }
    }

    pub fn from_channel(channel: &str) -> Option<Self> {
        Topic::ALL.into_iter().find(|topic| topic.channel() == channel)
    }
}

/// One event as it crossed the bus; the payload is the JSON text published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayEnvelope {
    pub topic: Topic,
    pub payload: String,
}

#[async_trait]
pub trait RelayBus: Send + Sync {
    async fn publish(&self, topic: Topic, payload: String) -> Result<(), RelayError>;

    /// Events published by any instance from now on.
    fn subscribe(&self) -> broadcast::Receiver<RelayEnvelope>;
}

impl dyn RelayBus {
    pub async fn publish_json<T>(&self, topic: Topic, value: &T) -> Result<(), RelayError>
    where
        T: Serialize + ?Sized,
    {
        let payload = serde_json::to_string(value)?;
        self.publish(topic, payload).await
    }
}
