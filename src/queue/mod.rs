//! Durable at-least-once work queues.
//!
//! A delivery stays owned by the queue until it is settled: `ack` removes it,
//! `nack(true)` hands it back for redelivery and `nack(false)` sends it to the
//! dead-letter destination.

mod amqp;
mod memory;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde::Serialize;
use thiserror::Error;

pub use self::{amqp::AmqpQueue, memory::MemoryQueue};

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("AMQP error: {0}")]
    Amqp(#[from] lapin::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("queue {0} is closed")]
    Closed(&'static str),
    #[error("broker refused publish to {0}")]
    Refused(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueName {
    /// Chat messages awaiting persistence.
    Messages,
    /// Push notifications for recipients that are offline.
    Notifications,
    /// File messages, for the attachment workflow.
    FileUploads,
    /// Content edits.
    MessageUpdates,
}

impl QueueName {
    pub const ALL: [QueueName; 4] = [
        QueueName::Messages,
        QueueName::Notifications,
        QueueName::FileUploads,
        QueueName::MessageUpdates,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            QueueName::Messages => "message_queue",
            QueueName::Notifications => "notification_queue",
            QueueName::FileUploads => "file-uploads",
            QueueName::MessageUpdates => "message-updates",
        }
    }

    /// Exchange and routing key a publish to this queue goes through.
    pub fn route(self) -> (&'static str, &'static str) {
        match self {
            QueueName::Messages | QueueName::Notifications => ("", self.as_str()),
            QueueName::FileUploads => (amqp::TOPIC_EXCHANGE, "message.file"),
            QueueName::MessageUpdates => (amqp::TOPIC_EXCHANGE, "message.update"),
        }
    }
}

/// Settles one delivery with the broker that handed it out.
#[async_trait]
pub trait Acknowledge: Send + Sync {
    async fn ack(&self) -> Result<(), QueueError>;
    async fn nack(&self, requeue: bool) -> Result<(), QueueError>;
}

pub struct Delivery {
    pub data: Vec<u8>,
    /// Set when this delivery was handed out before and not acked.
    pub redelivered: bool,
    acker: Box<dyn Acknowledge>,
}

impl Delivery {
    pub fn new(data: Vec<u8>, redelivered: bool, acker: Box<dyn Acknowledge>) -> Self {
        Self {
            data,
            redelivered,
            acker,
        }
    }

    pub async fn ack(self) -> Result<(), QueueError> {
        self.acker.ack().await
    }

    pub async fn nack(self, requeue: bool) -> Result<(), QueueError> {
        self.acker.nack(requeue).await
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("bytes", &self.data.len())
            .field("redelivered", &self.redelivered)
            .finish()
    }
}

#[async_trait]
pub trait DurableQueue: Send + Sync {
    /// Persistently enqueues `payload`; returns once the broker accepted it.
    async fn enqueue(&self, queue: QueueName, payload: &[u8]) -> Result<(), QueueError>;

    /// Deliveries from `queue`, each held until settled.
    async fn consume(
        &self,
        queue: QueueName,
    ) -> Result<BoxStream<'static, Result<Delivery, QueueError>>, QueueError>;
}

impl dyn DurableQueue {
    pub async fn enqueue_json<T>(&self, queue: QueueName, value: &T) -> Result<(), QueueError>
    where
        T: Serialize + ?Sized,
    {
        let payload = serde_json::to_vec(value)?;
        self.enqueue(queue, &payload).await
    }
}
