//! Queue consumer that persists chat messages.
//!
//! Deliveries are acked only after the store committed (or already held) the
//! message, so a crash at any point leads to redelivery and the idempotent
//! insert absorbs the repeat.

use std::{
    hash::{DefaultHasher, Hash, Hasher},
    sync::Arc,
    time::Duration,
};

use futures_util::StreamExt;
use serde::Serialize;
use tokio::{sync::mpsc, task::JoinSet};

use crate::{
    backoff::backoff,
    events::{ChatMessage, PresenceStatus},
    presence::PresenceStore,
    queue::{Delivery, DurableQueue, QueueError, QueueName},
    store::{Ingested, Store},
};

const RETRY_PAUSE: Duration = Duration::from_secs(1);
const PARTITION_BACKLOG: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Committed,
    Duplicate,
    /// Transient failure; the delivery goes back to the queue.
    Retry,
    /// Definitive failure; the delivery is dead-lettered.
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub user_id: String,
    pub title: String,
    pub body: String,
    pub data: NotificationData,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationData {
    pub chat_id: String,
    pub message_id: String,
}

pub struct IngestionWorker {
    store: Store,
    queue: Arc<dyn DurableQueue>,
    presence: Arc<dyn PresenceStore>,
    partitions: usize,
}

fn partition_of(chat_id: &str, partitions: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    chat_id.hash(&mut hasher);
    (hasher.finish() % partitions as u64) as usize
}

impl IngestionWorker {
    pub fn new(
        store: Store,
        queue: Arc<dyn DurableQueue>,
        presence: Arc<dyn PresenceStore>,
        partitions: usize,
    ) -> Self {
        Self {
            store,
            queue,
            presence,
            partitions: partitions.max(1),
        }
    }

    /// Consumes `message_queue` for as long as the process runs. Each chat
    /// maps to one partition, and a partition handles its deliveries one at a
    /// time. A failed or ended consumer is logged and consumed again after a
    /// backoff; only losing a partition task ends the worker.
    pub async fn run(self) -> Result<(), QueueError> {
        let partitions = self.partitions;
        let worker = Arc::new(self);

        let mut lanes = Vec::with_capacity(partitions);
        let mut tasks = JoinSet::new();
        for partition in 0..partitions {
            let (tx, mut rx) = mpsc::channel::<(ChatMessage, Delivery)>(PARTITION_BACKLOG);
            let worker = worker.clone();
            tasks.spawn(async move {
                while let Some((message, delivery)) = rx.recv().await {
                    let outcome = worker.ingest(&message).await;
                    worker.settle(delivery, outcome).await;
                }
                tracing::debug!(partition, "ingest partition drained");
            });
            lanes.push(tx);
        }
        tracing::info!(partitions, "ingestion worker started");

        let mut attempt = 0u32;
        'consume: loop {
            let mut deliveries = match worker.queue.consume(QueueName::Messages).await {
                Ok(deliveries) => deliveries,
                Err(err) => {
                    let delay = backoff(attempt);
                    tracing::warn!(%err, attempt, ?delay, "cannot consume message queue");
                    attempt = attempt.saturating_add(1);
                    tokio::time::sleep(delay).await;
                    continue;
                }
            };

            while let Some(delivery) = deliveries.next().await {
                let delivery = match delivery {
                    Ok(delivery) => delivery,
                    Err(err) => {
                        tracing::warn!(%err, "message queue consumer failed");
                        break;
                    }
                };
                attempt = 0;

                let message = match serde_json::from_slice::<ChatMessage>(&delivery.data) {
                    Ok(message) => message,
                    Err(err) => {
                        tracing::warn!(%err, bytes = delivery.data.len(), "undecodable message payload");
                        worker.settle(delivery, Outcome::Rejected).await;
                        continue;
                    }
                };

                let lane = &lanes[partition_of(&message.chat_id, partitions)];
                if lane.send((message, delivery)).await.is_err() {
                    break 'consume;
                }
            }

            let delay = backoff(attempt);
            tracing::warn!(attempt, ?delay, "message queue consumer ended, consuming again");
            attempt = attempt.saturating_add(1);
            tokio::time::sleep(delay).await;
        }

        drop(lanes);
        while tasks.join_next().await.is_some() {}
        Err(QueueError::Closed("ingest partition"))
    }

    pub async fn ingest(&self, message: &ChatMessage) -> Outcome {
        match self.store.insert_message(message).await {
            Ok(Ingested::Inserted { recipients }) => {
                tracing::info!(message = %message.id, chat = %message.chat_id, "message committed");
                self.notify_offline(message, &recipients).await;
                Outcome::Committed
            }
            Ok(Ingested::Duplicate) => {
                tracing::debug!(message = %message.id, "duplicate delivery");
                Outcome::Duplicate
            }
            Err(err) if err.is_transient() => {
                tracing::warn!(message = %message.id, %err, "transient store failure, will retry");
                Outcome::Retry
            }
            Err(err) => {
                tracing::error!(message = %message.id, chat = %message.chat_id, %err, "message rejected");
                Outcome::Rejected
            }
        }
    }

    async fn settle(&self, delivery: Delivery, outcome: Outcome) {
        let settled = match outcome {
            Outcome::Committed | Outcome::Duplicate => delivery.ack().await,
            Outcome::Retry => {
                tokio::time::sleep(RETRY_PAUSE).await;
                delivery.nack(true).await
            }
            Outcome::Rejected => delivery.nack(false).await,
        };

        if let Err(err) = settled {
            tracing::error!(?outcome, %err, "failed to settle delivery");
        }
    }

    /// Hands a push notification to the notification queue for each
    /// recipient not currently online. Failures are only logged.
    async fn notify_offline(&self, message: &ChatMessage, recipients: &[String]) {
        let mut offline = Vec::new();
        for user_id in recipients {
            match self.presence.get(user_id).await {
                Ok(Some(record)) if record.status == PresenceStatus::Online => {}
                Ok(_) => offline.push(user_id),
                Err(err) => {
                    tracing::warn!(user = %user_id, %err, "presence lookup failed, notifying");
                    offline.push(user_id);
                }
            }
        }
        if offline.is_empty() {
            return;
        }

        let title = match self.store.user_name(&message.sender_id).await {
            Ok(Some(name)) => name,
            Ok(None) => "New message".to_owned(),
            Err(err) => {
                tracing::warn!(user = %message.sender_id, %err, "sender lookup failed");
                "New message".to_owned()
            }
        };
        let body = message.body.preview();

        for user_id in offline {
            let notification = Notification {
                user_id: user_id.clone(),
                title: title.clone(),
                body: body.clone(),
                data: NotificationData {
                    chat_id: message.chat_id.clone(),
                    message_id: message.id.clone(),
                },
            };
            if let Err(err) = self
                .queue
                .enqueue_json(QueueName::Notifications, &notification)
                .await
            {
                tracing::warn!(user = %user_id, message = %message.id, %err, "notification hand-off failed");
            }
        }
    }
}
