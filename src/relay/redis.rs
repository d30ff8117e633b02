use async_trait::async_trait;
use futures_util::StreamExt;
use redis::{aio::ConnectionManager, aio::PubSub, AsyncCommands, RedisResult};
use tokio::sync::broadcast;

use super::{RelayBus, RelayEnvelope, RelayError, Topic, RELAY_CAPACITY};
use crate::backoff::backoff;

/// Redis pub/sub bus. Publishing goes through an auto-reconnecting
/// connection manager; a background task owns the subscription and feeds a
/// local broadcast channel.
pub struct RedisRelay {
    publisher: ConnectionManager,
    local: broadcast::Sender<RelayEnvelope>,
}

impl RedisRelay {
    pub async fn connect(url: &str) -> Result<Self, RelayError> {
        let client = redis::Client::open(url)?;
        let publisher = ConnectionManager::new(client.clone()).await?;
        let pubsub = subscribe_all(&client).await?;

        let (local, _) = broadcast::channel(RELAY_CAPACITY);
        tokio::spawn(run_subscriber(client, pubsub, local.clone()));

        tracing::info!("redis relay subscribed");
        Ok(Self { publisher, local })
    }
}

#[async_trait]
impl RelayBus for RedisRelay {
    async fn publish(&self, topic: Topic, payload: String) -> Result<(), RelayError> {
        let mut conn = self.publisher.clone();
        let _: () = conn.publish(topic.channel(), payload).await?;
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<RelayEnvelope> {
        self.local.subscribe()
    }
}

async fn subscribe_all(client: &redis::Client) -> RedisResult<PubSub> {
    let mut pubsub = client.get_async_pubsub().await?;
    for topic in Topic::ALL {
        pubsub.subscribe(topic.channel()).await?;
    }
    Ok(pubsub)
}

async fn run_subscriber(
    client: redis::Client,
    mut pubsub: PubSub,
    local: broadcast::Sender<RelayEnvelope>,
) {
    loop {
        {
            let mut messages = pubsub.on_message();
            while let Some(msg) = messages.next().await {
                let Some(topic) = Topic::from_channel(msg.get_channel_name()) else {
                    continue;
                };
                match msg.get_payload::<String>() {
                    Ok(payload) => {
                        let _ = local.send(RelayEnvelope { topic, payload });
                    }
                    Err(err) => {
                        tracing::warn!(%err, channel = topic.channel(), "undecodable relay payload")
                    }
                }
            }
        }

        tracing::warn!("relay subscription lost, resubscribing");
        pubsub = resubscribe(&client).await;
    }
}

async fn resubscribe(client: &redis::Client) -> PubSub {
    let mut attempt = 0u32;
    loop {
        let delay = backoff(attempt);
        tokio::time::sleep(delay).await;

        match subscribe_all(client).await {
            Ok(pubsub) => {
                tracing::info!(attempt, "relay subscription restored");
                return pubsub;
            }
            Err(err) => {
                tracing::warn!(%err, attempt, ?delay, "relay resubscribe failed");
                attempt = attempt.saturating_add(1);
            }
        }
    }
}
