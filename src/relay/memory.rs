use async_trait::async_trait;
use tokio::sync::broadcast;

use super::{RelayBus, RelayEnvelope, RelayError, Topic, RELAY_CAPACITY};

/// In-process bus. Clones share one channel, so gateways holding clones of
/// the same relay behave like separate instances behind one broker.
#[derive(Clone)]
pub struct MemoryRelay {
    tx: broadcast::Sender<RelayEnvelope>,
}

impl MemoryRelay {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(RELAY_CAPACITY);
        Self { tx }
    }
}

impl Default for MemoryRelay {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RelayBus for MemoryRelay {
    async fn publish(&self, topic: Topic, payload: String) -> Result<(), RelayError> {
        if self.tx.send(RelayEnvelope { topic, payload }).is_err() {
            tracing::debug!(topic = topic.channel(), "no relay subscribers");
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<RelayEnvelope> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn every_subscriber_sees_every_event() {
        let relay: Arc<dyn RelayBus> = Arc::new(MemoryRelay::new());
        let mut first = relay.subscribe();
        let mut second = relay.subscribe();

        relay
            .publish_json(Topic::Typing, &json!({ "chatId": "c1", "isTyping": true }))
            .await
            .unwrap();

        for rx in [&mut first, &mut second] {
            let envelope = rx.recv().await.unwrap();
            assert_eq!(envelope.topic, Topic::Typing);
            assert_eq!(envelope.payload, r#"{"chatId":"c1","isTyping":true}"#);
        }
    }

    #[tokio::test]
    async fn publishing_without_subscribers_is_fine() {
        let relay = MemoryRelay::new();
        assert!(relay.publish(Topic::Presence, "{}".into()).await.is_ok());
    }
}
