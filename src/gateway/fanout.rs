use std::sync::Arc;

use serde_json::Value;
use tokio::{sync::broadcast::error::RecvError, task::JoinHandle};

use super::{chat_room, Gateway};
use crate::{
    events::ServerEvent,
    relay::{RelayEnvelope, Topic},
};

/// Re-emits every relay event to the local sockets interested in it. The
/// subscription is taken before the task starts, so nothing published after
/// this returns is missed.
pub fn spawn_fanout(gateway: Arc<Gateway>) -> JoinHandle<()> {
    let mut events = gateway.relay.subscribe();

    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(envelope) => {
                    gateway.fan_out(&envelope);
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "fanout lagging behind the relay, events dropped")
                }
                Err(RecvError::Closed) => break,
            }
        }
        tracing::info!("relay closed, fanout stopped");
    })
}

impl Gateway {
    /// Returns how many local connections accepted the event.
    pub(crate) fn fan_out(&self, envelope: &RelayEnvelope) -> usize {
        let data: Value = match serde_json::from_str(&envelope.payload) {
            Ok(data) => data,
            Err(err) => {
                tracing::warn!(topic = envelope.topic.channel(), %err, "undecodable relay event");
                return 0;
            }
        };

        let event = match envelope.topic {
            Topic::Message => ServerEvent::ReceiveMessage,
            Topic::Typing => ServerEvent::Typing,
            Topic::Presence => ServerEvent::Presence,
            Topic::MessageStatus => ServerEvent::MessageStatusUpdate,
            Topic::GroupEvents => ServerEvent::GroupUpdate,
        };
        let frame = match event.encode(&data) {
            Ok(frame) => frame,
            Err(err) => {
                tracing::warn!(event = event.name(), %err, "frame encoding failed");
                return 0;
            }
        };

        if envelope.topic == Topic::Presence {
            return self.rooms.broadcast(&frame);
        }

        match data.get("chatId").and_then(Value::as_str) {
            Some(chat_id) => self.rooms.emit(&chat_room(chat_id), &frame),
            None => {
                tracing::debug!(event = event.name(), "relay event without chatId");
                0
            }
        }
    }
}
