//! Socket gateway: terminates client websockets, turns their events into
//! relay and queue traffic, and re-emits relay traffic to the rooms held by
//! this process.

mod fanout;
mod rooms;
mod session;
mod ws;

use std::sync::Arc;

use axum::{routing::get, Router};
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::{
    events::ValidationError,
    presence::{PresenceError, PresenceTracker},
    queue::{DurableQueue, QueueError},
    relay::{RelayBus, RelayError},
    store::{Membership, StoreError},
    AppState,
};

pub use self::{
    fanout::spawn_fanout,
    rooms::{chat_room, user_room},
    session::Session,
};
use self::rooms::Rooms;

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("Relay error: {0}")]
    Relay(#[from] RelayError),
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),
    #[error("Presence error: {0}")]
    Presence(#[from] PresenceError),
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct GatewayConfig {
    /// Frames buffered per connection before further frames are dropped.
    pub outbound_buffer: usize,
    /// Refuse `join_chat` unless the store lists the user in the chat.
    pub verify_membership: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            outbound_buffer: 256,
            verify_membership: false,
        }
    }
}

pub struct Gateway {
    rooms: Rooms,
    relay: Arc<dyn RelayBus>,
    queue: Arc<dyn DurableQueue>,
    presence: PresenceTracker,
    membership: Arc<dyn Membership>,
    config: GatewayConfig,
}

impl Gateway {
    pub fn new(
        relay: Arc<dyn RelayBus>,
        queue: Arc<dyn DurableQueue>,
        presence: PresenceTracker,
        membership: Arc<dyn Membership>,
        config: GatewayConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            rooms: Rooms::default(),
            relay,
            queue,
            presence,
            membership,
            config,
        })
    }

    pub fn router() -> Router<AppState> {
        Router::new().route("/ws", get(ws::socket))
    }

    /// Registers a new local connection. Frames for it arrive on the
    /// returned receiver.
    pub fn open_session(self: &Arc<Self>) -> (Session, mpsc::Receiver<String>) {
        let id = ConnectionId::new();
        let (tx, rx) = mpsc::channel(self.config.outbound_buffer.max(1));
        self.rooms.register(id, tx);

        tracing::debug!(connection = %id, "connection opened");
        (Session::new(id, self.clone()), rx)
    }

    pub fn local_connections(&self) -> usize {
        self.rooms.connections()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::{json, Value};

    use async_trait::async_trait;
    use futures_util::{stream::BoxStream, StreamExt};

    use super::*;
    use crate::{
        events::{ChatMessage, PresenceRecord, PresenceStatus},
        presence::MemoryPresence,
        queue::{Delivery, MemoryQueue, QueueName},
        relay::{MemoryRelay, RelayEnvelope, Topic},
        store::{fixtures, Store},
    };

    struct Cluster {
        relay: MemoryRelay,
        queue: MemoryQueue,
        presence: PresenceTracker,
        store: Store,
    }

    impl Cluster {
        async fn new() -> Self {
            let relay = MemoryRelay::new();
            let store = fixtures::store().await;
            fixtures::seed_chat(&store, "c1", &["alice", "bob"]).await;

            Self {
                presence: PresenceTracker::new(
                    Arc::new(MemoryPresence::new()),
                    Arc::new(relay.clone()),
                ),
                relay,
                queue: MemoryQueue::new(),
                store,
            }
        }

        fn instance(&self, config: GatewayConfig) -> Arc<Gateway> {
            self.instance_with(Arc::new(self.queue.clone()), config)
        }

        fn instance_with(&self, queue: Arc<dyn DurableQueue>, config: GatewayConfig) -> Arc<Gateway> {
            let gateway = Gateway::new(
                Arc::new(self.relay.clone()),
                queue,
                self.presence.clone(),
                Arc::new(self.store.clone()),
                config,
            );
            spawn_fanout(gateway.clone());
            gateway
        }
    }

    /// Broker that refuses every publish.
    struct Unreachable;

    #[async_trait]
    impl DurableQueue for Unreachable {
        async fn enqueue(&self, queue: QueueName, _payload: &[u8]) -> Result<(), QueueError> {
            Err(QueueError::Closed(queue.as_str()))
        }

        async fn consume(
            &self,
            queue: QueueName,
        ) -> Result<BoxStream<'static, Result<Delivery, QueueError>>, QueueError> {
            Err(QueueError::Closed(queue.as_str()))
        }
    }

    fn frame(event: &str, data: Value) -> String {
        json!({ "event": event, "data": data }).to_string()
    }

    /// Next frame named `event`, skipping others.
    async fn expect_frame(rx: &mut mpsc::Receiver<String>, event: &str) -> Value {
        tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                let text = rx.recv().await.expect("connection closed");
                let frame: Value = serde_json::from_str(&text).unwrap();
                if frame["event"] == event {
                    return frame["data"].clone();
                }
            }
        })
        .await
        .unwrap_or_else(|_| panic!("no {event} frame"))
    }

    fn drain(rx: &mut tokio::sync::broadcast::Receiver<RelayEnvelope>, topic: Topic) -> Vec<Value> {
        let mut seen = Vec::new();
        while let Ok(envelope) = rx.try_recv() {
            if envelope.topic == topic {
                seen.push(serde_json::from_str(&envelope.payload).unwrap());
            }
        }
        seen
    }

    fn text_message(id: &str) -> Value {
        json!({ "id": id, "chatId": "c1", "sender": "alice", "content": "hi", "type": "text" })
    }

    #[tokio::test]
    async fn messages_reach_sockets_on_other_instances() {
        let cluster = Cluster::new().await;
        let x = cluster.instance(GatewayConfig::default());
        let y = cluster.instance(GatewayConfig::default());

        let (mut bob, mut bob_rx) = y.open_session();
        bob.handle_text(&frame("auth", json!({ "userId": "bob" }))).await;
        bob.handle_text(&frame("join_chat", json!({ "chatId": "c1", "userId": "bob" }))).await;

        let (mut alice, _alice_rx) = x.open_session();
        alice.handle_text(&frame("auth", json!({ "userId": "alice" }))).await;
        alice.handle_text(&frame("message", text_message("m1"))).await;

        let received = expect_frame(&mut bob_rx, "receive_message").await;
        assert_eq!(received, text_message("m1"));

        let delivered = expect_frame(&mut bob_rx, "message_status_update").await;
        assert_eq!(delivered["messageId"], "m1");
        assert_eq!(delivered["status"], "delivered");
    }

    #[tokio::test]
    async fn accepted_messages_are_queued_for_persistence() {
        let cluster = Cluster::new().await;
        let gateway = cluster.instance(GatewayConfig::default());
        let mut messages = cluster.queue.consume(QueueName::Messages).await.unwrap();
        let mut uploads = cluster.queue.consume(QueueName::FileUploads).await.unwrap();

        let (mut session, _rx) = gateway.open_session();
        session
            .handle_text(&frame(
                "message",
                json!({
                    "id": "m2", "chatId": "c1", "user": "alice", "type": "file",
                    "fileUrl": "https://files/a.png", "fileName": "a.png"
                }),
            ))
            .await;

        let queued = messages.next().await.unwrap().unwrap();
        let message: ChatMessage = serde_json::from_slice(&queued.data).unwrap();
        assert_eq!(message.id, "m2");
        assert_eq!(message.sender_id, "alice");
        queued.ack().await.unwrap();

        let upload = uploads.next().await.unwrap().unwrap();
        assert_eq!(serde_json::from_slice::<ChatMessage>(&upload.data).unwrap(), message);
        upload.ack().await.unwrap();
    }

    #[tokio::test]
    async fn invalid_frames_are_dropped_without_closing_the_session() {
        let cluster = Cluster::new().await;
        let gateway = cluster.instance(GatewayConfig::default());
        let mut bus = cluster.relay.subscribe();
        let (mut session, _rx) = gateway.open_session();

        session.handle_text("{not json").await;
        session.handle_text(&frame("message", json!({ "chatId": "c1" }))).await;
        session.handle_text(&frame("launch_missiles", json!({}))).await;
        session
            .handle_text(&frame(
                "typing",
                json!({ "chatId": "c1", "userId": "alice", "isTyping": true }),
            ))
            .await;

        assert!(drain(&mut bus, Topic::Message).is_empty());
        assert_eq!(gateway.local_connections(), 1);

        let mut bus = cluster.relay.subscribe();
        session
            .handle_text(&frame(
                "typing",
                json!({ "chatId": "c1", "userId": "alice", "isTyping": false }),
            ))
            .await;
        assert_eq!(drain(&mut bus, Topic::Typing).len(), 1);
    }

    #[tokio::test]
    async fn joining_twice_announces_once() {
        let cluster = Cluster::new().await;
        let gateway = cluster.instance(GatewayConfig::default());
        let mut bus = cluster.relay.subscribe();
        let (mut session, _rx) = gateway.open_session();

        let join = frame("join_chat", json!({ "chatId": "c1", "userId": "bob" }));
        session.handle_text(&join).await;
        session.handle_text(&join).await;

        let joins = drain(&mut bus, Topic::GroupEvents);
        assert_eq!(joins.len(), 1);
        assert_eq!(joins[0]["type"], "join");
        assert_eq!(gateway.rooms.occupancy(&chat_room("c1")), 1);
    }

    #[tokio::test]
    async fn verified_joins_require_membership() {
        let cluster = Cluster::new().await;
        let gateway = cluster.instance(GatewayConfig {
            verify_membership: true,
            ..Default::default()
        });
        let (mut session, _rx) = gateway.open_session();

        session.handle_text(&frame("join_chat", json!({ "chatId": "c1" }))).await;
        assert_eq!(gateway.rooms.occupancy(&chat_room("c1")), 0);

        session.handle_text(&frame("auth", json!({ "userId": "mallory" }))).await;
        session.handle_text(&frame("join_chat", json!({ "chatId": "c1" }))).await;
        assert_eq!(gateway.rooms.occupancy(&chat_room("c1")), 0);

        let (mut bob, _bob_rx) = gateway.open_session();
        bob.handle_text(&frame("auth", json!({ "userId": "bob" }))).await;
        bob.handle_text(&frame("join_chat", json!({ "chatId": "c1" }))).await;
        assert_eq!(gateway.rooms.occupancy(&chat_room("c1")), 1);
    }

    #[tokio::test]
    async fn leaving_stops_typing_and_announces_the_leave() {
        let cluster = Cluster::new().await;
        let gateway = cluster.instance(GatewayConfig::default());
        let (mut session, _rx) = gateway.open_session();
        session.handle_text(&frame("auth", json!({ "userId": "bob" }))).await;
        session.handle_text(&frame("join_chat", json!({ "chatId": "c1", "userId": "bob" }))).await;
        session
            .handle_text(&frame(
                "typing",
                json!({ "chatId": "c1", "userId": "bob", "userName": "Bob", "isTyping": true }),
            ))
            .await;

        let mut bus = cluster.relay.subscribe();
        session.handle_text(&frame("leave_chat", json!({ "chatId": "c1", "userId": "bob" }))).await;

        let typing = drain(&mut bus, Topic::Typing);
        assert_eq!(typing.len(), 1);
        assert_eq!(typing[0]["isTyping"], false);
        assert_eq!(typing[0]["userName"], "Bob");

        let mut bus = cluster.relay.subscribe();
        session.handle_text(&frame("leave_chat", json!({ "chatId": "c1", "userId": "bob" }))).await;
        assert!(drain(&mut bus, Topic::GroupEvents).is_empty());
    }

    #[tokio::test]
    async fn user_goes_offline_when_their_last_connection_closes() {
        let cluster = Cluster::new().await;
        let gateway = cluster.instance(GatewayConfig::default());
        let (mut phone, _phone_rx) = gateway.open_session();
        let (mut laptop, _laptop_rx) = gateway.open_session();
        phone.handle_text(&frame("auth", json!({ "userId": "alice" }))).await;
        laptop.handle_text(&frame("auth", json!({ "userId": "alice" }))).await;

        phone.close().await;
        assert_eq!(status(&cluster, "alice").await, Some(PresenceStatus::Online));

        laptop.close().await;
        assert_eq!(status(&cluster, "alice").await, Some(PresenceStatus::Offline));
        assert_eq!(gateway.local_connections(), 0);
    }

    async fn status(cluster: &Cluster, user_id: &str) -> Option<PresenceStatus> {
        cluster
            .presence
            .get(user_id)
            .await
            .unwrap()
            .map(|record: PresenceRecord| record.status)
    }

    #[tokio::test]
    async fn switching_user_releases_the_previous_one() {
        let cluster = Cluster::new().await;
        let gateway = cluster.instance(GatewayConfig::default());
        let (mut session, _rx) = gateway.open_session();
        let (mut bob_elsewhere, _bob_rx) = gateway.open_session();
        bob_elsewhere.handle_text(&frame("auth", json!({ "userId": "bob" }))).await;

        session.handle_text(&frame("auth", json!({ "userId": "alice" }))).await;
        session.handle_text(&frame("auth", json!({ "userId": "bob" }))).await;
        assert_eq!(status(&cluster, "alice").await, Some(PresenceStatus::Offline));
        assert_eq!(gateway.rooms.occupancy(&user_room("alice")), 0);

        session.handle_text(&frame("auth", json!({ "userId": "carol" }))).await;
        assert_eq!(status(&cluster, "bob").await, Some(PresenceStatus::Online));

        session.close().await;
        assert_eq!(status(&cluster, "carol").await, Some(PresenceStatus::Offline));
        assert_eq!(status(&cluster, "bob").await, Some(PresenceStatus::Online));
    }

    #[tokio::test]
    async fn refused_enqueue_keeps_the_session_and_skips_delivered() {
        let cluster = Cluster::new().await;
        let gateway = cluster.instance_with(Arc::new(Unreachable), GatewayConfig::default());
        let mut bus = cluster.relay.subscribe();
        let (mut session, _rx) = gateway.open_session();

        session.handle_text(&frame("message", text_message("m1"))).await;

        assert_eq!(drain(&mut bus, Topic::Message), vec![text_message("m1")]);
        assert!(drain(&mut bus, Topic::MessageStatus).is_empty());
        assert_eq!(gateway.local_connections(), 1);

        session
            .handle_text(&frame(
                "typing",
                json!({ "chatId": "c1", "userId": "alice", "isTyping": true }),
            ))
            .await;
        assert_eq!(drain(&mut bus, Topic::Typing).len(), 1);
    }
}
