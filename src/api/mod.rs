//! REST surface for read receipts, message edits and history.

mod health;
mod messages;
mod presence;
mod receipts;

use axum::{
    routing::{get, patch, post},
    Router,
};

use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health::health))
        .route(
            "/messages/{id}",
            patch(messages::edit_message).delete(messages::delete_message),
        )
        .route("/messages/{id}/read", post(receipts::mark_read))
        .route("/chats/{id}/read", post(receipts::mark_chat_read))
        .route("/chats/{id}/messages", get(messages::history))
        .route("/users/{id}/unread", get(receipts::unread))
        .route("/presence/{id}", get(presence::presence))
}

#[cfg(test)]
pub(crate) mod fixtures {
    use std::{sync::Arc, time::Instant};

    use crate::{
        gateway::{Gateway, GatewayConfig},
        presence::{MemoryPresence, PresenceTracker},
        queue::MemoryQueue,
        relay::MemoryRelay,
        store::{fixtures, Store},
        AppState,
    };

    pub(crate) struct TestApp {
        pub state: AppState,
        pub relay: MemoryRelay,
        pub queue: MemoryQueue,
    }

    pub(crate) async fn app() -> TestApp {
        let store = fixtures::store().await;
        fixtures::seed_chat(&store, "c1", &["alice", "bob", "carol"]).await;
        app_with(store)
    }

    pub(crate) fn app_with(store: Store) -> TestApp {
        let relay = MemoryRelay::new();
        let queue = MemoryQueue::new();
        let presence = PresenceTracker::new(Arc::new(MemoryPresence::new()), Arc::new(relay.clone()));
        let gateway = Gateway::new(
            Arc::new(relay.clone()),
            Arc::new(queue.clone()),
            presence.clone(),
            Arc::new(store.clone()),
            GatewayConfig::default(),
        );

        TestApp {
            state: AppState {
                store,
                relay: Arc::new(relay.clone()),
                queue: Arc::new(queue.clone()),
                presence,
                gateway,
                started_at: Instant::now(),
            },
            relay,
            queue,
        }
    }
}
