//! Last known online/offline state per user.

mod memory;
mod redis;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use time::OffsetDateTime;

use crate::{
    events::{PresenceRecord, PresenceStatus},
    relay::{RelayBus, RelayError, Topic},
};

pub use self::{memory::MemoryPresence, redis::RedisPresence};

#[derive(Error, Debug)]
pub enum PresenceError {
    #[error("Redis error: {0}")]
    Redis(#[from] ::redis::RedisError),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Relay error: {0}")]
    Relay(#[from] RelayError),
}

#[async_trait]
pub trait PresenceStore: Send + Sync {
    /// Stores `record` unless a record with a later `last_seen` is already
    /// held. Returns whether the record was stored.
    async fn put(&self, record: &PresenceRecord) -> Result<bool, PresenceError>;

    async fn get(&self, user_id: &str) -> Result<Option<PresenceRecord>, PresenceError>;
}

/// Records presence changes and announces the accepted ones on the bus.
#[derive(Clone)]
pub struct PresenceTracker {
    store: Arc<dyn PresenceStore>,
    relay: Arc<dyn RelayBus>,
}

impl PresenceTracker {
    pub fn new(store: Arc<dyn PresenceStore>, relay: Arc<dyn RelayBus>) -> Self {
        Self { store, relay }
    }

    pub async fn set_online(&self, user_id: &str) -> Result<PresenceRecord, PresenceError> {
        self.update(user_id, PresenceStatus::Online).await
    }

    pub async fn set_offline(&self, user_id: &str) -> Result<PresenceRecord, PresenceError> {
        self.update(user_id, PresenceStatus::Offline).await
    }

    async fn update(
        &self,
        user_id: &str,
        status: PresenceStatus,
    ) -> Result<PresenceRecord, PresenceError> {
        let record = PresenceRecord {
            user_id: user_id.to_owned(),
            status,
            last_seen: OffsetDateTime::now_utc(),
        };

        if self.store.put(&record).await? {
            self.relay.publish_json(Topic::Presence, &record).await?;
            tracing::debug!(user = %user_id, ?status, "presence updated");
        } else {
            tracing::debug!(user = %user_id, ?status, "stale presence update ignored");
        }

        Ok(record)
    }

    pub async fn get(&self, user_id: &str) -> Result<Option<PresenceRecord>, PresenceError> {
        self.store.get(user_id).await
    }

    /// The backing store, for readers that only need lookups.
    pub fn store(&self) -> Arc<dyn PresenceStore> {
        self.store.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::MemoryRelay;

    #[tokio::test]
    async fn accepted_updates_are_published() {
        let relay = MemoryRelay::new();
        let mut events = relay.subscribe();
        let tracker = PresenceTracker::new(Arc::new(MemoryPresence::new()), Arc::new(relay));

        tracker.set_online("alice").await.unwrap();
        tracker.set_offline("alice").await.unwrap();

        let online: PresenceRecord =
            serde_json::from_str(&events.recv().await.unwrap().payload).unwrap();
        let offline: PresenceRecord =
            serde_json::from_str(&events.recv().await.unwrap().payload).unwrap();
        assert_eq!(online.status, PresenceStatus::Online);
        assert_eq!(offline.status, PresenceStatus::Offline);
        assert!(offline.last_seen >= online.last_seen);

        let latest = tracker.get("alice").await.unwrap().unwrap();
        assert_eq!(latest.status, PresenceStatus::Offline);
    }
}
