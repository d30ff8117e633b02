use async_trait::async_trait;
use dashmap::{mapref::entry::Entry, DashMap};

use super::{PresenceError, PresenceStore};
use crate::events::PresenceRecord;

#[derive(Default)]
pub struct MemoryPresence {
    records: DashMap<String, PresenceRecord>,
}

impl MemoryPresence {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PresenceStore for MemoryPresence {
    async fn put(&self, record: &PresenceRecord) -> Result<bool, PresenceError> {
        match self.records.entry(record.user_id.clone()) {
            Entry::Occupied(held) if held.get().last_seen > record.last_seen => Ok(false),
            Entry::Occupied(mut held) => {
                held.insert(record.clone());
                Ok(true)
            }
            Entry::Vacant(slot) => {
                slot.insert(record.clone());
                Ok(true)
            }
        }
    }

    async fn get(&self, user_id: &str) -> Result<Option<PresenceRecord>, PresenceError> {
        Ok(self.records.get(user_id).map(|record| record.clone()))
    }
}
