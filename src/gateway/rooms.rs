use std::collections::HashSet;

use dashmap::DashMap;
use tokio::sync::mpsc::{self, error::TrySendError};

use super::ConnectionId;

pub fn chat_room(chat_id: &str) -> String {
    format!("chat:{chat_id}")
}

pub fn user_room(user_id: &str) -> String {
    format!("user:{user_id}")
}

/// Local connection and room membership tables. Only this process's
/// sockets are tracked here.
#[derive(Default)]
pub struct Rooms {
    connections: DashMap<ConnectionId, mpsc::Sender<String>>,
    members: DashMap<String, HashSet<ConnectionId>>,
}

impl Rooms {
    pub fn register(&self, id: ConnectionId, outbound: mpsc::Sender<String>) {
        self.connections.insert(id, outbound);
    }

    /// Drops the connection and every room membership it held.
    pub fn unregister(&self, id: ConnectionId) {
        self.connections.remove(&id);
        self.members.retain(|_, members| {
            members.remove(&id);
            !members.is_empty()
        });
    }

    /// Returns false if the connection was already in the room.
    pub fn join(&self, room: &str, id: ConnectionId) -> bool {
        self.members.entry(room.to_owned()).or_default().insert(id)
    }

    pub fn leave(&self, room: &str, id: ConnectionId) -> bool {
        let Some(mut members) = self.members.get_mut(room) else {
            return false;
        };
        let left = members.remove(&id);
        let empty = members.is_empty();
        drop(members);

        if empty {
            self.members.remove_if(room, |_, members| members.is_empty());
        }
        left
    }

    pub fn occupancy(&self, room: &str) -> usize {
        self.members.get(room).map_or(0, |members| members.len())
    }

    pub fn connections(&self) -> usize {
        self.connections.len()
    }

    /// Queues `frame` for every connection in `room`; returns how many
    /// accepted it.
    pub fn emit(&self, room: &str, frame: &str) -> usize {
        let targets: Vec<ConnectionId> = match self.members.get(room) {
            Some(members) => members.iter().copied().collect(),
            None => return 0,
        };

        targets.into_iter().filter(|id| self.send(*id, frame)).count()
    }

    pub fn broadcast(&self, frame: &str) -> usize {
        let targets: Vec<ConnectionId> = self.connections.iter().map(|entry| *entry.key()).collect();
        targets.into_iter().filter(|id| self.send(*id, frame)).count()
    }

    fn send(&self, id: ConnectionId, frame: &str) -> bool {
        let Some(outbound) = self.connections.get(&id).map(|tx| tx.clone()) else {
            return false;
        };

        match outbound.try_send(frame.to_owned()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                tracing::warn!(connection = %id, "outbound buffer full, frame dropped");
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }
}
