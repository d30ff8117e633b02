use async_trait::async_trait;
use redis::{aio::ConnectionManager, AsyncCommands};

use super::{PresenceError, PresenceStore};
use crate::{events::PresenceRecord, unix_millis};

const RECORDS_KEY: &str = "user_presence";
const SEEN_KEY: &str = "user_presence:seen";

/// Stores a presence record unless the held one was seen later.
///
/// KEYS[1] - hash of JSON records by user id
/// KEYS[2] - hash of last-seen millis by user id
/// ARGV[1] - user id
/// ARGV[2] - JSON record
/// ARGV[3] - last-seen millis of the record
const PUT_SCRIPT: &str = r#"
local seen = redis.call('HGET', KEYS[2], ARGV[1])
if seen and tonumber(seen) > tonumber(ARGV[3]) then
    return 0
end
redis.call('HSET', KEYS[1], ARGV[1], ARGV[2])
redis.call('HSET', KEYS[2], ARGV[1], ARGV[3])
return 1
"#;

pub struct RedisPresence {
    connection: ConnectionManager,
    script: redis::Script,
}

impl RedisPresence {
    pub async fn connect(url: &str) -> Result<Self, PresenceError> {
        let client = redis::Client::open(url)?;
        let connection = ConnectionManager::new(client).await?;

        Ok(Self {
            connection,
            script: redis::Script::new(PUT_SCRIPT),
        })
    }
}

#[async_trait]
impl PresenceStore for RedisPresence {
    async fn put(&self, record: &PresenceRecord) -> Result<bool, PresenceError> {
        let mut conn = self.connection.clone();
        let json = serde_json::to_string(record)?;

        let stored: i32 = self
            .script
            .key(RECORDS_KEY)
            .key(SEEN_KEY)
            .arg(&record.user_id)
            .arg(json)
            .arg(unix_millis(record.last_seen))
            .invoke_async(&mut conn)
            .await?;

        Ok(stored == 1)
    }

    async fn get(&self, user_id: &str) -> Result<Option<PresenceRecord>, PresenceError> {
        let mut conn = self.connection.clone();
        let json: Option<String> = conn.hget(RECORDS_KEY, user_id).await?;

        Ok(json.map(|json| serde_json::from_str(&json)).transpose()?)
    }
}
