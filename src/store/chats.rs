use async_trait::async_trait;
use serde::Serialize;
use sqlx::SqliteConnection;
use time::OffsetDateTime;

use super::{Store, StoreError};
use crate::from_unix_millis;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatKind {
    Direct,
    Group,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Chat {
    pub id: String,
    pub kind: ChatKind,
    pub name: Option<String>,
    pub avatar_url: Option<String>,
    pub created_by: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(sqlx::FromRow)]
struct ChatRow {
    id: String,
    #[sqlx(rename = "type")]
    kind: String,
    name: Option<String>,
    avatar_url: Option<String>,
    created_by: String,
    created_at: i64,
}

impl From<ChatRow> for Chat {
    fn from(row: ChatRow) -> Self {
        Chat {
            id: row.id,
            kind: match row.kind.as_str() {
                "direct" => ChatKind::Direct,
                _ => ChatKind::Group,
            },
            name: row.name,
            avatar_url: row.avatar_url,
            created_by: row.created_by,
            created_at: from_unix_millis(row.created_at),
        }
    }
}

/// The slice of chat administration the delivery core consumes. Chats and
/// participants are created and removed elsewhere.
#[async_trait]
pub trait Membership: Send + Sync {
    async fn participants(&self, chat_id: &str) -> Result<Vec<String>, StoreError>;
    async fn is_participant(&self, chat_id: &str, user_id: &str) -> Result<bool, StoreError>;
}

#[async_trait]
impl Membership for Store {
    async fn participants(&self, chat_id: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.pool.acquire().await?;
        participants(&mut conn, chat_id).await
    }

    async fn is_participant(&self, chat_id: &str, user_id: &str) -> Result<bool, StoreError> {
        let mut conn = self.pool.acquire().await?;
        is_participant(&mut conn, chat_id, user_id).await
    }
}

impl Store {
    pub async fn chat(&self, chat_id: &str) -> Result<Chat, StoreError> {
        let row: Option<ChatRow> = sqlx::query_as(
            "SELECT id,type,name,avatar_url,created_by,created_at FROM chats WHERE id=?",
        )
        .bind(chat_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Chat::from)
            .ok_or_else(|| StoreError::not_found("chat", chat_id))
    }

    pub async fn user_name(&self, user_id: &str) -> Result<Option<String>, StoreError> {
        let name: Option<(String,)> = sqlx::query_as("SELECT name FROM users WHERE id=?")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(name.map(|(name,)| name))
    }
}

pub(super) async fn participants(
    conn: &mut SqliteConnection,
    chat_id: &str,
) -> Result<Vec<String>, StoreError> {
    let rows: Vec<(String,)> =
        sqlx::query_as("SELECT user_id FROM chat_participants WHERE chat_id=? ORDER BY user_id")
            .bind(chat_id)
            .fetch_all(&mut *conn)
            .await?;

    Ok(rows.into_iter().map(|(user_id,)| user_id).collect())
}

pub(super) async fn is_participant(
    conn: &mut SqliteConnection,
    chat_id: &str,
    user_id: &str,
) -> Result<bool, StoreError> {
    let row: Option<(i64,)> =
        sqlx::query_as("SELECT 1 FROM chat_participants WHERE chat_id=? AND user_id=?")
            .bind(chat_id)
            .bind(user_id)
            .fetch_optional(&mut *conn)
            .await?;

    Ok(row.is_some())
}

/// Not-found error for a missing participant row, naming the chat when it is
/// the chat itself that does not exist.
pub(super) async fn missing_participant(
    conn: &mut SqliteConnection,
    chat_id: &str,
    user_id: &str,
) -> Result<StoreError, StoreError> {
    let chat: Option<(i64,)> = sqlx::query_as("SELECT 1 FROM chats WHERE id=?")
        .bind(chat_id)
        .fetch_optional(&mut *conn)
        .await?;

    Ok(match chat {
        Some(_) => StoreError::not_found("participant", format!("{user_id} in chat {chat_id}")),
        None => StoreError::not_found("chat", chat_id),
    })
}
