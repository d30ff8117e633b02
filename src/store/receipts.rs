use serde::Serialize;
use sqlx::SqliteConnection;
use time::OffsetDateTime;

use super::{chats, messages, Store, StoreError};
use crate::unix_millis;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadOutcome {
    pub chat_id: String,
    /// Whether the reader's last-read pointer moved forward.
    pub pointer_advanced: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct ChatUnread {
    pub chat_id: String,
    pub count: i64,
}

/// Moves the pointer to `message_id` only if it currently points nowhere or
/// at an earlier message.
async fn advance_pointer(
    conn: &mut SqliteConnection,
    chat_id: &str,
    user_id: &str,
    message_id: &str,
    created_at: i64,
    seq: i64,
) -> Result<bool, StoreError> {
    let advanced = sqlx::query(
        "UPDATE chat_participants
         SET last_read_message_id = ?
         WHERE chat_id = ? AND user_id = ?
           AND (
               last_read_message_id IS NULL
               OR (SELECT created_at, seq FROM messages WHERE id = chat_participants.last_read_message_id) < (?, ?)
           )",
    )
    .bind(message_id)
    .bind(chat_id)
    .bind(user_id)
    .bind(created_at)
    .bind(seq)
    .execute(&mut *conn)
    .await?;

    Ok(advanced.rows_affected() > 0)
}

impl Store {
    /// Marks one message read for `user_id`. Repeating the call leaves the
    /// first read time in place.
    pub async fn mark_read(&self, message_id: &str, user_id: &str) -> Result<ReadOutcome, StoreError> {
        let now = unix_millis(OffsetDateTime::now_utc());
        let mut tx = self.pool.begin().await?;

        let target = messages::position(&mut tx, message_id)
            .await?
            .filter(|position| !position.is_deleted)
            .ok_or_else(|| StoreError::not_found("message", message_id))?;

        if !chats::is_participant(&mut tx, &target.chat_id, user_id).await? {
            return Err(chats::missing_participant(&mut tx, &target.chat_id, user_id).await?);
        }

        if target.sender_id != user_id {
            sqlx::query(
                "INSERT INTO message_status (message_id,user_id,is_read,read_at) VALUES (?,?,1,?)
                 ON CONFLICT(message_id,user_id) DO UPDATE
                 SET is_read = 1, read_at = COALESCE(message_status.read_at, excluded.read_at)",
            )
            .bind(message_id)
            .bind(user_id)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        let pointer_advanced = advance_pointer(
            &mut tx,
            &target.chat_id,
            user_id,
            message_id,
            target.created_at,
            target.seq,
        )
        .await?;

        tx.commit().await?;

        tracing::debug!(message = %message_id, user = %user_id, pointer_advanced, "message read");
        Ok(ReadOutcome {
            chat_id: target.chat_id,
            pointer_advanced,
        })
    }

    /// Marks every live message in the chat read for `user_id` and moves the
    /// pointer to the newest one. Returns that message id, if any.
    pub async fn mark_chat_read(
        &self,
        chat_id: &str,
        user_id: &str,
    ) -> Result<Option<String>, StoreError> {
        let now = unix_millis(OffsetDateTime::now_utc());
        let mut tx = self.pool.begin().await?;

        if !chats::is_participant(&mut tx, chat_id, user_id).await? {
            return Err(chats::missing_participant(&mut tx, chat_id, user_id).await?);
        }

        let latest: Option<(String, i64, i64)> = sqlx::query_as(
            "SELECT id, created_at, seq FROM messages
             WHERE chat_id = ? AND is_deleted = 0
             ORDER BY created_at DESC, seq DESC
             LIMIT 1",
        )
        .bind(chat_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some((latest_id, created_at, seq)) = latest else {
            return Ok(None);
        };

        let marked = sqlx::query(
            "INSERT INTO message_status (message_id,user_id,is_read,read_at)
             SELECT id, ?, 1, ? FROM messages
             WHERE chat_id = ? AND is_deleted = 0 AND sender_id != ?
             ON CONFLICT(message_id,user_id) DO UPDATE
             SET is_read = 1, read_at = COALESCE(message_status.read_at, excluded.read_at)",
        )
        .bind(user_id)
        .bind(now)
        .bind(chat_id)
        .bind(user_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        advance_pointer(&mut tx, chat_id, user_id, &latest_id, created_at, seq).await?;

        tx.commit().await?;

        tracing::debug!(chat = %chat_id, user = %user_id, marked, "chat read");
        Ok(Some(latest_id))
    }

    /// Unread totals per chat the user participates in, chats with nothing
    /// unread omitted.
    pub async fn unread_counts(&self, user_id: &str) -> Result<Vec<ChatUnread>, StoreError> {
        Ok(sqlx::query_as(
            "SELECT m.chat_id AS chat_id, COUNT(*) AS count
             FROM messages m
             JOIN chat_participants p ON p.chat_id = m.chat_id AND p.user_id = ?
             WHERE m.is_deleted = 0
               AND m.sender_id != ?
               AND NOT EXISTS (
                   SELECT 1 FROM message_status s
                   WHERE s.message_id = m.id AND s.user_id = ? AND s.is_read = 1
               )
             GROUP BY m.chat_id
             ORDER BY m.chat_id",
        )
        .bind(user_id)
        .bind(user_id)
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?)
    }

    pub async fn unread_count(&self, user_id: &str) -> Result<i64, StoreError> {
        Ok(self
            .unread_counts(user_id)
            .await?
            .iter()
            .map(|chat| chat.count)
            .sum())
    }

    pub async fn last_read(&self, chat_id: &str, user_id: &str) -> Result<Option<String>, StoreError> {
        let row: Option<(Option<String>,)> = sqlx::query_as(
            "SELECT last_read_message_id FROM chat_participants WHERE chat_id=? AND user_id=?",
        )
        .bind(chat_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some((pointer,)) => Ok(pointer),
            None => {
                let mut conn = self.pool.acquire().await?;
                Err(chats::missing_participant(&mut conn, chat_id, user_id).await?)
            }
        }
    }
}
