use std::collections::HashMap;

use serde::Serialize;
use sqlx::{QueryBuilder, Sqlite};
use time::OffsetDateTime;

use super::{chats, Store, StoreError};
use crate::{
    events::{ChatMessage, MessageBody},
    from_unix_millis, unix_millis,
};

/// Result of handing a queued message to the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ingested {
    /// The message is new; status rows were created for these recipients.
    Inserted { recipients: Vec<String> },
    /// A message with this id was already persisted.
    Duplicate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredMessage {
    pub id: String,
    pub chat_id: String,
    pub sender_id: String,
    pub body: MessageBody,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    pub is_deleted: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    #[serde(flatten)]
    pub message: StoredMessage,
    pub read_by: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Deletion {
    pub message_id: String,
    pub chat_id: String,
    /// Participants whose read pointer moved off the deleted message.
    pub reassigned_pointers: u64,
}

#[derive(sqlx::FromRow)]
struct MessageRow {
    id: String,
    chat_id: String,
    sender_id: String,
    content: Option<String>,
    #[sqlx(rename = "type")]
    kind: String,
    file_url: Option<String>,
    file_name: Option<String>,
    created_at: i64,
    updated_at: i64,
    is_deleted: bool,
}

const MESSAGE_COLUMNS: &str =
    "id,chat_id,sender_id,content,type,file_url,file_name,created_at,updated_at,is_deleted";

impl TryFrom<MessageRow> for StoredMessage {
    type Error = StoreError;

    fn try_from(row: MessageRow) -> Result<Self, Self::Error> {
        let body = match row.kind.as_str() {
            "text" => MessageBody::Text {
                content: row.content.unwrap_or_default(),
            },
            "system" => MessageBody::System {
                content: row.content.unwrap_or_default(),
            },
            "file" => MessageBody::File {
                url: row.file_url.unwrap_or_default(),
                name: row.file_name,
                caption: row.content,
            },
            other => {
                return Err(StoreError::Invalid(format!(
                    "message {} has unknown type {other}",
                    row.id
                )));
            }
        };

        Ok(StoredMessage {
            id: row.id,
            chat_id: row.chat_id,
            sender_id: row.sender_id,
            body,
            created_at: from_unix_millis(row.created_at),
            updated_at: from_unix_millis(row.updated_at),
            is_deleted: row.is_deleted,
        })
    }
}

/// Where a message sits in its chat's creation order.
#[derive(sqlx::FromRow)]
pub(super) struct Position {
    pub(super) chat_id: String,
    pub(super) sender_id: String,
    pub(super) created_at: i64,
    pub(super) seq: i64,
    pub(super) is_deleted: bool,
}

pub(super) async fn position(
    conn: &mut sqlx::SqliteConnection,
    message_id: &str,
) -> Result<Option<Position>, StoreError> {
    Ok(sqlx::query_as(
        "SELECT chat_id,sender_id,created_at,seq,is_deleted FROM messages WHERE id=?",
    )
    .bind(message_id)
    .fetch_optional(&mut *conn)
    .await?)
}

impl Store {
    /// Persists a queued message and its per-recipient status rows in one
    /// transaction. Re-inserting a known id is a successful no-op.
    pub async fn insert_message(&self, message: &ChatMessage) -> Result<Ingested, StoreError> {
        let mut tx = self.pool.begin().await?;

        if position(&mut tx, &message.id).await?.is_some() {
            return Ok(Ingested::Duplicate);
        }

        if !chats::is_participant(&mut tx, &message.chat_id, &message.sender_id).await? {
            return Err(
                chats::missing_participant(&mut tx, &message.chat_id, &message.sender_id).await?,
            );
        }

        let (content, file_url, file_name) = match &message.body {
            MessageBody::Text { content } | MessageBody::System { content } => {
                (Some(content.as_str()), None, None)
            }
            MessageBody::File { url, name, caption } => {
                (caption.as_deref(), Some(url.as_str()), name.as_deref())
            }
        };
        let created_at = unix_millis(message.created_at);

        let inserted = sqlx::query(
            "INSERT INTO messages (id,chat_id,sender_id,content,type,file_url,file_name,created_at,updated_at,is_deleted,seq)
             VALUES (?,?,?,?,?,?,?,?,?,0,(SELECT COALESCE(MAX(seq), 0) + 1 FROM messages))
             ON CONFLICT(id) DO NOTHING",
        )
        .bind(&message.id)
        .bind(&message.chat_id)
        .bind(&message.sender_id)
        .bind(content)
        .bind(message.body.kind().as_str())
        .bind(file_url)
        .bind(file_name)
        .bind(created_at)
        .bind(created_at)
        .execute(&mut *tx)
        .await?;

        if inserted.rows_affected() == 0 {
            return Ok(Ingested::Duplicate);
        }

        let recipients: Vec<String> = chats::participants(&mut tx, &message.chat_id)
            .await?
            .into_iter()
            .filter(|user_id| *user_id != message.sender_id)
            .collect();

        for recipient in &recipients {
            sqlx::query("INSERT INTO message_status (message_id,user_id,is_read,read_at) VALUES (?,?,0,NULL)")
                .bind(&message.id)
                .bind(recipient)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;

        tracing::debug!(
            message = %message.id,
            chat = %message.chat_id,
            recipients = recipients.len(),
            "message persisted"
        );
        Ok(Ingested::Inserted { recipients })
    }

    pub async fn message(&self, message_id: &str) -> Result<StoredMessage, StoreError> {
        let row: Option<MessageRow> =
            sqlx::query_as(&format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id=?"))
                .bind(message_id)
                .fetch_optional(&self.pool)
                .await?;

        row.ok_or_else(|| StoreError::not_found("message", message_id))?
            .try_into()
    }

    /// Replaces the content of a live text message.
    pub async fn edit_message(
        &self,
        message_id: &str,
        content: &str,
    ) -> Result<StoredMessage, StoreError> {
        if content.trim().is_empty() {
            return Err(StoreError::Invalid("message content cannot be empty".into()));
        }

        let current = self.message(message_id).await?;
        if current.is_deleted {
            return Err(StoreError::Invalid(format!("message {message_id} is deleted")));
        }
        if !matches!(current.body, MessageBody::Text { .. }) {
            return Err(StoreError::Invalid(format!(
                "only text messages can be edited, {message_id} is {}",
                current.body.kind().as_str()
            )));
        }

        let updated = sqlx::query(
            "UPDATE messages SET content=?, updated_at=? WHERE id=? AND type='text' AND is_deleted=0",
        )
        .bind(content)
        .bind(unix_millis(OffsetDateTime::now_utc()))
        .bind(message_id)
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(StoreError::Invalid(format!("message {message_id} is deleted")));
        }

        self.message(message_id).await
    }

    /// Soft-deletes a message, drops its status rows and moves any read
    /// pointer that referenced it to the nearest earlier live message.
    pub async fn delete_message(&self, message_id: &str) -> Result<Deletion, StoreError> {
        let mut tx = self.pool.begin().await?;

        let target = position(&mut tx, message_id)
            .await?
            .ok_or_else(|| StoreError::not_found("message", message_id))?;

        if !target.is_deleted {
            sqlx::query("UPDATE messages SET is_deleted=1, updated_at=? WHERE id=?")
                .bind(unix_millis(OffsetDateTime::now_utc()))
                .bind(message_id)
                .execute(&mut *tx)
                .await?;
        }

        sqlx::query("DELETE FROM message_status WHERE message_id=?")
            .bind(message_id)
            .execute(&mut *tx)
            .await?;

        let reassigned = sqlx::query(
            "UPDATE chat_participants
             SET last_read_message_id = (
                 SELECT id FROM messages
                 WHERE chat_id = ? AND is_deleted = 0 AND (created_at, seq) < (?, ?)
                 ORDER BY created_at DESC, seq DESC
                 LIMIT 1
             )
             WHERE chat_id = ? AND last_read_message_id = ?",
        )
        .bind(&target.chat_id)
        .bind(target.created_at)
        .bind(target.seq)
        .bind(&target.chat_id)
        .bind(message_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        tx.commit().await?;

        tracing::info!(message = %message_id, chat = %target.chat_id, reassigned, "message deleted");
        Ok(Deletion {
            message_id: message_id.to_owned(),
            chat_id: target.chat_id,
            reassigned_pointers: reassigned,
        })
    }

    /// A page of live messages, newest first, optionally strictly older than
    /// the `before` message.
    pub async fn history(
        &self,
        chat_id: &str,
        limit: u32,
        before: Option<&str>,
    ) -> Result<Vec<HistoryEntry>, StoreError> {
        self.chat(chat_id).await?;

        let cursor = match before {
            Some(before) => {
                let mut conn = self.pool.acquire().await?;
                let cursor = position(&mut conn, before)
                    .await?
                    .filter(|cursor| cursor.chat_id == chat_id)
                    .ok_or_else(|| StoreError::not_found("message", before))?;
                Some((cursor.created_at, cursor.seq))
            }
            None => None,
        };

        let mut query = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE is_deleted = 0 AND chat_id = "
        ));
        query.push_bind(chat_id);
        if let Some((created_at, seq)) = cursor {
            query
                .push(" AND (created_at, seq) < (")
                .push_bind(created_at)
                .push(", ")
                .push_bind(seq)
                .push(")");
        }
        query
            .push(" ORDER BY created_at DESC, seq DESC LIMIT ")
            .push_bind(i64::from(limit));

        let rows: Vec<MessageRow> = query.build_query_as().fetch_all(&self.pool).await?;
        let messages = rows
            .into_iter()
            .map(StoredMessage::try_from)
            .collect::<Result<Vec<_>, _>>()?;

        let mut read_by = self.readers(&messages).await?;
        Ok(messages
            .into_iter()
            .map(|message| HistoryEntry {
                read_by: read_by.remove(&message.id).unwrap_or_default(),
                message,
            })
            .collect())
    }

    async fn readers(
        &self,
        messages: &[StoredMessage],
    ) -> Result<HashMap<String, Vec<String>>, StoreError> {
        let mut readers: HashMap<String, Vec<String>> = HashMap::new();
        if messages.is_empty() {
            return Ok(readers);
        }

        let mut query = QueryBuilder::<Sqlite>::new(
            "SELECT message_id,user_id FROM message_status WHERE is_read = 1 AND message_id IN (",
        );
        let mut ids = query.separated(",");
        for message in messages {
            ids.push_bind(&message.id);
        }
        ids.push_unseparated(") ORDER BY read_at, user_id");

        let rows: Vec<(String, String)> = query.build_query_as().fetch_all(&self.pool).await?;
        for (message_id, user_id) in rows {
            readers.entry(message_id).or_default().push(user_id);
        }

        Ok(readers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::fixtures::{self, text};

    async fn status_rows(store: &Store, message_id: &str) -> Vec<(String, bool)> {
        sqlx::query_as("SELECT user_id,is_read FROM message_status WHERE message_id=? ORDER BY user_id")
            .bind(message_id)
            .fetch_all(store.pool())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn insert_fans_status_rows_out_to_everyone_but_the_sender() {
        let store = fixtures::store().await;
        fixtures::seed_chat(&store, "c1", &["alice", "bob", "carol"]).await;

        let outcome = store.insert_message(&text("m1", "c1", "alice", 1_000)).await.unwrap();

        assert_eq!(
            outcome,
            Ingested::Inserted {
                recipients: vec!["bob".into(), "carol".into()]
            }
        );
        assert_eq!(
            status_rows(&store, "m1").await,
            vec![("bob".to_owned(), false), ("carol".to_owned(), false)]
        );
    }

    #[tokio::test]
    async fn redelivered_message_is_persisted_once() {
        let store = fixtures::store().await;
        fixtures::seed_chat(&store, "c1", &["alice", "bob"]).await;
        let message = text("m1", "c1", "alice", 1_000);

        store.insert_message(&message).await.unwrap();
        assert_eq!(store.insert_message(&message).await.unwrap(), Ingested::Duplicate);

        let (messages,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM messages WHERE id='m1'")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(messages, 1);
        assert_eq!(status_rows(&store, "m1").await.len(), 1);
    }

    #[tokio::test]
    async fn sender_outside_the_chat_is_not_found() {
        let store = fixtures::store().await;
        fixtures::seed_chat(&store, "c1", &["alice", "bob"]).await;

        let stranger = store.insert_message(&text("m1", "c1", "mallory", 1_000)).await;
        assert!(matches!(stranger, Err(StoreError::NotFound { entity: "participant", .. })));

        let no_chat = store.insert_message(&text("m2", "ghost", "alice", 1_000)).await;
        assert!(matches!(no_chat, Err(StoreError::NotFound { entity: "chat", .. })));
        assert!(!no_chat.unwrap_err().is_transient());
    }

    #[tokio::test]
    async fn file_messages_round_trip_through_the_row_shape() {
        let store = fixtures::store().await;
        fixtures::seed_chat(&store, "c1", &["alice", "bob"]).await;
        let mut message = text("m1", "c1", "alice", 1_000);
        message.body = MessageBody::File {
            url: "https://files/report.pdf".into(),
            name: Some("report.pdf".into()),
            caption: None,
        };

        store.insert_message(&message).await.unwrap();

        let stored = store.message("m1").await.unwrap();
        assert_eq!(stored.body, message.body);
        assert_eq!(stored.created_at, message.created_at);
    }

    #[tokio::test]
    async fn only_live_text_messages_can_be_edited() {
        let store = fixtures::store().await;
        fixtures::seed_chat(&store, "c1", &["alice", "bob"]).await;
        store.insert_message(&text("m1", "c1", "alice", 1_000)).await.unwrap();
        let mut file = text("m2", "c1", "alice", 2_000);
        file.body = MessageBody::File {
            url: "https://files/a".into(),
            name: None,
            caption: None,
        };
        store.insert_message(&file).await.unwrap();

        let edited = store.edit_message("m1", "fixed typo").await.unwrap();
        assert_eq!(edited.body, MessageBody::Text { content: "fixed typo".into() });

        assert!(matches!(store.edit_message("m2", "nope").await, Err(StoreError::Invalid(_))));
        assert!(matches!(store.edit_message("m1", "  ").await, Err(StoreError::Invalid(_))));

        store.delete_message("m1").await.unwrap();
        assert!(matches!(store.edit_message("m1", "again").await, Err(StoreError::Invalid(_))));
        assert!(matches!(
            store.edit_message("missing", "x").await,
            Err(StoreError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn delete_soft_deletes_and_drops_status_rows() {
        let store = fixtures::store().await;
        fixtures::seed_chat(&store, "c1", &["alice", "bob"]).await;
        store.insert_message(&text("m1", "c1", "alice", 1_000)).await.unwrap();

        let deletion = store.delete_message("m1").await.unwrap();

        assert_eq!(deletion.chat_id, "c1");
        assert!(store.message("m1").await.unwrap().is_deleted);
        assert!(status_rows(&store, "m1").await.is_empty());
        assert!(store.delete_message("m1").await.is_ok());
        assert!(matches!(
            store.delete_message("missing").await,
            Err(StoreError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn history_pages_newest_first_with_readers() {
        let store = fixtures::store().await;
        fixtures::seed_chat(&store, "c1", &["alice", "bob", "carol"]).await;
        for (i, id) in ["m1", "m2", "m3"].iter().enumerate() {
            store
                .insert_message(&text(id, "c1", "alice", 1_000 * (i as i64 + 1)))
                .await
                .unwrap();
        }
        store.mark_read("m2", "bob").await.unwrap();
        store.delete_message("m3").await.unwrap();

        let page = store.history("c1", 10, None).await.unwrap();
        let ids: Vec<_> = page.iter().map(|e| e.message.id.as_str()).collect();
        assert_eq!(ids, ["m2", "m1"]);
        assert_eq!(page[0].read_by, ["bob"]);
        assert!(page[1].read_by.is_empty());

        let older = store.history("c1", 10, Some("m2")).await.unwrap();
        assert_eq!(older.len(), 1);
        assert_eq!(older[0].message.id, "m1");

        assert!(matches!(
            store.history("ghost", 10, None).await,
            Err(StoreError::NotFound { entity: "chat", .. })
        ));
    }

    #[tokio::test]
    async fn history_cursor_must_be_a_message_of_the_chat() {
        let store = fixtures::store().await;
        fixtures::seed_chat(&store, "c1", &["alice", "bob"]).await;
        fixtures::seed_chat(&store, "c2", &["alice", "bob"]).await;
        store.insert_message(&text("m1", "c1", "alice", 1_000)).await.unwrap();
        store.insert_message(&text("x1", "c2", "alice", 2_000)).await.unwrap();

        for cursor in ["ghost", "x1"] {
            assert!(matches!(
                store.history("c1", 10, Some(cursor)).await,
                Err(StoreError::NotFound { entity: "message", .. })
            ));
        }
    }
}
