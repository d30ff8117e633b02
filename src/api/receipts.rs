use std::sync::Arc;

use axum::{
    debug_handler,
    extract::{Path, State},
    Json,
};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::{
    events::{DeliveryStatus, MessageStatusEvent, ValidationError},
    relay::{RelayBus, Topic},
    store::{ChatUnread, ReadOutcome, Store},
    AppResult, AppState,
};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reader {
    #[serde(default)]
    user_id: String,
}

impl Reader {
    fn user_id(&self) -> Result<&str, ValidationError> {
        match self.user_id.trim() {
            "" => Err(ValidationError::Missing("userId")),
            _ => Ok(&self.user_id),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRead {
    pub chat_id: String,
    pub last_read_message_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct Unread {
    pub total: i64,
    pub chats: Vec<ChatUnread>,
}

async fn announce_read(
    relay: &Arc<dyn RelayBus>,
    message_id: String,
    chat_id: String,
    user_id: String,
) {
    let event = MessageStatusEvent {
        message_id,
        chat_id,
        user_id,
        status: DeliveryStatus::Read,
        timestamp: OffsetDateTime::now_utc(),
    };
    if let Err(err) = relay.publish_json(Topic::MessageStatus, &event).await {
        tracing::warn!(message = %event.message_id, %err, "read receipt relay failed");
    }
}

#[debug_handler(state = AppState)]
pub async fn mark_read(
    Path(message_id): Path<String>,
    State(store): State<Store>,
    State(relay): State<Arc<dyn RelayBus>>,
    Json(reader): Json<Reader>,
) -> AppResult<Json<ReadOutcome>> {
    let user_id = reader.user_id()?;
    let outcome = store.mark_read(&message_id, user_id).await?;

    announce_read(&relay, message_id, outcome.chat_id.clone(), user_id.to_owned()).await;
    Ok(Json(outcome))
}

#[debug_handler(state = AppState)]
pub async fn mark_chat_read(
    Path(chat_id): Path<String>,
    State(store): State<Store>,
    State(relay): State<Arc<dyn RelayBus>>,
    Json(reader): Json<Reader>,
) -> AppResult<Json<ChatRead>> {
    let user_id = reader.user_id()?;
    let latest = store.mark_chat_read(&chat_id, user_id).await?;

    if let Some(message_id) = &latest {
        announce_read(&relay, message_id.clone(), chat_id.clone(), user_id.to_owned()).await;
    }
    Ok(Json(ChatRead {
        chat_id,
        last_read_message_id: latest,
    }))
}

#[debug_handler(state = AppState)]
pub async fn unread(Path(user_id): Path<String>, State(store): State<Store>) -> AppResult<Json<Unread>> {
    let chats = store.unread_counts(&user_id).await?;
    Ok(Json(Unread {
        total: chats.iter().map(|chat| chat.count).sum(),
        chats,
    }))
}
