use std::sync::Arc;

use axum::{
    debug_handler,
    extract::{Path, Query, State},
    Json,
};
use serde::Deserialize;

use crate::{
    queue::{DurableQueue, QueueName},
    store::{Deletion, HistoryEntry, Store, StoredMessage},
    AppResult, AppState,
};

const DEFAULT_PAGE: u32 = 50;
const MAX_PAGE: u32 = 100;

#[derive(Debug, Deserialize)]
pub struct Edit {
    content: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct Page {
    limit: Option<u32>,
    before: Option<String>,
}

#[debug_handler(state = AppState)]
pub async fn edit_message(
    Path(message_id): Path<String>,
    State(store): State<Store>,
    State(queue): State<Arc<dyn DurableQueue>>,
    Json(edit): Json<Edit>,
) -> AppResult<Json<StoredMessage>> {
    let message = store.edit_message(&message_id, &edit.content).await?;

    if let Err(err) = queue.enqueue_json(QueueName::MessageUpdates, &message).await {
        tracing::warn!(message = %message_id, %err, "edit hand-off failed");
    }
    Ok(Json(message))
}

#[debug_handler(state = AppState)]
pub async fn delete_message(
    Path(message_id): Path<String>,
    State(store): State<Store>,
) -> AppResult<Json<Deletion>> {
    Ok(Json(store.delete_message(&message_id).await?))
}

#[debug_handler(state = AppState)]
pub async fn history(
    Path(chat_id): Path<String>,
    Query(page): Query<Page>,
    State(store): State<Store>,
) -> AppResult<Json<Vec<HistoryEntry>>> {
    let limit = page.limit.unwrap_or(DEFAULT_PAGE).clamp(1, MAX_PAGE);
    Ok(Json(
        store
            .history(&chat_id, limit, page.before.as_deref())
            .await?,
    ))
}
