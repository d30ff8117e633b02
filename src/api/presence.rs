use axum::{
    debug_handler,
    extract::{Path, State},
    Json,
};

use crate::{events::PresenceRecord, presence::PresenceTracker, AppError, AppResult, AppState};

#[debug_handler(state = AppState)]
pub async fn presence(
    Path(user_id): Path<String>,
    State(presence): State<PresenceTracker>,
) -> AppResult<Json<PresenceRecord>> {
    presence
        .get(&user_id)
        .await?
        .map(Json)
        .ok_or_else(|| AppError::not_found(format!("presence of {user_id}")))
}
