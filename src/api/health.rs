use std::time::Instant;

use axum::{debug_handler, extract::State, Json};
use serde_json::{json, Value};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

use crate::{AppResult, AppState};

#[debug_handler(state = AppState)]
pub async fn health(State(started_at): State<Instant>) -> AppResult<Json<Value>> {
    Ok(Json(json!({
        "status": "healthy",
        "uptime": started_at.elapsed().as_secs_f64(),
        "timestamp": OffsetDateTime::now_utc().format(&Rfc3339)?,
        "service": env!("CARGO_PKG_NAME"),
    })))
}
