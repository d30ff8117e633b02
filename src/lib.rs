pub mod api;
pub mod appresult;
pub mod backoff;
pub mod config;
pub mod events;
pub mod gateway;
pub mod ingest;
pub mod logging;
pub mod presence;
pub mod queue;
pub mod relay;
pub mod store;

use std::{sync::Arc, time::Instant};

use axum::extract::FromRef;
use time::OffsetDateTime;

pub use appresult::{AppError, AppResult};

use crate::{gateway::Gateway, presence::PresenceTracker, queue::DurableQueue, relay::RelayBus, store::Store};

#[derive(Clone, FromRef)]
pub struct AppState {
    pub store: Store,
    pub relay: Arc<dyn RelayBus>,
    pub queue: Arc<dyn DurableQueue>,
    pub presence: PresenceTracker,
    pub gateway: Arc<Gateway>,
    pub started_at: Instant,
}

/// Milliseconds since the unix epoch, the resolution timestamps are stored at.
pub fn unix_millis(at: OffsetDateTime) -> i64 {
    (at.unix_timestamp_nanos() / 1_000_000) as i64
}

pub fn from_unix_millis(millis: i64) -> OffsetDateTime {
    OffsetDateTime::from_unix_timestamp_nanos(millis as i128 * 1_000_000)
        .unwrap_or(OffsetDateTime::UNIX_EPOCH)
}
