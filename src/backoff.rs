use std::time::Duration;

use rand::Rng;

pub const BASE_DELAY: Duration = Duration::from_millis(250);
pub const MAX_DELAY: Duration = Duration::from_secs(30);

/// Exponential delay capped at `MAX_DELAY`, plus up to half of it again as
/// jitter so instances do not reconnect in lockstep.
pub fn backoff(attempt: u32) -> Duration {
    let base = BASE_DELAY
        .saturating_mul(2u32.saturating_pow(attempt.min(16)))
        .min(MAX_DELAY);
    let jitter = rand::rng().random_range(0..=base.as_millis() as u64 / 2);
    base + Duration::from_millis(jitter)
}
