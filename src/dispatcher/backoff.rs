//! Pure retry-delay and lease-deadline arithmetic.
//!
//! Kept free of store and broker types so the curves are unit-testable
//! in isolation.
use chrono::{DateTime, Duration, Utc};
use rand::Rng;

use crate::config::{BackoffConfig, DispatcherConfig, StateDeadlines};
use crate::core::types::TaskStatus;

/// Delay before retry number `retry_count` (1-based):
/// `base * 2^(retry_count - 1)`, capped.
pub fn backoff_delay(retry_count: u32, cfg: &BackoffConfig) -> Duration {
    let exponent = retry_count.saturating_sub(1).min(32);
    let secs = cfg
        .base_secs
        .saturating_mul(1u64 << exponent)
        .min(cfg.cap_secs);
    Duration::seconds(secs as i64)
}

/// Wall-clock moment of the next attempt after a transient failure.
pub fn next_attempt_at(now: DateTime<Utc>, retry_count: u32, cfg: &BackoffConfig) -> DateTime<Utc> {
    now + backoff_delay(retry_count, cfg)
}

/// Whether a leased task has outlived its per-state deadline.
pub fn lease_expired(
    status: TaskStatus,
    entered_at: DateTime<Utc>,
    deadlines: &StateDeadlines,
    now: DateTime<Utc>,
) -> bool {
    deadlines
        .for_status(status)
        .map(|ttl| entered_at + Duration::seconds(ttl as i64) < now)
        .unwrap_or(false)
}

/// Delay for tasks bounced back to pending (publish failure, proxy
/// starvation); jittered up to 25% to spread the re-dispatch.
pub fn short_retry_delay(cfg: &DispatcherConfig) -> Duration {
    let base = cfg.short_retry_delay_secs;
    let jitter = if base >= 4 {
        rand::thread_rng().gen_range(0..=base / 4)
    } else {
        0
    };
    Duration::seconds((base + jitter) as i64)
}
