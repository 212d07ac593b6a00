//! Dispatcher: backoff arithmetic and the scheduling loop.
pub mod backoff;
pub mod scheduler;

pub use backoff::{backoff_delay, lease_expired, next_attempt_at, short_retry_delay};
pub use scheduler::{Dispatcher, RoundStats};
