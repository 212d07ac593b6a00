//! Per-host request pacing for crawler workers.
//!
//! Each host gets a next-allowed slot; a caller reserves the slot under
//! the write lock and sleeps outside it, so concurrent workers against
//! one host space themselves out without a global lock.
use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::RwLock;

use crate::core::types::HostId;

pub struct HostPacer {
    slots: RwLock<HashMap<HostId, DateTime<Utc>>>,
}

impl Default for HostPacer {
    fn default() -> Self {
        Self::new()
    }
}

impl HostPacer {
    pub fn new() -> Self {
        Self {
            slots: RwLock::new(HashMap::new()),
        }
    }

    /// Reserve the next request slot for the host and wait until it
    /// arrives. A spacing of zero is a no-op.
    pub async fn wait_turn(&self, host_id: &HostId, min_spacing_secs: u64) {
        if min_spacing_secs == 0 {
            return;
        }
        let wait = {
            let mut slots = self.slots.write().await;
            let now = Utc::now();
            let next_free = slots.get(host_id).copied().unwrap_or(now);
            let start = next_free.max(now);
            slots.insert(
                host_id.clone(),
                start + Duration::seconds(min_spacing_secs as i64),
            );
            start - now
        };
        if wait > Duration::zero() {
            if let Ok(std_wait) = wait.to_std() {
                tokio::time::sleep(std_wait).await;
            }
        }
    }

    /// Drop slots that are already in the past to bound memory.
    pub async fn cleanup(&self) {
        let mut slots = self.slots.write().await;
        let now = Utc::now();
        slots.retain(|_, next_free| *next_free > now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn zero_spacing_never_waits() {
        let pacer = HostPacer::new();
        let host = HostId::generate();
        let start = std::time::Instant::now();
        for _ in 0..10 {
            pacer.wait_turn(&host, 0).await;
        }
        assert!(start.elapsed() < std::time::Duration::from_millis(50));
    }

    #[tokio::test]
    async fn consecutive_turns_reserve_increasing_slots() {
        let pacer = HostPacer::new();
        let host = HostId::generate();
        pacer.wait_turn(&host, 1).await;
        {
            let slots = pacer.slots.read().await;
            let next = slots.get(&host).copied().unwrap();
            assert!(next > Utc::now());
        }
        // A different host is unaffected.
        let other = HostId::generate();
        let start = std::time::Instant::now();
        pacer.wait_turn(&other, 0).await;
        assert!(start.elapsed() < std::time::Duration::from_millis(50));
    }
}
