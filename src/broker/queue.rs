//! Durable at-least-once queue with prefetch, TTL, and visibility
//! timeout redelivery.
use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Duration, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::broker::message::{Delivery, DeliveryTag};
use crate::core::error::{OrchestratorError, Result};

/// Declaration-time queue properties.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueOptions {
    pub durable: bool,
    /// Resident cap (ready + unacked); publishing past it is refused.
    pub max_length: usize,
    pub message_ttl_secs: u64,
    /// Unacked deliveries older than this are redelivered by the sweep.
    pub visibility_timeout_secs: u64,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            durable: true,
            max_length: 10_000,
            message_ttl_secs: 86_400,
            visibility_timeout_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound(serialize = "T: Serialize", deserialize = "T: DeserializeOwned"))]
struct Envelope<T> {
    tag: DeliveryTag,
    payload: T,
    enqueued_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    delivery_count: u32,
}

struct InFlight<T> {
    envelope: Envelope<T>,
    consumer_id: String,
    delivered_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
struct ConsumerState {
    prefetch: usize,
    in_flight: usize,
}

struct QueueInner<T> {
    ready: VecDeque<Envelope<T>>,
    unacked: HashMap<DeliveryTag, InFlight<T>>,
    consumers: HashMap<String, ConsumerState>,
    expired_dropped: u64,
    redelivered: u64,
}

/// Point-in-time queue metrics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueDepth {
    pub ready: usize,
    pub unacked: usize,
    pub expired_dropped: u64,
    pub redelivered: u64,
}

/// Serializable queue contents for snapshot persistence; unacked
/// deliveries fold back into `ready` on restore.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound(serialize = "T: Serialize", deserialize = "T: DeserializeOwned"))]
pub struct QueueState<T> {
    pub name: String,
    messages: Vec<Envelope<T>>,
    pub saved_at: DateTime<Utc>,
}

pub struct DurableQueue<T> {
    name: String,
    opts: QueueOptions,
    inner: RwLock<QueueInner<T>>,
}

impl<T> DurableQueue<T>
where
    T: Clone + Serialize + DeserializeOwned + Send + Sync,
{
    pub fn new(name: impl Into<String>, opts: QueueOptions) -> Self {
        Self {
            name: name.into(),
            opts,
            inner: RwLock::new(QueueInner {
                ready: VecDeque::new(),
                unacked: HashMap::new(),
                consumers: HashMap::new(),
                expired_dropped: 0,
                redelivered: 0,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn options(&self) -> &QueueOptions {
        &self.opts
    }

    /// Enqueue a message; refused with `BrokerUnavailable` at capacity.
    pub async fn publish(&self, payload: T, now: DateTime<Utc>) -> Result<DeliveryTag> {
        let mut inner = self.inner.write().await;
        if inner.ready.len() + inner.unacked.len() >= self.opts.max_length {
            return Err(OrchestratorError::BrokerUnavailable(format!(
                "queue {} at capacity ({})",
                self.name, self.opts.max_length
            )));
        }
        let envelope = Envelope {
            tag: DeliveryTag::generate(),
            payload,
            enqueued_at: now,
            expires_at: now + Duration::seconds(self.opts.message_ttl_secs as i64),
            delivery_count: 0,
        };
        let tag = envelope.tag.clone();
        inner.ready.push_back(envelope);
        Ok(tag)
    }

    /// Register a consumer with its prefetch window. Re-registering
    /// adjusts the prefetch and keeps in-flight accounting.
    pub async fn register_consumer(&self, consumer_id: &str, prefetch: usize) {
        let mut inner = self.inner.write().await;
        inner
            .consumers
            .entry(consumer_id.to_string())
            .or_default()
            .prefetch = prefetch.max(1);
    }

    /// Drop a consumer and requeue everything it had in flight.
    pub async fn disconnect_consumer(&self, consumer_id: &str) {
        let mut inner = self.inner.write().await;
        let tags: Vec<DeliveryTag> = inner
            .unacked
            .iter()
            .filter(|(_, f)| f.consumer_id == consumer_id)
            .map(|(tag, _)| tag.clone())
            .collect();
        for tag in tags {
            if let Some(in_flight) = inner.unacked.remove(&tag) {
                inner.ready.push_front(in_flight.envelope);
                inner.redelivered += 1;
            }
        }
        inner.consumers.remove(consumer_id);
        debug!(queue = %self.name, consumer = consumer_id, "consumer disconnected");
    }

    /// Hand the next live message to the consumer, up to its prefetch
    /// window. Expired messages are dropped on the way.
    pub async fn pop(&self, consumer_id: &str, now: DateTime<Utc>) -> Result<Option<Delivery<T>>> {
        let mut inner = self.inner.write().await;
        let state = inner.consumers.get(consumer_id).cloned().ok_or_else(|| {
            OrchestratorError::Validation(format!(
                "consumer {:?} not registered on queue {}",
                consumer_id, self.name
            ))
        })?;
        if state.in_flight >= state.prefetch {
            return Ok(None);
        }

        loop {
            let mut envelope = match inner.ready.pop_front() {
                Some(e) => e,
                None => return Ok(None),
            };
            if envelope.expires_at <= now {
                inner.expired_dropped += 1;
                debug!(queue = %self.name, tag = %envelope.tag, "message expired");
                continue;
            }
            envelope.delivery_count += 1;
            let delivery = Delivery {
                tag: envelope.tag.clone(),
                payload: envelope.payload.clone(),
                delivery_count: envelope.delivery_count,
            };
            inner.unacked.insert(
                envelope.tag.clone(),
                InFlight {
                    envelope,
                    consumer_id: consumer_id.to_string(),
                    delivered_at: now,
                },
            );
            if let Some(c) = inner.consumers.get_mut(consumer_id) {
                c.in_flight += 1;
            }
            return Ok(Some(delivery));
        }
    }

    /// Settle a delivery; `false` when the tag is unknown (already
    /// settled or redelivered elsewhere).
    pub async fn ack(&self, tag: &DeliveryTag) -> Result<bool> {
        let mut inner = self.inner.write().await;
        match inner.unacked.remove(tag) {
            Some(in_flight) => {
                if let Some(c) = inner.consumers.get_mut(&in_flight.consumer_id) {
                    c.in_flight = c.in_flight.saturating_sub(1);
                }
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Negative acknowledgement; requeues at the front for prompt
    /// redelivery, or drops the message.
    pub async fn nack(&self, tag: &DeliveryTag, requeue: bool) -> Result<bool> {
        let mut inner = self.inner.write().await;
        match inner.unacked.remove(tag) {
            Some(in_flight) => {
                if let Some(c) = inner.consumers.get_mut(&in_flight.consumer_id) {
                    c.in_flight = c.in_flight.saturating_sub(1);
                }
                if requeue {
                    inner.ready.push_front(in_flight.envelope);
                    inner.redelivered += 1;
                }
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Redeliver unacked messages past the visibility timeout and drop
    /// expired ready messages. Returns (redelivered, expired).
    pub async fn sweep(&self, now: DateTime<Utc>) -> (usize, usize) {
        let mut inner = self.inner.write().await;
        let timeout = Duration::seconds(self.opts.visibility_timeout_secs as i64);

        let stale: Vec<DeliveryTag> = inner
            .unacked
            .iter()
            .filter(|(_, f)| f.delivered_at + timeout < now)
            .map(|(tag, _)| tag.clone())
            .collect();
        let redelivered = stale.len();
        for tag in stale {
            if let Some(in_flight) = inner.unacked.remove(&tag) {
                if let Some(c) = inner.consumers.get_mut(&in_flight.consumer_id) {
                    c.in_flight = c.in_flight.saturating_sub(1);
                }
                warn!(
                    queue = %self.name,
                    tag = %tag,
                    consumer = %in_flight.consumer_id,
                    "visibility timeout exceeded, redelivering"
                );
                inner.ready.push_front(in_flight.envelope);
                inner.redelivered += 1;
            }
        }

        let before = inner.ready.len();
        inner.ready.retain(|e| e.expires_at > now);
        let expired = before - inner.ready.len();
        inner.expired_dropped += expired as u64;

        (redelivered, expired)
    }

    pub async fn depth(&self) -> QueueDepth {
        let inner = self.inner.read().await;
        QueueDepth {
            ready: inner.ready.len(),
            unacked: inner.unacked.len(),
            expired_dropped: inner.expired_dropped,
            redelivered: inner.redelivered,
        }
    }

    pub async fn capacity_remaining(&self) -> usize {
        let inner = self.inner.read().await;
        self.opts
            .max_length
            .saturating_sub(inner.ready.len() + inner.unacked.len())
    }

    /// Snapshot for durability; in-flight messages are captured as
    /// undelivered so a restart re-offers them.
    pub async fn snapshot(&self) -> QueueState<T> {
        let inner = self.inner.read().await;
        let mut messages: Vec<Envelope<T>> = inner.ready.iter().cloned().collect();
        messages.extend(inner.unacked.values().map(|f| f.envelope.clone()));
        QueueState {
            name: self.name.clone(),
            messages,
            saved_at: Utc::now(),
        }
    }

    /// Replace queue contents from a snapshot; consumer registrations
    /// are runtime state and are not restored.
    pub async fn restore(&self, state: QueueState<T>) {
        let mut inner = self.inner.write().await;
        inner.ready = state.messages.into_iter().collect();
        inner.unacked.clear();
        for consumer in inner.consumers.values_mut() {
            consumer.in_flight = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts(max: usize, ttl: u64, visibility: u64) -> QueueOptions {
        QueueOptions {
            durable: true,
            max_length: max,
            message_ttl_secs: ttl,
            visibility_timeout_secs: visibility,
        }
    }

    #[tokio::test]
    async fn delivers_in_order_and_acks() {
        let q: DurableQueue<u32> = DurableQueue::new("t", opts(10, 60, 30));
        let now = Utc::now();
        q.register_consumer("c1", 10).await;
        q.publish(1, now).await.unwrap();
        q.publish(2, now).await.unwrap();

        let d1 = q.pop("c1", now).await.unwrap().unwrap();
        let d2 = q.pop("c1", now).await.unwrap().unwrap();
        assert_eq!(d1.payload, 1);
        assert_eq!(d2.payload, 2);
        assert_eq!(d1.delivery_count, 1);

        assert!(q.ack(&d1.tag).await.unwrap());
        assert!(!q.ack(&d1.tag).await.unwrap());
        let depth = q.depth().await;
        assert_eq!(depth.ready, 0);
        assert_eq!(depth.unacked, 1);
    }

    #[tokio::test]
    async fn prefetch_limits_in_flight() {
        let q: DurableQueue<u32> = DurableQueue::new("t", opts(10, 60, 30));
        let now = Utc::now();
        q.register_consumer("c1", 2).await;
        for i in 0..5 {
            q.publish(i, now).await.unwrap();
        }
        assert!(q.pop("c1", now).await.unwrap().is_some());
        assert!(q.pop("c1", now).await.unwrap().is_some());
        assert!(q.pop("c1", now).await.unwrap().is_none());

        let d = Delivery {
            tag: DeliveryTag::generate(),
            payload: 0u32,
            delivery_count: 1,
        };
        // Unknown tag does not free a slot.
        assert!(!q.ack(&d.tag).await.unwrap());
        assert!(q.pop("c1", now).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn capacity_refuses_publish() {
        let q: DurableQueue<u32> = DurableQueue::new("t", opts(2, 60, 30));
        let now = Utc::now();
        q.publish(1, now).await.unwrap();
        q.publish(2, now).await.unwrap();
        let err = q.publish(3, now).await.unwrap_err();
        assert_eq!(
            err.kind(),
            crate::core::error::ErrorKind::BrokerUnavailable
        );
    }

    #[tokio::test]
    async fn visibility_timeout_redelivers() {
        let q: DurableQueue<u32> = DurableQueue::new("t", opts(10, 3600, 30));
        let now = Utc::now();
        q.register_consumer("c1", 10).await;
        q.publish(7, now).await.unwrap();
        let d = q.pop("c1", now).await.unwrap().unwrap();
        assert_eq!(d.delivery_count, 1);

        let later = now + Duration::seconds(31);
        let (redelivered, _) = q.sweep(later).await;
        assert_eq!(redelivered, 1);

        let d2 = q.pop("c1", later).await.unwrap().unwrap();
        assert_eq!(d2.payload, 7);
        assert_eq!(d2.delivery_count, 2);
    }

    #[tokio::test]
    async fn ttl_drops_expired_messages() {
        let q: DurableQueue<u32> = DurableQueue::new("t", opts(10, 60, 30));
        let now = Utc::now();
        q.register_consumer("c1", 10).await;
        q.publish(1, now).await.unwrap();
        let later = now + Duration::seconds(61);
        assert!(q.pop("c1", later).await.unwrap().is_none());
        assert_eq!(q.depth().await.expired_dropped, 1);
    }

    #[tokio::test]
    async fn disconnect_requeues_in_flight() {
        let q: DurableQueue<u32> = DurableQueue::new("t", opts(10, 3600, 300));
        let now = Utc::now();
        q.register_consumer("c1", 10).await;
        q.register_consumer("c2", 10).await;
        q.publish(9, now).await.unwrap();
        let _d = q.pop("c1", now).await.unwrap().unwrap();
        q.disconnect_consumer("c1").await;

        let d2 = q.pop("c2", now).await.unwrap().unwrap();
        assert_eq!(d2.payload, 9);
        assert_eq!(d2.delivery_count, 2);
    }

    #[tokio::test]
    async fn snapshot_restore_reoffers_in_flight() {
        let q: DurableQueue<u32> = DurableQueue::new("t", opts(10, 3600, 300));
        let now = Utc::now();
        q.register_consumer("c1", 10).await;
        q.publish(1, now).await.unwrap();
        q.publish(2, now).await.unwrap();
        let _d = q.pop("c1", now).await.unwrap().unwrap();

        let state = q.snapshot().await;
        let q2: DurableQueue<u32> = DurableQueue::new("t", opts(10, 3600, 300));
        q2.register_consumer("c1", 10).await;
        q2.restore(state).await;

        let mut seen = Vec::new();
        while let Some(d) = q2.pop("c1", now).await.unwrap() {
            seen.push(d.payload);
        }
        seen.sort();
        assert_eq!(seen, vec![1, 2]);
    }
}
