//! Three-queue broker adapter with priority routing and snapshot
//! durability.
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::fs;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::broker::message::{CrawlJob, Delivery, DeliveryTag, ParseJob, QueueName};
use crate::broker::queue::{DurableQueue, QueueDepth, QueueOptions, QueueState};
use crate::config::BrokerConfig;
use crate::core::error::{OrchestratorError, Result};

/// A crawl delivery together with the queue it must be settled on.
#[derive(Debug, Clone)]
pub struct CrawlDelivery {
    pub queue: QueueName,
    pub delivery: Delivery<CrawlJob>,
}

pub struct BrokerAdapter {
    crawl: DurableQueue<CrawlJob>,
    priority: DurableQueue<CrawlJob>,
    parse: DurableQueue<ParseJob>,
    snapshot_dir: Option<PathBuf>,
    mirrored: bool,
}

impl BrokerAdapter {
    pub fn new(cfg: &BrokerConfig) -> Self {
        let work_opts = |ttl: u64| QueueOptions {
            durable: true,
            max_length: cfg.max_length,
            message_ttl_secs: ttl,
            visibility_timeout_secs: cfg.visibility_timeout_secs,
        };
        Self {
            crawl: DurableQueue::new("crawl", work_opts(cfg.ttl_work_secs)),
            priority: DurableQueue::new("priority", work_opts(cfg.ttl_priority_secs)),
            parse: DurableQueue::new("parse", work_opts(cfg.ttl_work_secs)),
            snapshot_dir: cfg.snapshot_dir.clone(),
            mirrored: cfg.mirrored,
        }
    }

    /// Route a crawl job: expedited priorities skip the default queue.
    pub async fn publish_crawl(&self, job: CrawlJob, now: DateTime<Utc>) -> Result<QueueName> {
        if job.priority.is_expedited() {
            self.priority.publish(job, now).await?;
            Ok(QueueName::Priority)
        } else {
            self.crawl.publish(job, now).await?;
            Ok(QueueName::Crawl)
        }
    }

    pub async fn publish_parse(&self, job: ParseJob, now: DateTime<Utc>) -> Result<DeliveryTag> {
        self.parse.publish(job, now).await
    }

    /// Register a crawler-side consumer on both crawl queues.
    pub async fn register_crawl_consumer(&self, consumer_id: &str, prefetch: usize) {
        self.priority.register_consumer(consumer_id, prefetch).await;
        self.crawl.register_consumer(consumer_id, prefetch).await;
    }

    pub async fn register_parse_consumer(&self, consumer_id: &str, prefetch: usize) {
        self.parse.register_consumer(consumer_id, prefetch).await;
    }

    pub async fn disconnect_consumer(&self, consumer_id: &str) {
        self.priority.disconnect_consumer(consumer_id).await;
        self.crawl.disconnect_consumer(consumer_id).await;
        self.parse.disconnect_consumer(consumer_id).await;
    }

    /// Next crawl job for a consumer, draining the priority queue first.
    pub async fn next_crawl_job(
        &self,
        consumer_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<CrawlDelivery>> {
        if let Some(delivery) = self.priority.pop(consumer_id, now).await? {
            return Ok(Some(CrawlDelivery {
                queue: QueueName::Priority,
                delivery,
            }));
        }
        if let Some(delivery) = self.crawl.pop(consumer_id, now).await? {
            return Ok(Some(CrawlDelivery {
                queue: QueueName::Crawl,
                delivery,
            }));
        }
        Ok(None)
    }

    pub async fn next_parse_job(
        &self,
        consumer_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Delivery<ParseJob>>> {
        self.parse.pop(consumer_id, now).await
    }

    pub async fn ack(&self, queue: QueueName, tag: &DeliveryTag) -> Result<bool> {
        match queue {
            QueueName::Crawl => self.crawl.ack(tag).await,
            QueueName::Priority => self.priority.ack(tag).await,
            QueueName::Parse => self.parse.ack(tag).await,
        }
    }

    pub async fn nack(&self, queue: QueueName, tag: &DeliveryTag, requeue: bool) -> Result<bool> {
        match queue {
            QueueName::Crawl => self.crawl.nack(tag, requeue).await,
            QueueName::Priority => self.priority.nack(tag, requeue).await,
            QueueName::Parse => self.parse.nack(tag, requeue).await,
        }
    }

    /// Redeliver timed-out messages and drop expired ones on all queues.
    pub async fn sweep(&self, now: DateTime<Utc>) {
        let (crawl, priority, parse) = futures::join!(
            self.crawl.sweep(now),
            self.priority.sweep(now),
            self.parse.sweep(now)
        );
        for (name, (redelivered, expired)) in [
            (QueueName::Crawl, crawl),
            (QueueName::Priority, priority),
            (QueueName::Parse, parse),
        ] {
            if redelivered > 0 || expired > 0 {
                debug!(
                    queue = %name,
                    redelivered,
                    expired,
                    "queue sweep"
                );
            }
        }
    }

    pub async fn depth(&self, queue: QueueName) -> QueueDepth {
        match queue {
            QueueName::Crawl => self.crawl.depth().await,
            QueueName::Priority => self.priority.depth().await,
            QueueName::Parse => self.parse.depth().await,
        }
    }

    pub async fn capacity_remaining(&self, queue: QueueName) -> usize {
        match queue {
            QueueName::Crawl => self.crawl.capacity_remaining().await,
            QueueName::Priority => self.priority.capacity_remaining().await,
            QueueName::Parse => self.parse.capacity_remaining().await,
        }
    }

    /// Persist all three queues to the snapshot directory; with
    /// mirroring on, each queue gets a second copy so one lost file is
    /// survivable.
    pub async fn save_state(&self) -> Result<()> {
        let dir = match &self.snapshot_dir {
            Some(d) => d.clone(),
            None => return Ok(()),
        };
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| OrchestratorError::BrokerUnavailable(format!("snapshot dir: {}", e)))?;

        write_queue_state(&dir, &self.crawl.snapshot().await, self.mirrored).await?;
        write_queue_state(&dir, &self.priority.snapshot().await, self.mirrored).await?;
        write_queue_state(&dir, &self.parse.snapshot().await, self.mirrored).await?;
        Ok(())
    }

    /// Restore queue contents from the snapshot directory, falling back
    /// to the mirror copy per queue. Missing files leave a queue empty.
    pub async fn load_state(&self) -> Result<()> {
        let dir = match &self.snapshot_dir {
            Some(d) => d.clone(),
            None => return Ok(()),
        };
        if let Some(state) = read_queue_state::<CrawlJob>(&dir, "crawl").await {
            self.crawl.restore(state).await;
        }
        if let Some(state) = read_queue_state::<CrawlJob>(&dir, "priority").await {
            self.priority.restore(state).await;
        }
        if let Some(state) = read_queue_state::<ParseJob>(&dir, "parse").await {
            self.parse.restore(state).await;
        }
        info!(dir = %dir.display(), "broker queues restored");
        Ok(())
    }

    /// Periodic maintenance: sweep redelivery/TTL and checkpoint.
    pub fn start_maintenance(
        broker: Arc<BrokerAdapter>,
        interval: StdDuration,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(interval);
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = timer.tick() => {
                        broker.sweep(Utc::now()).await;
                        if let Err(e) = broker.save_state().await {
                            error!(error = %e, "broker checkpoint failed");
                        }
                    }
                }
            }
        })
    }
}

async fn write_queue_state<T: Serialize + DeserializeOwned>(
    dir: &Path,
    state: &QueueState<T>,
    mirrored: bool,
) -> Result<()> {
    let json = serde_json::to_string(state)
        .map_err(|e| OrchestratorError::BrokerUnavailable(format!("snapshot encode: {}", e)))?;
    let primary = dir.join(format!("{}.json", state.name));
    fs::write(&primary, &json)
        .await
        .map_err(|e| OrchestratorError::BrokerUnavailable(format!("snapshot write: {}", e)))?;
    if mirrored {
        let mirror = dir.join(format!("{}.mirror.json", state.name));
        fs::write(&mirror, &json)
            .await
            .map_err(|e| OrchestratorError::BrokerUnavailable(format!("mirror write: {}", e)))?;
    }
    Ok(())
}

async fn read_queue_state<T: Serialize + DeserializeOwned>(
    dir: &Path,
    name: &str,
) -> Option<QueueState<T>> {
    for candidate in [
        dir.join(format!("{}.json", name)),
        dir.join(format!("{}.mirror.json", name)),
    ] {
        match fs::read_to_string(&candidate).await {
            Ok(raw) => match serde_json::from_str(&raw) {
                Ok(state) => return Some(state),
                Err(e) => {
                    error!(path = %candidate.display(), error = %e, "corrupt queue snapshot");
                }
            },
            Err(_) => continue,
        }
    }
    None
}
