//! The dispatch loop: lease reclaim, recurrence materialization, parse
//! publication, and due-task dispatch.
//!
//! Every step is guarded by the store's CAS, so any number of replicas
//! can run the same round concurrently; a lost CAS is skipped, not
//! retried.
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::broker::adapter::BrokerAdapter;
use crate::broker::message::{CrawlJob, ParseJob};
use crate::config::DispatcherConfig;
use crate::core::error::{ErrorKind, Result};
use crate::core::traits::TaskStore;
use crate::core::types::TaskStatus;
use crate::dispatcher::backoff::short_retry_delay;
use crate::logging::events::TaskEventLogger;
use crate::store::model::{AttemptOutcome, TaskPatch};

/// Counters for one dispatch round.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoundStats {
    pub reclaimed: usize,
    pub reclaim_failed: usize,
    pub recurred: usize,
    pub parse_published: usize,
    pub dispatched: usize,
    /// CAS losses to a concurrent dispatcher; benign.
    pub skipped_cas: usize,
    /// Tasks returned to pending because the broker refused the publish.
    pub deferred: usize,
}

pub struct Dispatcher {
    id: String,
    store: Arc<dyn TaskStore>,
    broker: Arc<BrokerAdapter>,
    cfg: DispatcherConfig,
    events: TaskEventLogger,
}

impl Dispatcher {
    pub fn new(
        id: impl Into<String>,
        store: Arc<dyn TaskStore>,
        broker: Arc<BrokerAdapter>,
        cfg: DispatcherConfig,
    ) -> Self {
        let id = id.into();
        Self {
            events: TaskEventLogger::new(id.clone()),
            id,
            store,
            broker,
            cfg,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// One full dispatch round at the given instant.
    pub async fn run_round(&self, now: DateTime<Utc>) -> Result<RoundStats> {
        let mut stats = RoundStats::default();

        self.reclaim_leases(now, &mut stats).await?;
        self.materialize_recurrences(now, &mut stats).await?;
        self.publish_parse_jobs(now, &mut stats).await?;
        self.dispatch_due(now, &mut stats).await?;

        self.events.log_round(
            stats.reclaimed + stats.reclaim_failed,
            stats.recurred,
            stats.parse_published,
            stats.dispatched,
            stats.skipped_cas,
        );
        Ok(stats)
    }

    async fn reclaim_leases(&self, now: DateTime<Utc>, stats: &mut RoundStats) -> Result<()> {
        let report = self.store.reclaim_expired(now).await?;
        for id in &report.requeued {
            self.events.log_reclaimed(id, false);
        }
        for id in &report.failed {
            self.events.log_reclaimed(id, true);
        }
        stats.reclaimed = report.requeued.len();
        stats.reclaim_failed = report.failed.len();
        Ok(())
    }

    async fn materialize_recurrences(
        &self,
        now: DateTime<Utc>,
        stats: &mut RoundStats,
    ) -> Result<()> {
        let due = self.store.due_recurrences(self.cfg.batch_size, now).await?;
        for parent in due {
            match self.store.materialize_recurrence(&parent, now).await {
                Ok(child) => {
                    self.events.log_recurrence(&parent, &child);
                    stats.recurred += 1;
                }
                Err(e) if e.kind() == ErrorKind::Duplicate => {
                    debug!(task_id = %parent, "recurrence skipped, live row exists");
                }
                Err(e) => warn!(task_id = %parent, error = %e, "recurrence failed"),
            }
        }
        Ok(())
    }

    /// Publish `ParseJob`s for rows sitting in `Downloaded`. The crawler
    /// worker usually does this itself; the dispatcher covers parse-only
    /// restarts and workers that died between download and publish.
    async fn publish_parse_jobs(&self, now: DateTime<Utc>, stats: &mut RoundStats) -> Result<()> {
        let rows = self.store.fetch_downloaded(self.cfg.batch_size).await?;
        for task in rows {
            let blob_ref = match &task.blob_ref {
                Some(r) => r.clone(),
                None => {
                    warn!(task_id = %task.id, "downloaded row without blob, failing");
                    self.store
                        .record_attempt(
                            &task.id,
                            AttemptOutcome::TerminalFailure {
                                error: "downloaded row has no blob reference".to_string(),
                            },
                            now,
                        )
                        .await
                        .ok();
                    continue;
                }
            };
            let host = match self.store.get_host(&task.host_id).await {
                Ok(h) => h,
                Err(e) => {
                    warn!(task_id = %task.id, error = %e, "host lookup failed");
                    continue;
                }
            };

            let moved = self
                .store
                .transition(
                    &task.id,
                    &[TaskStatus::Downloaded],
                    TaskStatus::QueuedParse,
                    TaskPatch::none(),
                )
                .await?;
            if !moved {
                stats.skipped_cas += 1;
                continue;
            }
            self.events
                .log_transition(&task.id, TaskStatus::Downloaded, TaskStatus::QueuedParse);

            let job = ParseJob {
                task_id: task.id.clone(),
                host_id: task.host_id.clone(),
                blob_ref,
                parser_tag: host.parser_tag.clone(),
                attempt: task.attempt(),
            };
            match self.broker.publish_parse(job, now).await {
                Ok(_) => stats.parse_published += 1,
                Err(e) => {
                    // Leave the row in Downloaded; the next round retries.
                    self.store
                        .transition(
                            &task.id,
                            &[TaskStatus::QueuedParse],
                            TaskStatus::Downloaded,
                            TaskPatch::none(),
                        )
                        .await?;
                    warn!(task_id = %task.id, error = %e, "parse publish failed");
                    if e.kind() == ErrorKind::BrokerUnavailable {
                        stats.deferred += 1;
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    async fn dispatch_due(&self, now: DateTime<Utc>, stats: &mut RoundStats) -> Result<()> {
        let due = self.store.fetch_due(self.cfg.batch_size, now).await?;
        for task in due {
            let claimed = self
                .store
                .transition(
                    &task.id,
                    &[TaskStatus::Pending],
                    TaskStatus::Queued,
                    TaskPatch::none(),
                )
                .await?;
            if !claimed {
                stats.skipped_cas += 1;
                continue;
            }
            self.events
                .log_transition(&task.id, TaskStatus::Pending, TaskStatus::Queued);

            let job = CrawlJob {
                task_id: task.id.clone(),
                url: task.url.clone(),
                host_id: task.host_id.clone(),
                priority: task.priority,
                proxy_handle: None,
                attempt: task.attempt(),
            };
            match self.broker.publish_crawl(job, now).await {
                Ok(queue) => {
                    self.events
                        .log_dispatched(&task.id, queue.as_str(), task.priority.value());
                    stats.dispatched += 1;
                }
                Err(e) => {
                    // Refused publish: back to pending after a short
                    // delay, and the whole batch pauses.
                    let retry_at = now + short_retry_delay(&self.cfg);
                    self.store
                        .transition(
                            &task.id,
                            &[TaskStatus::Queued],
                            TaskStatus::Pending,
                            TaskPatch::scheduled(retry_at),
                        )
                        .await?;
                    self.events.log_deferred(&task.id, "broker publish failed");
                    stats.deferred += 1;
                    warn!(task_id = %task.id, error = %e, "crawl publish failed, pausing batch");
                    break;
                }
            }
        }
        Ok(())
    }

    /// Drive rounds on the configured cadence until cancelled.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut timer = tokio::time::interval(StdDuration::from_secs(self.cfg.interval_secs.max(1)));
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(dispatcher = %self.id, "dispatcher stopped");
                    break;
                }
                _ = timer.tick() => {
                    if let Err(e) = self.run_round(Utc::now()).await {
                        warn!(dispatcher = %self.id, error = %e, "dispatch round failed");
                    }
                }
            }
        }
    }
}
