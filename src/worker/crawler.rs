//! Crawler worker: consumes crawl jobs, downloads pages through
//! allocated proxies, and hands successful downloads to the parse queue.
use std::sync::Arc;
use std::time::{Duration as StdDuration, Instant};

use bytes::Bytes;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::broker::adapter::{BrokerAdapter, CrawlDelivery};
use crate::broker::message::ParseJob;
use crate::config::{DispatcherConfig, WorkerConfig};
use crate::core::error::{ErrorKind, Result};
use crate::core::traits::{BlobStore, TaskStore};
use crate::core::types::TaskStatus;
use crate::dispatcher::backoff::short_retry_delay;
use crate::logging::events::TaskEventLogger;
use crate::proxy::allocator::ProxyAllocator;
use crate::proxy::model::{ProxyHandle, ReleaseOutcome};
use crate::store::model::{AttemptOutcome, Host, TaskPatch};
use crate::worker::pacer::HostPacer;

/// HTTP statuses worth another attempt.
pub fn is_transient_http(status: u16) -> bool {
    matches!(status, 408 | 429 | 500..=599)
}

struct FetchSuccess {
    status: u16,
    body: Bytes,
    latency_ms: u64,
}

pub struct CrawlerWorker {
    id: String,
    store: Arc<dyn TaskStore>,
    broker: Arc<BrokerAdapter>,
    allocator: Arc<ProxyAllocator>,
    blobs: Arc<dyn BlobStore>,
    pacer: HostPacer,
    events: TaskEventLogger,
    cfg: WorkerConfig,
    dispatcher_cfg: DispatcherConfig,
    prefetch: usize,
}

impl CrawlerWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: impl Into<String>,
        store: Arc<dyn TaskStore>,
        broker: Arc<BrokerAdapter>,
        allocator: Arc<ProxyAllocator>,
        blobs: Arc<dyn BlobStore>,
        cfg: WorkerConfig,
        dispatcher_cfg: DispatcherConfig,
        prefetch: usize,
    ) -> Self {
        let id = id.into();
        Self {
            events: TaskEventLogger::new(id.clone()),
            id,
            store,
            broker,
            allocator,
            blobs,
            pacer: HostPacer::new(),
            cfg,
            dispatcher_cfg,
            prefetch,
        }
    }

    /// Settle the proxy lease and log the binding's resulting health.
    async fn release_proxy(&self, handle: &ProxyHandle, outcome: ReleaseOutcome) -> Result<()> {
        let summary = self.allocator.release(handle, outcome).await?;
        self.events.log_proxy_health(
            &handle.host_id,
            &handle.proxy_id,
            summary.binding_active,
            summary.consecutive_failures,
        );
        Ok(())
    }

    /// Consume crawl jobs (priority queue first) until cancelled.
    pub async fn run(&self, cancel: CancellationToken) {
        self.broker
            .register_crawl_consumer(&self.id, self.prefetch)
            .await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.broker.disconnect_consumer(&self.id).await;
                    debug!(worker = %self.id, "crawler worker stopped");
                    break;
                }
                next = self.broker.next_crawl_job(&self.id, Utc::now()) => {
                    match next {
                        Ok(Some(delivery)) => {
                            if let Err(e) = self.handle(delivery).await {
                                warn!(worker = %self.id, error = %e, "crawl delivery failed");
                            }
                        }
                        Ok(None) => {
                            tokio::time::sleep(StdDuration::from_millis(self.cfg.poll_interval_ms))
                                .await;
                        }
                        Err(e) => {
                            warn!(worker = %self.id, error = %e, "broker poll failed");
                            tokio::time::sleep(StdDuration::from_millis(self.cfg.poll_interval_ms))
                                .await;
                        }
                    }
                }
            }
        }
    }

    /// Process one delivery end to end. Errors that escape here leave
    /// the message unacked for visibility-timeout redelivery.
    pub async fn handle(&self, delivery: CrawlDelivery) -> Result<()> {
        let job = delivery.delivery.payload.clone();

        // Stage-entry re-check: a pause, cancel, or duplicate delivery
        // loses this CAS and the message is settled without work.
        let claimed = self
            .store
            .transition(
                &job.task_id,
                &[TaskStatus::Queued],
                TaskStatus::Crawling,
                TaskPatch::started(Utc::now()),
            )
            .await?;
        if !claimed {
            debug!(worker = %self.id, task_id = %job.task_id, "stale crawl delivery, re-acking");
            self.broker.ack(delivery.queue, &delivery.delivery.tag).await?;
            return Ok(());
        }

        let host = match self.store.get_host(&job.host_id).await {
            Ok(h) => h,
            Err(e) => {
                self.record(&job, AttemptOutcome::TerminalFailure {
                    error: format!("host lookup failed: {}", e),
                })
                .await;
                self.broker.ack(delivery.queue, &delivery.delivery.tag).await?;
                return Ok(());
            }
        };

        self.pacer.wait_turn(&job.host_id, host.min_spacing_secs).await;

        let handle = match self.allocator.acquire(&job.host_id, Utc::now()).await {
            Ok(h) => h,
            Err(e) if e.kind() == ErrorKind::NoProxyAvailable => {
                // Retryable without consuming a retry: back to pending
                // after a short delay.
                let retry_at = Utc::now() + short_retry_delay(&self.dispatcher_cfg);
                self.store
                    .transition(
                        &job.task_id,
                        &[TaskStatus::Crawling],
                        TaskStatus::Pending,
                        TaskPatch::scheduled(retry_at),
                    )
                    .await?;
                debug!(worker = %self.id, task_id = %job.task_id, "no proxy available, deferred");
                self.broker.ack(delivery.queue, &delivery.delivery.tag).await?;
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        match self.fetch_with_retries(&job.url, &host, &handle).await {
            Ok(fetch) if (200..300).contains(&fetch.status) => {
                self.release_proxy(&handle, ReleaseOutcome::Success {
                    latency_ms: fetch.latency_ms,
                })
                .await?;
                self.finish_download(&job, &host, &handle, fetch).await?;
            }
            Ok(fetch) => {
                // The proxy spoke to the origin; the failure belongs to
                // the target, not the identity.
                self.release_proxy(&handle, ReleaseOutcome::Success {
                    latency_ms: fetch.latency_ms,
                })
                .await?;
                let outcome = if is_transient_http(fetch.status) {
                    AttemptOutcome::TransientFailure {
                        error: format!("http status {}", fetch.status),
                    }
                } else {
                    AttemptOutcome::TerminalFailure {
                        error: format!("http status {}", fetch.status),
                    }
                };
                self.record(&job, outcome).await;
            }
            Err(reason) => {
                self.release_proxy(&handle, ReleaseOutcome::Failure {
                    reason: reason.clone(),
                })
                .await?;
                self.record(&job, AttemptOutcome::TransientFailure { error: reason })
                    .await;
            }
        }

        self.broker.ack(delivery.queue, &delivery.delivery.tag).await?;
        Ok(())
    }

    async fn finish_download(
        &self,
        job: &crate::broker::message::CrawlJob,
        host: &Host,
        handle: &ProxyHandle,
        fetch: FetchSuccess,
    ) -> Result<()> {
        let blob_ref = self
            .blobs
            .put_if_absent(&job.task_id, job.attempt, fetch.body)
            .await?
            .blob_ref();

        self.record(job, AttemptOutcome::DownloadSuccess {
            blob_ref: blob_ref.clone(),
            http_code: fetch.status,
            latency_ms: fetch.latency_ms,
            proxy_id: Some(handle.proxy_id.clone()),
        })
        .await;

        // Hand off to the parse queue; on publish failure the row stays
        // in Downloaded and the dispatcher re-publishes next round.
        let moved = self
            .store
            .transition(
                &job.task_id,
                &[TaskStatus::Downloaded],
                TaskStatus::QueuedParse,
                TaskPatch::none(),
            )
            .await?;
        if moved {
            let parse_job = ParseJob {
                task_id: job.task_id.clone(),
                host_id: job.host_id.clone(),
                blob_ref,
                parser_tag: host.parser_tag.clone(),
                attempt: job.attempt,
            };
            if let Err(e) = self.broker.publish_parse(parse_job, Utc::now()).await {
                warn!(task_id = %job.task_id, error = %e, "parse publish failed, reverting");
                self.store
                    .transition(
                        &job.task_id,
                        &[TaskStatus::QueuedParse],
                        TaskStatus::Downloaded,
                        TaskPatch::none(),
                    )
                    .await?;
            }
        }
        Ok(())
    }

    /// Record an outcome, treating a lost CAS (admin moved the task
    /// mid-flight) as benign.
    async fn record(&self, job: &crate::broker::message::CrawlJob, outcome: AttemptOutcome) {
        if let Err(e) = self
            .store
            .record_attempt(&job.task_id, outcome, Utc::now())
            .await
        {
            if e.is_benign_race() {
                debug!(task_id = %job.task_id, "attempt outcome dropped, task moved by admin");
            } else {
                warn!(task_id = %job.task_id, error = %e, "failed to record attempt");
            }
        }
    }

    async fn fetch_with_retries(
        &self,
        url: &str,
        host: &Host,
        handle: &ProxyHandle,
    ) -> std::result::Result<FetchSuccess, String> {
        let client = self
            .build_client(host, handle)
            .map_err(|e| format!("client build failed: {}", e))?;

        let attempts = self.cfg.max_inner_attempts.max(1);
        let mut last_error = String::new();
        for attempt in 0..attempts {
            let start = Instant::now();
            match client.get(url).send().await {
                Ok(response) => {
                    let status = response.status().as_u16();
                    match response.bytes().await {
                        Ok(body) => {
                            return Ok(FetchSuccess {
                                status,
                                body,
                                latency_ms: start.elapsed().as_millis() as u64,
                            });
                        }
                        Err(e) => last_error = format!("body read failed: {}", e),
                    }
                }
                Err(e) => last_error = format!("request failed: {}", e),
            }
            debug!(url, attempt, error = %last_error, "fetch attempt failed");
        }
        Err(last_error)
    }

    fn build_client(&self, host: &Host, handle: &ProxyHandle) -> reqwest::Result<reqwest::Client> {
        let user_agent = host
            .user_agent
            .clone()
            .unwrap_or_else(|| self.cfg.user_agent.clone());
        let mut proxy = reqwest::Proxy::all(handle.endpoint.url())?;
        if let (Some(user), Some(pass)) =
            (&handle.endpoint.username, &handle.endpoint.password)
        {
            proxy = proxy.basic_auth(user, pass);
        }
        reqwest::Client::builder()
            .timeout(StdDuration::from_secs(self.cfg.http_timeout_secs))
            .user_agent(user_agent)
            .proxy(proxy)
            .build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_http_classification() {
        assert!(is_transient_http(500));
        assert!(is_transient_http(503));
        assert!(is_transient_http(429));
        assert!(is_transient_http(408));
        assert!(!is_transient_http(404));
        assert!(!is_transient_http(403));
        assert!(!is_transient_http(200));
    }
}
