//! Parser worker: consumes parse jobs, routes to the registered handler
//! by tag, and writes products to the sink.
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::broker::adapter::BrokerAdapter;
use crate::broker::message::{Delivery, ParseJob, QueueName};
use crate::config::WorkerConfig;
use crate::core::error::{ErrorKind, Result};
use crate::core::traits::{BlobStore, ProductParser, ProductSink, TaskStore};
use crate::core::types::{ParserTag, TaskStatus};
use crate::storage::product::ProductRecord;
use crate::store::model::{AttemptOutcome, TaskPatch};

/// Tag → handler lookup table; hosts select their parser by tag.
#[derive(Default)]
pub struct ParserRegistry {
    handlers: HashMap<ParserTag, Arc<dyn ProductParser>>,
}

impl ParserRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tag: ParserTag, handler: Arc<dyn ProductParser>) {
        self.handlers.insert(tag, handler);
    }

    pub fn get(&self, tag: &ParserTag) -> Option<Arc<dyn ProductParser>> {
        self.handlers.get(tag).cloned()
    }

    pub fn tags(&self) -> Vec<ParserTag> {
        self.handlers.keys().cloned().collect()
    }
}

/// Minimal handler: records the body size without interpreting it.
/// Useful as a default registration and in tests.
pub struct NoopParser;

#[async_trait]
impl ProductParser for NoopParser {
    async fn parse(&self, job: &ParseJob, html: &Bytes) -> Result<serde_json::Value> {
        Ok(serde_json::json!({
            "blob_ref": job.blob_ref.as_str(),
            "content_length": html.len(),
        }))
    }
}

pub struct ParserWorker {
    id: String,
    store: Arc<dyn TaskStore>,
    broker: Arc<BrokerAdapter>,
    blobs: Arc<dyn BlobStore>,
    registry: Arc<ParserRegistry>,
    sink: Arc<dyn ProductSink>,
    cfg: WorkerConfig,
    prefetch: usize,
}

impl ParserWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: impl Into<String>,
        store: Arc<dyn TaskStore>,
        broker: Arc<BrokerAdapter>,
        blobs: Arc<dyn BlobStore>,
        registry: Arc<ParserRegistry>,
        sink: Arc<dyn ProductSink>,
        cfg: WorkerConfig,
        prefetch: usize,
    ) -> Self {
        Self {
            id: id.into(),
            store,
            broker,
            blobs,
            registry,
            sink,
            cfg,
            prefetch,
        }
    }

    pub async fn run(&self, cancel: CancellationToken) {
        self.broker
            .register_parse_consumer(&self.id, self.prefetch)
            .await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.broker.disconnect_consumer(&self.id).await;
                    debug!(worker = %self.id, "parser worker stopped");
                    break;
                }
                next = self.broker.next_parse_job(&self.id, Utc::now()) => {
                    match next {
                        Ok(Some(delivery)) => {
                            if let Err(e) = self.handle(delivery).await {
                                warn!(worker = %self.id, error = %e, "parse delivery failed");
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

    pub async fn handle(&self, delivery: Delivery<ParseJob>) -> Result<()> {
        let job = delivery.payload.clone();

        let claimed = self
            .store
            .transition(
                &job.task_id,
                &[TaskStatus::QueuedParse],
                TaskStatus::Parsing,
                TaskPatch::none(),
            )
            .await?;
        if !claimed {
            debug!(worker = %self.id, task_id = %job.task_id, "stale parse delivery, re-acking");
            self.broker.ack(QueueName::Parse, &delivery.tag).await?;
            return Ok(());
        }

        let html = match self.blobs.get(&job.blob_ref).await {
            Ok(body) => body,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                self.record_terminal(&job, "downloaded html no longer available")
                    .await;
                self.broker.ack(QueueName::Parse, &delivery.tag).await?;
                return Ok(());
            }
            Err(_) => {
                // Storage hiccup: give the message back for redelivery.
                self.requeue(&job, &delivery).await?;
                return Ok(());
            }
        };

        let handler = match self.registry.get(&job.parser_tag) {
            Some(h) => h,
            None => {
                self.record_terminal(
                    &job,
                    &format!("no parser registered for tag {}", job.parser_tag),
                )
                .await;
                self.broker.ack(QueueName::Parse, &delivery.tag).await?;
                return Ok(());
            }
        };

        let parsed = match handler.parse(&job, &html).await {
            Ok(fields) => fields,
            Err(e) => {
                self.handle_parse_failure(&job, &delivery, &e.to_string())
                    .await?;
                return Ok(());
            }
        };

        let task = self.store.get_task(&job.task_id).await?;
        let record = ProductRecord {
            task_id: job.task_id.clone(),
            host_id: job.host_id.clone(),
            url: task.url,
            parser_tag: job.parser_tag.clone(),
            fields: parsed,
            parsed_at: Utc::now(),
        };
        if let Err(e) = self.sink.write(&record).await {
            self.handle_parse_failure(&job, &delivery, &format!("product write failed: {}", e))
                .await?;
            return Ok(());
        }

        if let Err(e) = self
            .store
            .record_attempt(&job.task_id, AttemptOutcome::ParseSuccess, Utc::now())
            .await
        {
            if e.is_benign_race() {
                debug!(task_id = %job.task_id, "parse success dropped, task moved by admin");
            } else {
                warn!(task_id = %job.task_id, error = %e, "failed to record parse success");
            }
        }
        self.broker.ack(QueueName::Parse, &delivery.tag).await?;
        Ok(())
    }

    /// Transient failure: within the delivery budget the message is
    /// nacked for redelivery; past it the failure is recorded against
    /// the task (backoff or terminal).
    async fn handle_parse_failure(
        &self,
        job: &ParseJob,
        delivery: &Delivery<ParseJob>,
        reason: &str,
    ) -> Result<()> {
        if delivery.delivery_count < self.cfg.max_parse_deliveries {
            warn!(
                task_id = %job.task_id,
                delivery_count = delivery.delivery_count,
                reason,
                "parse failed, redelivering"
            );
            self.requeue(job, delivery).await?;
        } else {
            if let Err(e) = self
                .store
                .record_attempt(
                    &job.task_id,
                    AttemptOutcome::TransientFailure {
                        error: reason.to_string(),
                    },
                    Utc::now(),
                )
                .await
            {
                if !e.is_benign_race() {
                    warn!(task_id = %job.task_id, error = %e, "failed to record parse failure");
                }
            }
            self.broker.ack(QueueName::Parse, &delivery.tag).await?;
        }
        Ok(())
    }

    async fn requeue(&self, job: &ParseJob, delivery: &Delivery<ParseJob>) -> Result<()> {
        self.store
            .transition(
                &job.task_id,
                &[TaskStatus::Parsing],
                TaskStatus::QueuedParse,
                TaskPatch::none(),
            )
            .await?;
        self.broker.nack(QueueName::Parse, &delivery.tag, true).await?;
        Ok(())
    }

    async fn record_terminal(&self, job: &ParseJob, reason: &str) {
        if let Err(e) = self
            .store
            .record_attempt(
                &job.task_id,
                AttemptOutcome::TerminalFailure {
                    error: reason.to_string(),
                },
                Utc::now(),
            )
            .await
        {
            if !e.is_benign_race() {
                warn!(task_id = %job.task_id, error = %e, "failed to record terminal failure");
            }
        }
    }
}
