//! Trait seams between the orchestration core and its collaborators.
//!
//! Everything a dispatcher, worker, or the control plane touches goes
//! through one of these traits so the engines can be swapped without
//! rewiring callers.
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};

use crate::core::error::Result;
use crate::core::types::{BlobRef, HostId, TaskId, TaskStatus};
use crate::store::model::{
    AttemptOutcome, BulkInsertReport, CrawlTask, Host, HostPatch, NewHost, NewTaskOptions,
    ReclaimReport, TaskPage, TaskPatch, TaskQuery,
};

/// Durable, transactional source of truth for crawl tasks and hosts.
///
/// All mutations are atomic per row; status changes go through the CAS
/// in [`transition`](TaskStore::transition) or the outcome-specific
/// [`record_attempt`](TaskStore::record_attempt).
#[async_trait]
pub trait TaskStore: Send + Sync {
    // Host administration.
    async fn create_host(&self, host: NewHost) -> Result<HostId>;
    async fn update_host(&self, id: &HostId, patch: HostPatch) -> Result<()>;
    async fn get_host(&self, id: &HostId) -> Result<Host>;
    async fn list_hosts(&self) -> Result<Vec<Host>>;

    /// Insert one task; fails with `Duplicate` when a live row of the
    /// same host already holds the URL's fingerprint.
    async fn create_task(
        &self,
        host_id: &HostId,
        url: &str,
        opts: NewTaskOptions,
    ) -> Result<TaskId>;

    /// Insert up to 10,000 URLs with per-item outcome reporting; only a
    /// missing host fails the call as a whole.
    async fn create_tasks_bulk(
        &self,
        host_id: &HostId,
        urls: Vec<String>,
        opts: NewTaskOptions,
    ) -> Result<BulkInsertReport>;

    async fn get_task(&self, id: &TaskId) -> Result<CrawlTask>;

    /// Ready pending rows of active hosts, ordered by
    /// (priority asc, scheduled_at asc), honoring per-host in-flight
    /// caps.
    async fn fetch_due(&self, limit: usize, now: DateTime<Utc>) -> Result<Vec<CrawlTask>>;

    /// Rows sitting in `Downloaded` awaiting parse-queue publication.
    async fn fetch_downloaded(&self, limit: usize) -> Result<Vec<CrawlTask>>;

    /// Conditional status change: applies `to` and `patch` only when the
    /// current status is in `from`; returns `false` when a concurrent
    /// actor won.
    async fn transition(
        &self,
        id: &TaskId,
        from: &[TaskStatus],
        to: TaskStatus,
        patch: TaskPatch,
    ) -> Result<bool>;

    /// Record one worker attempt outcome (download success, parse
    /// success, transient failure with backoff, terminal failure).
    async fn record_attempt(
        &self,
        id: &TaskId,
        outcome: AttemptOutcome,
        now: DateTime<Utc>,
    ) -> Result<()>;

    /// Return leased rows past their per-state deadline to `Pending`,
    /// incrementing the retry counter (terminal `Failed` once retries
    /// are exhausted).
    async fn reclaim_expired(&self, now: DateTime<Utc>) -> Result<ReclaimReport>;

    /// Completed recurring rows whose `next_run_at` has passed.
    async fn due_recurrences(&self, limit: usize, now: DateTime<Utc>) -> Result<Vec<TaskId>>;

    /// Insert a fresh pending row from a completed recurring task and
    /// advance the parent's `next_run_at` by its interval.
    async fn materialize_recurrence(&self, id: &TaskId, now: DateTime<Utc>) -> Result<TaskId>;

    /// Field-only priority update; no broker re-routing happens.
    async fn set_priority(&self, id: &TaskId, priority: crate::core::types::Priority)
        -> Result<()>;

    /// Admin listing with cursor pagination.
    async fn query(&self, query: TaskQuery) -> Result<TaskPage>;
}

/// Write-once page-body storage addressed by (task, attempt).
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Conditional put; a second write to the same address observes the
    /// existing blob instead of overwriting it.
    async fn put_if_absent(&self, task: &TaskId, attempt: u32, body: Bytes) -> Result<PutOutcome>;
    async fn get(&self, blob: &BlobRef) -> Result<Bytes>;
    async fn exists(&self, blob: &BlobRef) -> Result<bool>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PutOutcome {
    Created(BlobRef),
    /// The address was already written by an earlier delivery of the
    /// same attempt.
    AlreadyExists(BlobRef),
}

impl PutOutcome {
    pub fn blob_ref(self) -> BlobRef {
        match self {
            PutOutcome::Created(r) | PutOutcome::AlreadyExists(r) => r,
        }
    }
}

/// One registered parser implementation, routed to by a host's tag.
#[async_trait]
pub trait ProductParser: Send + Sync {
    async fn parse(
        &self,
        job: &crate::broker::message::ParseJob,
        html: &Bytes,
    ) -> Result<serde_json::Value>;
}

/// Destination for extracted products.
#[async_trait]
pub trait ProductSink: Send + Sync {
    async fn write(&self, record: &crate::storage::product::ProductRecord) -> Result<()>;
}
