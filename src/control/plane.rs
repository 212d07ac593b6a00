//! Admin control plane: atomic task mutations plus host and proxy
//! administration.
//!
//! Operations race freely with dispatchers and workers; the store's CAS
//! is the only synchronization. A pause or cancel that lands while a
//! message is already queued is observed by the worker at its next
//! status re-check.
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::core::error::{OrchestratorError, Result};
use crate::core::traits::{BlobStore, TaskStore};
use crate::core::types::{BindingId, HostId, Priority, ProxyId, TaskId, TaskStatus};
use crate::proxy::allocator::ProxyAllocator;
use crate::proxy::model::{BindingStats, NewProxy};
use crate::store::model::{
    BulkInsertReport, CrawlTask, HostPatch, NewHost, NewTaskOptions, TaskFilter, TaskPage,
    TaskPatch, TaskQuery, TaskSort,
};

/// Options for a full restart of a terminal task.
#[derive(Debug, Clone, Default)]
pub struct RestartOptions {
    pub reset_retries: bool,
    pub priority: Option<Priority>,
    pub scheduled_at: Option<DateTime<Utc>>,
}

/// Filter for bulk restart of failed tasks.
#[derive(Debug, Clone, Default)]
pub struct BulkRestartFilter {
    pub host_id: Option<HostId>,
    /// Inclusive lower bound on when the task failed.
    pub failed_after: Option<DateTime<Utc>>,
}

/// Per-item outcome of a bulk restart.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BulkRestartReport {
    pub restarted: Vec<TaskId>,
    pub failed: Vec<(TaskId, String)>,
}

pub struct ControlPlane {
    store: Arc<dyn TaskStore>,
    allocator: Arc<ProxyAllocator>,
    blobs: Arc<dyn BlobStore>,
}

impl ControlPlane {
    pub fn new(
        store: Arc<dyn TaskStore>,
        allocator: Arc<ProxyAllocator>,
        blobs: Arc<dyn BlobStore>,
    ) -> Self {
        Self {
            store,
            allocator,
            blobs,
        }
    }

    // ---- submission ----

    pub async fn submit(&self, host_id: &HostId, url: &str, opts: NewTaskOptions) -> Result<TaskId> {
        let id = self.store.create_task(host_id, url, opts).await?;
        info!(task_id = %id, host_id = %host_id, "task submitted");
        Ok(id)
    }

    pub async fn submit_batch(
        &self,
        host_id: &HostId,
        urls: Vec<String>,
        opts: NewTaskOptions,
    ) -> Result<BulkInsertReport> {
        let report = self.store.create_tasks_bulk(host_id, urls, opts).await?;
        info!(
            host_id = %host_id,
            inserted = report.inserted.len(),
            duplicates = report.duplicates.len(),
            invalid = report.invalid.len(),
            "batch submitted"
        );
        Ok(report)
    }

    // ---- lifecycle mutations ----

    /// Move any non-terminal task to `Paused`. Queued broker messages
    /// are not drained; workers observe the state and re-ack.
    pub async fn pause(&self, task_id: &TaskId) -> Result<()> {
        self.checked_transition(
            task_id,
            TaskStatus::NON_TERMINAL,
            TaskStatus::Paused,
            TaskPatch::none(),
        )
        .await
    }

    /// Return a paused task to the schedulable pool immediately.
    pub async fn resume(&self, task_id: &TaskId) -> Result<()> {
        self.checked_transition(
            task_id,
            &[TaskStatus::Paused],
            TaskStatus::Pending,
            TaskPatch::scheduled(Utc::now()),
        )
        .await
    }

    /// Cancel from any non-terminal state; completed and failed rows are
    /// left as history.
    pub async fn cancel(&self, task_id: &TaskId) -> Result<()> {
        self.checked_transition(
            task_id,
            TaskStatus::NON_TERMINAL,
            TaskStatus::Cancelled,
            TaskPatch::none(),
        )
        .await
    }

    /// Re-run a terminal task from scratch.
    pub async fn restart_full(&self, task_id: &TaskId, opts: RestartOptions) -> Result<()> {
        let patch = TaskPatch {
            scheduled_at: Some(opts.scheduled_at.unwrap_or_else(Utc::now)),
            priority: opts.priority,
            retry_count: opts.reset_retries.then_some(0),
            clear_execution: true,
            ..TaskPatch::default()
        };
        self.checked_transition(
            task_id,
            &[TaskStatus::Failed, TaskStatus::Completed],
            TaskStatus::Pending,
            patch,
        )
        .await?;
        info!(task_id = %task_id, "task restarted");
        Ok(())
    }

    /// Re-run only the parse phase against the previously downloaded
    /// body; fails with `HtmlNotAvailable` when the blob is gone.
    pub async fn restart_parse_only(&self, task_id: &TaskId) -> Result<()> {
        let task = self.store.get_task(task_id).await?;
        let blob = task
            .blob_ref
            .as_ref()
            .ok_or_else(|| OrchestratorError::HtmlNotAvailable {
                task: task_id.clone(),
            })?;
        if !self.blobs.exists(blob).await? {
            return Err(OrchestratorError::HtmlNotAvailable {
                task: task_id.clone(),
            });
        }
        let patch = TaskPatch {
            clear_completion: true,
            ..TaskPatch::default()
        };
        self.checked_transition(
            task_id,
            &[TaskStatus::Failed, TaskStatus::Completed],
            TaskStatus::Downloaded,
            patch,
        )
        .await?;
        info!(task_id = %task_id, "parse-only restart");
        Ok(())
    }

    /// Restart failed tasks matching the filter, up to `limit`, with
    /// per-item outcomes and no rollback.
    pub async fn bulk_restart_failed(
        &self,
        filter: BulkRestartFilter,
        limit: usize,
    ) -> Result<BulkRestartReport> {
        let page = self
            .store
            .query(TaskQuery {
                filter: TaskFilter {
                    statuses: Some(vec![TaskStatus::Failed]),
                    host_id: filter.host_id.clone(),
                    transitioned_after: filter.failed_after,
                    ..TaskFilter::default()
                },
                sort: TaskSort::CreatedAt,
                ascending: true,
                limit,
                cursor: None,
            })
            .await?;

        let mut report = BulkRestartReport::default();
        for task in page.tasks {
            match self
                .restart_full(&task.id, RestartOptions {
                    reset_retries: true,
                    ..RestartOptions::default()
                })
                .await
            {
                Ok(()) => report.restarted.push(task.id),
                Err(e) => report.failed.push((task.id, e.to_string())),
            }
        }
        info!(
            restarted = report.restarted.len(),
            failed = report.failed.len(),
            "bulk restart completed"
        );
        Ok(report)
    }

    /// Field-only priority change; messages already enqueued keep their
    /// original route.
    pub async fn change_priority(&self, task_id: &TaskId, priority: Priority) -> Result<()> {
        self.store.set_priority(task_id, priority).await
    }

    pub async fn get_task(&self, task_id: &TaskId) -> Result<CrawlTask> {
        self.store.get_task(task_id).await
    }

    pub async fn query(&self, query: TaskQuery) -> Result<TaskPage> {
        self.store.query(query).await
    }

    // ---- host administration ----

    pub async fn create_host(&self, host: NewHost) -> Result<HostId> {
        self.store.create_host(host).await
    }

    pub async fn update_host(&self, id: &HostId, patch: HostPatch) -> Result<()> {
        self.store.update_host(id, patch).await
    }

    /// Soft-disable: pending tasks stop being dispatched; rows are kept.
    pub async fn set_host_active(&self, id: &HostId, active: bool) -> Result<()> {
        self.store
            .update_host(
                id,
                HostPatch {
                    active: Some(active),
                    ..HostPatch::default()
                },
            )
            .await
    }

    // ---- proxy administration ----

    pub async fn add_proxy(&self, proxy: NewProxy) -> Result<ProxyId> {
        self.allocator.add_proxy(proxy).await
    }

    pub async fn set_proxy_active(&self, id: &ProxyId, active: bool) -> Result<()> {
        self.allocator.set_proxy_active(id, active).await
    }

    pub async fn remove_proxy(&self, id: &ProxyId) -> Result<()> {
        self.allocator.remove_proxy(id).await
    }

    pub async fn bind_proxy(
        &self,
        host_id: &HostId,
        proxy_id: &ProxyId,
        priority: i32,
    ) -> Result<BindingId> {
        // The host must exist even though bindings live in the allocator.
        self.store.get_host(host_id).await?;
        self.allocator.bind(host_id, proxy_id, priority).await
    }

    pub async fn unbind_proxy(&self, host_id: &HostId, proxy_id: &ProxyId) -> Result<()> {
        self.allocator.unbind(host_id, proxy_id).await
    }

    pub async fn revive_binding(&self, host_id: &HostId, proxy_id: &ProxyId) -> Result<()> {
        self.allocator.revive_binding(host_id, proxy_id).await
    }

    pub async fn proxy_stats(&self, host_id: &HostId) -> Result<Vec<BindingStats>> {
        self.allocator.stats(host_id).await
    }

    // ---- internals ----

    /// CAS wrapper that surfaces a lost race as `IllegalTransition` with
    /// the actual state, instead of a silent `false`.
    async fn checked_transition(
        &self,
        task_id: &TaskId,
        from: &[TaskStatus],
        to: TaskStatus,
        patch: TaskPatch,
    ) -> Result<()> {
        if self.store.transition(task_id, from, to, patch).await? {
            return Ok(());
        }
        let task = self.store.get_task(task_id).await?;
        Err(OrchestratorError::IllegalTransition {
            task: task_id.clone(),
            actual: task.status,
            expected: from.to_vec(),
        })
    }
}
