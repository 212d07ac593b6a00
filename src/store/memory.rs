//! In-memory task store engine.
//!
//! A single `RwLock` over the row maps serializes every mutation, which
//! is what makes the per-row CAS discipline trivially atomic here. The
//! same contract maps onto a transactional database by turning each
//! method into one transaction.
use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::config::{BackoffConfig, StateDeadlines, UrlNormalizeConfig};
use crate::core::error::{OrchestratorError, Result};
use crate::core::traits::TaskStore;
use crate::core::types::{HostId, Priority, TaskId, TaskStatus};
use crate::dispatcher::backoff::next_attempt_at;
use crate::store::model::{
    AttemptOutcome, BulkInsertReport, CrawlTask, Host, HostPatch, NewHost, NewTaskOptions,
    ReclaimReport, TaskCursor, TaskPage, TaskPatch, TaskQuery, TaskSort,
};
use crate::utils::url_norm::normalize_and_fingerprint;

/// Largest accepted bulk submission.
pub const MAX_BULK_URLS: usize = 10_000;

pub(crate) struct StoreInner {
    pub hosts: HashMap<HostId, Host>,
    pub tasks: HashMap<TaskId, CrawlTask>,
    /// (host, fingerprint) -> live (non-terminal) task id.
    pub live_fp: HashMap<(HostId, String), TaskId>,
}

impl StoreInner {
    fn new() -> Self {
        Self {
            hosts: HashMap::new(),
            tasks: HashMap::new(),
            live_fp: HashMap::new(),
        }
    }

    fn index_live(&mut self, task: &CrawlTask) {
        self.live_fp
            .insert((task.host_id.clone(), task.url_fp.clone()), task.id.clone());
    }

    fn unindex_live(&mut self, task: &CrawlTask) {
        let key = (task.host_id.clone(), task.url_fp.clone());
        if self.live_fp.get(&key) == Some(&task.id) {
            self.live_fp.remove(&key);
        }
    }

    /// Tasks currently occupying a slot against their host.
    fn active_counts(&self) -> HashMap<HostId, u32> {
        let mut counts: HashMap<HostId, u32> = HashMap::new();
        for task in self.tasks.values() {
            if task.status.is_active() {
                *counts.entry(task.host_id.clone()).or_default() += 1;
            }
        }
        counts
    }
}

pub struct MemoryTaskStore {
    pub(crate) inner: RwLock<StoreInner>,
    backoff: BackoffConfig,
    normalize: UrlNormalizeConfig,
    deadlines: StateDeadlines,
}

impl MemoryTaskStore {
    pub fn new(
        backoff: BackoffConfig,
        normalize: UrlNormalizeConfig,
        deadlines: StateDeadlines,
    ) -> Self {
        Self {
            inner: RwLock::new(StoreInner::new()),
            backoff,
            normalize,
            deadlines,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(
            BackoffConfig::default(),
            UrlNormalizeConfig::default(),
            StateDeadlines::default(),
        )
    }

    fn create_one(
        &self,
        inner: &mut StoreInner,
        host_id: &HostId,
        url: &str,
        opts: &NewTaskOptions,
        now: DateTime<Utc>,
    ) -> Result<TaskId> {
        let host = inner
            .hosts
            .get(host_id)
            .ok_or_else(|| OrchestratorError::NotFound {
                entity: "host",
                id: host_id.to_string(),
            })?;

        let (normalized, fp) = normalize_and_fingerprint(url, &self.normalize)?;

        let key = (host_id.clone(), fp.clone());
        if let Some(existing) = inner.live_fp.get(&key) {
            return Err(OrchestratorError::Duplicate {
                fingerprint: fp,
                existing: existing.clone(),
            });
        }

        let interval_secs = opts.interval_secs.or(if opts.recurring {
            host.default_interval_secs
        } else {
            None
        });

        let task = CrawlTask {
            id: TaskId::generate(),
            host_id: host_id.clone(),
            url: normalized,
            url_fp: fp,
            status: TaskStatus::Pending,
            priority: opts.priority.unwrap_or_default(),
            scheduled_at: opts.scheduled_at.unwrap_or(now),
            started_at: None,
            completed_at: None,
            retry_count: 0,
            max_retries: opts.max_retries.unwrap_or(3),
            error: None,
            interval_secs,
            next_run_at: None,
            recur_count: 0,
            is_recurring: interval_secs.is_some(),
            blob_ref: None,
            http_code: None,
            latency_ms: None,
            proxy_id: None,
            last_transition_at: now,
            created_at: now,
            updated_at: now,
            created_by: opts.created_by.clone(),
        };

        let id = task.id.clone();
        inner.index_live(&task);
        inner.tasks.insert(id.clone(), task);
        Ok(id)
    }

    fn apply_patch(task: &mut CrawlTask, patch: &TaskPatch) {
        if patch.clear_execution {
            task.started_at = None;
            task.completed_at = None;
            task.error = None;
            task.next_run_at = None;
        }
        if patch.clear_completion {
            task.completed_at = None;
            task.error = None;
            task.next_run_at = None;
        }
        if let Some(v) = patch.scheduled_at {
            task.scheduled_at = v;
        }
        if let Some(v) = patch.started_at {
            task.started_at = Some(v);
        }
        if let Some(v) = patch.completed_at {
            task.completed_at = Some(v);
        }
        if let Some(v) = patch.priority {
            task.priority = v;
        }
        if let Some(v) = patch.retry_count {
            task.retry_count = v;
        }
        if let Some(ref v) = patch.error {
            task.error = Some(v.clone());
        }
        if let Some(ref v) = patch.blob_ref {
            task.blob_ref = Some(v.clone());
        }
        if let Some(v) = patch.http_code {
            task.http_code = Some(v);
        }
        if let Some(v) = patch.latency_ms {
            task.latency_ms = Some(v);
        }
        if let Some(ref v) = patch.proxy_id {
            task.proxy_id = Some(v.clone());
        }
        if let Some(v) = patch.next_run_at {
            task.next_run_at = Some(v);
        }
    }

    fn fail_task(inner: &mut StoreInner, id: &TaskId, error: String, now: DateTime<Utc>) {
        if let Some(task) = inner.tasks.get(id).cloned() {
            inner.unindex_live(&task);
        }
        if let Some(task) = inner.tasks.get_mut(id) {
            task.status = TaskStatus::Failed;
            task.error = Some(error);
            task.last_transition_at = now;
            task.updated_at = now;
        }
    }

    fn sort_key(task: &CrawlTask, sort: TaskSort) -> i64 {
        match sort {
            TaskSort::CreatedAt => task.created_at.timestamp_millis(),
            TaskSort::ScheduledAt => task.scheduled_at.timestamp_millis(),
            TaskSort::Priority => i64::from(task.priority.value()),
        }
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn create_host(&self, host: NewHost) -> Result<HostId> {
        let mut inner = self.inner.write().await;
        if inner.hosts.values().any(|h| h.name == host.name) {
            return Err(OrchestratorError::Validation(format!(
                "host name {:?} already exists",
                host.name
            )));
        }
        let now = Utc::now();
        let row = Host {
            id: HostId::generate(),
            name: host.name,
            base_url: host.base_url,
            parser_tag: host.parser_tag,
            min_spacing_secs: host.min_spacing_secs,
            max_in_flight: host.max_in_flight,
            default_interval_secs: host.default_interval_secs,
            active: true,
            robots_policy: None,
            user_agent: host.user_agent,
            created_at: now,
            updated_at: now,
        };
        let id = row.id.clone();
        inner.hosts.insert(id.clone(), row);
        Ok(id)
    }

    async fn update_host(&self, id: &HostId, patch: HostPatch) -> Result<()> {
        let mut inner = self.inner.write().await;
        let host = inner
            .hosts
            .get_mut(id)
            .ok_or_else(|| OrchestratorError::NotFound {
                entity: "host",
                id: id.to_string(),
            })?;
        if let Some(v) = patch.base_url {
            host.base_url = v;
        }
        if let Some(v) = patch.parser_tag {
            host.parser_tag = v;
        }
        if let Some(v) = patch.min_spacing_secs {
            host.min_spacing_secs = v;
        }
        if let Some(v) = patch.max_in_flight {
            host.max_in_flight = v;
        }
        if let Some(v) = patch.default_interval_secs {
            host.default_interval_secs = Some(v);
        }
        if let Some(v) = patch.active {
            host.active = v;
        }
        if let Some(v) = patch.robots_policy {
            host.robots_policy = Some(v);
        }
        if let Some(v) = patch.user_agent {
            host.user_agent = Some(v);
        }
        host.updated_at = Utc::now();
        Ok(())
    }

    async fn get_host(&self, id: &HostId) -> Result<Host> {
        let inner = self.inner.read().await;
        inner
            .hosts
            .get(id)
            .cloned()
            .ok_or_else(|| OrchestratorError::NotFound {
                entity: "host",
                id: id.to_string(),
            })
    }

    async fn list_hosts(&self) -> Result<Vec<Host>> {
        let inner = self.inner.read().await;
        let mut hosts: Vec<Host> = inner.hosts.values().cloned().collect();
        hosts.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(hosts)
    }

    async fn create_task(
        &self,
        host_id: &HostId,
        url: &str,
        opts: NewTaskOptions,
    ) -> Result<TaskId> {
        let mut inner = self.inner.write().await;
        self.create_one(&mut inner, host_id, url, &opts, Utc::now())
    }

    async fn create_tasks_bulk(
        &self,
        host_id: &HostId,
        urls: Vec<String>,
        opts: NewTaskOptions,
    ) -> Result<BulkInsertReport> {
        if urls.len() > MAX_BULK_URLS {
            return Err(OrchestratorError::Validation(format!(
                "bulk submission of {} urls exceeds the {} cap",
                urls.len(),
                MAX_BULK_URLS
            )));
        }
        let mut inner = self.inner.write().await;
        if !inner.hosts.contains_key(host_id) {
            return Err(OrchestratorError::NotFound {
                entity: "host",
                id: host_id.to_string(),
            });
        }
        let now = Utc::now();
        let mut report = BulkInsertReport::default();
        for url in urls {
            match self.create_one(&mut inner, host_id, &url, &opts, now) {
                Ok(id) => report.inserted.push(id),
                Err(OrchestratorError::Duplicate { .. }) => report.duplicates.push(url),
                Err(e) => report.invalid.push((url, e.to_string())),
            }
        }
        Ok(report)
    }

    async fn get_task(&self, id: &TaskId) -> Result<CrawlTask> {
        let inner = self.inner.read().await;
        inner
            .tasks
            .get(id)
            .cloned()
            .ok_or_else(|| OrchestratorError::NotFound {
                entity: "task",
                id: id.to_string(),
            })
    }

    async fn fetch_due(&self, limit: usize, now: DateTime<Utc>) -> Result<Vec<CrawlTask>> {
        let inner = self.inner.read().await;
        let active_counts = inner.active_counts();

        let mut candidates: Vec<&CrawlTask> = inner
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Pending && t.scheduled_at <= now)
            .filter(|t| {
                inner
                    .hosts
                    .get(&t.host_id)
                    .map(|h| h.active)
                    .unwrap_or(false)
            })
            .collect();

        candidates.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then_with(|| a.scheduled_at.cmp(&b.scheduled_at))
                .then_with(|| a.id.as_str().cmp(b.id.as_str()))
        });

        let mut allowance: HashMap<HostId, u32> = HashMap::new();
        let mut due = Vec::new();
        for task in candidates {
            if due.len() >= limit {
                break;
            }
            let host = match inner.hosts.get(&task.host_id) {
                Some(h) => h,
                None => continue,
            };
            let remaining = allowance.entry(task.host_id.clone()).or_insert_with(|| {
                host.max_in_flight
                    .saturating_sub(active_counts.get(&task.host_id).copied().unwrap_or(0))
            });
            if *remaining == 0 {
                continue;
            }
            *remaining -= 1;
            due.push(task.clone());
        }
        Ok(due)
    }

    async fn fetch_downloaded(&self, limit: usize) -> Result<Vec<CrawlTask>> {
        let inner = self.inner.read().await;
        let mut rows: Vec<&CrawlTask> = inner
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Downloaded)
            .collect();
        rows.sort_by(|a, b| a.last_transition_at.cmp(&b.last_transition_at));
        Ok(rows.into_iter().take(limit).cloned().collect())
    }

    async fn transition(
        &self,
        id: &TaskId,
        from: &[TaskStatus],
        to: TaskStatus,
        patch: TaskPatch,
    ) -> Result<bool> {
        let mut inner = self.inner.write().await;
        let snapshot = inner
            .tasks
            .get(id)
            .cloned()
            .ok_or_else(|| OrchestratorError::NotFound {
                entity: "task",
                id: id.to_string(),
            })?;
        let current = snapshot.status;

        if !from.contains(&current) {
            return Ok(false);
        }

        let leaving_terminal = current.is_terminal() && !to.is_terminal();
        let entering_terminal = !current.is_terminal() && to.is_terminal();

        if leaving_terminal {
            let key = (snapshot.host_id.clone(), snapshot.url_fp.clone());
            if let Some(existing) = inner.live_fp.get(&key) {
                if existing != id {
                    return Err(OrchestratorError::Duplicate {
                        fingerprint: snapshot.url_fp.clone(),
                        existing: existing.clone(),
                    });
                }
            }
            inner.index_live(&snapshot);
        }
        if entering_terminal {
            inner.unindex_live(&snapshot);
        }

        let now = Utc::now();
        if let Some(task) = inner.tasks.get_mut(id) {
            Self::apply_patch(task, &patch);
            task.status = to;
            task.last_transition_at = now;
            task.updated_at = now;
        }
        debug!(task_id = %id, from = %current, to = %to, "task transition");
        Ok(true)
    }

    async fn record_attempt(
        &self,
        id: &TaskId,
        outcome: AttemptOutcome,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut inner = self.inner.write().await;
        let current = inner
            .tasks
            .get(id)
            .map(|t| t.status)
            .ok_or_else(|| OrchestratorError::NotFound {
                entity: "task",
                id: id.to_string(),
            })?;

        let illegal = |expected: &[TaskStatus]| OrchestratorError::IllegalTransition {
            task: id.clone(),
            actual: current,
            expected: expected.to_vec(),
        };

        match outcome {
            AttemptOutcome::DownloadSuccess {
                blob_ref,
                http_code,
                latency_ms,
                proxy_id,
            } => {
                if current != TaskStatus::Crawling {
                    return Err(illegal(&[TaskStatus::Crawling]));
                }
                if let Some(task) = inner.tasks.get_mut(id) {
                    task.status = TaskStatus::Downloaded;
                    task.blob_ref = Some(blob_ref);
                    task.http_code = Some(http_code);
                    task.latency_ms = Some(latency_ms);
                    task.proxy_id = proxy_id;
                    task.error = None;
                    task.last_transition_at = now;
                    task.updated_at = now;
                }
            }
            AttemptOutcome::ParseSuccess => {
                if current != TaskStatus::Parsing {
                    return Err(illegal(&[TaskStatus::Parsing]));
                }
                if let Some(snapshot) = inner.tasks.get(id).cloned() {
                    inner.unindex_live(&snapshot);
                }
                if let Some(task) = inner.tasks.get_mut(id) {
                    task.status = TaskStatus::Completed;
                    task.completed_at = Some(now);
                    task.error = None;
                    if task.is_recurring {
                        if let Some(interval) = task.interval_secs {
                            task.next_run_at = Some(now + Duration::seconds(interval as i64));
                        }
                    }
                    task.last_transition_at = now;
                    task.updated_at = now;
                }
            }
            AttemptOutcome::TransientFailure { error } => {
                if !current.is_active() {
                    return Err(illegal(TaskStatus::ACTIVE));
                }
                let exhausted = inner
                    .tasks
                    .get(id)
                    .map(|t| t.retries_exhausted())
                    .unwrap_or(false);
                if exhausted {
                    Self::fail_task(&mut inner, id, error, now);
                } else if let Some(task) = inner.tasks.get_mut(id) {
                    task.retry_count += 1;
                    task.scheduled_at = next_attempt_at(now, task.retry_count, &self.backoff);
                    task.status = TaskStatus::Pending;
                    task.error = Some(error);
                    task.last_transition_at = now;
                    task.updated_at = now;
                }
            }
            AttemptOutcome::TerminalFailure { error } => {
                if !current.is_active() {
                    return Err(illegal(TaskStatus::ACTIVE));
                }
                Self::fail_task(&mut inner, id, error, now);
            }
        }
        Ok(())
    }

    async fn reclaim_expired(&self, now: DateTime<Utc>) -> Result<ReclaimReport> {
        let mut inner = self.inner.write().await;
        let expired: Vec<TaskId> = inner
            .tasks
            .values()
            .filter(|t| {
                self.deadlines
                    .for_status(t.status)
                    .map(|ttl| t.last_transition_at + Duration::seconds(ttl as i64) < now)
                    .unwrap_or(false)
            })
            .map(|t| t.id.clone())
            .collect();

        let mut report = ReclaimReport::default();
        for id in expired {
            let (status, exhausted) = match inner.tasks.get(&id) {
                Some(task) => (task.status, task.retries_exhausted()),
                None => continue,
            };
            if exhausted {
                Self::fail_task(
                    &mut inner,
                    &id,
                    format!("lease expired in {} with retries exhausted", status),
                    now,
                );
                report.failed.push(id.clone());
                warn!(task_id = %id, state = %status, "lease expired, task failed");
            } else {
                if let Some(task) = inner.tasks.get_mut(&id) {
                    task.retry_count += 1;
                    task.status = TaskStatus::Pending;
                    task.scheduled_at = now;
                    task.error = Some(format!("lease expired in {}", status));
                    task.last_transition_at = now;
                    task.updated_at = now;
                }
                report.requeued.push(id.clone());
                warn!(task_id = %id, state = %status, "lease expired, task requeued");
            }
        }
        Ok(report)
    }

    async fn due_recurrences(&self, limit: usize, now: DateTime<Utc>) -> Result<Vec<TaskId>> {
        let inner = self.inner.read().await;
        let mut due: Vec<&CrawlTask> = inner
            .tasks
            .values()
            .filter(|t| {
                t.status == TaskStatus::Completed
                    && t.is_recurring
                    && t.next_run_at.map(|at| at <= now).unwrap_or(false)
            })
            .collect();
        due.sort_by(|a, b| a.next_run_at.cmp(&b.next_run_at));
        Ok(due.into_iter().take(limit).map(|t| t.id.clone()).collect())
    }

    async fn materialize_recurrence(&self, id: &TaskId, now: DateTime<Utc>) -> Result<TaskId> {
        let mut inner = self.inner.write().await;
        let parent = inner
            .tasks
            .get(id)
            .cloned()
            .ok_or_else(|| OrchestratorError::NotFound {
                entity: "task",
                id: id.to_string(),
            })?;

        if parent.status != TaskStatus::Completed || !parent.is_recurring {
            return Err(OrchestratorError::IllegalTransition {
                task: id.clone(),
                actual: parent.status,
                expected: vec![TaskStatus::Completed],
            });
        }
        let interval = parent.interval_secs.ok_or_else(|| {
            OrchestratorError::Validation(format!("recurring task {} has no interval", id))
        })?;
        let next_run = parent.next_run_at.ok_or_else(|| {
            OrchestratorError::Validation(format!("recurring task {} has no next_run_at", id))
        })?;

        // Advance the parent first so a duplicate live row cannot make
        // the dispatcher revisit this recurrence every round.
        if let Some(parent_row) = inner.tasks.get_mut(id) {
            parent_row.next_run_at = Some(next_run + Duration::seconds(interval as i64));
            parent_row.updated_at = now;
        }

        let key = (parent.host_id.clone(), parent.url_fp.clone());
        if let Some(existing) = inner.live_fp.get(&key) {
            return Err(OrchestratorError::Duplicate {
                fingerprint: parent.url_fp.clone(),
                existing: existing.clone(),
            });
        }

        let child = CrawlTask {
            id: TaskId::generate(),
            host_id: parent.host_id.clone(),
            url: parent.url.clone(),
            url_fp: parent.url_fp.clone(),
            status: TaskStatus::Pending,
            priority: parent.priority,
            scheduled_at: now,
            started_at: None,
            completed_at: None,
            retry_count: 0,
            max_retries: parent.max_retries,
            error: None,
            interval_secs: Some(interval),
            next_run_at: None,
            recur_count: parent.recur_count + 1,
            is_recurring: true,
            blob_ref: None,
            http_code: None,
            latency_ms: None,
            proxy_id: None,
            last_transition_at: now,
            created_at: now,
            updated_at: now,
            created_by: Some("recurrence".to_string()),
        };
        let child_id = child.id.clone();
        inner.index_live(&child);
        inner.tasks.insert(child_id.clone(), child);
        debug!(parent = %id, child = %child_id, "recurrence materialized");
        Ok(child_id)
    }

    async fn set_priority(&self, id: &TaskId, priority: Priority) -> Result<()> {
        let mut inner = self.inner.write().await;
        let task = inner
            .tasks
            .get_mut(id)
            .ok_or_else(|| OrchestratorError::NotFound {
                entity: "task",
                id: id.to_string(),
            })?;
        task.priority = priority;
        task.updated_at = Utc::now();
        Ok(())
    }

    async fn query(&self, query: TaskQuery) -> Result<TaskPage> {
        let inner = self.inner.read().await;
        let f = &query.filter;
        let mut rows: Vec<&CrawlTask> = inner
            .tasks
            .values()
            .filter(|t| {
                f.statuses
                    .as_ref()
                    .map(|s| s.contains(&t.status))
                    .unwrap_or(true)
            })
            .filter(|t| f.host_id.as_ref().map(|h| &t.host_id == h).unwrap_or(true))
            .filter(|t| f.priority_min.map(|p| t.priority >= p).unwrap_or(true))
            .filter(|t| f.priority_max.map(|p| t.priority <= p).unwrap_or(true))
            .filter(|t| f.created_after.map(|at| t.created_at >= at).unwrap_or(true))
            .filter(|t| f.created_before.map(|at| t.created_at < at).unwrap_or(true))
            .filter(|t| {
                f.transitioned_after
                    .map(|at| t.last_transition_at >= at)
                    .unwrap_or(true)
            })
            .filter(|t| {
                f.transitioned_before
                    .map(|at| t.last_transition_at < at)
                    .unwrap_or(true)
            })
            .collect();

        rows.sort_by(|a, b| {
            let ka = Self::sort_key(a, query.sort);
            let kb = Self::sort_key(b, query.sort);
            let ord = ka.cmp(&kb).then_with(|| a.id.as_str().cmp(b.id.as_str()));
            if query.ascending { ord } else { ord.reverse() }
        });

        if let Some(cursor) = &query.cursor {
            let pos = rows.iter().position(|t| {
                let key = Self::sort_key(t, query.sort);
                if query.ascending {
                    (key, t.id.as_str()) > (cursor.key, cursor.id.as_str())
                } else {
                    (key, t.id.as_str()) < (cursor.key, cursor.id.as_str())
                }
            });
            rows = match pos {
                Some(p) => rows.split_off(p),
                None => Vec::new(),
            };
        }

        let has_more = rows.len() > query.limit;
        rows.truncate(query.limit);
        let next_cursor = if has_more {
            rows.last().map(|t| TaskCursor {
                key: Self::sort_key(t, query.sort),
                id: t.id.clone(),
            })
        } else {
            None
        };

        Ok(TaskPage {
            tasks: rows.into_iter().cloned().collect(),
            next_cursor,
        })
    }
}
