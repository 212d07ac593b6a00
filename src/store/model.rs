//! Row types and write-contract values for the task store.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::types::{BlobRef, HostId, ParserTag, Priority, ProxyId, TaskId, TaskStatus};

/// A target website and its crawl policy bundle.
///
/// Hosts are soft-disabled via `active`; rows referenced by tasks are
/// never deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Host {
    pub id: HostId,
    pub name: String,
    pub base_url: String,
    pub parser_tag: ParserTag,
    /// Minimum spacing between requests to this host, in seconds.
    pub min_spacing_secs: u64,
    /// Cap on simultaneously active tasks for this host.
    pub max_in_flight: u32,
    /// Default recurrence interval applied to recurring submissions that
    /// do not carry their own.
    pub default_interval_secs: Option<u64>,
    pub active: bool,
    pub robots_policy: Option<String>,
    pub user_agent: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewHost {
    pub name: String,
    pub base_url: String,
    pub parser_tag: ParserTag,
    pub min_spacing_secs: u64,
    pub max_in_flight: u32,
    pub default_interval_secs: Option<u64>,
    pub user_agent: Option<String>,
}

impl NewHost {
    pub fn new(name: impl Into<String>, base_url: impl Into<String>, tag: ParserTag) -> Self {
        Self {
            name: name.into(),
            base_url: base_url.into(),
            parser_tag: tag,
            min_spacing_secs: 0,
            max_in_flight: 50,
            default_interval_secs: None,
            user_agent: None,
        }
    }
}

/// Partial host mutation applied by the admin surface.
#[derive(Debug, Clone, Default)]
pub struct HostPatch {
    pub base_url: Option<String>,
    pub parser_tag: Option<ParserTag>,
    pub min_spacing_secs: Option<u64>,
    pub max_in_flight: Option<u32>,
    pub default_interval_secs: Option<u64>,
    pub active: Option<bool>,
    pub robots_policy: Option<String>,
    pub user_agent: Option<String>,
}

/// One URL travelling through the download → parse pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlTask {
    pub id: TaskId,
    pub host_id: HostId,
    pub url: String,
    /// SHA-256 hex of the normalized URL; sole deduplication key.
    pub url_fp: String,
    pub status: TaskStatus,
    pub priority: Priority,
    pub scheduled_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub error: Option<String>,
    pub interval_secs: Option<u64>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub recur_count: u32,
    pub is_recurring: bool,
    pub blob_ref: Option<BlobRef>,
    pub http_code: Option<u16>,
    pub latency_ms: Option<u64>,
    pub proxy_id: Option<ProxyId>,
    /// Set on every status change; lease deadlines count from here.
    pub last_transition_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub created_by: Option<String>,
}

impl CrawlTask {
    pub fn retries_exhausted(&self) -> bool {
        self.retry_count >= self.max_retries
    }

    /// 1-based attempt number carried on queued messages.
    pub fn attempt(&self) -> u32 {
        self.retry_count + 1
    }
}

/// Options accepted by task submission.
#[derive(Debug, Clone, Default)]
pub struct NewTaskOptions {
    pub priority: Option<Priority>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub max_retries: Option<u32>,
    /// Explicit recurrence interval; implies `recurring`.
    pub interval_secs: Option<u64>,
    /// Recur using the host's default interval when no explicit one is
    /// given.
    pub recurring: bool,
    pub created_by: Option<String>,
}

/// Field-level patch applied together with a status CAS.
#[derive(Debug, Clone, Default)]
pub struct TaskPatch {
    pub scheduled_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub priority: Option<Priority>,
    pub retry_count: Option<u32>,
    pub error: Option<String>,
    pub blob_ref: Option<BlobRef>,
    pub http_code: Option<u16>,
    pub latency_ms: Option<u64>,
    pub proxy_id: Option<ProxyId>,
    pub next_run_at: Option<DateTime<Utc>>,
    /// Reset started_at/completed_at/error/next_run_at (full restart).
    pub clear_execution: bool,
    /// Reset completed_at/error/next_run_at only (parse-only restart).
    pub clear_completion: bool,
}

impl TaskPatch {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn scheduled(at: DateTime<Utc>) -> Self {
        Self {
            scheduled_at: Some(at),
            ..Self::default()
        }
    }

    pub fn started(at: DateTime<Utc>) -> Self {
        Self {
            started_at: Some(at),
            ..Self::default()
        }
    }
}

/// Outcome a worker reports for one processing attempt.
#[derive(Debug, Clone)]
pub enum AttemptOutcome {
    DownloadSuccess {
        blob_ref: BlobRef,
        http_code: u16,
        latency_ms: u64,
        proxy_id: Option<ProxyId>,
    },
    ParseSuccess,
    TransientFailure { error: String },
    TerminalFailure { error: String },
}

/// Per-item result of a bulk submission.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BulkInsertReport {
    pub inserted: Vec<TaskId>,
    /// URLs whose fingerprint already exists on a live row.
    pub duplicates: Vec<String>,
    /// (url, reason) pairs rejected by validation.
    pub invalid: Vec<(String, String)>,
}

/// Admin listing filter; unset fields do not constrain.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub statuses: Option<Vec<TaskStatus>>,
    pub host_id: Option<HostId>,
    pub priority_min: Option<Priority>,
    pub priority_max: Option<Priority>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    /// Inclusive lower bound on the last status transition.
    pub transitioned_after: Option<DateTime<Utc>>,
    pub transitioned_before: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskSort {
    CreatedAt,
    ScheduledAt,
    Priority,
}

impl Default for TaskSort {
    fn default() -> Self {
        TaskSort::CreatedAt
    }
}

/// Cursor over (sort key, id); `key` is the integral rendering of the
/// sort field (epoch millis for timestamps, value for priority).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskCursor {
    pub key: i64,
    pub id: TaskId,
}

#[derive(Debug, Clone)]
pub struct TaskQuery {
    pub filter: TaskFilter,
    pub sort: TaskSort,
    pub ascending: bool,
    pub limit: usize,
    pub cursor: Option<TaskCursor>,
}

impl Default for TaskQuery {
    fn default() -> Self {
        Self {
            filter: TaskFilter::default(),
            sort: TaskSort::default(),
            ascending: true,
            limit: 100,
            cursor: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TaskPage {
    pub tasks: Vec<CrawlTask>,
    pub next_cursor: Option<TaskCursor>,
}

/// Ids reclaimed by one lease sweep, split by where they landed.
#[derive(Debug, Clone, Default)]
pub struct ReclaimReport {
    pub requeued: Vec<TaskId>,
    /// Leases that expired with retries already exhausted.
    pub failed: Vec<TaskId>,
}
