//! Orchestrator configuration sections with defaults and TOML loading.
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::core::error::{OrchestratorError, Result};
use crate::core::types::TaskStatus;

/// Dispatcher loop cadence and batching.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Seconds between dispatch rounds.
    pub interval_secs: u64,
    /// Maximum tasks handled per round.
    pub batch_size: usize,
    /// Delay applied when a task is bounced back to pending (publish
    /// failure, no proxy available).
    pub short_retry_delay_secs: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            interval_secs: 10,
            batch_size: 100,
            short_retry_delay_secs: 30,
        }
    }
}

/// Lease TTL per non-terminal active state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StateDeadlines {
    pub queued_secs: u64,
    pub crawling_secs: u64,
    pub queued_parse_secs: u64,
    pub parsing_secs: u64,
}

impl Default for StateDeadlines {
    fn default() -> Self {
        Self {
            queued_secs: 600,
            crawling_secs: 300,
            queued_parse_secs: 600,
            parsing_secs: 120,
        }
    }
}

impl StateDeadlines {
    /// Deadline for a leased state; `None` for states without a lease.
    pub fn for_status(&self, status: TaskStatus) -> Option<u64> {
        match status {
            TaskStatus::Queued => Some(self.queued_secs),
            TaskStatus::Crawling => Some(self.crawling_secs),
            TaskStatus::QueuedParse => Some(self.queued_parse_secs),
            TaskStatus::Parsing => Some(self.parsing_secs),
            _ => None,
        }
    }
}

/// Retry delay curve: `base * 2^(retry_count - 1)`, capped.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub base_secs: u64,
    pub cap_secs: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_secs: 60,
            cap_secs: 3600,
        }
    }
}

/// Proxy health thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Consecutive failures before a binding is deactivated.
    pub binding_failure_threshold: u32,
    /// Consecutive failures before a proxy is considered unhealthy
    /// everywhere.
    pub global_failure_threshold: u32,
    /// Seconds after the last failure before an unhealthy proxy may be
    /// probed again.
    pub grace_period_secs: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            binding_failure_threshold: 5,
            global_failure_threshold: 10,
            grace_period_secs: 1800,
        }
    }
}

/// Broker queue limits and delivery behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Per-consumer unacked delivery cap.
    pub prefetch: usize,
    /// Per-queue maximum resident messages (ready + unacked).
    pub max_length: usize,
    /// Message TTL on the crawl and parse queues.
    pub ttl_work_secs: u64,
    /// Message TTL on the priority queue.
    pub ttl_priority_secs: u64,
    /// Unacked deliveries are redelivered after this long.
    pub visibility_timeout_secs: u64,
    /// Snapshot directory for queue durability; `None` keeps queues
    /// memory-only.
    pub snapshot_dir: Option<PathBuf>,
    /// Write a second snapshot copy so one lost file is survivable.
    pub mirrored: bool,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            prefetch: 10,
            max_length: 10_000,
            ttl_work_secs: 86_400,
            ttl_priority_secs: 3_600,
            visibility_timeout_secs: 300,
            snapshot_dir: None,
            mirrored: true,
        }
    }
}

/// Individually toggleable URL normalization rules.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UrlNormalizeConfig {
    pub lowercase_host: bool,
    pub strip_fragment: bool,
    pub sort_query: bool,
    pub drop_empty_params: bool,
}

impl Default for UrlNormalizeConfig {
    fn default() -> Self {
        Self {
            lowercase_host: true,
            strip_fragment: true,
            sort_query: true,
            drop_empty_params: true,
        }
    }
}

/// Crawler/parser worker tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Per-request HTTP timeout.
    pub http_timeout_secs: u64,
    /// Network-error retries inside a single message delivery.
    pub max_inner_attempts: u32,
    /// Redeliveries a parse message may consume before the failure is
    /// recorded against the task.
    pub max_parse_deliveries: u32,
    /// Idle poll interval when the queues are empty, in milliseconds.
    pub poll_interval_ms: u64,
    pub user_agent: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            http_timeout_secs: 30,
            max_inner_attempts: 2,
            max_parse_deliveries: 3,
            poll_interval_ms: 200,
            user_agent: "crawl-orchestrator/0.1".to_string(),
        }
    }
}

/// Simple logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub file_path: Option<PathBuf>,
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file_path: None,
            json_format: false,
        }
    }
}

/// Top-level configuration; every section has workable defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub dispatcher: DispatcherConfig,
    pub state_deadlines: StateDeadlines,
    pub backoff: BackoffConfig,
    pub proxy: ProxyConfig,
    pub broker: BrokerConfig,
    pub url_normalize: UrlNormalizeConfig,
    pub worker: WorkerConfig,
    pub logging: LoggingConfig,
}

impl OrchestratorConfig {
    /// Load from a TOML file; missing sections fall back to defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            OrchestratorError::Validation(format!(
                "cannot read config {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;
        toml::from_str(&raw)
            .map_err(|e| OrchestratorError::Validation(format!("invalid config: {}", e)))
    }
}
