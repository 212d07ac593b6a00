//! Queue message payloads and delivery envelope types.
use serde::{Deserialize, Serialize};

use crate::core::types::{BlobRef, HostId, ParserTag, Priority, TaskId};
use crate::proxy::model::ProxyHandle;

/// The three logical queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueName {
    Crawl,
    Parse,
    Priority,
}

impl QueueName {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueName::Crawl => "crawl",
            QueueName::Parse => "parse",
            QueueName::Priority => "priority",
        }
    }
}

impl std::fmt::Display for QueueName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Download-phase work item; carries enough context for the crawler
/// worker to act without re-querying the store up front.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlJob {
    pub task_id: TaskId,
    pub url: String,
    pub host_id: HostId,
    pub priority: Priority,
    /// Pre-allocated identity; `None` when the worker acquires its own.
    pub proxy_handle: Option<ProxyHandle>,
    /// 1-based attempt number for this task.
    pub attempt: u32,
}

/// Parse-phase work item emitted after a successful download.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParseJob {
    pub task_id: TaskId,
    pub host_id: HostId,
    pub blob_ref: BlobRef,
    pub parser_tag: ParserTag,
    pub attempt: u32,
}

/// Opaque per-delivery acknowledgement token.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeliveryTag(String);

impl DeliveryTag {
    pub fn generate() -> Self {
        Self(format!("dlv_{}", uuid::Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DeliveryTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One delivered message awaiting acknowledgement.
#[derive(Debug, Clone)]
pub struct Delivery<T> {
    pub tag: DeliveryTag,
    pub payload: T,
    /// How many times this message has been handed out, this delivery
    /// included.
    pub delivery_count: u32,
}
