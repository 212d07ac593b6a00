// Structured logging events for orchestration operations
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::core::types::{HostId, ProxyId, TaskId, TaskStatus};

/// Task lifecycle event record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEvent {
    pub task_id: String,
    pub event_type: TaskEventType,
    pub from_status: Option<String>,
    pub to_status: Option<String>,
    pub queue: Option<String>,
    pub priority: Option<u8>,
    pub retry_count: Option<u32>,
    pub error_message: Option<String>,
}

impl TaskEvent {
    fn new(task_id: &TaskId, event_type: TaskEventType) -> Self {
        Self {
            task_id: task_id.to_string(),
            event_type,
            from_status: None,
            to_status: None,
            queue: None,
            priority: None,
            retry_count: None,
            error_message: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TaskEventType {
    Dispatched,
    Transitioned,
    Reclaimed,
    RecurrenceMaterialized,
    Failed,
    Deferred,
}

/// Emits orchestration events with stable field names.
pub struct TaskEventLogger {
    dispatcher_id: String,
}

impl TaskEventLogger {
    pub fn new(dispatcher_id: impl Into<String>) -> Self {
        Self {
            dispatcher_id: dispatcher_id.into(),
        }
    }

    pub fn log_dispatched(&self, task_id: &TaskId, queue: &str, priority: u8) {
        let event = TaskEvent {
            from_status: Some(TaskStatus::Pending.to_string()),
            to_status: Some(TaskStatus::Queued.to_string()),
            queue: Some(queue.to_string()),
            priority: Some(priority),
            ..TaskEvent::new(task_id, TaskEventType::Dispatched)
        };

        info!(
            dispatcher = %self.dispatcher_id,
            task_id = %task_id,
            queue = queue,
            priority = priority,
            event = "task_dispatched",
            "Task published to queue"
        );

        debug!(event = ?event, "Detailed dispatch event");
    }

    pub fn log_transition(&self, task_id: &TaskId, from: TaskStatus, to: TaskStatus) {
        let event = TaskEvent {
            from_status: Some(from.to_string()),
            to_status: Some(to.to_string()),
            ..TaskEvent::new(task_id, TaskEventType::Transitioned)
        };

        debug!(
            dispatcher = %self.dispatcher_id,
            task_id = %task_id,
            from = %from,
            to = %to,
            event = "task_transitioned",
            "Task status changed"
        );

        debug!(event = ?event, "Detailed transition event");
    }

    pub fn log_reclaimed(&self, task_id: &TaskId, failed: bool) {
        let event = TaskEvent {
            to_status: Some(
                if failed {
                    TaskStatus::Failed
                } else {
                    TaskStatus::Pending
                }
                .to_string(),
            ),
            ..TaskEvent::new(
                task_id,
                if failed {
                    TaskEventType::Failed
                } else {
                    TaskEventType::Reclaimed
                },
            )
        };

        warn!(
            dispatcher = %self.dispatcher_id,
            task_id = %task_id,
            terminal = failed,
            event = "lease_reclaimed",
            "Task lease expired"
        );

        debug!(event = ?event, "Detailed reclaim event");
    }

    pub fn log_recurrence(&self, parent: &TaskId, child: &TaskId) {
        let event = TaskEvent {
            to_status: Some(TaskStatus::Pending.to_string()),
            ..TaskEvent::new(child, TaskEventType::RecurrenceMaterialized)
        };

        info!(
            dispatcher = %self.dispatcher_id,
            parent_task = %parent,
            child_task = %child,
            event = "recurrence_materialized",
            "Recurring task re-materialized"
        );

        debug!(event = ?event, "Detailed recurrence event");
    }

    pub fn log_deferred(&self, task_id: &TaskId, reason: &str) {
        let event = TaskEvent {
            to_status: Some(TaskStatus::Pending.to_string()),
            error_message: Some(reason.to_string()),
            ..TaskEvent::new(task_id, TaskEventType::Deferred)
        };

        debug!(
            dispatcher = %self.dispatcher_id,
            task_id = %task_id,
            reason = reason,
            event = "task_deferred",
            "Task returned to pending"
        );

        debug!(event = ?event, "Detailed deferral event");
    }

    pub fn log_proxy_health(&self, host_id: &HostId, proxy_id: &ProxyId, healthy: bool, failures: u32) {
        if healthy {
            debug!(
                worker = %self.dispatcher_id,
                host_id = %host_id,
                proxy_id = %proxy_id,
                failures = failures,
                event = "proxy_health",
                "Proxy healthy"
            );
        } else {
            warn!(
                worker = %self.dispatcher_id,
                host_id = %host_id,
                proxy_id = %proxy_id,
                failures = failures,
                event = "proxy_health",
                "Proxy degraded"
            );
        }
    }

    pub fn log_round(
        &self,
        reclaimed: usize,
        recurred: usize,
        parse_published: usize,
        dispatched: usize,
        skipped: usize,
    ) {
        if reclaimed + recurred + parse_published + dispatched + skipped > 0 {
            info!(
                dispatcher = %self.dispatcher_id,
                reclaimed,
                recurred,
                parse_published,
                dispatched,
                skipped,
                event = "dispatch_round",
                "Dispatch round completed"
            );
        } else {
            debug!(dispatcher = %self.dispatcher_id, event = "dispatch_round", "Idle dispatch round");
        }
    }
}
