//! Crate error type with machine-stable kinds.
//!
//! Every failure a caller can observe carries one of the fixed
//! [`ErrorKind`] values plus a free-form message; bulk operations report
//! per-item outcomes instead of rolling back.
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::types::{HostId, TaskId, TaskStatus};

/// Machine-stable error discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    Duplicate,
    IllegalTransition,
    HtmlNotAvailable,
    NoProxyAvailable,
    BrokerUnavailable,
    StoreUnavailable,
    Validation,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::Duplicate => "duplicate",
            ErrorKind::IllegalTransition => "illegal_transition",
            ErrorKind::HtmlNotAvailable => "html_not_available",
            ErrorKind::NoProxyAvailable => "no_proxy_available",
            ErrorKind::BrokerUnavailable => "broker_unavailable",
            ErrorKind::StoreUnavailable => "store_unavailable",
            ErrorKind::Validation => "validation",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Error)]
pub enum OrchestratorError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("live task {existing} already holds fingerprint {fingerprint}")]
    Duplicate { fingerprint: String, existing: TaskId },

    #[error("task {task} is {actual}, expected one of {expected:?}")]
    IllegalTransition {
        task: TaskId,
        actual: TaskStatus,
        expected: Vec<TaskStatus>,
    },

    #[error("downloaded html no longer available for task {task}")]
    HtmlNotAvailable { task: TaskId },

    #[error("no proxy available for host {host}")]
    NoProxyAvailable { host: HostId },

    #[error("broker unavailable: {0}")]
    BrokerUnavailable(String),

    #[error("task store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("validation failed: {0}")]
    Validation(String),
}

impl OrchestratorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            OrchestratorError::NotFound { .. } => ErrorKind::NotFound,
            OrchestratorError::Duplicate { .. } => ErrorKind::Duplicate,
            OrchestratorError::IllegalTransition { .. } => ErrorKind::IllegalTransition,
            OrchestratorError::HtmlNotAvailable { .. } => ErrorKind::HtmlNotAvailable,
            OrchestratorError::NoProxyAvailable { .. } => ErrorKind::NoProxyAvailable,
            OrchestratorError::BrokerUnavailable(_) => ErrorKind::BrokerUnavailable,
            OrchestratorError::StoreUnavailable(_) => ErrorKind::StoreUnavailable,
            OrchestratorError::Validation(_) => ErrorKind::Validation,
        }
    }

    /// Whether the caller should retry after a delay instead of failing
    /// the task outright.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::NoProxyAvailable | ErrorKind::BrokerUnavailable | ErrorKind::StoreUnavailable
        )
    }

    /// CAS losses are expected under concurrent actors and are not
    /// reported as failures by dispatcher or workers.
    pub fn is_benign_race(&self) -> bool {
        self.kind() == ErrorKind::IllegalTransition
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        OrchestratorError::Validation(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_are_stable() {
        assert_eq!(ErrorKind::HtmlNotAvailable.to_string(), "html_not_available");
        assert_eq!(ErrorKind::NoProxyAvailable.to_string(), "no_proxy_available");
    }

    #[test]
    fn retryable_kinds() {
        let err = OrchestratorError::NoProxyAvailable {
            host: HostId::new("host_a"),
        };
        assert!(err.is_retryable());
        assert!(!OrchestratorError::validation("bad url").is_retryable());
        let race = OrchestratorError::IllegalTransition {
            task: TaskId::new("task_a"),
            actual: TaskStatus::Cancelled,
            expected: vec![TaskStatus::Queued],
        };
        assert!(race.is_benign_race());
        assert!(!race.is_retryable());
    }
}
