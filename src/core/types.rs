//! Identifier newtypes and shared enums used across every component.
use serde::{Deserialize, Serialize};

macro_rules! id_type {
    ($name:ident, $prefix:literal) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Generate a new random id with the type's prefix.
            pub fn generate() -> Self {
                Self(format!(concat!($prefix, "_{}"), uuid::Uuid::new_v4().simple()))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn into_string(self) -> String {
                self.0
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_type!(TaskId, "task");
id_type!(HostId, "host");
id_type!(ProxyId, "proxy");
id_type!(BindingId, "bind");

/// Status of a crawl task in the two-phase pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskStatus {
    Pending,
    Queued,
    Crawling,
    Downloaded,
    QueuedParse,
    Parsing,
    Completed,
    Failed,
    Paused,
    Cancelled,
}

impl TaskStatus {
    /// Every state an admin operation may start from.
    pub const NON_TERMINAL: &'static [TaskStatus] = &[
        TaskStatus::Pending,
        TaskStatus::Queued,
        TaskStatus::Crawling,
        TaskStatus::Downloaded,
        TaskStatus::QueuedParse,
        TaskStatus::Parsing,
        TaskStatus::Paused,
    ];

    /// States in which a worker implicitly holds a lease on the task.
    pub const LEASED: &'static [TaskStatus] = &[
        TaskStatus::Queued,
        TaskStatus::Crawling,
        TaskStatus::QueuedParse,
        TaskStatus::Parsing,
    ];

    /// States a transient or terminal failure may be recorded from.
    pub const ACTIVE: &'static [TaskStatus] = &[
        TaskStatus::Queued,
        TaskStatus::Crawling,
        TaskStatus::Downloaded,
        TaskStatus::QueuedParse,
        TaskStatus::Parsing,
    ];

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    pub fn is_active(&self) -> bool {
        Self::ACTIVE.contains(self)
    }

    pub fn is_leased(&self) -> bool {
        Self::LEASED.contains(self)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Queued => "queued",
            TaskStatus::Crawling => "crawling",
            TaskStatus::Downloaded => "downloaded",
            TaskStatus::QueuedParse => "queued_parse",
            TaskStatus::Parsing => "parsing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Paused => "paused",
            TaskStatus::Cancelled => "cancelled",
        }
    }
}

impl Default for TaskStatus {
    fn default() -> Self {
        TaskStatus::Pending
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Task priority in `1..=10`; 1 is the most urgent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Priority(u8);

impl Priority {
    pub const HIGHEST: Priority = Priority(1);
    pub const LOWEST: Priority = Priority(10);

    /// Priorities at or above this urgency skip the default crawl queue.
    pub const EXPEDITE_THRESHOLD: u8 = 2;

    pub fn new(value: u8) -> Option<Self> {
        (1..=10).contains(&value).then_some(Self(value))
    }

    pub fn value(&self) -> u8 {
        self.0
    }

    /// Whether this priority routes to the dedicated priority queue.
    pub fn is_expedited(&self) -> bool {
        self.0 <= Self::EXPEDITE_THRESHOLD
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority(5)
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Routing tag a host carries to pick the parser handling its pages.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ParserTag(String);

impl ParserTag {
    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ParserTag {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl std::fmt::Display for ParserTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque reference to a downloaded page body in the blob store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlobRef(String);

impl BlobRef {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for BlobRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_range_is_enforced() {
        assert!(Priority::new(0).is_none());
        assert!(Priority::new(11).is_none());
        assert_eq!(Priority::new(1), Some(Priority::HIGHEST));
        assert_eq!(Priority::default().value(), 5);
    }

    #[test]
    fn priority_routing_threshold() {
        assert!(Priority::new(1).unwrap().is_expedited());
        assert!(Priority::new(2).unwrap().is_expedited());
        assert!(!Priority::new(3).unwrap().is_expedited());
    }

    #[test]
    fn terminal_states() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
        assert!(!TaskStatus::Paused.is_terminal());
        assert!(!TaskStatus::NON_TERMINAL.iter().any(|s| s.is_terminal()));
    }

    #[test]
    fn id_prefixes() {
        assert!(TaskId::generate().as_str().starts_with("task_"));
        assert!(BindingId::generate().as_str().starts_with("bind_"));
    }
}
