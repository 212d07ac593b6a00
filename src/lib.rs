// Modular organization for the crawl orchestration core
pub mod broker;
pub mod config;
pub mod control;
pub mod core;
pub mod dispatcher;
pub mod logging;
pub mod proxy;
pub mod storage;
pub mod store;
pub mod utils;
pub mod worker;

// Re-exports for convenience
// Core types and seams
pub use crate::core::{
    BindingId, BlobRef, BlobStore, ErrorKind, HostId, OrchestratorError, ParserTag, Priority,
    ProductParser, ProductSink, ProxyId, TaskId, TaskStatus, TaskStore,
};

// Configuration
pub use config::{load_config, OrchestratorConfig};

// Task store
pub use store::{
    AttemptOutcome, BulkInsertReport, CrawlTask, Host, MemoryTaskStore, NewHost, NewTaskOptions,
    TaskPatch, TaskQuery,
};

// Proxy allocation
pub use proxy::{NewProxy, ProxyAllocator, ProxyEndpoint, ProxyHandle, ProxyProtocol, ReleaseOutcome};

// Broker
pub use broker::{BrokerAdapter, CrawlJob, ParseJob, QueueName};

// Dispatcher and control plane
pub use control::{BulkRestartFilter, ControlPlane, RestartOptions};
pub use dispatcher::{Dispatcher, RoundStats};

// Workers
pub use worker::{CrawlerWorker, NoopParser, ParserRegistry, ParserWorker};

// Storage
pub use storage::{FileBlobStore, JsonlProductSink, ProductRecord};

// Logging components
pub use logging::TaskEventLogger;

// Utilities
pub use utils::{init_logging, normalize_url, url_fingerprint};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
