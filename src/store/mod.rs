//! Task store: source of truth for hosts and crawl tasks.
pub mod memory;
pub mod model;
pub mod snapshot;

pub use memory::{MemoryTaskStore, MAX_BULK_URLS};
pub use model::{
    AttemptOutcome, BulkInsertReport, CrawlTask, Host, HostPatch, NewHost, NewTaskOptions,
    ReclaimReport, TaskCursor, TaskFilter, TaskPage, TaskPatch, TaskQuery, TaskSort,
};
pub use snapshot::StoreSnapshot;
