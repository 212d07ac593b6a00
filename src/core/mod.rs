//! Shared foundation: error type, identifiers, status machine, seams.
pub mod error;
pub mod traits;
pub mod types;

pub use error::{ErrorKind, OrchestratorError, Result};
pub use traits::{BlobStore, ProductParser, ProductSink, PutOutcome, TaskStore};
pub use types::{BindingId, BlobRef, HostId, ParserTag, Priority, ProxyId, TaskId, TaskStatus};
