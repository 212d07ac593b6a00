//! Admin control plane over the task store, allocator, and blob store.
pub mod plane;

pub use plane::{BulkRestartFilter, BulkRestartReport, ControlPlane, RestartOptions};
