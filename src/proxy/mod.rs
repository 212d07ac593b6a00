//! Proxy allocation: per-host LRU rotation with independent binding and
//! global health accounting.
pub mod allocator;
pub mod model;

pub use allocator::ProxyAllocator;
pub use model::{
    BindingStats, HostProxyBinding, NewProxy, Proxy, ProxyEndpoint, ProxyHandle, ProxyProtocol,
    ReleaseOutcome, ReleaseSummary,
};
