//! Shared helpers: logging initialization, URL normalization.
pub mod logging;
pub mod url_norm;

pub use logging::{init_logging, init_logging_with_level, log_startup_info};
pub use url_norm::{normalize_and_fingerprint, normalize_url, url_fingerprint};
