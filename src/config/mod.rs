//! Configuration loading and defaults.
pub mod environment;
pub mod orchestrator;

pub use environment::{apply_env_overrides, load_config};
pub use orchestrator::{
    BackoffConfig, BrokerConfig, DispatcherConfig, LoggingConfig, OrchestratorConfig, ProxyConfig,
    StateDeadlines, UrlNormalizeConfig, WorkerConfig,
};
