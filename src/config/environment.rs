//! Environment variable overrides applied on top of file/default config.
use std::env;

use super::orchestrator::OrchestratorConfig;

const ENV_PREFIX: &str = "CRAWL_ORCH_";

fn parse_var<T: std::str::FromStr>(name: &str) -> Option<T> {
    env::var(format!("{}{}", ENV_PREFIX, name))
        .ok()
        .and_then(|v| v.parse().ok())
}

/// Apply recognized `CRAWL_ORCH_*` overrides in place.
///
/// Unparseable values are ignored rather than failing startup.
pub fn apply_env_overrides(cfg: &mut OrchestratorConfig) {
    if let Some(v) = parse_var("DISPATCHER_INTERVAL_SECS") {
        cfg.dispatcher.interval_secs = v;
    }
    if let Some(v) = parse_var("DISPATCHER_BATCH_SIZE") {
        cfg.dispatcher.batch_size = v;
    }
    if let Some(v) = parse_var("BACKOFF_BASE_SECS") {
        cfg.backoff.base_secs = v;
    }
    if let Some(v) = parse_var("BACKOFF_CAP_SECS") {
        cfg.backoff.cap_secs = v;
    }
    if let Some(v) = parse_var("BROKER_PREFETCH") {
        cfg.broker.prefetch = v;
    }
    if let Some(v) = parse_var("QUEUE_MAX_LENGTH") {
        cfg.broker.max_length = v;
    }
    if let Ok(v) = env::var(format!("{}LOG_LEVEL", ENV_PREFIX)) {
        cfg.logging.level = v;
    }
}

/// Convenience loader: file (when present) + env overrides.
pub fn load_config(path: Option<&std::path::Path>) -> crate::core::Result<OrchestratorConfig> {
    let mut cfg = match path {
        Some(p) => OrchestratorConfig::from_file(p)?,
        None => OrchestratorConfig::default(),
    };
    apply_env_overrides(&mut cfg);
    Ok(cfg)
}
