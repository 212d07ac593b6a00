/// Logging setup utilities
use anyhow::Error;

/// Initialize structured logging for the application
pub fn init_logging() -> Result<(), Error> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,crawl_orchestrator=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

/// Initialize logging with custom level
pub fn init_logging_with_level(level: &str) -> Result<(), Error> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    let env_filter = format!("{},crawl_orchestrator={}", level, level);

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| env_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

/// Log application startup information
pub fn log_startup_info(app_name: &str, version: &str) {
    tracing::info!(
        app_name = app_name,
        version = version,
        "Application starting"
    );
}
