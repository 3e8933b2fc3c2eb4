/// Logging Setup
///
/// Installs the global tracing subscriber. Everything goes to stderr because
/// stdout carries the JSON-RPC stream in STDIO mode. When a log path is
/// configured, a second plain-text layer appends to that file.

use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::core::utils::LoggingConfig;

/// Build the filter: an explicit `override_level` wins, then `RUST_LOG`,
/// then the configured level.
pub fn build_filter(override_level: Option<&str>, config: &LoggingConfig) -> EnvFilter {
    match override_level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level)),
    }
}

/// Install the global subscriber.
///
/// # Arguments
/// * `config` - Logging section of the server configuration
/// * `override_level` - Level given on the command line, if any
pub fn init_logging(config: &LoggingConfig, override_level: Option<&str>) -> anyhow::Result<()> {
    let filter = build_filter(override_level, config);

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false);

    let file_layer = match &config.path {
        Some(path) => {
            let file = open_log_file(path)?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_writer(Arc::new(file))
                    .with_ansi(false),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .try_init()?;
    Ok(())
}

fn open_log_file(path: &Path) -> anyhow::Result<std::fs::File> {
    use anyhow::Context;

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create log directory {}", parent.display()))?;
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open log file {}", path.display()))
}
