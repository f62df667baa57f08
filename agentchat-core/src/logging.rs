//! Logging for agentchat
//!
//! The CLI prints command output on stdout, so logs go to a daily-rotated
//! file at [`Config::log_path`]. `AGENTCHAT_LOG` takes precedence over
//! `RUST_LOG`, which takes precedence over `[logging] level`.

use std::path::Path;

use crate::config::{Config, LoggingConfig};
use crate::error::{Error, Result};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// Environment variable overriding the configured level
pub const LOG_ENV: &str = "AGENTCHAT_LOG";

/// HTTP stack crates that are only interesting when asked for by name
const QUIET_TARGETS: &[&str] = &["hyper", "hyper_util", "h2", "reqwest", "rustls"];

/// Filter directives for a base level or directive string.
///
/// Noisy transport crates are capped at `warn` unless `base` already
/// mentions them.
pub fn filter_directives(base: &str) -> String {
    let base = base.trim();
    let base = if base.is_empty() { "info" } else { base };

    let mut directives = vec![base.to_string()];
    for target in QUIET_TARGETS {
        let named = base
            .split(',')
            .any(|d| d.trim().split('=').next() == Some(*target));
        if !named {
            directives.push(format!("{}=warn", target));
        }
    }
    directives.join(",")
}

/// Build the filter from `override_directives` if present, else the config level.
pub fn build_filter(config: &LoggingConfig, override_directives: Option<&str>) -> Result<EnvFilter> {
    let base = override_directives
        .filter(|d| !d.trim().is_empty())
        .unwrap_or(config.level.as_str());
    EnvFilter::try_new(filter_directives(base))
        .map_err(|e| Error::Config(format!("invalid log filter '{}': {}", base, e)))
}

/// Initialize file logging.
///
/// The returned guard must live until exit or buffered lines are lost.
pub fn init(config: &LoggingConfig) -> Result<LoggingGuard> {
    let log_path = Config::log_path();
    let (log_dir, file_name) = split_log_path(&log_path)?;

    std::fs::create_dir_all(log_dir)?;

    let file_appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(file_name)
        .max_log_files(config.max_files.max(1))
        .build(log_dir)
        .map_err(|e| Error::Config(format!("failed to create log appender: {}", e)))?;

    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let env_override = std::env::var(LOG_ENV)
        .ok()
        .or_else(|| std::env::var("RUST_LOG").ok());
    let filter = build_filter(config, env_override.as_deref())?;

    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .init();

    tracing::info!(
        log_file = %log_path.display(),
        level = %config.level,
        env_override = env_override.is_some(),
        max_files = config.max_files,
        version = env!("CARGO_PKG_VERSION"),
        "Logging initialized"
    );

    Ok(LoggingGuard { _guard: guard })
}

fn split_log_path(path: &Path) -> Result<(&Path, &str)> {
    let dir = path.parent();
    let name = path.file_name().and_then(|n| n.to_str());
    match (dir, name) {
        (Some(dir), Some(name)) => Ok((dir, name)),
        _ => Err(Error::Config(format!(
            "log path has no file name: {}",
            path.display()
        ))),
    }
}

/// Initialize logging for tests (logs to the test writer)
pub fn init_test() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter_directives(
            &std::env::var(LOG_ENV).unwrap_or_default(),
        )))
        .with_test_writer()
        .with_span_events(FmtSpan::CLOSE)
        .try_init();
}

/// Keeps the background log writer alive; flushes on drop.
pub struct LoggingGuard {
    _guard: tracing_appender::non_blocking::WorkerGuard,
}
