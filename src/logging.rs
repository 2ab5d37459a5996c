//! Logging setup for mailpacer using tracing.
//!
//! The log file is JSON, one event per line, so the structured fields on
//! deliveries and dispatches (`message_id`, `queue`, `conversation_id`,
//! `handler`, ...) can be filtered with ordinary tools. The console stays
//! human-readable.

use anyhow::Result;
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const LOG_FILE_PREFIX: &str = "mailpacer.log";
const DEFAULT_DIRECTIVES: &str = "info,mailpacer=debug";

/// Initialize logging with a JSON file appender and console output.
pub fn init() -> Result<(WorkerGuard, PathBuf)> {
    let log_dir = get_log_dir()?;
    std::fs::create_dir_all(&log_dir)?;

    let file_appender = tracing_appender::rolling::daily(&log_dir, LOG_FILE_PREFIX);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = fmt::layer()
        .json()
        .flatten_event(true)
        .with_current_span(false)
        .with_writer(non_blocking)
        .with_target(true)
        .with_file(true)
        .with_line_number(true);

    let console_layer = fmt::layer()
        .compact()
        .with_writer(std::io::stderr)
        .with_target(false);

    tracing_subscriber::registry()
        .with(env_filter(DEFAULT_DIRECTIVES))
        .with(file_layer)
        .with(console_layer)
        .try_init()?;

    tracing::info!(
        log_dir = %log_dir.display(),
        version = env!("CARGO_PKG_VERSION"),
        "Logging initialized"
    );

    Ok((guard, log_dir))
}

/// `RUST_LOG` when set and valid, `default` otherwise.
fn env_filter(default: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default))
}

fn get_log_dir() -> Result<PathBuf> {
    let dirs = directories::ProjectDirs::from("com", "mailpacer", "mailpacer")
        .ok_or_else(|| anyhow::anyhow!("Could not determine data directory"))?;

    Ok(dirs.data_dir().join("logs"))
}

/// Console-only logging for tests. Safe to call from every test.
#[cfg(test)]
pub fn init_test() {
    // Only the first call installs a subscriber.
    let _ = tracing_subscriber::registry()
        .with(env_filter("debug"))
        .with(fmt::layer().with_test_writer())
        .try_init();
}
