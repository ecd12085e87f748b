//! Tracing setup for the host and for plugin binaries.

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

use crate::config::LoggingConfig;

const LOG_FILE_PREFIX: &str = "oasis-host.log";

/// Install the host subscriber: stdout (plain or JSON) plus an optional daily
/// rolling file. The returned guard flushes the file writer on drop and must
/// be held for the life of the process.
pub fn init(config: &LoggingConfig, debug: bool) -> Option<WorkerGuard> {
    let level = if debug { "debug" } else { "info" };
    let filter = || {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(format!("oasis={level},oasis_host={level},warn")))
    };

    let stdout_layer = if config.json {
        fmt::layer().json().with_filter(filter()).boxed()
    } else {
        fmt::layer().with_filter(filter()).boxed()
    };

    let mut layers = vec![stdout_layer];
    let mut guard = None;
    if let Some(dir) = &config.directory {
        let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
        let (writer, file_guard) = tracing_appender::non_blocking(appender);
        layers.push(
            fmt::layer()
                .json()
                .with_writer(writer)
                .with_ansi(false)
                .with_filter(filter())
                .boxed(),
        );
        guard = Some(file_guard);
    }

    let result = tracing_subscriber::registry().with(layers).try_init();
    if let Err(e) = result {
        eprintln!("tracing already initialized: {e}");
    }

    guard
}

/// Subscriber for plugin binaries. Stdout carries the handshake, so
/// everything goes to stderr, where the host picks it up.
pub fn init_plugin() {
    let _ = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .with_target(false)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .try_init();
}
