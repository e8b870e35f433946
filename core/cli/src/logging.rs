//! File logging for the `proctor` binary.
//!
//! Stdout carries command output (JSON lines), so logs go to a daily-rolling
//! file under `<proctor home>/logs`. `PROCTOR_LOG_STDERR=1` mirrors them to
//! stderr as well.

use std::env;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

const LOG_FILE_PREFIX: &str = "proctor.log";

/// Installs the global subscriber. Hold the returned guard until exit so
/// buffered lines are flushed.
pub fn init() -> Option<WorkerGuard> {
    let filter = || {
        EnvFilter::try_from_env("PROCTOR_LOG").unwrap_or_else(|_| EnvFilter::new("info"))
    };
    let stderr_enabled = env::var("PROCTOR_LOG_STDERR")
        .map(|value| matches!(value.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"))
        .unwrap_or(false);
    let stderr_layer = stderr_enabled.then(|| {
        fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false)
            .with_filter(filter())
    });

    let log_dir = match proctor_engine::proctor_home() {
        Some(root) => root.join("logs"),
        None => {
            tracing_subscriber::registry().with(stderr_layer).init();
            return None;
        }
    };
    if fs_err::create_dir_all(&log_dir).is_err() {
        tracing_subscriber::registry().with(stderr_layer).init();
        return None;
    }

    let appender = tracing_appender::rolling::daily(&log_dir, LOG_FILE_PREFIX);
    let (writer, guard) = tracing_appender::non_blocking(appender);
    let file_layer = fmt::layer()
        .with_writer(writer)
        .with_ansi(false)
        .with_filter(filter());

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(file_layer)
        .init();
    Some(guard)
}
