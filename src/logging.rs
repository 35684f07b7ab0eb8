//! # Structured Logging Module
//!
//! Environment-aware structured logging. Console output is always on; setting
//! `TRIGGER_METRICS_LOG_DIR` adds a JSON-lines file per process.

use crate::config::detect_environment;
use chrono::Utc;
use std::path::PathBuf;
use std::process;
use std::sync::OnceLock;
use std::time::Duration;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

static LOGGER_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Initialize structured logging with environment-specific configuration.
/// Safe to call more than once; only the first call installs a subscriber.
pub fn init_structured_logging() {
    LOGGER_INITIALIZED.get_or_init(|| {
        let environment = detect_environment();
        let log_level = log_level_for(&environment);
        let filter = || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
        let production = environment == "production";

        let console = if production {
            fmt::layer()
                .with_target(true)
                .with_ansi(false)
                .json()
                .with_filter(filter())
                .boxed()
        } else {
            fmt::layer()
                .with_target(true)
                .with_level(true)
                .with_ansi(true)
                .with_filter(filter())
                .boxed()
        };

        let log_dir = std::env::var("TRIGGER_METRICS_LOG_DIR").ok().map(PathBuf::from);
        let (file_layer, log_file) = match &log_dir {
            Some(dir) => {
                let file_name = format!(
                    "{}.{}.{}.log",
                    environment,
                    process::id(),
                    Utc::now().format("%Y%m%d_%H%M%S")
                );
                let appender = tracing_appender::rolling::never(dir, &file_name);
                let (writer, guard) = tracing_appender::non_blocking(appender);
                // The writer flushes on guard drop; logging lives for the whole process
                std::mem::forget(guard);
                let layer = fmt::layer()
                    .with_writer(writer)
                    .with_ansi(false)
                    .json()
                    .with_filter(filter())
                    .boxed();
                (Some(layer), Some(dir.join(file_name)))
            }
            None => (None, None),
        };

        let subscriber = tracing_subscriber::registry().with(console).with(file_layer);
        if subscriber.try_init().is_err() {
            tracing::debug!("Global tracing subscriber already initialized - continuing with existing subscriber");
        }

        tracing::info!(
            pid = process::id(),
            environment = %environment,
            log_file = ?log_file,
            "Structured logging initialized"
        );
    });
}

/// Default filter directive for an environment; `RUST_LOG` takes precedence
fn log_level_for(environment: &str) -> &'static str {
    match environment {
        "production" => "info",
        "test" => "warn",
        _ => "debug",
    }
}

/// Log one completed store-facing operation
pub fn log_store_operation(
    component: &str,
    operation: &str,
    status: &str,
    duration: Duration,
    details: Option<&str>,
) {
    tracing::debug!(
        component = %component,
        operation = %operation,
        status = %status,
        duration_ms = duration.as_millis() as u64,
        details = details,
        "STORE_OPERATION"
    );
}
