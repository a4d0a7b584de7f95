//! # Structured Logging Module
//!
//! Environment-aware structured logging that writes human-readable output to the
//! console and JSON lines to a per-process log file.

use chrono::Utc;
use std::fs;
use std::path::PathBuf;
use std::process;
use std::sync::OnceLock;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

static LOGGER_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Initialize structured logging with environment-specific configuration
pub fn init_structured_logging() {
    LOGGER_INITIALIZED.get_or_init(|| {
        let environment = get_environment();
        let log_level = get_log_level(&environment);

        let log_dir = PathBuf::from("log");
        let file_layer = if fs::create_dir_all(&log_dir).is_ok() {
            let pid = process::id();
            let timestamp = Utc::now().format("%Y%m%d_%H%M%S").to_string();
            let file_appender = tracing_appender::rolling::never(
                &log_dir,
                format!("{environment}.{pid}.{timestamp}.log"),
            );
            let (file_writer, guard) = tracing_appender::non_blocking(file_appender);
            // The guard must outlive the subscriber, which lives for the whole process
            std::mem::forget(guard);
            Some(
                fmt::layer()
                    .with_writer(file_writer)
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_level(true)
                    .with_ansi(false)
                    .json()
                    .with_filter(EnvFilter::new(log_level.clone())),
            )
        } else {
            None
        };

        let subscriber = tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_level(true)
                    .with_ansi(true)
                    .with_filter(EnvFilter::new(log_level)),
            )
            .with(file_layer);

        // An embedding host may already own the global subscriber
        if subscriber.try_init().is_err() {
            tracing::debug!("Global tracing subscriber already initialized - keeping it");
        }

        tracing::info!(
            pid = process::id(),
            environment = %environment,
            "🔧 STRUCTURED LOGGING: Initialized"
        );
    });
}

/// Current environment from environment variables
pub fn get_environment() -> String {
    std::env::var("ORCHESTRATOR_ENV")
        .or_else(|_| std::env::var("APP_ENV"))
        .unwrap_or_else(|_| "development".to_string())
}

/// Log level based on environment, overridable via `RUST_LOG`
fn get_log_level(environment: &str) -> String {
    if let Ok(level) = std::env::var("RUST_LOG") {
        return level;
    }
    match environment {
        "production" => "info".to_string(),
        _ => "debug".to_string(),
    }
}

/// Log structured data for work request operations
pub fn log_work_operation(
    operation: &str,
    request_id: &str,
    kind: &str,
    priority: &str,
    status: &str,
    details: Option<&str>,
) {
    tracing::info!(
        operation = %operation,
        request_id = %request_id,
        kind = %kind,
        priority = %priority,
        status = %status,
        details = details,
        timestamp = %Utc::now().to_rfc3339(),
        "📋 WORK_OPERATION"
    );
}

/// Log structured data for deployment operations
pub fn log_deployment_operation(
    operation: &str,
    deployment_id: &str,
    strategy: Option<&str>,
    environment: Option<&str>,
    status: &str,
    details: Option<&str>,
) {
    tracing::info!(
        operation = %operation,
        deployment_id = %deployment_id,
        strategy = strategy,
        environment = environment,
        status = %status,
        details = details,
        timestamp = %Utc::now().to_rfc3339(),
        "🚀 DEPLOYMENT_OPERATION"
    );
}

/// Log structured data for scaling operations
pub fn log_scaling_operation(
    operation: &str,
    component_id: &str,
    previous_instances: u32,
    target_instances: u32,
    reason: &str,
) {
    tracing::info!(
        operation = %operation,
        component_id = %component_id,
        previous_instances = previous_instances,
        target_instances = target_instances,
        reason = %reason,
        timestamp = %Utc::now().to_rfc3339(),
        "📈 SCALING_OPERATION"
    );
}

/// Log error with full context
pub fn log_error(component: &str, operation: &str, error: &str, context: Option<&str>) {
    tracing::error!(
        component = %component,
        operation = %operation,
        error = %error,
        context = context,
        timestamp = %Utc::now().to_rfc3339(),
        "❌ ERROR"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_level_mapping() {
        if std::env::var("RUST_LOG").is_ok() {
            return;
        }
        assert_eq!(get_log_level("test"), "debug");
        assert_eq!(get_log_level("development"), "debug");
        assert_eq!(get_log_level("production"), "info");
        assert_eq!(get_log_level("unknown"), "debug");
    }
}
