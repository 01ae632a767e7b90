/// Logging module with background file rotation and multi-layer tracing setup.
///
/// This module provides:
/// - JSON and text log formatting
/// - Automatic file rotation (daily rotation)
/// - Background, non-blocking logging
/// - Environment-based log level filtering
/// - Separate log files stored in a dedicated logs/ folder
use std::path::Path;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Initialize the tracing subscriber with multi-layer setup.
///
/// Creates two log outputs:
/// 1. `logs/controller.log` - Human-readable text format with ANSI colors disabled
/// 2. `logs/controller.json.log` - Structured JSON format for parsing/analysis
///
/// Logs are rotated daily and old logs are kept with timestamps.
///
/// # Environment Variables
/// * `RUST_LOG` - Controls log level filtering (default: "info")
///
/// # Panics
/// Panics if the subscriber is already initialized.
pub fn init_logging<P: AsRef<Path>>(log_dir: P) -> Result<(), Box<dyn std::error::Error>> {
    let log_path = log_dir.as_ref();
    std::fs::create_dir_all(log_path)?;

    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .expect("Failed to create EnvFilter");

    let text_file_appender = tracing_appender::rolling::daily(log_path, "controller.log");
    let (text_writer, text_guard) = tracing_appender::non_blocking(text_file_appender);

    let json_file_appender = tracing_appender::rolling::daily(log_path, "controller.json.log");
    let (json_writer, json_guard) = tracing_appender::non_blocking(json_file_appender);

    let text_layer = fmt::layer()
        .with_writer(text_writer)
        .with_target(true)
        .with_line_number(true)
        .with_ansi(false)
        .compact()
        .with_filter(env_filter.clone());

    let json_layer = fmt::layer()
        .json()
        .with_writer(json_writer)
        .with_target(true)
        .with_current_span(true)
        .with_span_list(true)
        .with_filter(env_filter.clone());

    let stdout_layer = fmt::layer()
        .with_target(false)
        .with_line_number(false)
        .compact()
        .with_filter(env_filter);

    tracing_subscriber::registry()
        .with(text_layer)
        .with(json_layer)
        .with(stdout_layer)
        .init();

    // Guards must outlive the process or buffered log lines are lost on drop.
    Box::leak(Box::new(text_guard));
    Box::leak(Box::new(json_guard));

    tracing::info!(
        "Logging initialized - logs will be written to {}",
        log_path.display()
    );

    Ok(())
}

/// Convenience wrapper that places logs in a "logs" subdirectory of the data dir.
pub fn init_logging_in_data_dir<P: AsRef<Path>>(
    data_dir: P,
) -> Result<(), Box<dyn std::error::Error>> {
    let log_dir = data_dir.as_ref().join("logs");
    init_logging(log_dir)
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    #[test]
    fn test_log_directory_creation() {
        let temp_dir = TempDir::new().unwrap();
        let log_path = temp_dir.path().join("logs");

        // init_logging panics if a subscriber is already set, so only the
        // directory handling is exercised here.
        std::fs::create_dir_all(&log_path).unwrap();
        assert!(log_path.exists());
    }
}
