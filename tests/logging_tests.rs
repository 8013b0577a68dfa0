//! Integration tests for logging initialization
//!
//! Subscriber installation is process-global, so every test that touches
//! it runs serially and tolerates an already-initialized subscriber.

use anyhow::Result;
use serial_test::serial;
use tensorforge::logging::{
    init_logging_default, init_with_config, is_initialized, LogFormat, LogLevel, LoggingConfig,
};

#[test]
#[serial]
fn test_default_initialization_is_idempotent() {
    init_logging_default();
    assert!(is_initialized());
    // Second call must be a no-op, not a panic
    init_logging_default();
    assert!(is_initialized());
}

#[test]
#[serial]
fn test_init_with_file_config() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let log_path = dir.path().join("logs").join("forge.log");
    let config = LoggingConfig::new()
        .with_level(LogLevel::Debug)
        .with_format(LogFormat::Json)
        .with_log_file(log_path);

    // The first initializer in the process wins; this must not panic
    // either way.
    init_with_config(&config);
    assert!(is_initialized());

    tracing::info!(test = "logging_tests", "emitting a structured event");
    Ok(())
}

#[test]
#[serial]
fn test_events_do_not_panic_after_init() {
    init_logging_default();
    tracing::error!("error-level event");
    tracing::warn!("warn-level event");
    tracing::info!(field = 42, "info-level event with field");
    tracing::debug!("debug-level event");
    tracing::trace!("trace-level event");
}
