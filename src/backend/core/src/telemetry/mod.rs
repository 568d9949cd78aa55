//! Telemetry: structured logging and scheduler metrics.
//!
//! - **Logging**: a `tracing-subscriber` registry with JSON, pretty or compact output
//! - **Metrics**: counters, a gauge and a histogram recorded through the `metrics` facade
//!
//! # Example
//!
//! ```rust,no_run
//! use runmanager_core::telemetry::{init_telemetry, LoggingConfig};
//!
//! init_telemetry(&LoggingConfig::default()).expect("Failed to initialize telemetry");
//! ```

pub mod logging;
pub mod metrics;

pub use logging::{init_logging, LogFormat, LoggingConfig, SpanEventConfig};
pub use metrics::{describe_metrics, JobMetrics, RunningGuard};

/// Install logging and describe metrics. Call once at startup.
///
/// # Errors
///
/// Returns an error if logging cannot be initialized.
pub fn init_telemetry(config: &LoggingConfig) -> anyhow::Result<()> {
    init_logging(config)?;
    describe_metrics();
    ::tracing::debug!(format = ?config.format, level = %config.level, "Telemetry initialized");
    Ok(())
}
