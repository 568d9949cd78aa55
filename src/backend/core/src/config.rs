//! Configuration management.
//!
//! Sources, later overriding earlier: serde defaults, an optional file, then
//! environment variables such as `RUNMANAGER__SCHEDULER__WORKERS=8`.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{ErrorCode, RunError, Result};
use crate::jobs::ToolInfo;
use crate::telemetry::LoggingConfig;

pub const ENV_PREFIX: &str = "RUNMANAGER";
pub const ENV_SEPARATOR: &str = "__";

/// Main application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Job store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Worker pool and dispatch configuration
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Default tool table
    #[serde(default)]
    pub tools: Vec<ToolInfo>,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Store file
    #[serde(default = "default_store_path")]
    pub path: PathBuf,

    /// How long to wait on a locked store file
    #[serde(default = "default_busy_timeout", with = "humantime_serde")]
    pub busy_timeout: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
            busy_timeout: default_busy_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Maximum number of jobs executing at once
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Whether dispatch starts paused
    #[serde(default = "default_start_paused")]
    pub start_paused: bool,

    /// Capacity of the job event channel
    #[serde(default = "default_event_buffer_size")]
    pub event_buffer_size: usize,

    /// How long shutdown waits for running jobs
    #[serde(default = "default_shutdown_timeout", with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            start_paused: default_start_paused(),
            event_buffer_size: default_event_buffer_size(),
            shutdown_timeout: default_shutdown_timeout(),
        }
    }
}

// Default value functions
fn default_store_path() -> PathBuf { PathBuf::from("runmanager.db") }
fn default_busy_timeout() -> Duration { Duration::from_secs(5) }
fn default_workers() -> usize { std::thread::available_parallelism().map(usize::from).unwrap_or(1).max(1) }
fn default_start_paused() -> bool { true }
fn default_event_buffer_size() -> usize { 1024 }
fn default_shutdown_timeout() -> Duration { Duration::from_secs(30) }

impl Config {
    /// Load configuration from environment variables.
    pub fn load() -> Result<Self> {
        let config = config::Config::builder()
            .add_source(environment())
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load configuration from a file, with environment overrides.
    pub fn from_file(path: &Path) -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::from(path))
            .add_source(environment())
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject values the scheduler cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.scheduler.workers == 0 {
            return Err(RunError::new(
                ErrorCode::InvalidConfiguration,
                "scheduler.workers must be at least 1",
            ));
        }
        if self.scheduler.event_buffer_size == 0 {
            return Err(RunError::new(
                ErrorCode::InvalidConfiguration,
                "scheduler.event_buffer_size must be at least 1",
            ));
        }
        if self.store.path.as_os_str().is_empty() {
            return Err(RunError::new(ErrorCode::MissingConfiguration, "store.path is empty"));
        }
        Ok(())
    }
}

fn environment() -> config::Environment {
    config::Environment::with_prefix(ENV_PREFIX)
        .separator(ENV_SEPARATOR)
        .try_parsing(true)
}
