//! Subcommands and the store/config session they share.

pub mod jobs;
pub mod run;
pub mod stats;
pub mod workflow;

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use runmanager_core::config::Config;
use runmanager_core::scheduler::RunManager;
use runmanager_core::store::JobStore;
use runmanager_core::telemetry;

/// Resolved configuration for one invocation.
pub struct Session {
    pub config: Config,
}

impl Session {
    /// Load configuration, apply the `--store` override and install logging.
    pub fn new(config_file: Option<&Path>, store: Option<PathBuf>) -> Result<Self> {
        let mut config = match config_file {
            Some(path) => Config::from_file(path)
                .with_context(|| format!("Failed to load config from {}", path.display()))?,
            None => Config::load().context("Failed to load config from the environment")?,
        };
        if let Some(path) = store {
            config.store.path = path;
        }
        telemetry::init_telemetry(&config.logging)?;
        Ok(Self { config })
    }

    /// Open the store without starting workers or recovering interrupted jobs.
    pub async fn open_store(&self) -> Result<JobStore> {
        let path = &self.config.store.path;
        JobStore::open(path, self.config.store.busy_timeout)
            .await
            .with_context(|| format!("Failed to open job store {}", path.display()))
    }

    /// Start a run manager on the configured store.
    pub async fn open_manager(&self) -> Result<RunManager> {
        RunManager::open_from_config(&self.config)
            .await
            .context("Failed to start the run manager")
    }
}
