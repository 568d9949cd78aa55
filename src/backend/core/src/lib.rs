#![allow(clippy::result_large_err)]
//! # RunManager Core
//!
//! A durable job-dependency scheduler.
//!
//! ## Architecture
//!
//! - **Jobs**: typed jobs arranged in trees with parent, child and join edges
//! - **Workflows**: ordered step lists materialized into job trees, with parallel split/join
//! - **Executors**: pluggable per-type execution, including external tool processes
//! - **Store**: SQLite persistence with transactional readiness and cancel propagation
//! - **Scheduler**: a pausable, bounded worker pool with events and crash recovery
//! - **Telemetry**: structured logging and job metrics

pub mod config;
pub mod error;
pub mod executor;
pub mod jobs;
pub mod scheduler;
pub mod store;
pub mod telemetry;

pub use error::{ErrorCode, ErrorContext, ErrorDetails, ErrorSeverity, Result, RunError};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::error::{ErrorCode, ErrorContext, ErrorDetails, ErrorSeverity, Result, RunError};
    pub use crate::executor::{ExecutionContext, ExecutorRegistry, JobExecutor};
    pub use crate::jobs::{
        FileRef, Job, JobError, JobErrorKind, JobFactory, JobId, JobParams, JobState, JobTree,
        JobType, ToolInfo, ToolTable, ToolVersion, Workflow,
    };
    pub use crate::scheduler::{JobEvent, RunManager, RunManagerOptions};
    pub use crate::store::{CancelOutcome, JobStore, RunStats};
}
