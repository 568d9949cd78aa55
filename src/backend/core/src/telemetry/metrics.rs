//! Scheduler metrics through the `metrics` facade.
//!
//! Nothing is exported by this crate; install any `metrics` recorder in the
//! host process to collect these.
//!
//! # Example
//!
//! ```rust,no_run
//! use runmanager_core::telemetry::metrics::{describe_metrics, JobMetrics};
//! use runmanager_core::jobs::{JobState, JobType};
//!
//! describe_metrics();
//! JobMetrics::enqueued(3);
//! JobMetrics::finished(JobState::Succeeded, &JobType::EnergyPlus, Some(12.5));
//! ```

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use std::sync::Once;
use std::time::Instant;

use crate::jobs::{JobState, JobType};

pub const JOBS_ENQUEUED_TOTAL: &str = "runmanager_jobs_enqueued_total";
pub const JOBS_FINISHED_TOTAL: &str = "runmanager_jobs_finished_total";
pub const JOBS_RUNNING: &str = "runmanager_jobs_running";
pub const JOB_DURATION_SECONDS: &str = "runmanager_job_duration_seconds";
pub const ERRORS_TOTAL: &str = "runmanager_errors_total";

static DESCRIBED: Once = Once::new();

/// Register metric descriptions with the installed recorder. Idempotent.
pub fn describe_metrics() {
    DESCRIBED.call_once(|| {
        describe_counter!(JOBS_ENQUEUED_TOTAL, "Total number of jobs persisted by enqueue");
        describe_counter!(
            JOBS_FINISHED_TOTAL,
            "Total number of jobs reaching a terminal state"
        );
        describe_gauge!(JOBS_RUNNING, "Number of jobs currently executing");
        describe_histogram!(
            JOB_DURATION_SECONDS,
            "Wall-clock execution time of finished jobs in seconds"
        );
        describe_counter!(ERRORS_TOTAL, "Total number of errors by code");
    });
}

/// Job lifecycle metrics.
pub struct JobMetrics;

impl JobMetrics {
    pub fn enqueued(jobs: usize) {
        counter!(JOBS_ENQUEUED_TOTAL).increment(jobs as u64);
    }

    /// Record a terminal transition and, if known, its run time.
    pub fn finished(state: JobState, job_type: &JobType, duration_seconds: Option<f64>) {
        counter!(
            JOBS_FINISHED_TOTAL,
            "state" => state.as_str(),
            "job_type" => job_type.tag().to_string(),
        )
        .increment(1);

        if let Some(seconds) = duration_seconds {
            histogram!(JOB_DURATION_SECONDS, "job_type" => job_type.tag().to_string()).record(seconds);
        }
    }

    /// Start tracking a running job; the gauge drops when the guard does.
    pub fn running() -> RunningGuard {
        gauge!(JOBS_RUNNING).increment(1.0);
        RunningGuard {
            start: Instant::now(),
        }
    }
}

/// Keeps a job counted in the running gauge.
#[derive(Debug)]
pub struct RunningGuard {
    start: Instant,
}

impl RunningGuard {
    pub fn elapsed_seconds(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        gauge!(JOBS_RUNNING).decrement(1.0);
    }
}
