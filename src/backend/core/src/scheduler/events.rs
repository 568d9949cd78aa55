//! Events broadcast by the scheduler.

use serde::{Deserialize, Serialize};

use crate::jobs::{JobError, JobId, JobType};

/// A scheduler-level occurrence, delivered to every subscriber.
///
/// Delivery is best effort: a subscriber that falls behind the channel
/// capacity misses events rather than slowing the scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum JobEvent {
    /// A tree was persisted
    Enqueued { root_id: JobId, jobs: usize },
    /// A job became eligible for dispatch
    Ready { job_id: JobId },
    /// A worker claimed a job
    Started { job_id: JobId, job_type: JobType },
    /// A job finished and all its outputs exist
    Succeeded { job_id: JobId, outputs: usize },
    /// A job failed
    Failed { job_id: JobId, error: JobError },
    /// A job was canceled, directly or through a prerequisite
    Canceled { job_id: JobId },
    /// Dispatch was paused or resumed
    PauseChanged { paused: bool },
}

impl JobEvent {
    /// The job this event concerns, if any.
    pub fn job_id(&self) -> Option<JobId> {
        match self {
            Self::Enqueued { root_id, .. } => Some(*root_id),
            Self::Ready { job_id }
            | Self::Started { job_id, .. }
            | Self::Succeeded { job_id, .. }
            | Self::Failed { job_id, .. }
            | Self::Canceled { job_id } => Some(*job_id),
            Self::PauseChanged { .. } => None,
        }
    }
}
