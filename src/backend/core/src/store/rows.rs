//! Row types and conversions for the job store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::Result;
use crate::jobs::{Job, JobId, JobState};

/// Column list matching [`JobRow`].
pub(crate) const JOB_COLUMNS: &str = "seq, id, root_id, parent_id, child_index, job_type, runnable, \
     state, params, input_files, output_files, expected_outputs, tools, error, base_path, \
     cancel_requested, created_at, started_at, finished_at";

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct JobRow {
    pub seq: i64,
    pub id: String,
    pub root_id: String,
    pub parent_id: Option<String>,
    pub child_index: i64,
    pub job_type: String,
    pub runnable: bool,
    pub state: String,
    pub params: String,
    pub input_files: String,
    pub output_files: String,
    pub expected_outputs: String,
    pub tools: String,
    pub error: Option<String>,
    pub base_path: String,
    pub cancel_requested: bool,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl JobRow {
    pub fn into_job(self, children: Vec<JobId>, join_dependencies: Vec<JobId>) -> Result<Job> {
        Ok(Job {
            id: self.id.parse()?,
            root_id: self.root_id.parse()?,
            job_type: self.job_type.into(),
            params: serde_json::from_str(&self.params)?,
            input_files: serde_json::from_str(&self.input_files)?,
            output_files: serde_json::from_str(&self.output_files)?,
            expected_outputs: serde_json::from_str(&self.expected_outputs)?,
            tools: serde_json::from_str(&self.tools)?,
            state: self.state.parse()?,
            error: self.error.as_deref().map(serde_json::from_str).transpose()?,
            runnable: self.runnable,
            parent_id: self.parent_id.as_deref().map(str::parse).transpose()?,
            child_index: u32::try_from(self.child_index).unwrap_or_default(),
            children,
            join_dependencies,
            base_path: PathBuf::from(self.base_path),
            cancel_requested: self.cancel_requested,
            created_at: self.created_at,
            started_at: self.started_at,
            finished_at: self.finished_at,
        })
    }
}

/// The fields of a row needed to walk up a tree.
#[derive(Debug, sqlx::FromRow)]
pub(crate) struct LineageRow {
    pub parent_id: Option<String>,
    pub input_files: String,
    pub output_files: String,
    pub base_path: String,
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct StateRow {
    pub id: String,
    pub state: String,
}

impl StateRow {
    pub fn parse(&self) -> Result<(JobId, JobState)> {
        Ok((self.id.parse()?, self.state.parse()?))
    }
}

/// Job counts per state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStats {
    pub pending: u64,
    pub ready: u64,
    pub running: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub canceled: u64,
    pub total: u64,
}

impl RunStats {
    pub fn count(&self, state: JobState) -> u64 {
        match state {
            JobState::Pending => self.pending,
            JobState::Ready => self.ready,
            JobState::Running => self.running,
            JobState::Succeeded => self.succeeded,
            JobState::Failed => self.failed,
            JobState::Canceled => self.canceled,
        }
    }

    pub(crate) fn add(&mut self, state: JobState, n: u64) {
        let slot = match state {
            JobState::Pending => &mut self.pending,
            JobState::Ready => &mut self.ready,
            JobState::Running => &mut self.running,
            JobState::Succeeded => &mut self.succeeded,
            JobState::Failed => &mut self.failed,
            JobState::Canceled => &mut self.canceled,
        };
        *slot += n;
        self.total += n;
    }

    /// Jobs not yet in a terminal state.
    pub fn unfinished(&self) -> u64 {
        self.pending + self.ready + self.running
    }
}
