//! Job inspection and management commands.
//!
//! These open the store directly; no workers are started.

use anyhow::{Context, Result};
use clap::Subcommand;
use serde::Serialize;
use tabled::Tabled;

use runmanager_core::jobs::{Job, JobId, JobState};

use super::Session;
use crate::output::{self, OutputFormat};

#[derive(Subcommand)]
pub enum JobCommands {
    /// List jobs
    List {
        /// Filter by state (pending, ready, running, succeeded, failed, canceled)
        #[arg(short, long)]
        state: Option<JobState>,
    },

    /// Show one job in full
    Show {
        /// Job ID
        job_id: JobId,
    },

    /// Cancel a job and everything downstream of it
    Cancel {
        /// Job ID
        job_id: JobId,
    },

    /// Remove a finished job and its finished descendants
    Remove {
        /// Job ID
        job_id: JobId,
    },

    /// Remove every tree whose jobs have all finished
    Clear,
}

/// One table line per job.
#[derive(Debug, Serialize, Tabled)]
pub struct JobRow {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Type")]
    job_type: String,
    #[tabled(rename = "State")]
    state: String,
    #[tabled(rename = "Parent")]
    parent: String,
    #[tabled(rename = "Duration")]
    duration: String,
    #[tabled(rename = "Error")]
    error: String,
}

impl From<&Job> for JobRow {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id.short(),
            job_type: job.job_type.to_string(),
            state: output::state_label(job.state),
            parent: job.parent_id.map(|p| p.short()).unwrap_or_else(|| "-".to_string()),
            duration: job
                .duration_ms()
                .map(|ms| format!("{:.1}s", ms as f64 / 1000.0))
                .unwrap_or_else(|| "-".to_string()),
            error: job.error.as_ref().map(|e| e.to_string()).unwrap_or_default(),
        }
    }
}

/// Print `jobs` as a table, or in full for JSON/YAML.
pub fn print_jobs(jobs: &[Job], format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Table => {
            let rows: Vec<JobRow> = jobs.iter().map(JobRow::from).collect();
            output::print_list(&rows, format)
        }
        _ => output::print_item(&jobs, format),
    }
}

// ── Execution ───────────────────────────────────────────────────────────────

pub async fn execute(cmd: JobCommands, session: &Session, format: OutputFormat) -> Result<()> {
    let store = session.open_store().await?;

    match cmd {
        JobCommands::List { state } => {
            let jobs = store.list_jobs(state).await?;
            print_jobs(&jobs, format)?;
        }

        JobCommands::Show { job_id } => {
            let job = store
                .get_job(job_id)
                .await?
                .with_context(|| format!("Job not found: {}", job_id))?;

            match format {
                OutputFormat::Table => print_job_detail(&job),
                _ => output::print_item(&job, format)?,
            }
        }

        JobCommands::Cancel { job_id } => {
            let outcome = store.cancel(job_id).await?;
            match format {
                OutputFormat::Table => {
                    output::print_success(&format!("Cancel requested for {}", job_id));
                    output::print_detail("Canceled", &outcome.canceled.len().to_string());
                    output::print_detail("Running, flagged", &outcome.running.len().to_string());
                }
                _ => output::print_item(
                    &serde_json::json!({
                        "canceled": outcome.canceled,
                        "running": outcome.running,
                    }),
                    format,
                )?,
            }
        }

        JobCommands::Remove { job_id } => {
            let removed = store.remove(job_id).await?;
            output::print_success(&format!("Removed {} job(s)", removed));
        }

        JobCommands::Clear => {
            let removed = store.clear_finished().await?;
            output::print_success(&format!("Removed {} finished job(s)", removed));
        }
    }

    store.close().await;
    Ok(())
}

fn print_job_detail(job: &Job) {
    output::print_header(&format!("Job {}", job.id));
    output::print_detail("Type", &job.job_type.to_string());
    output::print_detail("State", &output::state_label(job.state));
    output::print_detail("Root", &job.root_id.to_string());
    if let Some(parent) = job.parent_id {
        output::print_detail("Parent", &parent.to_string());
    }
    if !job.join_dependencies.is_empty() {
        let deps: Vec<String> = job.join_dependencies.iter().map(JobId::short).collect();
        output::print_detail("Joins", &deps.join(", "));
    }
    output::print_detail("Directory", &job.working_directory().display().to_string());
    for input in &job.input_files {
        output::print_detail("Input", &input.path.display().to_string());
    }
    for produced in &job.output_files {
        output::print_detail("Output", &produced.path.display().to_string());
    }
    if let Some(ms) = job.duration_ms() {
        output::print_detail("Duration", &format!("{} ms", ms));
    }
    if let Some(error) = &job.error {
        output::print_detail("Error", &error.to_string());
        if let Some(text) = &error.output {
            println!();
            println!("{}", text);
        }
    }
}
