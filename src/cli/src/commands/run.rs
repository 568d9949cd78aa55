//! Running workflows to completion.

use anyhow::{bail, Context, Result};
use clap::Args;
use std::path::{Path, PathBuf};

use runmanager_core::jobs::{JobId, JobState, JobType, Workflow};
use runmanager_core::scheduler::RunManager;

use super::{jobs, stats, Session};
use crate::output::{self, OutputFormat};

#[derive(Args)]
pub struct RunArgs {
    /// Workflow spec, step names joined by "->"
    pub spec: String,

    #[command(flatten)]
    pub target: RunTarget,

    /// Split every EnergyPlus step into this many partitions
    #[arg(long)]
    pub split_count: Option<u32>,
}

/// Where a workflow runs and what it starts from.
#[derive(Args)]
pub struct RunTarget {
    /// Input file handed to the first job
    #[arg(short, long)]
    pub input: PathBuf,

    /// Base directory for job working directories
    #[arg(short, long, default_value = ".")]
    pub dir: PathBuf,

    /// Parameter applied to every job, as key=value
    #[arg(short, long = "param", value_parser = parse_param)]
    pub params: Vec<(String, String)>,
}

fn parse_param(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected key=value, got {:?}", raw)),
    }
}

pub async fn execute(args: RunArgs, session: &Session, format: OutputFormat) -> Result<()> {
    let mut workflow = Workflow::parse(&args.spec)?;
    if let Some(n) = args.split_count {
        if workflow.parallelize(&JobType::EnergyPlus, n)? == 0 {
            output::print_info("No EnergyPlus step to split");
        }
    }
    run_workflow(workflow, args.target, session, format).await
}

/// Materialize `workflow`, run it and print its jobs. Fails if any job did
/// not succeed.
pub async fn run_workflow(
    mut workflow: Workflow,
    target: RunTarget,
    session: &Session,
    format: OutputFormat,
) -> Result<()> {
    for (key, value) in &target.params {
        workflow.add_param(key.as_str(), value);
    }

    let input = std::fs::canonicalize(&target.input)
        .with_context(|| format!("Input file not found: {}", target.input.display()))?;
    let dir = prepare_dir(&target.dir)?;
    let tree = workflow.create(&dir, input, &[])?;
    let root = tree.root_id();

    let manager = session.open_manager().await?;
    manager.enqueue(&tree).await?;
    if matches!(format, OutputFormat::Table) {
        output::print_info(&format!("Running {} ({} jobs) in {}", workflow, tree.len(), dir.display()));
    }
    run_to_completion(&manager, Some(root)).await?;

    let jobs = manager.tree_jobs(root).await?;
    manager.shutdown().await?;
    jobs::print_jobs(&jobs, format)?;

    let unsuccessful = jobs.iter().filter(|job| job.state != JobState::Succeeded).count();
    if unsuccessful > 0 {
        bail!("{} of {} job(s) did not succeed", unsuccessful, jobs.len());
    }
    Ok(())
}

pub async fn resume(session: &Session, format: OutputFormat) -> Result<()> {
    let manager = session.open_manager().await?;
    if !manager.work_pending().await? {
        output::print_info("Nothing to run");
    }
    run_to_completion(&manager, None).await?;

    let totals = manager.stats().await?;
    manager.shutdown().await?;
    stats::print_stats(&totals, format)
}

/// Unpause and wait for the queue to drain. Ctrl-C cancels `root` (or every
/// tree without one), then waits for running jobs to stop.
async fn run_to_completion(manager: &RunManager, root: Option<JobId>) -> Result<()> {
    manager.set_paused(false);
    tokio::select! {
        result = manager.wait_for_finished() => return Ok(result?),
        _ = tokio::signal::ctrl_c() => {
            output::print_info("Interrupted, canceling");
        }
    }

    match root {
        Some(root) => {
            manager.cancel(root).await?;
        }
        None => {
            for job in manager.jobs().await? {
                if job.parent_id.is_none() {
                    manager.cancel(job.id).await?;
                }
            }
        }
    }
    manager.wait_for_finished().await?;
    Ok(())
}

fn prepare_dir(dir: &Path) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create {}", dir.display()))?;
    std::fs::canonicalize(dir).with_context(|| format!("Failed to resolve {}", dir.display()))
}
