//! Worker loop.
//!
//! Each worker pops ready ids, claims them in the store, runs the registered
//! executor and records the outcome. The store decides what becomes ready
//! next; workers only forward those ids to the queue.

use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

use super::{Inner, JobEvent};
use crate::executor::ExecutionContext;
use crate::jobs::{FileRef, Job, JobError, JobErrorKind, JobId, JobState};
use crate::store::{Completion, FinishOutcome};
use crate::telemetry::metrics::{JobMetrics, RunningGuard};

pub(crate) async fn run(inner: Arc<Inner>, worker: usize) {
    let mut paused = inner.paused.subscribe();
    debug!(worker, "Worker started");

    loop {
        if inner.shutdown.is_cancelled() {
            break;
        }

        if *paused.borrow_and_update() {
            tokio::select! {
                _ = inner.shutdown.cancelled() => break,
                changed = paused.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
            continue;
        }

        match inner.queue.pop() {
            Some(id) => {
                if !inner.queue.is_empty() {
                    inner.queue.nudge();
                }
                process(&inner, id)
                    .instrument(tracing::info_span!("job", worker, job_id = %id))
                    .await;
            }
            None => {
                tokio::select! {
                    _ = inner.shutdown.cancelled() => break,
                    _ = inner.queue.wait() => {}
                    changed = paused.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
        }
    }

    debug!(worker, "Worker stopped");
}

async fn process(inner: &Inner, id: JobId) {
    // Registered before the claim so a cancel that lands right after the
    // claim still reaches the executor.
    let token = inner.running.entry(id).or_default().clone();

    let job = match inner.store.claim(id).await {
        Ok(Some(job)) => job,
        Ok(None) => {
            inner.running.remove(&id);
            debug!(job_id = %id, "Stale ready entry dropped");
            return;
        }
        Err(e) => {
            inner.running.remove(&id);
            error!(job_id = %id, error = %e, "Failed to claim job");
            return;
        }
    };

    debug!(job_id = %id, job_type = %job.job_type, "Job claimed");
    inner.emit(JobEvent::Started {
        job_id: id,
        job_type: job.job_type.clone(),
    });
    let guard = JobMetrics::running();

    let completion = run_job(inner, &job, token).await;
    let (produced, failure) = match &completion {
        Completion::Succeeded(outputs) => (outputs.len(), None),
        Completion::Failed(error) => (0, Some(error.clone())),
        Completion::Canceled(_) => (0, None),
    };

    let outcome = inner.store.finish(id, completion).await;
    inner.running.remove(&id);

    match outcome {
        Ok(Some(outcome)) => record(inner, &job, outcome, produced, failure, &guard),
        Ok(None) => debug!(job_id = %id, "Job no longer running; outcome discarded"),
        Err(e) => error!(job_id = %id, error = %e, "Failed to record job outcome"),
    }
    drop(guard);
    inner.finished.notify_waiters();
}

async fn run_job(inner: &Inner, job: &Job, cancel: CancellationToken) -> Completion {
    if !job.runnable {
        return Completion::Succeeded(Vec::new());
    }

    let inputs = match inner.store.execution_inputs(job).await {
        Ok(inputs) => inputs,
        Err(e) => {
            return Completion::Failed(JobError::execution(format!(
                "unable to resolve input files: {}",
                e
            )))
        }
    };
    let missing: Vec<String> = inputs
        .input_files
        .iter()
        .filter(|path| !path.exists())
        .map(|path| path.display().to_string())
        .collect();
    if !missing.is_empty() {
        return Completion::Failed(JobError::execution(format!(
            "input file(s) not found: {}",
            missing.join(", ")
        )));
    }

    let working_dir = job.working_directory();
    if let Err(e) = tokio::fs::create_dir_all(&working_dir).await {
        return Completion::Failed(JobError::execution(format!(
            "unable to create working directory {}: {}",
            working_dir.display(),
            e
        )));
    }

    let Some(executor) = inner.executors.get(&job.job_type) else {
        return Completion::Failed(JobError::configuration(format!(
            "no executor registered for job type '{}'",
            job.job_type
        )));
    };

    let ctx = ExecutionContext {
        job_id: job.id,
        working_dir,
        input_files: inputs.input_files,
        join_outputs: inputs.join_outputs,
        tools: inner.tools.clone(),
        cancel,
    };

    let handle = tokio::spawn({
        let job = job.clone();
        let ctx = ctx.clone();
        async move { executor.execute(&job, &ctx).await }
    });
    let result = match handle.await {
        Ok(result) => result,
        Err(e) if e.is_panic() => Err(JobError::execution("executor panicked")),
        Err(_) => Err(JobError::canceled("execution aborted")),
    };

    match result {
        Ok(outputs) => verify_outputs(job, &ctx.working_dir, outputs).await,
        // Tokens fired by shutdown rather than by a cancel request leave the
        // job interrupted; the store still turns a requested cancel into
        // Canceled.
        Err(error) if error.kind == JobErrorKind::Canceled && inner.shutdown.is_cancelled() => {
            Completion::Failed(JobError::interrupted())
        }
        Err(error) if error.kind == JobErrorKind::Canceled => Completion::Canceled(error),
        Err(error) => Completion::Failed(error),
    }
}

async fn verify_outputs(job: &Job, working_dir: &Path, mut outputs: Vec<FileRef>) -> Completion {
    let mut missing = Vec::new();
    for name in &job.expected_outputs {
        if !is_readable_file(&working_dir.join(name)).await {
            missing.push(name.as_str());
        }
    }
    if !missing.is_empty() {
        return Completion::Failed(JobError::execution(format!(
            "expected output file(s) not generated: {}",
            missing.join(", ")
        )));
    }

    for name in &job.expected_outputs {
        let file = FileRef::new(working_dir.join(name));
        if !outputs.contains(&file) {
            outputs.push(file);
        }
    }
    Completion::Succeeded(outputs)
}

/// A regular file this process can open.
async fn is_readable_file(path: &Path) -> bool {
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_file() => tokio::fs::File::open(path).await.is_ok(),
        _ => false,
    }
}

fn record(
    inner: &Inner,
    job: &Job,
    outcome: FinishOutcome,
    produced: usize,
    failure: Option<JobError>,
    guard: &RunningGuard,
) {
    let id = job.id;
    let Some(state) = outcome.state else {
        return;
    };
    JobMetrics::finished(state, &job.job_type, Some(guard.elapsed_seconds()));

    match state {
        JobState::Succeeded => {
            info!(job_id = %id, job_type = %job.job_type, "Job succeeded");
            inner.emit(JobEvent::Succeeded {
                job_id: id,
                outputs: produced,
            });
        }
        JobState::Failed => {
            let error = failure.unwrap_or_else(|| JobError::execution("job failed"));
            warn!(job_id = %id, job_type = %job.job_type, error = %error, "Job failed");
            inner.emit(JobEvent::Failed { job_id: id, error });
        }
        _ => {
            info!(job_id = %id, job_type = %job.job_type, "Job canceled");
            inner.emit(JobEvent::Canceled { job_id: id });
        }
    }

    for canceled in &outcome.canceled {
        inner.emit(JobEvent::Canceled { job_id: *canceled });
    }
    if !outcome.canceled.is_empty() {
        info!(job_id = %id, canceled = outcome.canceled.len(), "Descendants canceled");
    }

    for ready in &outcome.ready {
        inner.emit(JobEvent::Ready { job_id: *ready });
    }
    inner.queue.extend(outcome.ready);
}
