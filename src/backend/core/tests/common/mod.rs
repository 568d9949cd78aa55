//! Shared fixtures for the integration tests.
//!
//! Custom executors stand in for external tools so the scheduler can be
//! driven without anything installed.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

use runmanager_core::executor::{ExecutionContext, ExecutorRegistry, JobExecutor};
use runmanager_core::jobs::{FileRef, Job, JobError, JobFactory, JobId, JobParams, JobState};
use runmanager_core::scheduler::{RunManager, RunManagerOptions};

pub const TOUCH: &str = "Touch";
pub const FAIL: &str = "Fail";
pub const BLOCK: &str = "Block";
pub const PANIC: &str = "Panic";
pub const GATE: &str = "Gate";

/// Writes one `<short id>.out` file and remembers what it saw.
#[derive(Default)]
pub struct TouchExecutor {
    runs: Mutex<Vec<JobId>>,
    inputs: Mutex<HashMap<JobId, Vec<PathBuf>>>,
}

impl TouchExecutor {
    pub fn runs(&self) -> Vec<JobId> {
        self.runs.lock().clone()
    }

    pub fn inputs_of(&self, id: JobId) -> Vec<PathBuf> {
        self.inputs.lock().get(&id).cloned().unwrap_or_default()
    }

    pub fn output_path(job: &Job) -> PathBuf {
        job.working_directory().join(format!("{}.out", job.id.short()))
    }
}

#[async_trait]
impl JobExecutor for TouchExecutor {
    async fn execute(&self, job: &Job, ctx: &ExecutionContext) -> Result<Vec<FileRef>, JobError> {
        self.inputs.lock().insert(job.id, ctx.input_files.clone());
        let out = ctx.working_dir.join(format!("{}.out", job.id.short()));
        tokio::fs::write(&out, format!("{}\n", job.id))
            .await
            .map_err(|e| JobError::execution(e.to_string()))?;
        self.runs.lock().push(job.id);
        Ok(vec![FileRef::new(out)])
    }
}

/// Always fails with captured output.
pub struct FailExecutor;

#[async_trait]
impl JobExecutor for FailExecutor {
    async fn execute(&self, _job: &Job, _ctx: &ExecutionContext) -> Result<Vec<FileRef>, JobError> {
        Err(JobError::execution("tool exited with status 3").with_output("simulated stderr"))
    }
}

/// Runs until its cancellation token fires.
pub struct BlockExecutor;

#[async_trait]
impl JobExecutor for BlockExecutor {
    async fn execute(&self, _job: &Job, ctx: &ExecutionContext) -> Result<Vec<FileRef>, JobError> {
        ctx.cancel.cancelled().await;
        Err(JobError::canceled("stopped on request"))
    }
}

/// Holds each job until `open` is called, then writes `<short id>.out`.
pub struct GateExecutor {
    permits: Semaphore,
}

impl GateExecutor {
    pub fn new() -> Self {
        Self {
            permits: Semaphore::new(0),
        }
    }

    /// Let `n` waiting jobs through.
    pub fn open(&self, n: usize) {
        self.permits.add_permits(n);
    }
}

#[async_trait]
impl JobExecutor for GateExecutor {
    async fn execute(&self, job: &Job, ctx: &ExecutionContext) -> Result<Vec<FileRef>, JobError> {
        tokio::select! {
            permit = self.permits.acquire() => {
                permit.map_err(|e| JobError::execution(e.to_string()))?.forget();
            }
            _ = ctx.cancel.cancelled() => return Err(JobError::canceled("stopped on request")),
        }
        let out = ctx.working_dir.join(format!("{}.out", job.id.short()));
        tokio::fs::write(&out, format!("{}\n", job.id))
            .await
            .map_err(|e| JobError::execution(e.to_string()))?;
        Ok(vec![FileRef::new(out)])
    }
}

pub struct PanicExecutor;

#[async_trait]
impl JobExecutor for PanicExecutor {
    async fn execute(&self, _job: &Job, _ctx: &ExecutionContext) -> Result<Vec<FileRef>, JobError> {
        panic!("executor bug");
    }
}

pub fn registry(touch: Arc<TouchExecutor>) -> ExecutorRegistry {
    let mut registry = ExecutorRegistry::with_builtins();
    registry
        .register_custom(TOUCH, touch)
        .register_custom(FAIL, Arc::new(FailExecutor))
        .register_custom(BLOCK, Arc::new(BlockExecutor))
        .register_custom(PANIC, Arc::new(PanicExecutor));
    registry
}

pub async fn manager(workers: usize) -> (RunManager, Arc<TouchExecutor>) {
    let touch = Arc::new(TouchExecutor::default());
    let manager = RunManager::open_with_executors(
        RunManagerOptions::default()
            .with_workers(workers)
            .with_shutdown_timeout(Duration::from_secs(5)),
        registry(touch.clone()),
    )
    .await
    .unwrap();
    (manager, touch)
}

/// Like `manager`, with a `Gate` executor the test controls.
pub async fn gated_manager(workers: usize) -> (RunManager, Arc<TouchExecutor>, Arc<GateExecutor>) {
    let touch = Arc::new(TouchExecutor::default());
    let gate = Arc::new(GateExecutor::new());
    let mut executors = registry(touch.clone());
    executors.register_custom(GATE, gate.clone());
    let manager = RunManager::open_with_executors(
        RunManagerOptions::default()
            .with_workers(workers)
            .with_shutdown_timeout(Duration::from_secs(5)),
        executors,
    )
    .await
    .unwrap();
    (manager, touch, gate)
}

pub fn custom(name: &str) -> Job {
    JobFactory::custom(name, JobParams::new()).unwrap()
}

pub async fn finish(manager: &RunManager) {
    assert!(
        manager
            .wait_for_finished_timeout(Duration::from_secs(10))
            .await
            .unwrap(),
        "work still pending after 10s"
    );
}

pub async fn state_of(manager: &RunManager, id: JobId) -> JobState {
    manager.get_job(id).await.unwrap().state
}

/// Poll until `id` reaches `state`.
pub async fn wait_for_state(manager: &RunManager, id: JobId, state: JobState) {
    for _ in 0..500 {
        if state_of(manager, id).await == state {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("job {} never reached {}", id, state);
}
