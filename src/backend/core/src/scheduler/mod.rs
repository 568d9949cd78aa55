//! The run manager: a pausable pool of workers over the job store.
//!
//! ```text
//!   enqueue(tree) ──► JobStore ──ready ids──► ReadyQueue ──► worker 0..N
//!                        ▲                                      │
//!                        └──── finish(): promote / cancel ◄─────┘
//! ```
//!
//! The store is the source of truth. The queue only carries hints, and a
//! worker must win the claim in the store before it runs anything, so a
//! job executes at most once however many workers race for it.
//!
//! # Example
//!
//! ```rust,no_run
//! use runmanager_core::jobs::Workflow;
//! use runmanager_core::scheduler::{RunManager, RunManagerOptions};
//!
//! # async fn demo() -> runmanager_core::Result<()> {
//! let manager = RunManager::open(RunManagerOptions::default().with_workers(4)).await?;
//! let workflow: Workflow = "ModelToIdf->EnergyPlus->ReadVars".parse()?;
//! let tree = workflow.create("/tmp/run".as_ref(), "/tmp/run/model.osm", &[])?;
//!
//! manager.enqueue(&tree).await?;
//! manager.set_paused(false);
//! manager.wait_for_finished().await?;
//! manager.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod events;
pub mod queue;
mod worker;

pub use events::JobEvent;
pub use queue::ReadyQueue;
pub use crate::store::RunStats;

use dashmap::DashMap;
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{Config, SchedulerConfig, StoreConfig};
use crate::error::{ErrorCode, RunError, Result};
use crate::executor::ExecutorRegistry;
use crate::jobs::{Job, JobId, JobTree, ToolInfo, ToolTable, Workflow};
use crate::store::{CancelOutcome, JobStore};
use crate::telemetry::metrics::{describe_metrics, JobMetrics};

// ═══════════════════════════════════════════════════════════════════════════════
// Options
// ═══════════════════════════════════════════════════════════════════════════════

/// Configuration for a [`RunManager`].
#[derive(Debug, Clone)]
pub struct RunManagerOptions {
    /// Store file; `None` keeps everything in memory
    pub store_path: Option<PathBuf>,

    /// Maximum number of jobs executing at once
    pub workers: usize,

    /// Whether dispatch starts paused
    pub start_paused: bool,

    /// Scheduler-wide tool table
    pub tools: Vec<ToolInfo>,

    /// Capacity of the event channel
    pub event_buffer_size: usize,

    /// How long to wait on a locked store file
    pub busy_timeout: Duration,

    /// How long shutdown waits for running jobs before cancelling them
    pub shutdown_timeout: Duration,
}

impl Default for RunManagerOptions {
    fn default() -> Self {
        let scheduler = SchedulerConfig::default();
        let store = StoreConfig::default();
        Self {
            store_path: None,
            workers: scheduler.workers,
            start_paused: scheduler.start_paused,
            tools: Vec::new(),
            event_buffer_size: scheduler.event_buffer_size,
            busy_timeout: store.busy_timeout,
            shutdown_timeout: scheduler.shutdown_timeout,
        }
    }
}

impl RunManagerOptions {
    pub fn with_store_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.store_path = Some(path.into());
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_start_paused(mut self, paused: bool) -> Self {
        self.start_paused = paused;
        self
    }

    pub fn with_tools(mut self, tools: impl IntoIterator<Item = ToolInfo>) -> Self {
        self.tools = tools.into_iter().collect();
        self
    }

    pub fn with_event_buffer_size(mut self, size: usize) -> Self {
        self.event_buffer_size = size;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

impl From<&Config> for RunManagerOptions {
    fn from(config: &Config) -> Self {
        Self {
            store_path: Some(config.store.path.clone()),
            workers: config.scheduler.workers,
            start_paused: config.scheduler.start_paused,
            tools: config.tools.clone(),
            event_buffer_size: config.scheduler.event_buffer_size,
            busy_timeout: config.store.busy_timeout,
            shutdown_timeout: config.scheduler.shutdown_timeout,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Run Manager
// ═══════════════════════════════════════════════════════════════════════════════

/// State shared between the manager handle and its workers.
pub(crate) struct Inner {
    pub(crate) store: JobStore,
    pub(crate) queue: ReadyQueue,
    pub(crate) paused: watch::Sender<bool>,
    pub(crate) executors: ExecutorRegistry,
    pub(crate) tools: ToolTable,
    /// Cancellation tokens of claimed jobs
    pub(crate) running: DashMap<JobId, CancellationToken>,
    /// Notified whenever a job reaches a terminal state
    pub(crate) finished: Notify,
    pub(crate) events: broadcast::Sender<JobEvent>,
    pub(crate) shutdown: CancellationToken,
    pub(crate) options: RunManagerOptions,
}

impl Inner {
    pub(crate) fn emit(&self, event: JobEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

/// Persists job trees and runs them with a bounded pool of workers.
pub struct RunManager {
    inner: Arc<Inner>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl RunManager {
    /// Open the store, recover jobs interrupted by a previous process and
    /// start the workers, using the built-in executors.
    pub async fn open(options: RunManagerOptions) -> Result<Self> {
        Self::open_with_executors(options, ExecutorRegistry::with_builtins()).await
    }

    /// Like [`RunManager::open`], with a caller-supplied executor registry.
    pub async fn open_with_executors(
        options: RunManagerOptions,
        executors: ExecutorRegistry,
    ) -> Result<Self> {
        if options.workers == 0 {
            return Err(RunError::new(
                ErrorCode::InvalidConfiguration,
                "a run manager needs at least one worker",
            ));
        }

        let store = match &options.store_path {
            Some(path) => JobStore::open(path, options.busy_timeout).await?,
            None => JobStore::in_memory().await?,
        };

        let report = store.recover_interrupted().await?;
        if !report.interrupted.is_empty() {
            warn!(
                interrupted = report.interrupted.len(),
                canceled = report.canceled.len(),
                "Recovered jobs interrupted by a previous run"
            );
        }

        describe_metrics();
        let (events, _) = broadcast::channel(options.event_buffer_size.max(1));
        let (paused, _) = watch::channel(options.start_paused);

        let inner = Arc::new(Inner {
            queue: ReadyQueue::new(),
            paused,
            tools: ToolTable::new(options.tools.clone()),
            executors,
            running: DashMap::new(),
            finished: Notify::new(),
            events,
            shutdown: CancellationToken::new(),
            store,
            options,
        });
        inner.queue.extend(inner.store.ready_jobs().await?);

        let handles = (0..inner.options.workers)
            .map(|n| tokio::spawn(worker::run(inner.clone(), n)))
            .collect();

        info!(
            workers = inner.options.workers,
            paused = inner.options.start_paused,
            queued = inner.queue.len(),
            "Run manager started"
        );

        Ok(Self {
            inner,
            handles: Mutex::new(handles),
        })
    }

    /// Open with options derived from `config`.
    pub async fn open_from_config(config: &Config) -> Result<Self> {
        Self::open(RunManagerOptions::from(config)).await
    }

    /// Stop the workers and close the store.
    ///
    /// Running jobs get `shutdown_timeout` to finish; after that their
    /// cancellation tokens fire and they are recorded as interrupted.
    pub async fn shutdown(&self) -> Result<()> {
        self.inner.shutdown.cancel();

        let handles = std::mem::take(&mut *self.handles.lock());
        let all = futures::future::join_all(handles);
        tokio::pin!(all);

        if tokio::time::timeout(self.inner.options.shutdown_timeout, &mut all)
            .await
            .is_err()
        {
            warn!(
                running = self.inner.running.len(),
                "Shutdown timeout elapsed; cancelling running jobs"
            );
            for entry in self.inner.running.iter() {
                entry.value().cancel();
            }
            all.await;
        }

        self.inner.finished.notify_waiters();
        self.inner.store.close().await;
        info!("Run manager stopped");
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Enqueue
    // ═══════════════════════════════════════════════════════════════════════════

    /// Persist `tree` and make its root dispatchable.
    ///
    /// Returns `false`, changing nothing, if the root id is already stored.
    pub async fn enqueue(&self, tree: &JobTree) -> Result<bool> {
        self.ensure_running()?;

        let Some(ready) = self.inner.store.insert_tree(tree).await? else {
            return Ok(false);
        };

        JobMetrics::enqueued(tree.len());
        info!(root_id = %tree.root_id(), jobs = tree.len(), "Tree enqueued");
        self.inner.emit(JobEvent::Enqueued {
            root_id: tree.root_id(),
            jobs: tree.len(),
        });
        for id in &ready {
            self.inner.emit(JobEvent::Ready { job_id: *id });
        }
        self.inner.queue.extend(ready);
        Ok(true)
    }

    /// Enqueue several trees. Returns how many were newly added.
    pub async fn enqueue_all<'a>(&self, trees: impl IntoIterator<Item = &'a JobTree>) -> Result<usize> {
        let mut added = 0;
        for tree in trees {
            if self.enqueue(tree).await? {
                added += 1;
            }
        }
        Ok(added)
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Dispatch control
    // ═══════════════════════════════════════════════════════════════════════════

    /// Stop or resume claiming ready jobs. Running jobs are not touched.
    pub fn set_paused(&self, paused: bool) {
        let previous = self.inner.paused.send_replace(paused);
        if previous != paused {
            info!(paused, "Dispatch {}", if paused { "paused" } else { "resumed" });
            self.inner.emit(JobEvent::PauseChanged { paused });
        }
    }

    pub fn is_paused(&self) -> bool {
        *self.inner.paused.borrow()
    }

    /// True while any job is pending, ready or running.
    pub async fn work_pending(&self) -> Result<bool> {
        self.inner.store.has_pending_work().await
    }

    /// Wait until no work is pending.
    ///
    /// Never resumes dispatch itself: waiting on a paused manager that
    /// still holds ready jobs waits until someone unpauses it.
    pub async fn wait_for_finished(&self) -> Result<()> {
        loop {
            let notified = self.inner.finished.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            self.ensure_running()?;
            if !self.work_pending().await? {
                return Ok(());
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = self.inner.shutdown.cancelled() => {}
            }
        }
    }

    /// Like [`RunManager::wait_for_finished`], giving up after `timeout`.
    /// Returns whether all work finished in time.
    pub async fn wait_for_finished_timeout(&self, timeout: Duration) -> Result<bool> {
        match tokio::time::timeout(timeout, self.wait_for_finished()).await {
            Ok(result) => result.map(|()| true),
            Err(_) => Ok(false),
        }
    }

    /// Cancel a job and everything downstream of it.
    ///
    /// Pending and ready jobs are canceled at once. A running job has its
    /// cancellation token triggered and is recorded as canceled when its
    /// executor returns.
    pub async fn cancel(&self, id: JobId) -> Result<CancelOutcome> {
        let outcome = self.inner.store.cancel(id).await?;

        for running in &outcome.running {
            if let Some(token) = self.inner.running.get(running) {
                token.cancel();
            }
        }
        for canceled in &outcome.canceled {
            self.inner.emit(JobEvent::Canceled { job_id: *canceled });
        }

        info!(
            job_id = %id,
            canceled = outcome.canceled.len(),
            running = outcome.running.len(),
            "Cancellation requested"
        );
        self.inner.finished.notify_waiters();
        Ok(outcome)
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Queries
    // ═══════════════════════════════════════════════════════════════════════════

    pub async fn get_job(&self, id: JobId) -> Result<Job> {
        self.inner
            .store
            .get_job(id)
            .await?
            .ok_or_else(|| RunError::job_not_found(id.0))
    }

    /// Every stored job, in creation order.
    pub async fn jobs(&self) -> Result<Vec<Job>> {
        self.inner.store.list_jobs(None).await
    }

    pub async fn tree_jobs(&self, root: JobId) -> Result<Vec<Job>> {
        self.inner.store.tree_jobs(root).await
    }

    pub async fn stats(&self) -> Result<RunStats> {
        self.inner.store.stats(None).await
    }

    pub async fn tree_stats(&self, root: JobId) -> Result<RunStats> {
        self.inner.store.stats(Some(root)).await
    }

    /// Receive scheduler events from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.inner.events.subscribe()
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Removal
    // ═══════════════════════════════════════════════════════════════════════════

    /// Delete a finished job and its finished subtree.
    pub async fn remove(&self, id: JobId) -> Result<usize> {
        let removed = self.inner.store.remove(id).await?;
        info!(job_id = %id, removed, "Jobs removed");
        Ok(removed)
    }

    /// Delete every tree whose jobs have all finished.
    pub async fn clear_finished(&self) -> Result<usize> {
        let removed = self.inner.store.clear_finished().await?;
        info!(removed, "Finished trees cleared");
        Ok(removed)
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Workflows
    // ═══════════════════════════════════════════════════════════════════════════

    pub async fn persist_workflow(&self, name: &str, workflow: &Workflow) -> Result<()> {
        self.inner.store.save_workflow(name, workflow).await
    }

    pub async fn load_workflow(&self, name: &str) -> Result<Workflow> {
        self.inner.store.load_workflow(name).await
    }

    pub async fn workflow_names(&self) -> Result<Vec<String>> {
        self.inner.store.workflow_names().await
    }

    pub async fn delete_workflow(&self, name: &str) -> Result<bool> {
        self.inner.store.delete_workflow(name).await
    }

    /// Direct access to the store.
    pub fn store(&self) -> &JobStore {
        &self.inner.store
    }

    fn ensure_running(&self) -> Result<()> {
        if self.inner.shutdown.is_cancelled() {
            return Err(RunError::new(
                ErrorCode::SchedulerShutDown,
                "The run manager has shut down",
            ));
        }
        Ok(())
    }
}

impl Drop for RunManager {
    fn drop(&mut self) {
        self.inner.shutdown.cancel();
    }
}

impl std::fmt::Debug for RunManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunManager")
            .field("workers", &self.inner.options.workers)
            .field("paused", &self.is_paused())
            .field("queued", &self.inner.queue.len())
            .field("running", &self.inner.running.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{Job, JobState, JobType};

    #[test]
    fn test_options_from_config() {
        let mut config = Config::default();
        config.scheduler.workers = 3;
        config.scheduler.start_paused = false;
        let options = RunManagerOptions::from(&config);
        assert_eq!(options.workers, 3);
        assert!(!options.start_paused);
        assert_eq!(options.store_path, Some(PathBuf::from("runmanager.db")));
    }

    #[test]
    fn test_options_default_to_memory_and_paused() {
        let options = RunManagerOptions::default();
        assert!(options.store_path.is_none());
        assert!(options.start_paused);
        assert!(options.workers >= 1);
    }

    #[tokio::test]
    async fn test_zero_workers_rejected() {
        let err = RunManager::open(RunManagerOptions::default().with_workers(0))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidConfiguration);
    }

    #[tokio::test]
    async fn test_paused_manager_dispatches_nothing() {
        let manager = RunManager::open(RunManagerOptions::default().with_workers(2))
            .await
            .unwrap();
        assert!(manager.is_paused());

        let tree = JobTree::new(Job::new(JobType::Null));
        assert!(manager.enqueue(&tree).await.unwrap());
        assert!(!manager.enqueue(&tree).await.unwrap());

        assert!(!manager
            .wait_for_finished_timeout(Duration::from_millis(100))
            .await
            .unwrap());
        assert_eq!(manager.get_job(tree.root_id()).await.unwrap().state, JobState::Ready);

        manager.set_paused(false);
        manager.wait_for_finished().await.unwrap();
        assert_eq!(
            manager.get_job(tree.root_id()).await.unwrap().state,
            JobState::Succeeded
        );
        manager.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_enqueue_after_shutdown_fails() {
        let manager = RunManager::open(RunManagerOptions::default().with_workers(1))
            .await
            .unwrap();
        manager.shutdown().await.unwrap();
        let err = manager
            .enqueue(&JobTree::new(Job::new(JobType::Null)))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::SchedulerShutDown);
    }
}
