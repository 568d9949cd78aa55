//! Job execution.
//!
//! Jobs are plain data; what a job *does* is looked up by its type tag in an
//! [`ExecutorRegistry`]. Built-in types map to the executors in this module,
//! and callers can register more for [`JobType::Custom`] tags or override a
//! built-in.

pub mod parallel;
pub mod tool;

use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::jobs::{FileRef, Job, JobError, JobId, JobType, ToolTable};

pub use parallel::{JoinExecutor, SplitExecutor};
pub use tool::ToolExecutor;

// ═══════════════════════════════════════════════════════════════════════════════
// Execution Context
// ═══════════════════════════════════════════════════════════════════════════════

/// Everything an executor may rely on besides the job itself.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub job_id: JobId,
    /// Directory owned exclusively by this job; created before execution
    pub working_dir: PathBuf,
    /// Absolute input paths: ancestors first, then join outputs, then own inputs
    pub input_files: Vec<PathBuf>,
    /// Outputs of each join dependency, in child-index order
    pub join_outputs: Vec<Vec<PathBuf>>,
    /// Scheduler-wide tool table; job-local tools are layered on top
    pub tools: ToolTable,
    /// Triggered when cancellation of this job is requested
    pub cancel: CancellationToken,
}

impl ExecutionContext {
    pub fn new(job_id: JobId, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            job_id,
            working_dir: working_dir.into(),
            input_files: Vec::new(),
            join_outputs: Vec::new(),
            tools: ToolTable::default(),
            cancel: CancellationToken::new(),
        }
    }

    /// Last resolved input with the given extension (case-insensitive).
    pub fn last_input_with_extension(&self, ext: &str) -> Option<&Path> {
        self.input_files
            .iter()
            .rev()
            .find(|p| {
                p.extension()
                    .and_then(|e| e.to_str())
                    .is_some_and(|e| e.eq_ignore_ascii_case(ext))
            })
            .map(PathBuf::as_path)
    }

    pub fn is_canceled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Fail early if cancellation was requested. Executors call this at
    /// safe points, such as before spawning a process.
    pub fn checkpoint(&self) -> Result<(), JobError> {
        if self.is_canceled() {
            return Err(JobError::canceled("cancellation requested"));
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Executor Trait
// ═══════════════════════════════════════════════════════════════════════════════

/// Runs one job.
///
/// On success returns the files produced, which must include every name the
/// job declared in `expected_outputs`. Executors must only write under
/// `ctx.working_dir`.
#[async_trait]
pub trait JobExecutor: Send + Sync {
    async fn execute(&self, job: &Job, ctx: &ExecutionContext) -> Result<Vec<FileRef>, JobError>;
}

/// Executor for placeholders and anything else that does no work.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopExecutor;

#[async_trait]
impl JobExecutor for NoopExecutor {
    async fn execute(&self, _job: &Job, _ctx: &ExecutionContext) -> Result<Vec<FileRef>, JobError> {
        Ok(Vec::new())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Registry
// ═══════════════════════════════════════════════════════════════════════════════

/// Executors keyed by job type tag.
#[derive(Clone)]
pub struct ExecutorRegistry {
    executors: HashMap<String, Arc<dyn JobExecutor>>,
}

impl ExecutorRegistry {
    /// A registry with nothing registered.
    pub fn empty() -> Self {
        Self {
            executors: HashMap::new(),
        }
    }

    /// A registry covering every built-in job type.
    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        let tool: Arc<dyn JobExecutor> = Arc::new(ToolExecutor::new());
        registry.register(&JobType::Null, Arc::new(NoopExecutor));
        for job_type in [
            JobType::ModelToIdf,
            JobType::ExpandObjects,
            JobType::EnergyPlus,
            JobType::ReadVars,
            JobType::Script,
        ] {
            registry.register(&job_type, tool.clone());
        }
        registry.register(&JobType::Split, Arc::new(SplitExecutor));
        registry.register(&JobType::Join, Arc::new(JoinExecutor));
        registry
    }

    /// Register `executor` for `job_type`, replacing any previous one.
    pub fn register(&mut self, job_type: &JobType, executor: Arc<dyn JobExecutor>) -> &mut Self {
        self.executors.insert(job_type.tag().to_string(), executor);
        self
    }

    /// Register an executor for `JobType::Custom(name)`.
    pub fn register_custom(&mut self, name: impl Into<String>, executor: Arc<dyn JobExecutor>) -> &mut Self {
        let job_type = JobType::Custom(name.into());
        self.register(&job_type, executor)
    }

    pub fn get(&self, job_type: &JobType) -> Option<Arc<dyn JobExecutor>> {
        self.executors.get(job_type.tag()).cloned()
    }

    pub fn contains(&self, job_type: &JobType) -> bool {
        self.executors.contains_key(job_type.tag())
    }

    /// Registered tags, sorted.
    pub fn tags(&self) -> Vec<&str> {
        let mut tags: Vec<&str> = self.executors.keys().map(String::as_str).collect();
        tags.sort_unstable();
        tags
    }
}

impl Default for ExecutorRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl fmt::Debug for ExecutorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutorRegistry")
            .field("tags", &self.tags())
            .finish()
    }
}
