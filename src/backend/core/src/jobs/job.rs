//! Job definitions and lifecycle state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use uuid::Uuid;

use super::tools::ToolInfo;
use crate::error::{RunError, Result};

// ═══════════════════════════════════════════════════════════════════════════════
// Job ID
// ═══════════════════════════════════════════════════════════════════════════════

/// Unique identifier for a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// First eight hex digits, used for directory names and table output.
    pub fn short(&self) -> String {
        self.0.simple().to_string()[..8].to_string()
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for JobId {
    type Err = RunError;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(JobId)
            .map_err(|e| RunError::invalid_parameter("job_id", e.to_string()))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job State
// ═══════════════════════════════════════════════════════════════════════════════

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Created, waiting on a parent or join dependency
    Pending,
    /// Every prerequisite succeeded; eligible for dispatch
    Ready,
    /// Claimed by a worker
    Running,
    /// Execution returned and every declared output exists
    Succeeded,
    /// Execution failed, a tool was missing, or the scheduler stopped mid-run
    Failed,
    /// Canceled by request or because a prerequisite did not succeed
    Canceled,
}

impl JobState {
    pub const ALL: [JobState; 6] = [
        JobState::Pending,
        JobState::Ready,
        JobState::Running,
        JobState::Succeeded,
        JobState::Failed,
        JobState::Canceled,
    ];

    /// Check if transition to another state is valid.
    pub fn can_transition_to(&self, target: &JobState) -> bool {
        use JobState::*;
        matches!(
            (self, target),
            (Pending, Ready)
                | (Pending, Canceled)
                | (Ready, Running)
                | (Ready, Canceled)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Running, Canceled)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Failed | JobState::Canceled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = RunError;

    fn from_str(s: &str) -> Result<Self> {
        JobState::ALL
            .into_iter()
            .find(|state| state.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| RunError::invalid_parameter("state", format!("unknown job state '{}'", s)))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Type
// ═══════════════════════════════════════════════════════════════════════════════

/// The kind of work a job performs.
///
/// Built-in types are dispatched to built-in executors; `Custom` tags are
/// dispatched to whatever executor the caller registers under that name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum JobType {
    /// No-op placeholder
    Null,
    /// Translate a model file into simulation input
    ModelToIdf,
    /// Expand template objects in simulation input
    ExpandObjects,
    /// Run the simulation engine
    EnergyPlus,
    /// Post-process simulation output into tabular form
    ReadVars,
    /// Run a user script through an interpreter
    Script,
    /// Fan a single input out into N partitions
    Split,
    /// Merge the outputs of N partitioned siblings
    Join,
    /// Caller-defined type handled by a registered executor
    Custom(String),
}

impl JobType {
    pub const BUILTIN: [JobType; 8] = [
        JobType::Null,
        JobType::ModelToIdf,
        JobType::ExpandObjects,
        JobType::EnergyPlus,
        JobType::ReadVars,
        JobType::Script,
        JobType::Split,
        JobType::Join,
    ];

    pub fn tag(&self) -> &str {
        match self {
            Self::Null => "Null",
            Self::ModelToIdf => "ModelToIdf",
            Self::ExpandObjects => "ExpandObjects",
            Self::EnergyPlus => "EnergyPlus",
            Self::ReadVars => "ReadVars",
            Self::Script => "Script",
            Self::Split => "Split",
            Self::Join => "Join",
            Self::Custom(name) => name,
        }
    }

    /// Resolve a tag to a type; unrecognised tags become `Custom`.
    pub fn from_tag(tag: &str) -> Self {
        Self::BUILTIN
            .into_iter()
            .find(|t| t.tag().eq_ignore_ascii_case(tag))
            .unwrap_or_else(|| Self::Custom(tag.to_string()))
    }

    /// Resolve a name from a workflow spec string.
    ///
    /// Only types that can be built from default parameters are accepted.
    pub fn parse_step(name: &str) -> Result<Self> {
        match Self::from_tag(name) {
            Self::Custom(_) | Self::Split | Self::Join => Err(RunError::unknown_job_type(name)),
            job_type => Ok(job_type),
        }
    }

    /// Whether jobs of this type do real work (false for placeholders).
    pub fn is_runnable(&self) -> bool {
        !matches!(self, Self::Null)
    }

    pub fn is_builtin(&self) -> bool {
        !matches!(self, Self::Custom(_))
    }

    /// External tool invoked by this type, if any.
    pub fn tool_name(&self) -> Option<&'static str> {
        match self {
            Self::ModelToIdf => Some("modeltoidf"),
            Self::ExpandObjects => Some("expandobjects"),
            Self::EnergyPlus => Some("energyplus"),
            Self::ReadVars => Some("readvars"),
            Self::Script => Some("ruby"),
            _ => None,
        }
    }

    /// Extension of the input file this type consumes.
    pub fn primary_input_extension(&self) -> Option<&'static str> {
        match self {
            Self::ModelToIdf => Some("osm"),
            Self::ExpandObjects | Self::EnergyPlus => Some("idf"),
            Self::ReadVars => Some("sql"),
            _ => None,
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

impl From<String> for JobType {
    fn from(tag: String) -> Self {
        Self::from_tag(&tag)
    }
}

impl From<JobType> for String {
    fn from(job_type: JobType) -> Self {
        job_type.tag().to_string()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Parameters and Files
// ═══════════════════════════════════════════════════════════════════════════════

/// String parameters configuring a job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobParams(BTreeMap<String, String>);

impl JobParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl ToString) {
        self.0.insert(key.into(), value.to_string());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.0.remove(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Overlay `other` on top of `self`; keys in `other` win.
    pub fn merged(&self, other: &JobParams) -> JobParams {
        let mut out = self.clone();
        out.0.extend(other.0.iter().map(|(k, v)| (k.clone(), v.clone())));
        out
    }

    /// Parse an optional unsigned integer parameter.
    pub fn parse_u32(&self, key: &str) -> Result<Option<u32>> {
        match self.get(key) {
            None => Ok(None),
            Some(raw) => raw
                .trim()
                .parse::<u32>()
                .map(Some)
                .map_err(|_| RunError::invalid_parameter(key, format!("'{}' is not a non-negative integer", raw))),
        }
    }

    /// Comma-separated list parameter, empty entries dropped.
    pub fn list(&self, key: &str) -> Vec<String> {
        self.get(key)
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl<K: Into<String>, V: ToString> FromIterator<(K, V)> for JobParams {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut params = JobParams::new();
        for (k, v) in iter {
            params.insert(k, v);
        }
        params
    }
}

/// Reference to a file consumed or produced by a job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileRef {
    pub path: PathBuf,
}

impl FileRef {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn extension(&self) -> Option<&str> {
        self.path.extension().and_then(|e| e.to_str())
    }

    pub fn file_name(&self) -> Option<&str> {
        self.path.file_name().and_then(|n| n.to_str())
    }

    /// Absolute path, joining relative references onto `base`.
    pub fn resolve(&self, base: &Path) -> PathBuf {
        if self.path.is_absolute() {
            self.path.clone()
        } else {
            base.join(&self.path)
        }
    }
}

impl From<PathBuf> for FileRef {
    fn from(path: PathBuf) -> Self {
        Self::new(path)
    }
}

impl From<&Path> for FileRef {
    fn from(path: &Path) -> Self {
        Self::new(path)
    }
}

impl From<&str> for FileRef {
    fn from(path: &str) -> Self {
        Self::new(path)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Error
// ═══════════════════════════════════════════════════════════════════════════════

/// Classification of a recorded job error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobErrorKind {
    /// The environment is wrong (tool missing, no executor registered)
    Configuration,
    /// The work itself failed (non-zero exit, missing input or output)
    Execution,
    /// The job was running when the scheduler stopped
    Interrupted,
    /// The job was canceled; not a failure for reporting purposes
    Canceled,
}

impl fmt::Display for JobErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Configuration => "configuration",
            Self::Execution => "execution",
            Self::Interrupted => "interrupted",
            Self::Canceled => "canceled",
        };
        f.write_str(s)
    }
}

/// Error detail recorded on a job that did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    pub kind: JobErrorKind,
    pub message: String,
    /// Captured process output, one labelled section per stream
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
}

impl JobError {
    pub fn new(kind: JobErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            output: None,
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(JobErrorKind::Configuration, message)
    }

    pub fn execution(message: impl Into<String>) -> Self {
        Self::new(JobErrorKind::Execution, message)
    }

    pub fn interrupted() -> Self {
        Self::new(
            JobErrorKind::Interrupted,
            "job was running when the scheduler stopped",
        )
    }

    pub fn canceled(message: impl Into<String>) -> Self {
        Self::new(JobErrorKind::Canceled, message)
    }

    pub fn with_output(mut self, output: impl Into<String>) -> Self {
        self.output = Some(output.into());
        self
    }
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} error: {}", self.kind, self.message)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job
// ═══════════════════════════════════════════════════════════════════════════════

/// A single schedulable unit of work.
///
/// Relationships are id references. A job on its own is a one-node tree;
/// [`crate::jobs::JobTree`] wires parents, children and join dependencies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Unique identifier
    pub id: JobId,

    /// Root of the tree this job belongs to
    pub root_id: JobId,

    /// Kind of work
    pub job_type: JobType,

    /// Type-specific configuration
    pub params: JobParams,

    /// Declared input files, in order
    pub input_files: Vec<FileRef>,

    /// Produced files, set once on success
    pub output_files: Vec<FileRef>,

    /// File names this job must leave in its working directory
    pub expected_outputs: Vec<String>,

    /// Job-local tool table entries
    pub tools: Vec<ToolInfo>,

    /// Current lifecycle state
    pub state: JobState,

    /// Error detail when the job did not succeed
    pub error: Option<JobError>,

    /// False for no-op placeholders
    pub runnable: bool,

    /// Owning parent, used for traversal only
    pub parent_id: Option<JobId>,

    /// Position among the parent's children
    pub child_index: u32,

    /// Children in order
    pub children: Vec<JobId>,

    /// Jobs that must succeed before this one, beyond the parent
    pub join_dependencies: Vec<JobId>,

    /// Directory the tree's relative paths and working directories live under
    pub base_path: PathBuf,

    /// Set when cancellation was requested while running
    pub cancel_requested: bool,

    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Create a new pending job of the given type.
    pub fn new(job_type: JobType) -> Self {
        let id = JobId::new();
        Self {
            id,
            root_id: id,
            runnable: job_type.is_runnable(),
            job_type,
            params: JobParams::new(),
            input_files: Vec::new(),
            output_files: Vec::new(),
            expected_outputs: Vec::new(),
            tools: Vec::new(),
            state: JobState::Pending,
            error: None,
            parent_id: None,
            child_index: 0,
            children: Vec::new(),
            join_dependencies: Vec::new(),
            base_path: PathBuf::new(),
            cancel_requested: false,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    pub fn with_params(mut self, params: JobParams) -> Self {
        self.params = params;
        self
    }

    pub fn with_input_file(mut self, file: impl Into<FileRef>) -> Self {
        self.input_files.push(file.into());
        self
    }

    pub fn with_expected_outputs<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.expected_outputs = names.into_iter().map(Into::into).collect();
        self
    }

    /// Directory owned exclusively by this job.
    pub fn working_directory(&self) -> PathBuf {
        self.base_path
            .join(format!("{}-{}", self.job_type.tag().to_lowercase(), self.id.short()))
    }

    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }

    /// A structurally identical copy with a fresh id and no runtime state.
    pub(crate) fn fresh_copy(&self) -> Self {
        let mut copy = self.clone();
        copy.id = JobId::new();
        copy.root_id = copy.id;
        copy.state = JobState::Pending;
        copy.error = None;
        copy.output_files.clear();
        copy.parent_id = None;
        copy.children.clear();
        copy.join_dependencies.clear();
        copy.cancel_requested = false;
        copy.created_at = Utc::now();
        copy.started_at = None;
        copy.finished_at = None;
        copy
    }

    /// Wall-clock run time in milliseconds (if started).
    pub fn duration_ms(&self) -> Option<i64> {
        let started = self.started_at?;
        let ended = self.finished_at.unwrap_or_else(Utc::now);
        Some((ended - started).num_milliseconds())
    }
}
