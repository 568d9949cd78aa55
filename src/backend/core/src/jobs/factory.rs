//! Per-type job constructors.
//!
//! Everything that can be checked without running the job is checked here,
//! so a job that reaches the store is never doomed by its own parameters.

use serde::{Deserialize, Serialize};

use super::job::{Job, JobParams, JobType};
use super::tools::ToolVersion;
use super::tree::JobTree;
use crate::error::{ErrorCode, RunError, Result};

/// Parameter keys understood by the built-in job types.
pub mod params {
    pub const TOOL_VERSION: &str = "tool_version";
    pub const ARGS: &str = "args";
    pub const RUN_PERIOD_START: &str = "run_period_start";
    pub const RUN_PERIOD_END: &str = "run_period_end";
    pub const THREADS: &str = "threads";
    pub const SCRIPT: &str = "script";
    pub const OUTPUTS: &str = "outputs";
    pub const SPLIT_COUNT: &str = "split_count";
    pub const INNER_TYPE: &str = "inner_type";
    pub const PARTITION_INDEX: &str = "partition_index";
    pub const PARTITION_COUNT: &str = "partition_count";
}

const DAYS_IN_YEAR: u32 = 365;

/// One slice of a split job, written to disk by the split executor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Partition {
    pub index: u32,
    pub count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_period_start: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_period_end: Option<u32>,
}

impl Partition {
    pub fn file_name(index: u32) -> String {
        format!("partition-{}.json", index)
    }
}

/// Stateless constructors, one per job type.
pub struct JobFactory;

impl JobFactory {
    /// Build a job of any type from its parameters.
    pub fn create(job_type: JobType, params: JobParams) -> Result<Job> {
        match job_type {
            JobType::Null => Ok(Self::null_job()),
            JobType::ModelToIdf => Self::model_to_idf(params),
            JobType::ExpandObjects => Self::expand_objects(params),
            JobType::EnergyPlus => Self::energy_plus(params),
            JobType::ReadVars => Self::read_vars(params),
            JobType::Script => Self::script(params),
            JobType::Split => {
                let count = params
                    .parse_u32(params::SPLIT_COUNT)?
                    .ok_or_else(|| RunError::missing_parameter(JobType::Split, params::SPLIT_COUNT))?;
                let inner = params
                    .get(params::INNER_TYPE)
                    .map(JobType::from_tag)
                    .unwrap_or(JobType::Null);
                Self::split(count, &inner, params)
            }
            JobType::Join => Ok(Self::join()),
            JobType::Custom(name) => Self::custom(name, params),
        }
    }

    /// A no-op placeholder.
    pub fn null_job() -> Job {
        Job::new(JobType::Null)
    }

    pub fn model_to_idf(params: JobParams) -> Result<Job> {
        Self::tool_job(JobType::ModelToIdf, params, &["in.idf"])
    }

    pub fn expand_objects(params: JobParams) -> Result<Job> {
        Self::tool_job(JobType::ExpandObjects, params, &["expanded.idf"])
    }

    pub fn energy_plus(params: JobParams) -> Result<Job> {
        let (start, end) = run_period(&params)?;
        if start > end {
            return Err(RunError::invalid_parameter(
                params::RUN_PERIOD_START,
                format!("start day {} is after end day {}", start, end),
            ));
        }
        if let Some(threads) = params.parse_u32(params::THREADS)? {
            if threads == 0 {
                return Err(RunError::invalid_parameter(params::THREADS, "must be at least 1"));
            }
        }
        Self::tool_job(JobType::EnergyPlus, params, &["eplusout.sql", "eplusout.err"])
    }

    pub fn read_vars(params: JobParams) -> Result<Job> {
        Self::tool_job(JobType::ReadVars, params, &["eplusout.csv"])
    }

    pub fn script(params: JobParams) -> Result<Job> {
        match params.get(params::SCRIPT) {
            Some(script) if !script.trim().is_empty() => {}
            _ => return Err(RunError::missing_parameter(JobType::Script, params::SCRIPT)),
        }
        validate_tool_version(&params)?;
        let outputs = params.list(params::OUTPUTS);
        Ok(Job::new(JobType::Script)
            .with_params(params)
            .with_expected_outputs(outputs))
    }

    /// A split job producing `count` partition manifests.
    pub fn split(count: u32, inner: &JobType, params: JobParams) -> Result<Job> {
        if count == 0 {
            return Err(RunError::new(
                ErrorCode::InvalidSplitCount,
                "split count must be at least 1",
            ));
        }
        let mut params = params;
        params.insert(params::SPLIT_COUNT, count);
        params.insert(params::INNER_TYPE, inner.tag());
        let outputs = (0..count).map(Partition::file_name);
        Ok(Job::new(JobType::Split)
            .with_params(params)
            .with_expected_outputs(outputs))
    }

    /// A join job; its outputs depend on what its dependencies produce.
    pub fn join() -> Job {
        Job::new(JobType::Join)
    }

    /// A job handled by an executor registered under `name`.
    pub fn custom(name: impl Into<String>, params: JobParams) -> Result<Job> {
        let name = name.into();
        if name.trim().is_empty() || name.contains("->") {
            return Err(RunError::unknown_job_type(name));
        }
        if JobType::from_tag(&name).is_builtin() {
            return Err(RunError::invalid_parameter(
                "job_type",
                format!("'{}' is a built-in type", name),
            ));
        }
        let outputs = params.list(params::OUTPUTS);
        Ok(Job::new(JobType::Custom(name))
            .with_params(params)
            .with_expected_outputs(outputs))
    }

    fn tool_job(job_type: JobType, params: JobParams, outputs: &[&str]) -> Result<Job> {
        validate_tool_version(&params)?;
        Ok(Job::new(job_type)
            .with_params(params)
            .with_expected_outputs(outputs.iter().copied()))
    }

    /// Fan `job` out into `split_count` partitioned copies.
    ///
    /// The result is rooted at a split job whose children are the copies plus
    /// a join that depends on every copy. The join is the tree's tail.
    pub fn create_parallel_job_tree(job: Job, split_count: u32) -> Result<JobTree> {
        let plan = partition_plan(&job, split_count)?;

        let mut split_params = JobParams::new();
        if let Some(version) = job.params.get(params::TOOL_VERSION) {
            split_params.insert(params::TOOL_VERSION, version);
        }
        if job.job_type == JobType::EnergyPlus {
            let (start, end) = run_period(&job.params)?;
            split_params.insert(params::RUN_PERIOD_START, start);
            split_params.insert(params::RUN_PERIOD_END, end);
        }
        let mut split = Self::split(split_count, &job.job_type, split_params)?;
        split.input_files = job.input_files.clone();
        split.tools = job.tools.clone();

        let mut tree = JobTree::new(split);
        let root = tree.root_id();
        let mut copies = Vec::with_capacity(plan.len());
        for partition in &plan {
            let mut copy = job.fresh_copy();
            copy.input_files.clear();
            copy.params.insert(params::PARTITION_INDEX, partition.index);
            copy.params.insert(params::PARTITION_COUNT, partition.count);
            if let (Some(start), Some(end)) = (partition.run_period_start, partition.run_period_end) {
                copy.params.insert(params::RUN_PERIOD_START, start);
                copy.params.insert(params::RUN_PERIOD_END, end);
            }
            copies.push(tree.add_child(root, copy)?);
        }

        let join = tree.add_child(root, Self::join())?;
        for copy in copies {
            tree.add_join_dependency(join, copy)?;
        }
        tree.set_tail(join)?;
        Ok(tree)
    }
}

fn validate_tool_version(params: &JobParams) -> Result<Option<ToolVersion>> {
    params
        .get(params::TOOL_VERSION)
        .map(str::parse::<ToolVersion>)
        .transpose()
}

fn run_period(params: &JobParams) -> Result<(u32, u32)> {
    let start = params.parse_u32(params::RUN_PERIOD_START)?.unwrap_or(1);
    let end = params.parse_u32(params::RUN_PERIOD_END)?.unwrap_or(DAYS_IN_YEAR);
    for (key, day) in [(params::RUN_PERIOD_START, start), (params::RUN_PERIOD_END, end)] {
        if !(1..=DAYS_IN_YEAR).contains(&day) {
            return Err(RunError::invalid_parameter(
                key,
                format!("day {} is outside 1..={}", day, DAYS_IN_YEAR),
            ));
        }
    }
    Ok((start, end))
}

/// Split the inclusive day range into `n` contiguous near-equal ranges.
/// Leftover days go one each to the earliest ranges.
pub fn partition_days(start: u32, end: u32, n: u32) -> Result<Vec<(u32, u32)>> {
    if n == 0 {
        return Err(RunError::new(ErrorCode::InvalidSplitCount, "split count must be at least 1"));
    }
    let days = end.saturating_sub(start) + 1;
    if n > days {
        return Err(RunError::new(
            ErrorCode::InvalidSplitCount,
            format!("cannot split {} day(s) into {} partitions", days, n),
        ));
    }
    let base = days / n;
    let extra = days % n;
    let mut ranges = Vec::with_capacity(n as usize);
    let mut first = start;
    for i in 0..n {
        let len = base + u32::from(i < extra);
        ranges.push((first, first + len - 1));
        first += len;
    }
    Ok(ranges)
}

/// How `job` is divided among `n` parallel copies.
pub fn partition_plan(job: &Job, n: u32) -> Result<Vec<Partition>> {
    if n == 0 {
        return Err(RunError::new(ErrorCode::InvalidSplitCount, "split count must be at least 1"));
    }
    if matches!(job.job_type, JobType::Split | JobType::Join) {
        return Err(RunError::invalid_parameter(
            "job_type",
            format!("{} jobs cannot be parallelized", job.job_type),
        ));
    }

    if job.job_type == JobType::EnergyPlus {
        let (start, end) = run_period(&job.params)?;
        let ranges = partition_days(start, end, n)?;
        return Ok(ranges
            .into_iter()
            .zip(0..)
            .map(|((s, e), index)| Partition {
                index,
                count: n,
                run_period_start: Some(s),
                run_period_end: Some(e),
            })
            .collect());
    }

    Ok((0..n)
        .map(|index| Partition {
            index,
            count: n,
            run_period_start: None,
            run_period_end: None,
        })
        .collect())
}
