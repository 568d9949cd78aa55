//! Workflow builder.
//!
//! A workflow is an ordered list of steps. Nothing here allocates job ids
//! until [`Workflow::create`] materializes the steps into a [`JobTree`].

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use super::factory::{partition_plan, JobFactory};
use super::job::{FileRef, JobParams, JobType};
use super::tools::ToolInfo;
use super::tree::JobTree;
use crate::error::{ErrorCode, RunError, Result};

/// Token joining job type names in a workflow spec string.
pub const STEP_SEPARATOR: &str = "->";

/// One step of a workflow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub job_type: JobType,
    #[serde(default, skip_serializing_if = "JobParams::is_empty")]
    pub params: JobParams,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    /// When set, the step materializes as a split/join sub-tree.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub split_count: Option<u32>,
}

impl WorkflowStep {
    pub fn new(job_type: JobType, params: JobParams) -> Self {
        Self {
            job_type,
            params,
            tag: None,
            split_count: None,
        }
    }

    /// Construct the step once to surface parameter errors now.
    fn check(&self) -> Result<()> {
        let job = JobFactory::create(self.job_type.clone(), self.params.clone())?;
        if let Some(n) = self.split_count {
            partition_plan(&job, n)?;
        }
        Ok(())
    }
}

/// Build-time recipe for a job tree.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workflow {
    steps: Vec<WorkflowStep>,
    /// Applied to every step at materialization
    #[serde(default, skip_serializing_if = "JobParams::is_empty")]
    params: JobParams,
    /// Given to every materialized job
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    tools: Vec<ToolInfo>,
}

impl Workflow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a linear chain such as `ExpandObjects->EnergyPlus->ReadVars`.
    pub fn parse(spec: &str) -> Result<Self> {
        if spec.trim().is_empty() {
            return Err(RunError::new(ErrorCode::EmptyWorkflow, "workflow spec is empty"));
        }
        let mut workflow = Self::new();
        for name in spec.split(STEP_SEPARATOR) {
            let job_type = JobType::parse_step(name.trim())?;
            workflow.add_job(job_type, JobParams::new(), None)?;
        }
        Ok(workflow)
    }

    pub fn steps(&self) -> &[WorkflowStep] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn params(&self) -> &JobParams {
        &self.params
    }

    pub fn tools(&self) -> &[ToolInfo] {
        &self.tools
    }

    /// Tag name to step position.
    pub fn tags(&self) -> BTreeMap<String, usize> {
        self.steps
            .iter()
            .enumerate()
            .filter_map(|(i, step)| step.tag.clone().map(|tag| (tag, i)))
            .collect()
    }

    /// Append one step, optionally remembered under `tag`.
    pub fn add_job(&mut self, job_type: JobType, params: JobParams, tag: Option<&str>) -> Result<&mut Self> {
        let mut step = WorkflowStep::new(job_type, params);
        step.tag = tag.map(str::to_string);
        self.push_step(step)
    }

    /// Append a no-op step that is meant to be replaced later.
    pub fn add_placeholder(&mut self, tag: &str) -> Result<&mut Self> {
        self.add_job(JobType::Null, JobParams::new(), Some(tag))
    }

    /// Append a step that runs as `split_count` partitioned copies.
    pub fn add_parallel_job(
        &mut self,
        job_type: JobType,
        params: JobParams,
        split_count: u32,
        tag: Option<&str>,
    ) -> Result<&mut Self> {
        let mut step = WorkflowStep::new(job_type, params);
        step.tag = tag.map(str::to_string);
        step.split_count = Some(split_count);
        self.push_step(step)
    }

    /// Run every step of `job_type` as `split_count` partitioned copies.
    /// Returns the number of steps changed.
    pub fn parallelize(&mut self, job_type: &JobType, split_count: u32) -> Result<usize> {
        let mut changed = Vec::new();
        for (i, step) in self.steps.iter().enumerate() {
            if &step.job_type == job_type {
                let mut candidate = step.clone();
                candidate.split_count = Some(split_count);
                candidate.check()?;
                changed.push(i);
            }
        }
        for &i in &changed {
            self.steps[i].split_count = Some(split_count);
        }
        Ok(changed.len())
    }

    fn push_step(&mut self, step: WorkflowStep) -> Result<&mut Self> {
        if let Some(tag) = &step.tag {
            if self.tags().contains_key(tag) {
                return Err(RunError::duplicate_tag(tag.clone()));
            }
        }
        step.check()?;
        self.steps.push(step);
        Ok(self)
    }

    /// Append all of `other`'s steps. Fails without modifying `self` if any
    /// of `other`'s tags is already in use.
    pub fn add_workflow(&mut self, other: &Workflow) -> Result<&mut Self> {
        let existing = self.tags();
        if let Some(tag) = other.tags().into_keys().find(|t| existing.contains_key(t)) {
            return Err(RunError::duplicate_tag(tag));
        }
        self.steps.extend(other.resolved_steps());
        self.merge_tools(&other.tools);
        Ok(self)
    }

    /// Substitute the step tagged `tag` with `replacement`'s steps.
    ///
    /// The tagged step is removed; the replacement chain sits between the
    /// removed step's predecessor and successor.
    pub fn replace_jobs(&mut self, tag: &str, replacement: &Workflow) -> Result<&mut Self> {
        if replacement.is_empty() {
            return Err(RunError::new(
                ErrorCode::EmptyWorkflow,
                format!("replacement for tag '{}' has no steps", tag),
            ));
        }
        let mut existing = self.tags();
        let position = existing.remove(tag).ok_or_else(|| RunError::tag_not_found(tag))?;
        if let Some(dup) = replacement.tags().into_keys().find(|t| existing.contains_key(t)) {
            return Err(RunError::duplicate_tag(dup));
        }
        self.steps
            .splice(position..=position, replacement.resolved_steps());
        self.merge_tools(&replacement.tools);
        Ok(self)
    }

    pub fn add_tools(&mut self, tools: &[ToolInfo]) -> &mut Self {
        self.merge_tools(tools);
        self
    }

    /// Set a parameter on every step, overriding per-step values.
    pub fn add_param(&mut self, key: impl Into<String>, value: impl ToString) -> &mut Self {
        self.params.insert(key, value);
        self
    }

    fn merge_tools(&mut self, tools: &[ToolInfo]) {
        for tool in tools {
            if !self.tools.contains(tool) {
                self.tools.push(tool.clone());
            }
        }
    }

    /// Steps with workflow-wide params folded in.
    fn resolved_steps(&self) -> impl Iterator<Item = WorkflowStep> + '_ {
        self.steps.iter().map(|step| {
            let mut step = step.clone();
            step.params = step.params.merged(&self.params);
            step
        })
    }

    /// Materialize the steps into a job tree rooted at the first step.
    ///
    /// Each call allocates fresh job ids.
    pub fn create(
        &self,
        working_dir: &Path,
        input_file: impl Into<FileRef>,
        tools: &[ToolInfo],
    ) -> Result<JobTree> {
        let mut tree: Option<JobTree> = None;
        for step in self.resolved_steps() {
            let job = JobFactory::create(step.job_type, step.params)?;
            let subtree = match step.split_count {
                Some(n) => JobFactory::create_parallel_job_tree(job, n)?,
                None => JobTree::new(job),
            };
            tree = Some(match tree.take() {
                None => subtree,
                Some(mut tree) => {
                    let tail = tree.tail_id();
                    tree.append(tail, subtree)?;
                    tree
                }
            });
        }

        let mut tree = tree.ok_or_else(|| RunError::new(ErrorCode::EmptyWorkflow, "workflow has no steps"))?;
        tree.add_root_input(input_file);
        tree.set_base_path(working_dir);
        tree.add_tools(&self.tools);
        tree.add_tools(tools);
        tree.validate()?;
        Ok(tree)
    }
}

impl fmt::Display for Workflow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, step) in self.steps.iter().enumerate() {
            if i > 0 {
                f.write_str(STEP_SEPARATOR)?;
            }
            f.write_str(step.job_type.tag())?;
        }
        Ok(())
    }
}

impl FromStr for Workflow {
    type Err = RunError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::factory::params;
    use std::path::PathBuf;

    fn types(tree: &JobTree) -> Vec<JobType> {
        tree.iter().map(|j| j.job_type.clone()).collect()
    }

    #[test]
    fn test_parse_creates_straight_chain() {
        let workflow = Workflow::parse("ExpandObjects->EnergyPlus->ReadVars").unwrap();
        let tree = workflow.create(Path::new("/runs/a"), PathBuf::from("in.idf"), &[]).unwrap();

        assert_eq!(tree.len(), 3);
        let jobs: Vec<_> = tree.iter().collect();
        assert!(jobs[0].is_root());
        assert_eq!(jobs[1].parent_id, Some(jobs[0].id));
        assert_eq!(jobs[2].parent_id, Some(jobs[1].id));
        assert_eq!(jobs[0].children, vec![jobs[1].id]);
        assert_eq!(jobs[0].input_files, vec![FileRef::new("in.idf")]);
        assert!(jobs.iter().all(|j| j.base_path == Path::new("/runs/a")));
    }

    #[test]
    fn test_parse_rejects_unknown_names() {
        let err = Workflow::parse("ExpandObjects->Bogus").unwrap_err();
        assert_eq!(err.code(), ErrorCode::UnknownJobType);
        assert!(Workflow::parse("").is_err());
        assert!(Workflow::parse("EnergyPlus->").is_err());
    }

    #[test]
    fn test_display_round_trips() {
        let spec = "ModelToIdf->EnergyPlus->ReadVars";
        let workflow: Workflow = spec.parse().unwrap();
        assert_eq!(workflow.to_string(), spec);
    }

    #[test]
    fn test_replace_jobs_splices_chain() {
        let mut workflow = Workflow::new();
        workflow
            .add_job(JobType::ExpandObjects, JobParams::new(), None)
            .unwrap()
            .add_placeholder("sim")
            .unwrap()
            .add_job(JobType::ReadVars, JobParams::new(), None)
            .unwrap();

        let sub = Workflow::parse("EnergyPlus->Null").unwrap();
        workflow.replace_jobs("sim", &sub).unwrap();

        assert_eq!(workflow.to_string(), "ExpandObjects->EnergyPlus->Null->ReadVars");
        assert!(workflow.tags().is_empty());

        let tree = workflow.create(Path::new("/r"), PathBuf::from("in.idf"), &[]).unwrap();
        let jobs: Vec<_> = tree.iter().collect();
        assert_eq!(jobs.len(), 4);
        for pair in jobs.windows(2) {
            assert_eq!(pair[1].parent_id, Some(pair[0].id));
        }
    }

    #[test]
    fn test_replace_unknown_tag_fails() {
        let mut workflow = Workflow::parse("EnergyPlus").unwrap();
        let sub = Workflow::parse("ReadVars").unwrap();
        let err = workflow.replace_jobs("missing", &sub).unwrap_err();
        assert_eq!(err.code(), ErrorCode::TagNotFound);
    }

    #[test]
    fn test_add_workflow_tag_collision_leaves_builder_untouched() {
        let mut a = Workflow::new();
        a.add_placeholder("post").unwrap();
        let mut b = Workflow::new();
        b.add_job(JobType::ReadVars, JobParams::new(), Some("post")).unwrap();

        let err = a.add_workflow(&b).unwrap_err();
        assert_eq!(err.code(), ErrorCode::DuplicateTag);
        assert_eq!(a.len(), 1);

        let mut c = Workflow::new();
        c.add_job(JobType::ReadVars, JobParams::new(), Some("csv")).unwrap();
        a.add_workflow(&c).unwrap();
        assert_eq!(a.tags().get("csv"), Some(&1));
    }

    #[test]
    fn test_add_job_validates_eagerly() {
        let mut workflow = Workflow::new();
        let bad = JobParams::new().with(params::THREADS, "many");
        assert!(workflow.add_job(JobType::EnergyPlus, bad, None).is_err());
        assert!(workflow.is_empty());
        assert!(workflow.add_job(JobType::Script, JobParams::new(), None).is_err());
        assert!(workflow.add_placeholder("a").is_ok());
        assert!(workflow.add_placeholder("a").is_err());
    }

    #[test]
    fn test_parallel_step_materializes_split_join() {
        let mut workflow = Workflow::parse("ExpandObjects->EnergyPlus->ReadVars").unwrap();
        assert_eq!(workflow.parallelize(&JobType::EnergyPlus, 3).unwrap(), 1);
        assert!(workflow.parallelize(&JobType::EnergyPlus, 0).is_err());

        let tree = workflow.create(Path::new("/r"), PathBuf::from("in.idf"), &[]).unwrap();
        assert_eq!(
            types(&tree),
            vec![
                JobType::ExpandObjects,
                JobType::Split,
                JobType::EnergyPlus,
                JobType::EnergyPlus,
                JobType::EnergyPlus,
                JobType::Join,
                JobType::ReadVars,
            ]
        );
        let join = tree.iter().find(|j| j.job_type == JobType::Join).unwrap();
        let read_vars = tree.get(tree.tail_id()).unwrap();
        assert_eq!(read_vars.parent_id, Some(join.id));
        assert_eq!(join.join_dependencies.len(), 3);
    }

    #[test]
    fn test_params_and_tools_reach_every_job() {
        let mut workflow = Workflow::parse("ExpandObjects->ReadVars").unwrap();
        workflow
            .add_param(params::TOOL_VERSION, "9.4")
            .add_tools(&[ToolInfo::new("readvars", "/opt/ep/readvars")]);
        let extra = [ToolInfo::new("expandobjects", "/opt/ep/expandobjects")];

        let tree = workflow.create(Path::new("/r"), PathBuf::from("in.idf"), &extra).unwrap();
        for job in tree.iter() {
            assert_eq!(job.params.get(params::TOOL_VERSION), Some("9.4"));
            assert_eq!(job.tools.len(), 2);
        }
    }

    #[test]
    fn test_create_twice_yields_independent_trees() {
        let workflow = Workflow::parse("EnergyPlus").unwrap();
        let a = workflow.create(Path::new("/r"), PathBuf::from("in.idf"), &[]).unwrap();
        let b = workflow.create(Path::new("/r"), PathBuf::from("in.idf"), &[]).unwrap();
        assert_ne!(a.root_id(), b.root_id());
    }

    #[test]
    fn test_empty_workflow_cannot_be_created() {
        let err = Workflow::new()
            .create(Path::new("/r"), PathBuf::from("in.idf"), &[])
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::EmptyWorkflow);
    }

    #[test]
    fn test_serde_round_trip_preserves_tags() {
        let mut workflow = Workflow::parse("ExpandObjects").unwrap();
        workflow.add_parallel_job(JobType::EnergyPlus, JobParams::new(), 2, Some("sim")).unwrap();
        let json = serde_json::to_string(&workflow).unwrap();
        let back: Workflow = serde_json::from_str(&json).unwrap();
        assert_eq!(back, workflow);
        assert_eq!(back.tags().get("sim"), Some(&1));
    }
}
