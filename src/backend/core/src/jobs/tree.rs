//! Job trees: an arena of jobs plus id-based edges.
//!
//! A tree has exactly one root and a *tail*, the job the next workflow step
//! attaches beneath. For a straight chain the tail is the last job; for a
//! split/join sub-tree it is the join.

use petgraph::algo::is_cyclic_directed;
use petgraph::graph::{DiGraph, NodeIndex};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

use super::job::{FileRef, Job, JobId};
use super::tools::ToolInfo;
use crate::error::{RunError, Result};

/// How a dependent relates to its prerequisite.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    /// Parent to child
    Parent,
    /// Join dependency
    Join,
}

impl EdgeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Parent => "parent",
            Self::Join => "join",
        }
    }
}

/// A prerequisite/dependent pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Edge {
    pub prerequisite: JobId,
    pub dependent: JobId,
    pub kind: EdgeKind,
}

/// A materialized tree of jobs ready to be enqueued.
#[derive(Debug, Clone)]
pub struct JobTree {
    /// Jobs in creation order; index 0 is the root
    jobs: Vec<Job>,
    index: HashMap<JobId, usize>,
    tail: JobId,
}

impl JobTree {
    /// Create a one-node tree.
    pub fn new(mut root: Job) -> Self {
        root.parent_id = None;
        root.root_id = root.id;
        root.child_index = 0;
        let id = root.id;
        Self {
            index: HashMap::from([(id, 0)]),
            jobs: vec![root],
            tail: id,
        }
    }

    pub fn root(&self) -> &Job {
        &self.jobs[0]
    }

    pub fn root_id(&self) -> JobId {
        self.jobs[0].id
    }

    pub fn tail_id(&self) -> JobId {
        self.tail
    }

    pub fn set_tail(&mut self, id: JobId) -> Result<()> {
        if !self.index.contains_key(&id) {
            return Err(RunError::job_not_found(id.0));
        }
        self.tail = id;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn get(&self, id: JobId) -> Option<&Job> {
        self.index.get(&id).map(|&i| &self.jobs[i])
    }

    fn get_mut(&mut self, id: JobId) -> Result<&mut Job> {
        match self.index.get(&id) {
            Some(&i) => Ok(&mut self.jobs[i]),
            None => Err(RunError::job_not_found(id.0)),
        }
    }

    /// Jobs in creation order.
    pub fn iter(&self) -> impl Iterator<Item = &Job> {
        self.jobs.iter()
    }

    pub fn into_jobs(self) -> Vec<Job> {
        self.jobs
    }

    /// Attach `job` as the last child of `parent`.
    pub fn add_child(&mut self, parent: JobId, mut job: Job) -> Result<JobId> {
        if self.index.contains_key(&job.id) {
            return Err(RunError::job_already_exists(job.id.0));
        }
        let root_id = self.root_id();
        let parent_job = self.get_mut(parent)?;
        job.parent_id = Some(parent);
        job.root_id = root_id;
        job.child_index = parent_job.children.len() as u32;
        parent_job.children.push(job.id);

        let id = job.id;
        self.index.insert(id, self.jobs.len());
        self.jobs.push(job);
        Ok(id)
    }

    /// Require `dependency` to succeed before `job` may become ready.
    pub fn add_join_dependency(&mut self, job: JobId, dependency: JobId) -> Result<()> {
        if !self.index.contains_key(&dependency) {
            return Err(RunError::job_not_found(dependency.0));
        }
        let target = self.get_mut(job)?;
        if target.join_dependencies.contains(&dependency) {
            return Ok(());
        }
        target.join_dependencies.push(dependency);

        if let Err(err) = self.validate() {
            self.get_mut(job)?.join_dependencies.pop();
            return Err(err);
        }
        Ok(())
    }

    /// Graft `subtree` beneath `parent`. The tree's tail becomes the
    /// subtree's tail.
    pub fn append(&mut self, parent: JobId, subtree: JobTree) -> Result<JobId> {
        let sub_tail = subtree.tail;
        let sub_root = subtree.root_id();
        let mut jobs = subtree.into_jobs().into_iter();
        let Some(root) = jobs.next() else {
            return Err(RunError::internal("cannot append an empty job tree"));
        };
        // Children lists are rebuilt by add_child.
        let mut pending: Vec<Job> = std::iter::once(root).chain(jobs).collect();
        for job in pending.iter_mut() {
            job.children.clear();
        }
        for job in pending {
            let job_parent = job.parent_id.filter(|_| job.id != sub_root).unwrap_or(parent);
            self.add_child(job_parent, job)?;
        }
        self.tail = sub_tail;
        Ok(sub_tail)
    }

    /// Base directory for every job's working directory and relative paths.
    pub fn set_base_path(&mut self, base: &Path) {
        for job in &mut self.jobs {
            job.base_path = base.to_path_buf();
        }
    }

    pub fn add_root_input(&mut self, file: impl Into<FileRef>) {
        self.jobs[0].input_files.push(file.into());
    }

    /// Give every job access to `tools`.
    pub fn add_tools(&mut self, tools: &[ToolInfo]) {
        for job in &mut self.jobs {
            for tool in tools {
                if !job.tools.contains(tool) {
                    job.tools.push(tool.clone());
                }
            }
        }
    }

    /// Parent and join edges, in job creation order.
    pub fn edges(&self) -> Vec<Edge> {
        let mut edges = Vec::new();
        for job in &self.jobs {
            if let Some(parent) = job.parent_id {
                edges.push(Edge {
                    prerequisite: parent,
                    dependent: job.id,
                    kind: EdgeKind::Parent,
                });
            }
            for dep in &job.join_dependencies {
                edges.push(Edge {
                    prerequisite: *dep,
                    dependent: job.id,
                    kind: EdgeKind::Join,
                });
            }
        }
        edges
    }

    /// Check for dangling references and cycles.
    pub fn validate(&self) -> Result<()> {
        let mut graph: DiGraph<JobId, EdgeKind> = DiGraph::new();
        let nodes: HashMap<JobId, NodeIndex> = self
            .jobs
            .iter()
            .map(|job| (job.id, graph.add_node(job.id)))
            .collect();

        for edge in self.edges() {
            let from = nodes
                .get(&edge.prerequisite)
                .ok_or_else(|| RunError::job_not_found(edge.prerequisite.0))?;
            let to = nodes
                .get(&edge.dependent)
                .ok_or_else(|| RunError::job_not_found(edge.dependent.0))?;
            graph.add_edge(*from, *to, edge.kind);
        }

        if is_cyclic_directed(&graph) {
            return Err(RunError::cycle_detected(format!(
                "tree rooted at {}",
                self.root_id()
            )));
        }
        Ok(())
    }

    /// A structurally identical tree with fresh ids and no runtime state.
    ///
    /// Finished jobs are never re-run; retrying means enqueuing a reissue.
    pub fn reissue(&self) -> JobTree {
        let mapping: HashMap<JobId, JobId> = self
            .jobs
            .iter()
            .map(|job| (job.id, JobId::new()))
            .collect();
        let remap = |id: &JobId| mapping.get(id).copied().unwrap_or(*id);

        let jobs: Vec<Job> = self
            .jobs
            .iter()
            .map(|job| {
                let mut copy = job.fresh_copy();
                copy.id = remap(&job.id);
                copy.root_id = remap(&job.root_id);
                copy.parent_id = job.parent_id.as_ref().map(remap);
                copy.children = job.children.iter().map(remap).collect();
                copy.join_dependencies = job.join_dependencies.iter().map(remap).collect();
                copy
            })
            .collect();

        let index = jobs.iter().enumerate().map(|(i, job)| (job.id, i)).collect();
        JobTree {
            jobs,
            index,
            tail: remap(&self.tail),
        }
    }
}
