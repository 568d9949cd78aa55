//! Job model and tree construction.
//!
//! This module covers everything that happens before a job reaches the store:
//!
//! - **Job**: identity, lifecycle state, parameters and file references
//! - **JobTree**: an arena of jobs with parent, child and join edges
//! - **JobFactory**: validated per-type constructors and the parallel split/join pattern
//! - **Workflow**: a builder that materializes job trees from ordered steps
//! - **Tools**: the name + version lookup table handed to executors
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐  create()   ┌──────────────┐  enqueue()  ┌──────────────┐
//! │   Workflow   │────────────▶│   JobTree    │────────────▶│  RunManager  │
//! │   (steps)    │             │   (arena)    │             │   (store)    │
//! └──────┬───────┘             └──────────────┘             └──────────────┘
//!        │ per step                    ▲
//!        ▼                             │ split/join sub-trees
//! ┌──────────────┐                     │
//! │  JobFactory  │─────────────────────┘
//! └──────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use runmanager_core::jobs::{JobType, JobParams, Workflow};
//!
//! let mut workflow = Workflow::parse("ExpandObjects->EnergyPlus->ReadVars")?;
//! workflow.parallelize(&JobType::EnergyPlus, 4)?;
//! let tree = workflow.create(Path::new("/runs/office"), PathBuf::from("in.idf"), &tools)?;
//! manager.enqueue(&tree).await?;
//! ```

pub mod factory;
pub mod job;
pub mod tools;
pub mod tree;
pub mod workflow;

pub use factory::{partition_days, partition_plan, JobFactory, Partition};
pub use job::{FileRef, Job, JobError, JobErrorKind, JobId, JobParams, JobState, JobType};
pub use tools::{LayeredTools, ToolInfo, ToolTable, ToolVersion};
pub use tree::{Edge, EdgeKind, JobTree};
pub use workflow::{Workflow, WorkflowStep, STEP_SEPARATOR};
