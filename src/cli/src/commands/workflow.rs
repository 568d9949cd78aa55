//! Named workflow commands.
//!
//! Workflows are saved in the job store under a name and can be run later.

use anyhow::Result;
use clap::Subcommand;
use serde::Serialize;
use tabled::Tabled;

use runmanager_core::jobs::{JobType, Workflow};

use super::run::{self, RunTarget};
use super::Session;
use crate::output::{self, OutputFormat};

#[derive(Subcommand)]
pub enum WorkflowCommands {
    /// Save a workflow spec under a name, replacing any existing one
    Save {
        /// Workflow name
        name: String,

        /// Workflow spec, step names joined by "->"
        spec: String,

        /// Split every EnergyPlus step into this many partitions
        #[arg(long)]
        split_count: Option<u32>,
    },

    /// List saved workflows
    List,

    /// Show the steps of a saved workflow
    Show {
        /// Workflow name
        name: String,
    },

    /// Delete a saved workflow
    Delete {
        /// Workflow name
        name: String,
    },

    /// Run a saved workflow
    Run {
        /// Workflow name
        name: String,

        #[command(flatten)]
        target: RunTarget,
    },
}

#[derive(Debug, Serialize, Tabled)]
struct WorkflowRow {
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Steps")]
    steps: String,
}

#[derive(Debug, Serialize, Tabled)]
struct StepRow {
    #[tabled(rename = "#")]
    index: usize,
    #[tabled(rename = "Type")]
    job_type: String,
    #[tabled(rename = "Tag")]
    tag: String,
    #[tabled(rename = "Split")]
    split: String,
    #[tabled(rename = "Params")]
    params: String,
}

// ── Execution ───────────────────────────────────────────────────────────────

pub async fn execute(cmd: WorkflowCommands, session: &Session, format: OutputFormat) -> Result<()> {
    let store = session.open_store().await?;
    let result = match cmd {
        WorkflowCommands::Save {
            name,
            spec,
            split_count,
        } => {
            let mut workflow = Workflow::parse(&spec)?;
            if let Some(n) = split_count {
                workflow.parallelize(&JobType::EnergyPlus, n)?;
            }
            store.save_workflow(&name, &workflow).await?;
            output::print_success(&format!("Saved workflow '{}': {}", name, workflow));
            Ok(())
        }

        WorkflowCommands::List => {
            let mut rows = Vec::new();
            for name in store.workflow_names().await? {
                let workflow = store.load_workflow(&name).await?;
                rows.push(WorkflowRow {
                    name,
                    steps: workflow.to_string(),
                });
            }
            output::print_list(&rows, format)
        }

        WorkflowCommands::Show { name } => {
            let workflow = store.load_workflow(&name).await?;
            match format {
                OutputFormat::Table => {
                    output::print_header(&format!("Workflow {}", name));
                    if !workflow.params().is_empty() {
                        output::print_detail("Params", &serde_json::to_string(workflow.params())?);
                    }
                    for tool in workflow.tools() {
                        output::print_detail(&tool.name, &tool.path.display().to_string());
                    }
                    output::print_list(&step_rows(&workflow)?, format)
                }
                _ => output::print_item(&workflow, format),
            }
        }

        WorkflowCommands::Delete { name } => {
            if store.delete_workflow(&name).await? {
                output::print_success(&format!("Deleted workflow '{}'", name));
            } else {
                output::print_info(&format!("No workflow named '{}'", name));
            }
            Ok(())
        }

        WorkflowCommands::Run { name, target } => {
            // The manager opens the store itself.
            let workflow = store.load_workflow(&name).await;
            store.close().await;
            return run::run_workflow(workflow?, target, session, format).await;
        }
    };

    store.close().await;
    result
}

fn step_rows(workflow: &Workflow) -> Result<Vec<StepRow>> {
    workflow
        .steps()
        .iter()
        .enumerate()
        .map(|(index, step)| {
            Ok(StepRow {
                index,
                job_type: step.job_type.to_string(),
                tag: step.tag.clone().unwrap_or_default(),
                split: step.split_count.map(|n| n.to_string()).unwrap_or_default(),
                params: if step.params.is_empty() {
                    String::new()
                } else {
                    serde_json::to_string(&step.params)?
                },
            })
        })
        .collect()
}
