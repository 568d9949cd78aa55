//! runmanager CLI - run simulation workflows against a local job store.
//!
//! Provides commands to run and resume workflows, inspect jobs, and manage
//! named workflows.

mod commands;
mod output;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use commands::{jobs, run, stats, workflow, Session};
use output::OutputFormat;

/// runmanager - durable job-dependency scheduler
#[derive(Parser)]
#[command(
    name = "runmanager",
    version,
    about = "Run simulation workflows as dependency-ordered jobs",
    long_about = "Materializes workflows into job trees, stores them durably and runs them with a bounded worker pool.",
    propagate_version = true
)]
pub struct Cli {
    /// Configuration file
    #[arg(short, long, global = true, env = "RUNMANAGER_CONFIG")]
    config: Option<PathBuf>,

    /// Job store file (overrides the configured path)
    #[arg(long, global = true, env = "RUNMANAGER_STORE")]
    store: Option<PathBuf>,

    /// Output format
    #[arg(short, long, global = true, default_value = "table")]
    output: OutputFormat,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a workflow spec such as "ModelToIdf->EnergyPlus->ReadVars"
    Run(run::RunArgs),

    /// Run whatever work the store still holds
    Resume,

    /// Job inspection and management
    #[command(subcommand)]
    Jobs(jobs::JobCommands),

    /// Named workflow management
    #[command(subcommand)]
    Workflow(workflow::WorkflowCommands),

    /// Show job counts per state
    Stats,
}

#[tokio::main]
async fn main() {
    // A missing .env file is fine.
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    if cli.no_color {
        colored::control::set_override(false);
    }

    let result = run_command(cli).await;

    if let Err(e) = result {
        output::print_error(&format!("{:#}", e));
        std::process::exit(1);
    }
}

async fn run_command(cli: Cli) -> Result<()> {
    let session = Session::new(cli.config.as_deref(), cli.store)?;
    let format = cli.output;

    match cli.command {
        Commands::Run(args) => run::execute(args, &session, format).await,
        Commands::Resume => run::resume(&session, format).await,
        Commands::Jobs(cmd) => jobs::execute(cmd, &session, format).await,
        Commands::Workflow(cmd) => workflow::execute(cmd, &session, format).await,
        Commands::Stats => stats::execute(&session, format).await,
    }
}
