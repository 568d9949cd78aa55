//! Workflows of built-in tool jobs, driven by stand-in `/bin/sh` tools.

#![cfg(unix)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;

use runmanager_core::executor::tool::{STDERR_LOG, STDOUT_LOG};
use runmanager_core::jobs::{Job, JobErrorKind, JobState, JobType, ToolInfo, Workflow};
use runmanager_core::scheduler::{RunManager, RunManagerOptions};

const LAST_ARG: &str = "for last; do :; done\n";

fn write_tool(dir: &Path, name: &str, body: &str) -> ToolInfo {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{}{}", LAST_ARG, body)).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    ToolInfo::new(name, path)
}

/// Tools that copy their primary input into the outputs each one declares.
fn healthy_tools(dir: &Path) -> Vec<ToolInfo> {
    vec![
        write_tool(dir, "modeltoidf", "cat \"$last\" > in.idf\n"),
        write_tool(
            dir,
            "energyplus",
            "echo \"${RUNMANAGER_RUN_PERIOD_START:-1}-${RUNMANAGER_RUN_PERIOD_END:-365}\" > eplusout.sql\n\
             echo simulated > eplusout.err\n",
        ),
        write_tool(dir, "readvars", "cp \"$last\" eplusout.csv\necho converted\n"),
    ]
}

struct Fixture {
    dir: TempDir,
    tools: Vec<ToolInfo>,
}

impl Fixture {
    fn new(tools: impl FnOnce(&Path) -> Vec<ToolInfo>) -> Self {
        let dir = TempDir::new().unwrap();
        let bin = dir.path().join("bin");
        std::fs::create_dir(&bin).unwrap();
        let tools = tools(&bin);
        std::fs::write(dir.path().join("model.osm"), "model\n").unwrap();
        Self { dir, tools }
    }

    fn model(&self) -> PathBuf {
        self.dir.path().join("model.osm")
    }

    fn runs(&self) -> PathBuf {
        self.dir.path().join("runs")
    }

    async fn manager(&self) -> RunManager {
        RunManager::open(
            RunManagerOptions::default()
                .with_workers(2)
                .with_start_paused(false)
                .with_tools(self.tools.clone())
                .with_shutdown_timeout(Duration::from_secs(5)),
        )
        .await
        .unwrap()
    }
}

async fn run(manager: &RunManager, workflow: &Workflow, fixture: &Fixture) -> Vec<Job> {
    let tree = workflow
        .create(&fixture.runs(), fixture.model(), &[])
        .unwrap();
    manager.enqueue(&tree).await.unwrap();
    assert!(manager
        .wait_for_finished_timeout(Duration::from_secs(20))
        .await
        .unwrap());
    manager.tree_jobs(tree.root_id()).await.unwrap()
}

fn of_type<'a>(jobs: &'a [Job], job_type: &JobType) -> Vec<&'a Job> {
    jobs.iter().filter(|job| &job.job_type == job_type).collect()
}

#[tokio::test]
async fn test_serial_simulation_chain() {
    let fixture = Fixture::new(healthy_tools);
    let manager = fixture.manager().await;
    let workflow = Workflow::parse("ModelToIdf->EnergyPlus->ReadVars").unwrap();

    let jobs = run(&manager, &workflow, &fixture).await;
    assert_eq!(jobs.len(), 3);
    assert!(jobs.iter().all(|job| job.state == JobState::Succeeded));

    let readvars = of_type(&jobs, &JobType::ReadVars)[0];
    let dir = readvars.working_directory();
    assert_eq!(std::fs::read_to_string(dir.join("eplusout.csv")).unwrap(), "1-365\n");
    assert_eq!(std::fs::read_to_string(dir.join(STDOUT_LOG)).unwrap(), "converted\n");
    assert!(dir.join(STDERR_LOG).exists());
    manager.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_parallel_simulation_merges_partitions_in_order() {
    let fixture = Fixture::new(healthy_tools);
    let manager = fixture.manager().await;
    let mut workflow = Workflow::parse("ModelToIdf->EnergyPlus->ReadVars").unwrap();
    assert_eq!(workflow.parallelize(&JobType::EnergyPlus, 2).unwrap(), 1);

    let jobs = run(&manager, &workflow, &fixture).await;
    // ModelToIdf, Split, 2 x EnergyPlus, Join, ReadVars
    assert_eq!(jobs.len(), 6);
    assert!(jobs.iter().all(|job| job.state == JobState::Succeeded));

    let join = of_type(&jobs, &JobType::Join)[0];
    let merged = join.working_directory().join("eplusout.sql");
    assert_eq!(std::fs::read_to_string(merged).unwrap(), "1-183\n184-365\n");

    let readvars = of_type(&jobs, &JobType::ReadVars)[0];
    let csv = readvars.working_directory().join("eplusout.csv");
    assert_eq!(std::fs::read_to_string(csv).unwrap(), "1-183\n184-365\n");
    manager.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_nonzero_exit_fails_with_captured_output() {
    let fixture = Fixture::new(|bin| {
        let mut tools = healthy_tools(bin);
        tools[1] = write_tool(bin, "energyplus", "echo 'severe error' >&2\nexit 2\n");
        tools
    });
    let manager = fixture.manager().await;
    let workflow = Workflow::parse("ModelToIdf->EnergyPlus->ReadVars").unwrap();

    let jobs = run(&manager, &workflow, &fixture).await;
    let energyplus = of_type(&jobs, &JobType::EnergyPlus)[0];
    assert_eq!(energyplus.state, JobState::Failed);
    let error = energyplus.error.clone().unwrap();
    assert_eq!(error.kind, JobErrorKind::Execution);
    assert_eq!(error.output.as_deref(), Some("[stderr]\nsevere error\n"));
    assert_eq!(
        std::fs::read_to_string(energyplus.working_directory().join(STDERR_LOG)).unwrap(),
        "severe error\n"
    );

    assert_eq!(of_type(&jobs, &JobType::ReadVars)[0].state, JobState::Canceled);
    manager.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_missing_declared_output_fails() {
    let fixture = Fixture::new(|bin| {
        let mut tools = healthy_tools(bin);
        tools[1] = write_tool(bin, "energyplus", "echo partial > eplusout.err\n");
        tools
    });
    let manager = fixture.manager().await;
    let workflow = Workflow::parse("ModelToIdf->EnergyPlus").unwrap();

    let jobs = run(&manager, &workflow, &fixture).await;
    let energyplus = of_type(&jobs, &JobType::EnergyPlus)[0];
    assert_eq!(energyplus.state, JobState::Failed);
    assert_eq!(
        energyplus.error.clone().unwrap().message,
        "expected output file(s) not generated: eplusout.sql"
    );
    manager.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_missing_tool_is_a_configuration_error() {
    let fixture = Fixture::new(|bin| healthy_tools(bin).into_iter().take(1).collect());
    let manager = fixture.manager().await;
    let workflow = Workflow::parse("ModelToIdf->EnergyPlus").unwrap();

    let jobs = run(&manager, &workflow, &fixture).await;
    let energyplus = of_type(&jobs, &JobType::EnergyPlus)[0];
    assert_eq!(energyplus.state, JobState::Failed);
    assert_eq!(energyplus.error.clone().unwrap().kind, JobErrorKind::Configuration);
    manager.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_cancel_terminates_tool_process() {
    let fixture = Fixture::new(|bin| vec![write_tool(bin, "modeltoidf", "sleep 30\n")]);
    let manager = fixture.manager().await;
    let tree = Workflow::parse("ModelToIdf")
        .unwrap()
        .create(&fixture.runs(), fixture.model(), &[])
        .unwrap();
    manager.enqueue(&tree).await.unwrap();

    for _ in 0..500 {
        if manager.get_job(tree.root_id()).await.unwrap().state == JobState::Running {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    manager.cancel(tree.root_id()).await.unwrap();

    assert!(manager
        .wait_for_finished_timeout(Duration::from_secs(5))
        .await
        .unwrap());
    let job = manager.get_job(tree.root_id()).await.unwrap();
    assert_eq!(job.state, JobState::Canceled);
    manager.shutdown().await.unwrap();
}
