//! External tool executor.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use tokio::process::Command;
use tracing::{debug, instrument};

use super::{ExecutionContext, JobExecutor};
use crate::jobs::factory::params;
use crate::jobs::{FileRef, Job, JobError, JobType, ToolInfo, ToolVersion};

pub const STDOUT_LOG: &str = "stdout.log";
pub const STDERR_LOG: &str = "stderr.log";

/// Environment variables handed to partitioned tool processes.
pub mod env {
    pub const PARTITION_INDEX: &str = "RUNMANAGER_PARTITION_INDEX";
    pub const PARTITION_COUNT: &str = "RUNMANAGER_PARTITION_COUNT";
    pub const RUN_PERIOD_START: &str = "RUNMANAGER_RUN_PERIOD_START";
    pub const RUN_PERIOD_END: &str = "RUNMANAGER_RUN_PERIOD_END";
}

/// Runs the job type's external tool in the job's working directory.
///
/// Argument order: optional `-j <threads>` (EnergyPlus), the script path
/// (Script), whitespace-split `args`, then the primary input. A running
/// process is killed when cancellation is requested.
#[derive(Debug, Clone, Copy, Default)]
pub struct ToolExecutor;

impl ToolExecutor {
    pub fn new() -> Self {
        Self
    }

    fn resolve_tool(job: &Job, ctx: &ExecutionContext) -> Result<ToolInfo, JobError> {
        let name = job.job_type.tool_name().ok_or_else(|| {
            JobError::configuration(format!("{} jobs do not run an external tool", job.job_type))
        })?;
        let requirement = job
            .params
            .get(params::TOOL_VERSION)
            .map(str::parse::<ToolVersion>)
            .transpose()
            .map_err(|e| JobError::configuration(e.user_message().to_string()))?;

        ctx.tools
            .layered(&job.tools)
            .find(name, requirement.as_ref())
            .ok_or_else(|| match requirement {
                Some(version) => JobError::configuration(format!(
                    "tool '{}' version {} not found in tool table",
                    name, version
                )),
                None => JobError::configuration(format!("tool '{}' not found in tool table", name)),
            })
    }

    fn arguments(job: &Job, ctx: &ExecutionContext) -> Result<Vec<String>, JobError> {
        let mut args = Vec::new();

        if job.job_type == JobType::EnergyPlus {
            if let Some(threads) = job.params.get(params::THREADS) {
                args.push("-j".to_string());
                args.push(threads.to_string());
            }
        }
        if job.job_type == JobType::Script {
            let script = job
                .params
                .get(params::SCRIPT)
                .ok_or_else(|| JobError::configuration("script parameter is missing"))?;
            args.push(FileRef::new(script).resolve(&job.base_path).display().to_string());
        }
        if let Some(extra) = job.params.get(params::ARGS) {
            args.extend(extra.split_whitespace().map(str::to_string));
        }

        let input = match job.job_type.primary_input_extension() {
            Some(ext) => Some(ctx.last_input_with_extension(ext).ok_or_else(|| {
                JobError::execution(format!("no .{} input file available", ext))
            })?),
            None => ctx.input_files.last().map(PathBuf::as_path),
        };
        if let Some(input) = input {
            args.push(input.display().to_string());
        }
        Ok(args)
    }

    /// Only partitioned copies get these.
    fn partition_env(job: &Job) -> Vec<(&'static str, String)> {
        if !job.params.contains(params::PARTITION_INDEX) {
            return Vec::new();
        }
        [
            (env::PARTITION_INDEX, params::PARTITION_INDEX),
            (env::PARTITION_COUNT, params::PARTITION_COUNT),
            (env::RUN_PERIOD_START, params::RUN_PERIOD_START),
            (env::RUN_PERIOD_END, params::RUN_PERIOD_END),
        ]
        .into_iter()
        .filter_map(|(var, key)| job.params.get(key).map(|v| (var, v.to_string())))
        .collect()
    }

    async fn write_logs(dir: &Path, output: &Output) -> Result<(), JobError> {
        for (name, bytes) in [(STDOUT_LOG, &output.stdout), (STDERR_LOG, &output.stderr)] {
            tokio::fs::write(dir.join(name), bytes)
                .await
                .map_err(|e| JobError::execution(format!("failed to write {}: {}", name, e)))?;
        }
        Ok(())
    }
}

/// Failure output, one labelled section per non-empty stream. Invalid UTF-8
/// is replaced in the text; the log files keep the raw bytes.
fn captured(output: &Output) -> String {
    let mut text = String::new();
    for (label, bytes, log) in [
        ("stdout", &output.stdout, STDOUT_LOG),
        ("stderr", &output.stderr, STDERR_LOG),
    ] {
        if bytes.is_empty() {
            continue;
        }
        text.push_str(&format!("[{}]\n", label));
        text.push_str(&String::from_utf8_lossy(bytes));
        if !text.ends_with('\n') {
            text.push('\n');
        }
        if std::str::from_utf8(bytes).is_err() {
            text.push_str(&format!("[{} is not valid UTF-8; raw bytes in {}]\n", label, log));
        }
    }
    text
}

#[async_trait]
impl JobExecutor for ToolExecutor {
    #[instrument(skip_all, fields(job_id = %job.id, job_type = %job.job_type))]
    async fn execute(&self, job: &Job, ctx: &ExecutionContext) -> Result<Vec<FileRef>, JobError> {
        let tool = Self::resolve_tool(job, ctx)?;
        let args = Self::arguments(job, ctx)?;

        ctx.checkpoint()?;
        debug!(tool = %tool.path.display(), ?args, "Spawning tool");

        let mut command = Command::new(&tool.path);
        command
            .args(&args)
            .current_dir(&ctx.working_dir)
            .envs(Self::partition_env(job))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = tokio::select! {
            result = command.output() => result.map_err(|e| {
                JobError::configuration(format!("failed to launch '{}': {}", tool.path.display(), e))
            })?,
            _ = ctx.cancel.cancelled() => {
                return Err(JobError::canceled(format!("{} terminated on cancellation", tool.name)));
            }
        };

        Self::write_logs(&ctx.working_dir, &output).await?;

        if !output.status.success() {
            return Err(JobError::execution(format!("{} exited with {}", tool.name, output.status))
                .with_output(captured(&output)));
        }

        Ok(job
            .expected_outputs
            .iter()
            .map(|name| FileRef::new(ctx.working_dir.join(name)))
            .collect())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::jobs::{JobErrorKind, JobFactory, JobParams, ToolTable};
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn context(dir: &TempDir, tools: Vec<ToolInfo>) -> ExecutionContext {
        let work = dir.path().join("work");
        std::fs::create_dir_all(&work).unwrap();
        let mut ctx = ExecutionContext::new(crate::jobs::JobId::new(), work);
        ctx.tools = ToolTable::new(tools);
        ctx.input_files = vec![dir.path().join("in.idf")];
        ctx
    }

    #[tokio::test]
    async fn test_success_returns_expected_outputs_and_logs() {
        let dir = TempDir::new().unwrap();
        let tool = script(dir.path(), "expandobjects", "echo expanding \"$1\"; touch expanded.idf");
        let ctx = context(&dir, vec![ToolInfo::new("expandobjects", tool)]);
        let job = JobFactory::expand_objects(JobParams::new()).unwrap();

        let outputs = ToolExecutor::new().execute(&job, &ctx).await.unwrap();
        assert_eq!(outputs, vec![FileRef::new(ctx.working_dir.join("expanded.idf"))]);
        let stdout = std::fs::read_to_string(ctx.working_dir.join(STDOUT_LOG)).unwrap();
        assert!(stdout.contains("in.idf"));
    }

    #[tokio::test]
    async fn test_nonzero_exit_captures_output() {
        let dir = TempDir::new().unwrap();
        let tool = script(dir.path(), "readvars", "echo partial; echo broken >&2; exit 3");
        let mut ctx = context(&dir, vec![ToolInfo::new("readvars", tool)]);
        ctx.input_files = vec![dir.path().join("eplusout.sql")];
        let job = JobFactory::read_vars(JobParams::new()).unwrap();

        let err = ToolExecutor::new().execute(&job, &ctx).await.unwrap_err();
        assert_eq!(err.kind, JobErrorKind::Execution);
        assert_eq!(err.output.as_deref(), Some("[stdout]\npartial\n[stderr]\nbroken\n"));
    }

    #[tokio::test]
    async fn test_binary_output_points_at_raw_log() {
        let dir = TempDir::new().unwrap();
        let tool = script(dir.path(), "readvars", "printf 'bad \\377 byte' >&2; exit 1");
        let mut ctx = context(&dir, vec![ToolInfo::new("readvars", tool)]);
        ctx.input_files = vec![dir.path().join("eplusout.sql")];
        let job = JobFactory::read_vars(JobParams::new()).unwrap();

        let err = ToolExecutor::new().execute(&job, &ctx).await.unwrap_err();
        let output = err.output.unwrap();
        assert!(output.starts_with("[stderr]\nbad \u{FFFD} byte\n"), "{}", output);
        assert!(output.contains("raw bytes in stderr.log"));
        let raw = std::fs::read(ctx.working_dir.join(STDERR_LOG)).unwrap();
        assert_eq!(raw, b"bad \xff byte");
    }

    #[tokio::test]
    async fn test_missing_tool_is_configuration_error() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir, vec![]);
        let job = JobFactory::energy_plus(JobParams::new()).unwrap();

        let err = ToolExecutor::new().execute(&job, &ctx).await.unwrap_err();
        assert_eq!(err.kind, JobErrorKind::Configuration);
        assert!(err.message.contains("energyplus"));
    }

    #[tokio::test]
    async fn test_version_requirement_is_honored() {
        let dir = TempDir::new().unwrap();
        let tool = script(dir.path(), "ep", "touch eplusout.sql eplusout.err");
        let ctx = context(
            &dir,
            vec![ToolInfo::new("energyplus", tool).with_version("9.4.0".parse().unwrap())],
        );
        let wants_8 = JobFactory::energy_plus(JobParams::new().with(params::TOOL_VERSION, "8")).unwrap();
        let err = ToolExecutor::new().execute(&wants_8, &ctx).await.unwrap_err();
        assert_eq!(err.kind, JobErrorKind::Configuration);

        let wants_9 = JobFactory::energy_plus(JobParams::new().with(params::TOOL_VERSION, "9.4")).unwrap();
        assert!(ToolExecutor::new().execute(&wants_9, &ctx).await.is_ok());
    }

    #[tokio::test]
    async fn test_partition_environment() {
        let dir = TempDir::new().unwrap();
        let tool = script(
            dir.path(),
            "ep",
            "echo \"$RUNMANAGER_PARTITION_INDEX/$RUNMANAGER_PARTITION_COUNT $RUNMANAGER_RUN_PERIOD_START-$RUNMANAGER_RUN_PERIOD_END\"",
        );
        let ctx = context(&dir, vec![ToolInfo::new("energyplus", tool)]);
        let job = JobFactory::energy_plus(
            JobParams::new()
                .with(params::PARTITION_INDEX, 1)
                .with(params::PARTITION_COUNT, 2)
                .with(params::RUN_PERIOD_START, 184)
                .with(params::RUN_PERIOD_END, 365),
        )
        .unwrap();

        let _ = ToolExecutor::new().execute(&job, &ctx).await;
        let stdout = std::fs::read_to_string(ctx.working_dir.join(STDOUT_LOG)).unwrap();
        assert_eq!(stdout.trim(), "1/2 184-365");
    }

    #[tokio::test]
    async fn test_cancellation_terminates_process() {
        let dir = TempDir::new().unwrap();
        let tool = script(dir.path(), "readvars", "sleep 30");
        let mut ctx = context(&dir, vec![ToolInfo::new("readvars", tool)]);
        ctx.input_files = vec![dir.path().join("eplusout.sql")];
        let job = JobFactory::read_vars(JobParams::new()).unwrap();

        let cancel = ctx.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            cancel.cancel();
        });
        let started = std::time::Instant::now();
        let err = ToolExecutor::new().execute(&job, &ctx).await.unwrap_err();
        assert_eq!(err.kind, JobErrorKind::Canceled);
        assert!(started.elapsed() < std::time::Duration::from_secs(10));
    }
}
