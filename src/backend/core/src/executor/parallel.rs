//! Split and join executors for the parallel pattern.

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection};
use sqlx::Connection;
use std::path::{Path, PathBuf};
use tracing::debug;

use super::{ExecutionContext, JobExecutor};
use crate::jobs::factory::params;
use crate::jobs::{partition_plan, FileRef, Job, JobError, JobType, Partition};

/// Writes one `partition-<i>.json` manifest per partition.
#[derive(Debug, Clone, Copy, Default)]
pub struct SplitExecutor;

#[async_trait]
impl JobExecutor for SplitExecutor {
    async fn execute(&self, job: &Job, ctx: &ExecutionContext) -> Result<Vec<FileRef>, JobError> {
        let count = job
            .params
            .parse_u32(params::SPLIT_COUNT)
            .map_err(|e| JobError::configuration(e.user_message().to_string()))?
            .ok_or_else(|| JobError::configuration("split_count parameter is missing"))?;
        let inner = job
            .params
            .get(params::INNER_TYPE)
            .map(JobType::from_tag)
            .unwrap_or(JobType::Null);

        let template = Job::new(inner).with_params(job.params.clone());
        let partitions = partition_plan(&template, count)
            .map_err(|e| JobError::configuration(e.user_message().to_string()))?;

        let mut outputs = Vec::with_capacity(partitions.len());
        for partition in &partitions {
            ctx.checkpoint()?;
            let path = ctx.working_dir.join(Partition::file_name(partition.index));
            let body = serde_json::to_vec_pretty(partition)
                .map_err(|e| JobError::execution(format!("failed to encode partition: {}", e)))?;
            tokio::fs::write(&path, body)
                .await
                .map_err(|e| JobError::execution(format!("failed to write {}: {}", path.display(), e)))?;
            outputs.push(FileRef::new(path));
        }
        debug!(job_id = %job.id, partitions = outputs.len(), "Wrote partition manifests");
        Ok(outputs)
    }
}

/// Extensions merged as SQLite databases rather than concatenated.
const DATABASE_EXTENSIONS: &[&str] = &["sql", "sqlite"];

/// Merges same-named outputs of the join dependencies, in child-index order,
/// into the join's working directory.
///
/// SQLite outputs (`.sql`, `.sqlite`) are merged table by table: each source
/// is attached in turn and its rows appended to the same-named table of the
/// target, which is created from the source schema on first sight. Every
/// other file is byte-concatenated.
#[derive(Debug, Clone, Copy, Default)]
pub struct JoinExecutor;

impl JoinExecutor {
    /// Distinct file names in first-seen order, each with its sources.
    fn group(join_outputs: &[Vec<PathBuf>]) -> Vec<(String, Vec<&PathBuf>)> {
        let mut groups: Vec<(String, Vec<&PathBuf>)> = Vec::new();
        for outputs in join_outputs {
            for path in outputs {
                let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                    continue;
                };
                match groups.iter().position(|(n, _)| n == name) {
                    Some(i) => groups[i].1.push(path),
                    None => groups.push((name.to_string(), vec![path])),
                }
            }
        }
        groups
    }

    fn is_database(name: &str) -> bool {
        Path::new(name)
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| DATABASE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
    }

    async fn concatenate(target: &Path, sources: &[&PathBuf]) -> Result<(), JobError> {
        let mut contents = Vec::new();
        for source in sources {
            let bytes = tokio::fs::read(source)
                .await
                .map_err(|e| JobError::execution(format!("failed to read {}: {}", source.display(), e)))?;
            contents.extend_from_slice(&bytes);
        }
        tokio::fs::write(target, contents)
            .await
            .map_err(|e| JobError::execution(format!("failed to write {}: {}", target.display(), e)))
    }

    async fn merge_databases(target: &Path, sources: &[&PathBuf]) -> Result<(), JobError> {
        // A rerun starts from an empty target.
        match tokio::fs::remove_file(target).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(JobError::execution(format!(
                    "failed to replace {}: {}",
                    target.display(),
                    e
                )))
            }
        }

        let options = SqliteConnectOptions::new().filename(target).create_if_missing(true);
        let mut conn = SqliteConnection::connect_with(&options)
            .await
            .map_err(|e| JobError::execution(format!("failed to open {}: {}", target.display(), e)))?;

        let mut result = Ok(());
        for source in sources {
            if let Err(e) = attach_and_copy(&mut conn, source).await {
                result = Err(JobError::execution(format!(
                    "failed to merge {} into {}: {}",
                    source.display(),
                    target.display(),
                    e
                )));
                break;
            }
        }
        let closed = conn.close().await;
        result?;
        closed.map_err(|e| JobError::execution(format!("failed to close {}: {}", target.display(), e)))
    }
}

async fn attach_and_copy(conn: &mut SqliteConnection, source: &Path) -> Result<(), sqlx::Error> {
    sqlx::query("ATTACH DATABASE ? AS src")
        .bind(source.to_string_lossy().into_owned())
        .persistent(false)
        .execute(&mut *conn)
        .await?;
    let copied = copy_tables(conn).await;
    sqlx::query("DETACH DATABASE src")
        .persistent(false)
        .execute(&mut *conn)
        .await?;
    copied
}

/// Appends every table of the attached `src` schema to `main`, in one
/// transaction.
async fn copy_tables(conn: &mut SqliteConnection) -> Result<(), sqlx::Error> {
    let mut tx = conn.begin().await?;
    let tables: Vec<(String, String)> = sqlx::query_as(
        "SELECT name, sql FROM src.sqlite_master \
         WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY rowid",
    )
    .persistent(false)
    .fetch_all(&mut *tx)
    .await?;

    for (name, create) in tables {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM main.sqlite_master WHERE type = 'table' AND name = ?)",
        )
        .bind(&name)
        .persistent(false)
        .fetch_one(&mut *tx)
        .await?;
        if !exists {
            sqlx::query(&create).persistent(false).execute(&mut *tx).await?;
        }

        let quoted = name.replace('"', "\"\"");
        sqlx::query(&format!(
            "INSERT INTO main.\"{0}\" SELECT * FROM src.\"{0}\"",
            quoted
        ))
        .persistent(false)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await
}

#[async_trait]
impl JobExecutor for JoinExecutor {
    async fn execute(&self, job: &Job, ctx: &ExecutionContext) -> Result<Vec<FileRef>, JobError> {
        let mut merged = Vec::new();
        for (name, sources) in Self::group(&ctx.join_outputs) {
            ctx.checkpoint()?;
            let target = ctx.working_dir.join(&name);
            if Self::is_database(&name) {
                Self::merge_databases(&target, &sources).await?;
            } else {
                Self::concatenate(&target, &sources).await?;
            }
            merged.push(FileRef::new(target));
        }
        debug!(job_id = %job.id, files = merged.len(), "Merged join outputs");
        Ok(merged)
    }
}
