//! Durable job store.
//!
//! SQLite through `sqlx`. The pool holds a single connection, so every
//! transaction runs serially and each state change is linearizable. State
//! changes are compare-and-swap updates on the `state` column, and readiness
//! propagation runs in the same transaction as the transition that caused it.

mod rows;

pub use rows::RunStats;

use chrono::Utc;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePool, SqlitePoolOptions,
    SqliteSynchronous,
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{ErrorCode, RunError, Result};
use crate::jobs::{FileRef, Job, JobError, JobId, JobState, JobTree, Workflow};
use rows::{JobRow, LineageRow, StateRow, JOB_COLUMNS};

/// How a running job ended, as reported by a worker.
#[derive(Debug, Clone)]
pub enum Completion {
    Succeeded(Vec<FileRef>),
    Failed(JobError),
    Canceled(JobError),
}

/// Result of recording a terminal transition.
#[derive(Debug, Clone, Default)]
pub struct FinishOutcome {
    /// State actually recorded; `Canceled` if cancellation was requested
    /// while the job ran, whatever the completion said
    pub state: Option<JobState>,
    /// Dependents that became ready, in creation order
    pub ready: Vec<JobId>,
    /// Descendants canceled because this job did not succeed
    pub canceled: Vec<JobId>,
}

/// Result of a cancellation request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CancelOutcome {
    /// Jobs moved to `Canceled`
    pub canceled: Vec<JobId>,
    /// Running jobs flagged for cancellation
    pub running: Vec<JobId>,
}

/// Result of startup recovery.
#[derive(Debug, Clone, Default)]
pub struct RecoveryReport {
    /// Jobs found running and marked failed
    pub interrupted: Vec<JobId>,
    /// Their descendants, canceled
    pub canceled: Vec<JobId>,
}

/// Resolved inputs for one job.
#[derive(Debug, Clone, Default)]
pub struct ExecutionInputs {
    /// Ancestors' inputs and outputs (root first), join outputs, own inputs
    pub input_files: Vec<PathBuf>,
    /// Outputs of each join dependency, in child-index order
    pub join_outputs: Vec<Vec<PathBuf>>,
}

/// Handle to the job store. Cheap to clone.
#[derive(Debug, Clone)]
pub struct JobStore {
    pool: SqlitePool,
}

impl JobStore {
    /// Open (creating if needed) the store file at `path` and migrate it.
    pub async fn open(path: &Path, busy_timeout: Duration) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(busy_timeout);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .acquire_timeout(busy_timeout.max(Duration::from_secs(1)))
            .connect_with(options)
            .await
            .map_err(|e| {
                RunError::with_internal(
                    ErrorCode::StoreConnectionFailed,
                    format!("Unable to open job store at {}", path.display()),
                    e.to_string(),
                )
                .with_source(e)
            })?;

        let store = Self { pool };
        store.migrate().await?;
        info!(path = %path.display(), "Job store opened");
        Ok(store)
    }

    /// A private in-memory store, for tests and throwaway runs.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Run migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    /// Get the connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Enqueue
    // ═══════════════════════════════════════════════════════════════════════════

    /// Persist `tree`. Returns `None` if its root is already stored,
    /// otherwise the ids that start out ready.
    pub async fn insert_tree(&self, tree: &JobTree) -> Result<Option<Vec<JobId>>> {
        let mut tx = self.pool.begin().await?;

        let root = tree.root_id().to_string();
        let exists: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM jobs WHERE id = ?)")
            .bind(&root)
            .fetch_one(&mut *tx)
            .await?;
        if exists {
            return Ok(None);
        }
        tree.validate()?;

        let now = Utc::now();
        let mut ready = Vec::new();
        for job in tree.iter() {
            let state = if job.parent_id.is_none() && job.join_dependencies.is_empty() {
                ready.push(job.id);
                JobState::Ready
            } else {
                JobState::Pending
            };
            insert_job(&mut tx, job, state, now).await?;
        }

        for edge in tree.edges() {
            sqlx::query("INSERT INTO job_edges (prerequisite_id, dependent_id, kind) VALUES (?, ?, ?)")
                .bind(edge.prerequisite.to_string())
                .bind(edge.dependent.to_string())
                .bind(edge.kind.as_str())
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        debug!(root_id = %root, jobs = tree.len(), "Tree persisted");
        Ok(Some(ready))
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Queries
    // ═══════════════════════════════════════════════════════════════════════════

    pub async fn get_job(&self, id: JobId) -> Result<Option<Job>> {
        let mut conn = self.pool.acquire().await?;
        fetch_job(&mut conn, id).await
    }

    /// Jobs in creation order, optionally only those in `state`.
    pub async fn list_jobs(&self, state: Option<JobState>) -> Result<Vec<Job>> {
        let mut conn = self.pool.acquire().await?;
        let rows: Vec<JobRow> = match state {
            Some(state) => {
                sqlx::query_as(&format!("SELECT {} FROM jobs WHERE state = ? ORDER BY seq", JOB_COLUMNS))
                    .bind(state.as_str())
                    .fetch_all(&mut *conn)
                    .await?
            }
            None => {
                sqlx::query_as(&format!("SELECT {} FROM jobs ORDER BY seq", JOB_COLUMNS))
                    .fetch_all(&mut *conn)
                    .await?
            }
        };
        hydrate(&mut conn, rows, None).await
    }

    /// Every job of the tree rooted at `root`, in creation order.
    pub async fn tree_jobs(&self, root: JobId) -> Result<Vec<Job>> {
        let mut conn = self.pool.acquire().await?;
        let root = root.to_string();
        let rows: Vec<JobRow> =
            sqlx::query_as(&format!("SELECT {} FROM jobs WHERE root_id = ? ORDER BY seq", JOB_COLUMNS))
                .bind(&root)
                .fetch_all(&mut *conn)
                .await?;
        hydrate(&mut conn, rows, Some(&root)).await
    }

    /// Ready jobs in creation order.
    pub async fn ready_jobs(&self) -> Result<Vec<JobId>> {
        let ids: Vec<String> = sqlx::query_scalar("SELECT id FROM jobs WHERE state = 'ready' ORDER BY seq")
            .fetch_all(&self.pool)
            .await?;
        ids.iter().map(|id| id.parse()).collect()
    }

    /// True while any job is pending, ready or running.
    pub async fn has_pending_work(&self) -> Result<bool> {
        let pending: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM jobs WHERE state IN ('pending', 'ready', 'running'))",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(pending)
    }

    /// Counts per state, for one tree or the whole store.
    pub async fn stats(&self, root: Option<JobId>) -> Result<RunStats> {
        let counts: Vec<(String, i64)> = match root {
            Some(root) => {
                sqlx::query_as("SELECT state, COUNT(*) FROM jobs WHERE root_id = ? GROUP BY state")
                    .bind(root.to_string())
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                sqlx::query_as("SELECT state, COUNT(*) FROM jobs GROUP BY state")
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        let mut stats = RunStats::default();
        for (state, n) in counts {
            stats.add(state.parse()?, u64::try_from(n).unwrap_or_default());
        }
        Ok(stats)
    }

    /// Resolve the files a job consumes.
    pub async fn execution_inputs(&self, job: &Job) -> Result<ExecutionInputs> {
        let mut conn = self.pool.acquire().await?;

        let mut lineage: Vec<LineageRow> = Vec::new();
        let mut next = job.parent_id.map(|id| id.to_string());
        while let Some(id) = next {
            let row: LineageRow = sqlx::query_as(
                "SELECT parent_id, input_files, output_files, base_path FROM jobs WHERE id = ?",
            )
            .bind(&id)
            .fetch_optional(&mut *conn)
            .await?
            .ok_or_else(|| RunError::not_found("job", id))?;
            next = row.parent_id.clone();
            lineage.push(row);
        }

        let mut inputs = ExecutionInputs::default();
        for row in lineage.iter().rev() {
            let base = PathBuf::from(&row.base_path);
            for column in [&row.input_files, &row.output_files] {
                let files: Vec<FileRef> = serde_json::from_str(column)?;
                inputs.input_files.extend(files.iter().map(|f| f.resolve(&base)));
            }
        }

        for dep in &job.join_dependencies {
            let (outputs, base): (String, String) =
                sqlx::query_as("SELECT output_files, base_path FROM jobs WHERE id = ?")
                    .bind(dep.to_string())
                    .fetch_optional(&mut *conn)
                    .await?
                    .ok_or_else(|| RunError::job_not_found(dep.0))?;
            let base = PathBuf::from(base);
            let files: Vec<FileRef> = serde_json::from_str(&outputs)?;
            let resolved: Vec<PathBuf> = files.iter().map(|f| f.resolve(&base)).collect();
            inputs.input_files.extend(resolved.iter().cloned());
            inputs.join_outputs.push(resolved);
        }

        inputs
            .input_files
            .extend(job.input_files.iter().map(|f| f.resolve(&job.base_path)));
        Ok(inputs)
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Transitions
    // ═══════════════════════════════════════════════════════════════════════════

    /// Atomically move a ready job to running. `None` if another worker got
    /// there first or the job is no longer ready.
    pub async fn claim(&self, id: JobId) -> Result<Option<Job>> {
        let mut tx = self.pool.begin().await?;
        let claimed = sqlx::query(
            "UPDATE jobs SET state = 'running', started_at = ? WHERE id = ? AND state = 'ready'",
        )
        .bind(Utc::now())
        .bind(id.to_string())
        .execute(&mut *tx)
        .await?
        .rows_affected()
            == 1;
        if !claimed {
            return Ok(None);
        }
        let job = fetch_job(&mut tx, id).await?;
        tx.commit().await?;
        Ok(job)
    }

    /// Record how a running job ended and propagate. `None` if the job was
    /// not running.
    pub async fn finish(&self, id: JobId, completion: Completion) -> Result<Option<FinishOutcome>> {
        let mut tx = self.pool.begin().await?;
        let key = id.to_string();

        let current: Option<(String, bool)> =
            sqlx::query_as("SELECT state, cancel_requested FROM jobs WHERE id = ?")
                .bind(&key)
                .fetch_optional(&mut *tx)
                .await?;
        let Some((state, cancel_requested)) = current else {
            return Err(RunError::job_not_found(id.0));
        };
        if state.parse::<JobState>()? != JobState::Running {
            return Ok(None);
        }

        let completion = match completion {
            Completion::Succeeded(_) | Completion::Failed(_) if cancel_requested => {
                Completion::Canceled(JobError::canceled("canceled while running"))
            }
            other => other,
        };
        let (state, outputs, error) = match completion {
            Completion::Succeeded(outputs) => (JobState::Succeeded, outputs, None),
            Completion::Failed(error) => (JobState::Failed, Vec::new(), Some(error)),
            Completion::Canceled(error) => (JobState::Canceled, Vec::new(), Some(error)),
        };
        let error_json = error.as_ref().map(serde_json::to_string).transpose()?;

        sqlx::query(
            "UPDATE jobs SET state = ?, output_files = ?, error = ?, finished_at = ? \
             WHERE id = ? AND state = 'running'",
        )
        .bind(state.as_str())
        .bind(serde_json::to_string(&outputs)?)
        .bind(error_json)
        .bind(Utc::now())
        .bind(&key)
        .execute(&mut *tx)
        .await?;

        let mut outcome = FinishOutcome {
            state: Some(state),
            ..Default::default()
        };
        if state == JobState::Succeeded {
            outcome.ready = promote_dependents(&mut tx, id).await?;
        } else {
            let reason = JobError::canceled(format!("prerequisite {} did not succeed", id));
            outcome.canceled = cancel_descendants(&mut tx, id, &reason).await?.canceled;
        }

        tx.commit().await?;
        debug!(
            job_id = %id,
            state = %state,
            ready = outcome.ready.len(),
            canceled = outcome.canceled.len(),
            "Transition recorded"
        );
        Ok(Some(outcome))
    }

    /// Cancel `id` and its unfinished descendants.
    ///
    /// Pending and ready jobs are canceled at once. A running job is only
    /// flagged; it becomes canceled when its execution returns. Cancelling a
    /// finished job cancels its unfinished descendants.
    pub async fn cancel(&self, id: JobId) -> Result<CancelOutcome> {
        let mut tx = self.pool.begin().await?;
        let key = id.to_string();

        let state: Option<String> = sqlx::query_scalar("SELECT state FROM jobs WHERE id = ?")
            .bind(&key)
            .fetch_optional(&mut *tx)
            .await?;
        let state: JobState = state.ok_or_else(|| RunError::job_not_found(id.0))?.parse()?;

        let mut outcome = CancelOutcome::default();
        let requested = JobError::canceled("canceled by request");
        match state {
            JobState::Pending | JobState::Ready => {
                if mark_canceled(&mut tx, &key, &requested).await? {
                    outcome.canceled.push(id);
                }
            }
            JobState::Running => {
                flag_running(&mut tx, &key).await?;
                outcome.running.push(id);
            }
            _ => {}
        }

        let reason = JobError::canceled(format!("prerequisite {} was canceled", id));
        let descendants = cancel_descendants(&mut tx, id, &reason).await?;
        outcome.canceled.extend(descendants.canceled);
        outcome.running.extend(descendants.running);

        tx.commit().await?;
        Ok(outcome)
    }

    /// Fail every job left running by a previous process.
    pub async fn recover_interrupted(&self) -> Result<RecoveryReport> {
        let mut tx = self.pool.begin().await?;
        let running: Vec<String> =
            sqlx::query_scalar("SELECT id FROM jobs WHERE state = 'running' ORDER BY seq")
                .fetch_all(&mut *tx)
                .await?;

        let mut report = RecoveryReport::default();
        let error = serde_json::to_string(&JobError::interrupted())?;
        for key in running {
            let id: JobId = key.parse()?;
            sqlx::query(
                "UPDATE jobs SET state = 'failed', error = ?, finished_at = ? \
                 WHERE id = ? AND state = 'running'",
            )
            .bind(&error)
            .bind(Utc::now())
            .bind(&key)
            .execute(&mut *tx)
            .await?;
            report.interrupted.push(id);

            let reason = JobError::canceled(format!("prerequisite {} was interrupted", id));
            report
                .canceled
                .extend(cancel_descendants(&mut tx, id, &reason).await?.canceled);
        }
        tx.commit().await?;
        Ok(report)
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Removal
    // ═══════════════════════════════════════════════════════════════════════════

    /// Delete `id` and everything downstream of it. Every job involved must
    /// be finished. Returns the number of jobs removed.
    pub async fn remove(&self, id: JobId) -> Result<usize> {
        let mut tx = self.pool.begin().await?;
        let key = id.to_string();

        let state: Option<String> = sqlx::query_scalar("SELECT state FROM jobs WHERE id = ?")
            .bind(&key)
            .fetch_optional(&mut *tx)
            .await?;
        let state: JobState = state.ok_or_else(|| RunError::job_not_found(id.0))?.parse()?;

        let mut doomed = vec![(id, state)];
        doomed.extend(descendant_states(&mut tx, id).await?);
        if let Some((busy, state)) = doomed.iter().find(|(_, s)| !s.is_terminal()) {
            return Err(RunError::new(
                ErrorCode::InvalidStateTransition,
                format!("job {} is {}; only finished jobs can be removed", busy, state),
            ));
        }

        for (job, _) in &doomed {
            delete_job(&mut tx, &job.to_string()).await?;
        }
        tx.commit().await?;
        Ok(doomed.len())
    }

    /// Delete every tree whose jobs have all finished. Returns the number of
    /// jobs removed.
    pub async fn clear_finished(&self) -> Result<usize> {
        let mut tx = self.pool.begin().await?;
        let roots: Vec<String> = sqlx::query_scalar(
            "SELECT root_id FROM jobs GROUP BY root_id \
             HAVING SUM(CASE WHEN state IN ('pending', 'ready', 'running') THEN 1 ELSE 0 END) = 0",
        )
        .fetch_all(&mut *tx)
        .await?;

        let mut removed = 0usize;
        for root in roots {
            let ids: Vec<String> = sqlx::query_scalar("SELECT id FROM jobs WHERE root_id = ?")
                .bind(&root)
                .fetch_all(&mut *tx)
                .await?;
            for id in &ids {
                delete_job(&mut tx, id).await?;
            }
            removed += ids.len();
        }
        tx.commit().await?;
        Ok(removed)
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Workflows
    // ═══════════════════════════════════════════════════════════════════════════

    /// Insert or replace a named workflow.
    pub async fn save_workflow(&self, name: &str, workflow: &Workflow) -> Result<()> {
        sqlx::query(
            "INSERT INTO workflows (name, definition, updated_at) VALUES (?, ?, ?) \
             ON CONFLICT (name) DO UPDATE SET definition = excluded.definition, updated_at = excluded.updated_at",
        )
        .bind(name)
        .bind(serde_json::to_string(workflow)?)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn load_workflow(&self, name: &str) -> Result<Workflow> {
        let definition: Option<String> = sqlx::query_scalar("SELECT definition FROM workflows WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        let definition = definition.ok_or_else(|| RunError::workflow_not_found(name))?;
        Ok(serde_json::from_str(&definition)?)
    }

    pub async fn workflow_names(&self) -> Result<Vec<String>> {
        Ok(sqlx::query_scalar("SELECT name FROM workflows ORDER BY name")
            .fetch_all(&self.pool)
            .await?)
    }

    /// Returns false if no workflow had that name.
    pub async fn delete_workflow(&self, name: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM workflows WHERE name = ?")
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Connection-level helpers
// ═══════════════════════════════════════════════════════════════════════════════

async fn insert_job(
    conn: &mut SqliteConnection,
    job: &Job,
    state: JobState,
    now: chrono::DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO jobs (id, root_id, parent_id, child_index, job_type, runnable, state, params, \
         input_files, output_files, expected_outputs, tools, error, base_path, cancel_requested, created_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, '[]', ?, ?, NULL, ?, 0, ?)",
    )
    .bind(job.id.to_string())
    .bind(job.root_id.to_string())
    .bind(job.parent_id.map(|p| p.to_string()))
    .bind(i64::from(job.child_index))
    .bind(job.job_type.tag())
    .bind(job.runnable)
    .bind(state.as_str())
    .bind(serde_json::to_string(&job.params)?)
    .bind(serde_json::to_string(&job.input_files)?)
    .bind(serde_json::to_string(&job.expected_outputs)?)
    .bind(serde_json::to_string(&job.tools)?)
    .bind(job.base_path.to_string_lossy().into_owned())
    .bind(now)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn fetch_job(conn: &mut SqliteConnection, id: JobId) -> Result<Option<Job>> {
    let key = id.to_string();
    let row: Option<JobRow> = sqlx::query_as(&format!("SELECT {} FROM jobs WHERE id = ?", JOB_COLUMNS))
        .bind(&key)
        .fetch_optional(&mut *conn)
        .await?;
    let Some(row) = row else {
        return Ok(None);
    };

    let children: Vec<String> =
        sqlx::query_scalar("SELECT id FROM jobs WHERE parent_id = ? ORDER BY child_index, seq")
            .bind(&key)
            .fetch_all(&mut *conn)
            .await?;
    let joins: Vec<String> = sqlx::query_scalar(
        "SELECT e.prerequisite_id FROM job_edges e JOIN jobs p ON p.id = e.prerequisite_id \
         WHERE e.dependent_id = ? AND e.kind = 'join' ORDER BY p.child_index, p.seq",
    )
    .bind(&key)
    .fetch_all(&mut *conn)
    .await?;

    Ok(Some(row.into_job(parse_ids(&children)?, parse_ids(&joins)?)?))
}

/// Attach children and join dependencies to a batch of rows.
async fn hydrate(conn: &mut SqliteConnection, rows: Vec<JobRow>, root: Option<&str>) -> Result<Vec<Job>> {
    let (child_edges, join_edges): (Vec<(String, String)>, Vec<(String, String)>) = match root {
        Some(root) => (
            sqlx::query_as(
                "SELECT parent_id, id FROM jobs WHERE parent_id IS NOT NULL AND root_id = ? \
                 ORDER BY child_index, seq",
            )
            .bind(root)
            .fetch_all(&mut *conn)
            .await?,
            sqlx::query_as(
                "SELECT e.dependent_id, e.prerequisite_id FROM job_edges e \
                 JOIN jobs p ON p.id = e.prerequisite_id \
                 WHERE e.kind = 'join' AND p.root_id = ? ORDER BY p.child_index, p.seq",
            )
            .bind(root)
            .fetch_all(&mut *conn)
            .await?,
        ),
        None => (
            sqlx::query_as("SELECT parent_id, id FROM jobs WHERE parent_id IS NOT NULL ORDER BY child_index, seq")
                .fetch_all(&mut *conn)
                .await?,
            sqlx::query_as(
                "SELECT e.dependent_id, e.prerequisite_id FROM job_edges e \
                 JOIN jobs p ON p.id = e.prerequisite_id \
                 WHERE e.kind = 'join' ORDER BY p.child_index, p.seq",
            )
            .fetch_all(&mut *conn)
            .await?,
        ),
    };

    let children = group_ids(child_edges)?;
    let joins = group_ids(join_edges)?;
    rows.into_iter()
        .map(|row| {
            let kids = children.get(&row.id).cloned().unwrap_or_default();
            let deps = joins.get(&row.id).cloned().unwrap_or_default();
            row.into_job(kids, deps)
        })
        .collect()
}

fn group_ids(pairs: Vec<(String, String)>) -> Result<HashMap<String, Vec<JobId>>> {
    let mut map: HashMap<String, Vec<JobId>> = HashMap::new();
    for (key, id) in pairs {
        map.entry(key).or_default().push(id.parse()?);
    }
    Ok(map)
}

fn parse_ids(ids: &[String]) -> Result<Vec<JobId>> {
    ids.iter().map(|id| id.parse()).collect()
}

/// Pending dependents of `id` whose prerequisites have all succeeded move
/// to ready. Each dependent is visited once.
async fn promote_dependents(conn: &mut SqliteConnection, id: JobId) -> Result<Vec<JobId>> {
    let dependents: Vec<String> = sqlx::query_scalar(
        "SELECT d.id FROM jobs d WHERE d.state = 'pending' AND d.id IN \
         (SELECT dependent_id FROM job_edges WHERE prerequisite_id = ?) ORDER BY d.seq",
    )
    .bind(id.to_string())
    .fetch_all(&mut *conn)
    .await?;

    let mut ready = Vec::new();
    for dependent in dependents {
        let unmet: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM job_edges e JOIN jobs p ON p.id = e.prerequisite_id \
             WHERE e.dependent_id = ? AND p.state != 'succeeded'",
        )
        .bind(&dependent)
        .fetch_one(&mut *conn)
        .await?;
        if unmet > 0 {
            continue;
        }
        let promoted = sqlx::query("UPDATE jobs SET state = 'ready' WHERE id = ? AND state = 'pending'")
            .bind(&dependent)
            .execute(&mut *conn)
            .await?
            .rows_affected()
            == 1;
        if promoted {
            ready.push(dependent.parse()?);
        }
    }
    Ok(ready)
}

/// Every job reachable from `id` over parent and join edges, with its
/// state, in creation order.
async fn descendant_states(conn: &mut SqliteConnection, id: JobId) -> Result<Vec<(JobId, JobState)>> {
    let rows: Vec<StateRow> = sqlx::query_as(
        "WITH RECURSIVE descendants(id) AS ( \
             SELECT dependent_id FROM job_edges WHERE prerequisite_id = ? \
             UNION \
             SELECT e.dependent_id FROM job_edges e JOIN descendants d ON e.prerequisite_id = d.id \
         ) \
         SELECT j.id, j.state FROM jobs j JOIN descendants d ON j.id = d.id ORDER BY j.seq",
    )
    .bind(id.to_string())
    .fetch_all(&mut *conn)
    .await?;
    rows.iter().map(StateRow::parse).collect()
}

/// Cancel pending and ready descendants of `id`; flag running ones.
async fn cancel_descendants(conn: &mut SqliteConnection, id: JobId, reason: &JobError) -> Result<CancelOutcome> {
    let mut outcome = CancelOutcome::default();
    for (descendant, state) in descendant_states(conn, id).await? {
        let key = descendant.to_string();
        match state {
            JobState::Pending | JobState::Ready => {
                if mark_canceled(conn, &key, reason).await? {
                    outcome.canceled.push(descendant);
                }
            }
            JobState::Running => {
                flag_running(conn, &key).await?;
                outcome.running.push(descendant);
            }
            _ => {}
        }
    }
    Ok(outcome)
}

async fn mark_canceled(conn: &mut SqliteConnection, key: &str, reason: &JobError) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE jobs SET state = 'canceled', error = ?, finished_at = ? \
         WHERE id = ? AND state IN ('pending', 'ready')",
    )
    .bind(serde_json::to_string(reason)?)
    .bind(Utc::now())
    .bind(key)
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected() == 1)
}

async fn flag_running(conn: &mut SqliteConnection, key: &str) -> Result<()> {
    sqlx::query("UPDATE jobs SET cancel_requested = 1 WHERE id = ? AND state = 'running'")
        .bind(key)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

async fn delete_job(conn: &mut SqliteConnection, key: &str) -> Result<()> {
    sqlx::query("DELETE FROM job_edges WHERE prerequisite_id = ? OR dependent_id = ?")
        .bind(key)
        .bind(key)
        .execute(&mut *conn)
        .await?;
    sqlx::query("DELETE FROM jobs WHERE id = ?")
        .bind(key)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{JobErrorKind, JobFactory, JobParams, JobType};

    fn chain(n: usize) -> JobTree {
        let mut tree = JobTree::new(Job::new(JobType::Null));
        for _ in 1..n {
            let tail = tree.tail_id();
            let id = tree.add_child(tail, Job::new(JobType::Null)).unwrap();
            tree.set_tail(id).unwrap();
        }
        tree
    }

    async fn run(store: &JobStore, id: JobId, completion: Completion) -> FinishOutcome {
        store.claim(id).await.unwrap().expect("claimable");
        store.finish(id, completion).await.unwrap().expect("running")
    }

    #[tokio::test]
    async fn test_insert_is_idempotent() {
        let store = JobStore::in_memory().await.unwrap();
        let tree = chain(3);

        let ready = store.insert_tree(&tree).await.unwrap().unwrap();
        assert_eq!(ready, vec![tree.root_id()]);
        assert!(store.insert_tree(&tree).await.unwrap().is_none());
        assert_eq!(store.stats(None).await.unwrap().total, 3);
    }

    #[tokio::test]
    async fn test_round_trip_preserves_relations() {
        let store = JobStore::in_memory().await.unwrap();
        let ep = JobFactory::energy_plus(JobParams::new()).unwrap();
        let tree = JobFactory::create_parallel_job_tree(ep, 3).unwrap();
        store.insert_tree(&tree).await.unwrap();

        let jobs = store.tree_jobs(tree.root_id()).await.unwrap();
        assert_eq!(jobs.len(), tree.len());
        for (stored, original) in jobs.iter().zip(tree.iter()) {
            assert_eq!(stored.id, original.id);
            assert_eq!(stored.children, original.children);
            assert_eq!(stored.join_dependencies, original.join_dependencies);
            assert_eq!(stored.params, original.params);
            assert_eq!(stored.expected_outputs, original.expected_outputs);
        }
        let join = store.get_job(tree.tail_id()).await.unwrap().unwrap();
        assert_eq!(join.join_dependencies.len(), 3);
    }

    #[tokio::test]
    async fn test_claim_is_exclusive() {
        let store = JobStore::in_memory().await.unwrap();
        let tree = chain(2);
        store.insert_tree(&tree).await.unwrap();

        assert!(store.claim(tree.root_id()).await.unwrap().is_some());
        assert!(store.claim(tree.root_id()).await.unwrap().is_none());
        assert!(store.claim(tree.tail_id()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_success_promotes_child() {
        let store = JobStore::in_memory().await.unwrap();
        let tree = chain(3);
        store.insert_tree(&tree).await.unwrap();

        let jobs: Vec<_> = tree.iter().map(|j| j.id).collect();
        let outcome = run(&store, jobs[0], Completion::Succeeded(vec![])).await;
        assert_eq!(outcome.ready, vec![jobs[1]]);
        let third = store.get_job(jobs[2]).await.unwrap().unwrap();
        assert_eq!(third.state, JobState::Pending);
    }

    #[tokio::test]
    async fn test_failure_cancels_descendants() {
        let store = JobStore::in_memory().await.unwrap();
        let tree = chain(3);
        store.insert_tree(&tree).await.unwrap();

        let outcome = run(&store, tree.root_id(), Completion::Failed(JobError::execution("boom"))).await;
        assert_eq!(outcome.state, Some(JobState::Failed));
        assert_eq!(outcome.canceled.len(), 2);
        assert!(!store.has_pending_work().await.unwrap());

        let tail = store.get_job(tree.tail_id()).await.unwrap().unwrap();
        assert_eq!(tail.state, JobState::Canceled);
        assert_eq!(tail.error.unwrap().kind, JobErrorKind::Canceled);
    }

    #[tokio::test]
    async fn test_cancel_running_defers_until_finish() {
        let store = JobStore::in_memory().await.unwrap();
        let tree = chain(2);
        store.insert_tree(&tree).await.unwrap();
        store.claim(tree.root_id()).await.unwrap();

        let outcome = store.cancel(tree.root_id()).await.unwrap();
        assert_eq!(outcome.running, vec![tree.root_id()]);
        assert_eq!(outcome.canceled, vec![tree.tail_id()]);

        let finished = store
            .finish(tree.root_id(), Completion::Succeeded(vec![]))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(finished.state, Some(JobState::Canceled));
    }

    #[tokio::test]
    async fn test_recovery_fails_running_jobs() {
        let store = JobStore::in_memory().await.unwrap();
        let tree = chain(2);
        store.insert_tree(&tree).await.unwrap();
        store.claim(tree.root_id()).await.unwrap();

        let report = store.recover_interrupted().await.unwrap();
        assert_eq!(report.interrupted, vec![tree.root_id()]);
        assert_eq!(report.canceled, vec![tree.tail_id()]);
        let root = store.get_job(tree.root_id()).await.unwrap().unwrap();
        assert_eq!(root.state, JobState::Failed);
        assert_eq!(root.error.unwrap().kind, JobErrorKind::Interrupted);
    }

    #[tokio::test]
    async fn test_remove_requires_finished_subtree() {
        let store = JobStore::in_memory().await.unwrap();
        let tree = chain(2);
        store.insert_tree(&tree).await.unwrap();

        let err = store.remove(tree.root_id()).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidStateTransition);

        store.cancel(tree.root_id()).await.unwrap();
        assert_eq!(store.remove(tree.root_id()).await.unwrap(), 2);
        assert!(store.get_job(tree.tail_id()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_clear_finished_keeps_active_trees() {
        let store = JobStore::in_memory().await.unwrap();
        let done = chain(2);
        let active = chain(2);
        store.insert_tree(&done).await.unwrap();
        store.insert_tree(&active).await.unwrap();
        store.cancel(done.root_id()).await.unwrap();

        assert_eq!(store.clear_finished().await.unwrap(), 2);
        assert_eq!(store.stats(None).await.unwrap().total, 2);
    }

    #[tokio::test]
    async fn test_workflow_persistence() {
        let store = JobStore::in_memory().await.unwrap();
        let workflow = Workflow::parse("ExpandObjects->EnergyPlus").unwrap();
        store.save_workflow("sim", &workflow).await.unwrap();
        store.save_workflow("sim", &workflow).await.unwrap();

        assert_eq!(store.workflow_names().await.unwrap(), vec!["sim"]);
        assert_eq!(store.load_workflow("sim").await.unwrap(), workflow);
        assert!(store.delete_workflow("sim").await.unwrap());
        assert!(!store.delete_workflow("sim").await.unwrap());
        assert_eq!(
            store.load_workflow("sim").await.unwrap_err().code(),
            ErrorCode::WorkflowNotFound
        );
    }
}
