//! libSQL backend — async `JobStore` implementation.
//!
//! Supports local files, in-memory databases and remote `libsql://` URLs.
//! All row-level coordination (claim, resolve, lock recovery) is expressed as
//! a single conditional statement, so the database serializes competing
//! workers in other processes without any extra locking.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::params::IntoParams;
use libsql::{Connection, Database as LibSqlDatabase, params};
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::StoreError;
use crate::queue::{ActiveJob, Job, JobId, NewJob, QueueStats, TaskStats};
use crate::store::migrations;
use crate::store::traits::JobStore;

/// How long a statement waits on a locked database file before failing.
const BUSY_TIMEOUT_MS: u64 = 5_000;

/// Error recorded on jobs whose final attempt was abandoned by a dead worker.
pub const ABANDONED_FINAL_ATTEMPT: &str = "lock released after final attempt was abandoned";

/// libSQL job store.
///
/// Stores a single connection that is reused for all operations. Statements
/// run one at a time and their rows are read to the end before the next one
/// starts: change counts, `RETURNING` rows and SQLite's busy handler are all
/// per connection, and an open statement from one task would otherwise make
/// another task's write fail with `database is locked` instead of waiting.
pub struct LibSqlJobStore {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Mutex<Connection>,
}

impl LibSqlJobStore {
    /// Open a store from a connection string: a local path, `:memory:`, or a
    /// `libsql://` / `http(s)://` URL (which needs `auth_token`).
    pub async fn connect(url: &str, auth_token: Option<&SecretString>) -> Result<Self, StoreError> {
        if is_remote_url(url) {
            Self::new_remote(url, auth_token).await
        } else if url == ":memory:" {
            Self::new_memory().await
        } else {
            Self::new_local(Path::new(url)).await
        }
    }

    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Unavailable(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| StoreError::Unavailable(format!("Failed to open libSQL database: {e}")))?;

        let store = Self::from_database(db)?;
        // Busy timeout first: switching to WAL needs the file lock.
        store
            .pragma(&format!("PRAGMA busy_timeout = {BUSY_TIMEOUT_MS}"))
            .await?;
        // WAL lets several worker processes share one file.
        store.pragma("PRAGMA journal_mode = WAL").await?;
        store.init_schema().await?;
        info!(path = %path.display(), "Job store opened");
        Ok(store)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, StoreError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                StoreError::Unavailable(format!("Failed to create in-memory database: {e}"))
            })?;

        let store = Self::from_database(db)?;
        store.init_schema().await?;
        Ok(store)
    }

    /// Connect to a remote libSQL server.
    pub async fn new_remote(url: &str, auth_token: Option<&SecretString>) -> Result<Self, StoreError> {
        let token = auth_token
            .map(|t| t.expose_secret().to_string())
            .unwrap_or_default();
        let db = libsql::Builder::new_remote(url.to_string(), token)
            .build()
            .await
            .map_err(|e| StoreError::Unavailable(format!("Failed to connect to {url}: {e}")))?;

        let store = Self::from_database(db)?;
        store.init_schema().await?;
        info!(url, "Remote job store connected");
        Ok(store)
    }

    fn from_database(db: LibSqlDatabase) -> Result<Self, StoreError> {
        let conn = db
            .connect()
            .map_err(|e| StoreError::Unavailable(format!("Failed to create connection: {e}")))?;
        Ok(Self {
            db: Arc::new(db),
            conn: Mutex::new(conn),
        })
    }

    /// Run one statement and map every row it returns while holding the
    /// connection.
    async fn query_map<T, F>(
        &self,
        op: &str,
        sql: &str,
        params: impl IntoParams + Send,
        map: F,
    ) -> Result<Vec<T>, StoreError>
    where
        F: Fn(&libsql::Row) -> Result<T, StoreError> + Send,
        T: Send,
    {
        let conn = self.conn.lock().await;
        let mut rows = conn
            .query(sql, params)
            .await
            .map_err(|e| StoreError::Unavailable(format!("{op}: {e}")))?;

        let mut out = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| StoreError::Unavailable(format!("{op}: {e}")))?
        {
            out.push(map(&row)?);
        }
        Ok(out)
    }

    /// Run a `... RETURNING id` mutation and count the rows it touched.
    async fn mutate(
        &self,
        op: &str,
        sql: &str,
        params: impl IntoParams + Send,
    ) -> Result<u64, StoreError> {
        let touched = self.query_map(op, sql, params, |_| Ok(())).await?;
        Ok(touched.len() as u64)
    }

    /// Run a pragma and step it to completion so it takes effect.
    async fn pragma(&self, sql: &str) -> Result<(), StoreError> {
        self.query_map(sql, sql, (), |_| Ok(())).await?;
        Ok(())
    }

    /// Load job rows, skipping rows that fail to decode.
    async fn query_jobs(
        &self,
        op: &str,
        sql: &str,
        params: impl IntoParams + Send,
    ) -> Result<Vec<Job>, StoreError> {
        let rows = self.query_map(op, sql, params, |row| Ok(row_to_job(row))).await?;
        let mut jobs = Vec::with_capacity(rows.len());
        for row in rows {
            match row {
                Ok(job) => jobs.push(job),
                Err(e) => warn!("{op}: skipping job row: {e}"),
            }
        }
        Ok(jobs)
    }
}

// ── Helper functions ────────────────────────────────────────────────

fn is_remote_url(url: &str) -> bool {
    url.starts_with("libsql://") || url.starts_with("https://") || url.starts_with("http://")
}

/// Canonical timestamp format: RFC 3339, UTC, fixed microsecond precision.
///
/// Fixed width keeps text comparison in SQL equivalent to time comparison.
fn fmt_ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: &Option<String>) -> Option<DateTime<Utc>> {
    s.as_ref().map(|s| parse_datetime(s))
}

/// `now - age`, saturating at the minimum representable time.
fn cutoff(now: DateTime<Utc>, age: Duration) -> DateTime<Utc> {
    let age = chrono::Duration::from_std(age).unwrap_or(chrono::Duration::MAX);
    now.checked_sub_signed(age).unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Convert `Option<&str>` to libsql Value.
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

const JOB_COLUMNS: &str = "id, task_name, payload, job_key, attempts, max_attempts, last_error, locked_by, locked_at, run_at, created_at, completed_at, failed_at";

/// Map a libsql Row to a Job.
///
/// Column order matches JOB_COLUMNS.
fn row_to_job(row: &libsql::Row) -> Result<Job, StoreError> {
    let get_err = |e: libsql::Error| StoreError::Serialization(format!("job row: {e}"));

    let payload_str: String = row.get(2).map_err(get_err)?;
    let payload = serde_json::from_str(&payload_str)
        .map_err(|e| StoreError::Serialization(format!("job payload: {e}")))?;
    let attempts: i64 = row.get(4).map_err(get_err)?;
    let max_attempts: i64 = row.get(5).map_err(get_err)?;
    let locked_at: Option<String> = row.get(8).ok();
    let run_at: String = row.get(9).map_err(get_err)?;
    let created_at: String = row.get(10).map_err(get_err)?;
    let completed_at: Option<String> = row.get(11).ok();
    let failed_at: Option<String> = row.get(12).ok();

    Ok(Job {
        id: row.get(0).map_err(get_err)?,
        task_name: row.get(1).map_err(get_err)?,
        payload,
        job_key: row.get(3).ok(),
        attempts: attempts.max(0) as u32,
        max_attempts: max_attempts.max(0) as u32,
        last_error: row.get(6).ok(),
        locked_by: row.get(7).ok(),
        locked_at: parse_optional_datetime(&locked_at),
        run_at: parse_datetime(&run_at),
        created_at: parse_datetime(&created_at),
        completed_at: parse_optional_datetime(&completed_at),
        failed_at: parse_optional_datetime(&failed_at),
    })
}

/// One row of the compound stats statement.
enum StatsRow {
    Task { stats: TaskStats, retrying: u64 },
    Active(ActiveJob),
}

fn row_to_stats(row: &libsql::Row) -> Result<StatsRow, StoreError> {
    let kind: String = row.get(0).unwrap_or_default();
    let task_name: String = row.get(1).unwrap_or_default();
    let count = |idx: i32| row.get::<i64>(idx).unwrap_or(0).max(0) as u64;

    if kind == "task" {
        return Ok(StatsRow::Task {
            stats: TaskStats {
                task_name,
                pending: count(2),
                locked: count(3),
                failed: count(4),
                completed: count(5),
            },
            retrying: count(6),
        });
    }

    let run_at: String = row.get(9).unwrap_or_default();
    let locked_at: String = row.get(11).unwrap_or_default();
    Ok(StatsRow::Active(ActiveJob {
        id: row
            .get(7)
            .map_err(|e| StoreError::Serialization(format!("active job id: {e}")))?,
        task_name,
        attempts: count(8) as u32,
        run_at: parse_datetime(&run_at),
        locked_by: row.get(10).unwrap_or_default(),
        locked_at: parse_datetime(&locked_at),
    }))
}

// ── Trait implementation ────────────────────────────────────────────

/// Rows that are neither terminal nor locked.
const OPEN_UNLOCKED: &str =
    "locked_by IS NULL AND completed_at IS NULL AND failed_at IS NULL";

#[async_trait]
impl JobStore for LibSqlJobStore {
    async fn init_schema(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        migrations::run_migrations(&conn).await
    }

    async fn insert(&self, job: &NewJob) -> Result<JobId, StoreError> {
        let payload = serde_json::to_string(&job.payload)
            .map_err(|e| StoreError::Serialization(format!("insert payload: {e}")))?;
        let now = fmt_ts(Utc::now());

        let ids = self
            .query_map(
                "insert",
                "INSERT INTO jobs (task_name, payload, job_key, max_attempts, run_at, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(job_key) DO NOTHING
                 RETURNING id",
                params![
                    job.task_name.as_str(),
                    payload,
                    opt_text(job.job_key.as_deref()),
                    job.max_attempts as i64,
                    fmt_ts(job.run_at),
                    now,
                ],
                |row| {
                    row.get::<JobId>(0)
                        .map_err(|e| StoreError::Serialization(format!("insert id: {e}")))
                },
            )
            .await?;

        match (ids.first(), &job.job_key) {
            (Some(&id), _) => {
                debug!(job_id = id, task = %job.task_name, "Job inserted");
                Ok(id)
            }
            (None, Some(key)) => Err(StoreError::DuplicateJob { key: key.clone() }),
            (None, None) => Err(StoreError::Unavailable("insert: no id returned".into())),
        }
    }

    async fn get_job(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        let mut jobs = self
            .query_map(
                "get_job",
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
                params![id],
                row_to_job,
            )
            .await?;
        Ok(jobs.pop())
    }

    async fn find_claimable(&self, limit: usize) -> Result<Vec<Job>, StoreError> {
        let now = fmt_ts(Utc::now());
        self.query_jobs(
            "find_claimable",
            &format!(
                "SELECT {JOB_COLUMNS} FROM jobs
                 WHERE {OPEN_UNLOCKED} AND run_at <= ?1 AND attempts < max_attempts
                 ORDER BY run_at ASC, created_at ASC, id ASC
                 LIMIT ?2"
            ),
            params![now, limit as i64],
        )
        .await
    }

    async fn try_claim(&self, id: JobId, worker_id: &str) -> Result<Option<Job>, StoreError> {
        let now = fmt_ts(Utc::now());
        let mut claimed = self
            .query_map(
                "try_claim",
                &format!(
                    "UPDATE jobs
                     SET locked_by = ?1, locked_at = ?2, attempts = attempts + 1
                     WHERE id = ?3 AND {OPEN_UNLOCKED}
                       AND run_at <= ?2 AND attempts < max_attempts
                     RETURNING {JOB_COLUMNS}"
                ),
                params![worker_id, now, id],
                row_to_job,
            )
            .await?;

        let job = claimed.pop();
        if let Some(job) = &job {
            debug!(job_id = id, worker = worker_id, attempts = job.attempts, "Job claimed");
        }
        Ok(job)
    }

    async fn resolve_success(&self, id: JobId, worker_id: &str) -> Result<bool, StoreError> {
        let now = fmt_ts(Utc::now());
        let count = self
            .mutate(
                "resolve_success",
                "UPDATE jobs SET completed_at = ?1, locked_by = NULL, locked_at = NULL
                 WHERE id = ?2 AND locked_by = ?3 AND completed_at IS NULL AND failed_at IS NULL
                 RETURNING id",
                params![now, id, worker_id],
            )
            .await?;

        Ok(count > 0)
    }

    async fn resolve_retry(
        &self,
        id: JobId,
        worker_id: &str,
        error: &str,
        next_run_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let now = fmt_ts(Utc::now());
        // An exhausted job cannot go back to pending, whatever the caller asked.
        let count = self
            .mutate(
                "resolve_retry",
                "UPDATE jobs SET
                    locked_by = NULL,
                    locked_at = NULL,
                    last_error = ?1,
                    run_at = MAX(run_at, ?2),
                    failed_at = CASE WHEN attempts >= max_attempts THEN ?3 ELSE NULL END
                 WHERE id = ?4 AND locked_by = ?5 AND completed_at IS NULL AND failed_at IS NULL
                 RETURNING id",
                params![error, fmt_ts(next_run_at), now, id, worker_id],
            )
            .await?;

        Ok(count > 0)
    }

    async fn resolve_failure(
        &self,
        id: JobId,
        worker_id: &str,
        error: &str,
    ) -> Result<bool, StoreError> {
        let now = fmt_ts(Utc::now());
        let count = self
            .mutate(
                "resolve_failure",
                "UPDATE jobs SET failed_at = ?1, last_error = ?2, locked_by = NULL, locked_at = NULL
                 WHERE id = ?3 AND locked_by = ?4 AND completed_at IS NULL AND failed_at IS NULL
                 RETURNING id",
                params![now, error, id, worker_id],
            )
            .await?;

        Ok(count > 0)
    }

    async fn release_stale_locks(&self, older_than: Duration) -> Result<u64, StoreError> {
        let now = Utc::now();
        let count = self
            .mutate(
                "release_stale_locks",
                "UPDATE jobs SET
                    locked_by = NULL,
                    locked_at = NULL,
                    failed_at = CASE WHEN attempts >= max_attempts THEN ?1 ELSE NULL END,
                    last_error = CASE WHEN attempts >= max_attempts THEN ?2 ELSE last_error END
                 WHERE locked_by IS NOT NULL AND locked_at <= ?3
                   AND completed_at IS NULL AND failed_at IS NULL
                 RETURNING id",
                params![
                    fmt_ts(now),
                    ABANDONED_FINAL_ATTEMPT,
                    fmt_ts(cutoff(now, older_than)),
                ],
            )
            .await?;

        if count > 0 {
            info!(count, older_than_secs = older_than.as_secs(), "Released stale job locks");
        }
        Ok(count)
    }

    async fn stats(&self) -> Result<QueueStats, StoreError> {
        // One compound statement so every figure comes from the same snapshot.
        let rows = self
            .query_map(
                "stats",
                "SELECT 'task', task_name,
                    SUM(CASE WHEN locked_by IS NULL AND completed_at IS NULL AND failed_at IS NULL THEN 1 ELSE 0 END),
                    SUM(CASE WHEN locked_by IS NOT NULL AND completed_at IS NULL AND failed_at IS NULL THEN 1 ELSE 0 END),
                    SUM(CASE WHEN failed_at IS NOT NULL THEN 1 ELSE 0 END),
                    SUM(CASE WHEN completed_at IS NOT NULL THEN 1 ELSE 0 END),
                    SUM(CASE WHEN locked_by IS NULL AND completed_at IS NULL AND failed_at IS NULL
                             AND last_error IS NOT NULL THEN 1 ELSE 0 END),
                    NULL, NULL, NULL, NULL, NULL
                 FROM jobs GROUP BY task_name
                 UNION ALL
                 SELECT 'active', task_name, NULL, NULL, NULL, NULL, NULL,
                    id, attempts, run_at, locked_by, locked_at
                 FROM jobs
                 WHERE locked_by IS NOT NULL AND completed_at IS NULL AND failed_at IS NULL",
                (),
                row_to_stats,
            )
            .await?;

        let mut task_stats = Vec::new();
        let mut active_jobs = Vec::new();
        let mut retrying = 0u64;
        for row in rows {
            match row {
                StatsRow::Task { stats, retrying: r } => {
                    retrying += r;
                    task_stats.push(stats);
                }
                StatsRow::Active(job) => active_jobs.push(job),
            }
        }

        Ok(QueueStats::from_parts(task_stats, active_jobs, retrying))
    }

    async fn purge_completed(&self, older_than: Duration) -> Result<u64, StoreError> {
        let count = self
            .mutate(
                "purge_completed",
                "DELETE FROM jobs WHERE completed_at IS NOT NULL AND completed_at <= ?1
                 RETURNING id",
                params![fmt_ts(cutoff(Utc::now(), older_than))],
            )
            .await?;

        if count > 0 {
            info!(count, "Purged completed jobs");
        }
        Ok(count)
    }
}
