use std::path::Path;
use std::str::FromStr;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use queuectl_core::error::{QueueError, Result};
use queuectl_core::job::{Job, JobCounts, JobState, NewJob, WorkerInfo};
use queuectl_core::store::{ConfigStore, JobStore, WorkerRegistry};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::Row;

/// SQLite-backed job store.
///
/// Holds a connection pool; callers share one `SqliteStore` across a process
/// (it is cheap to clone — `SqlitePool` is an `Arc` internally).
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

fn to_rfc3339(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(s: &str) -> anyhow::Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)?.with_timezone(&Utc))
}

/// True for SQLite's lock-contention errors, as opposed to any other
/// (potentially fatal) storage error.
fn is_sqlite_busy(err: &sqlx::Error) -> bool {
    let msg = err.to_string().to_ascii_lowercase();
    msg.contains("database is locked") || msg.contains("database is busy")
}

const MAX_BUSY_RETRIES: u32 = 50;

/// Retry a single-statement write past transient `SQLITE_BUSY` contention.
///
/// `acquire`'s dispatch transaction is the one place contention is a
/// first-class "no job this tick" outcome; everything else here is
/// recording the outcome of work a worker already committed to (a
/// completion, a failure, a heartbeat), so a writer-lock flicker from the
/// near-zero `busy_timeout` must be retried rather than surfaced as a
/// fatal error or silently dropped.
async fn retry_on_busy<T, F, Fut>(mut op: F) -> std::result::Result<T, sqlx::Error>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, sqlx::Error>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if is_sqlite_busy(&e) && attempt < MAX_BUSY_RETRIES => {
                let backoff_ms = 1u64 << attempt.min(6);
                tokio::time::sleep(std::time::Duration::from_millis(backoff_ms.min(50))).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

impl SqliteStore {
    /// Open (creating if absent) the database at `path` with WAL journaling.
    pub async fn connect(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let url = format!("sqlite:{}", path.as_ref().display());
        let options = SqliteConnectOptions::from_str(&url)?
            .journal_mode(SqliteJournalMode::Wal)
            // Near-zero: SQLITE_BUSY must surface immediately so a losing
            // `acquire()` returns `None` to the poll loop rather than
            // blocking the caller in SQLite's internal busy-handler retry.
            .busy_timeout(std::time::Duration::from_millis(1))
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(16)
            .connect_with(options)
            .await
            .context("failed to open queuectl database")?;

        Ok(Self { pool })
    }

    /// Create the schema if it does not already exist.
    pub async fn init_schema(&self) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
                id TEXT PRIMARY KEY,
                command TEXT NOT NULL,
                state TEXT NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 0,
                max_retries INTEGER NOT NULL DEFAULT 3,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                next_run_at TEXT NOT NULL,
                last_error TEXT,
                locked_by TEXT,
                locked_at TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_state_next_run ON jobs (state, next_run_at)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_locked_by ON jobs (locked_by)")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS config (key TEXT PRIMARY KEY, value TEXT NOT NULL)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS workers (
                worker_id TEXT PRIMARY KEY,
                pid INTEGER NOT NULL,
                started_at TEXT NOT NULL,
                last_heartbeat TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    fn row_to_job(row: &sqlx::sqlite::SqliteRow) -> anyhow::Result<Job> {
        let state: String = row.try_get("state")?;
        let locked_at: Option<String> = row.try_get("locked_at")?;
        Ok(Job {
            id: row.try_get("id")?,
            command: row.try_get("command")?,
            state: JobState::parse(&state).context("unrecognized job state in database")?,
            attempts: row.try_get("attempts")?,
            max_retries: row.try_get("max_retries")?,
            created_at: parse_ts(&row.try_get::<String, _>("created_at")?)?,
            updated_at: parse_ts(&row.try_get::<String, _>("updated_at")?)?,
            next_run_at: parse_ts(&row.try_get::<String, _>("next_run_at")?)?,
            last_error: row.try_get("last_error")?,
            locked_by: row.try_get("locked_by")?,
            locked_at: locked_at.map(|s| parse_ts(&s)).transpose()?,
        })
    }
}

#[async_trait]
impl JobStore for SqliteStore {
    async fn enqueue(&self, job: NewJob, default_max_retries: i64) -> Result<bool> {
        let now = Utc::now();
        let next_run_at = job.next_run_at.unwrap_or(now);
        let max_retries = job.max_retries.unwrap_or(default_max_retries);

        let result = retry_on_busy(|| {
            sqlx::query(
                r#"
                INSERT INTO jobs (
                    id, command, state, attempts, max_retries,
                    created_at, updated_at, next_run_at
                ) VALUES (?, ?, 'pending', 0, ?, ?, ?, ?)
                "#,
            )
            .bind(&job.id)
            .bind(&job.command)
            .bind(max_retries)
            .bind(to_rfc3339(now))
            .bind(to_rfc3339(now))
            .bind(to_rfc3339(next_run_at))
            .execute(&self.pool)
        })
        .await;

        match result {
            Ok(_) => Ok(true),
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => Ok(false),
            Err(e) => Err(QueueError::Storage(e.into())),
        }
    }

    async fn acquire(&self, worker_id: &str) -> Result<Option<Job>> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| QueueError::Storage(e.into()))?;

        if let Err(e) = sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await {
            if is_sqlite_busy(&e) {
                // Write lock contention: treat as "no job available" this tick.
                return Ok(None);
            }
            return Err(QueueError::Storage(e.into()));
        }

        let now = Utc::now();
        let candidate = sqlx::query(
            r#"
            SELECT id FROM jobs
            WHERE state IN ('pending', 'failed') AND next_run_at <= ?
            ORDER BY created_at ASC
            LIMIT 1
            "#,
        )
        .bind(to_rfc3339(now))
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| QueueError::Storage(e.into()))?;

        let Some(row) = candidate else {
            let _ = sqlx::query("COMMIT").execute(&mut *conn).await;
            return Ok(None);
        };
        let job_id: String = row.try_get("id").map_err(|e| QueueError::Storage(e.into()))?;

        sqlx::query(
            r#"
            UPDATE jobs
            SET state = 'processing', locked_by = ?, locked_at = ?,
                attempts = attempts + 1, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(worker_id)
        .bind(to_rfc3339(now))
        .bind(to_rfc3339(now))
        .bind(&job_id)
        .execute(&mut *conn)
        .await
        .map_err(|e| QueueError::Storage(e.into()))?;

        sqlx::query("COMMIT")
            .execute(&mut *conn)
            .await
            .map_err(|e| QueueError::Storage(e.into()))?;

        let row = sqlx::query("SELECT * FROM jobs WHERE id = ?")
            .bind(&job_id)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| QueueError::Storage(e.into()))?;

        Ok(Some(
            Self::row_to_job(&row).map_err(QueueError::Storage)?,
        ))
    }

    async fn complete(&self, job_id: &str) -> Result<()> {
        let now = to_rfc3339(Utc::now());
        retry_on_busy(|| {
            sqlx::query(
                r#"
                UPDATE jobs
                SET state = 'completed', updated_at = ?, locked_by = NULL, locked_at = NULL
                WHERE id = ?
                "#,
            )
            .bind(&now)
            .bind(job_id)
            .execute(&self.pool)
        })
        .await
        .map_err(|e| QueueError::Storage(e.into()))?;
        Ok(())
    }

    async fn fail(&self, job_id: &str, error: &str, backoff_base: i64) -> Result<()> {
        let row = retry_on_busy(|| {
            sqlx::query("SELECT attempts, max_retries FROM jobs WHERE id = ?")
                .bind(job_id)
                .fetch_optional(&self.pool)
        })
        .await
        .map_err(|e| QueueError::Storage(e.into()))?;

        let Some(row) = row else {
            tracing::warn!(job_id, "fail() called against a nonexistent job");
            return Ok(());
        };
        let attempts: i64 = row.try_get("attempts").map_err(|e| QueueError::Storage(e.into()))?;
        let max_retries: i64 = row
            .try_get("max_retries")
            .map_err(|e| QueueError::Storage(e.into()))?;

        let now = Utc::now();
        if attempts > max_retries {
            let updated_at = to_rfc3339(now);
            retry_on_busy(|| {
                sqlx::query(
                    r#"
                    UPDATE jobs
                    SET state = 'dead', updated_at = ?, last_error = ?,
                        locked_by = NULL, locked_at = NULL
                    WHERE id = ?
                    "#,
                )
                .bind(&updated_at)
                .bind(error)
                .bind(job_id)
                .execute(&self.pool)
            })
            .await
            .map_err(|e| QueueError::Storage(e.into()))?;
        } else {
            let delay_secs = backoff_base.pow(attempts as u32);
            let next_run = now + chrono::Duration::seconds(delay_secs);
            let updated_at = to_rfc3339(now);
            let next_run_at = to_rfc3339(next_run);
            retry_on_busy(|| {
                sqlx::query(
                    r#"
                    UPDATE jobs
                    SET state = 'failed', updated_at = ?, next_run_at = ?, last_error = ?,
                        locked_by = NULL, locked_at = NULL
                    WHERE id = ?
                    "#,
                )
                .bind(&updated_at)
                .bind(&next_run_at)
                .bind(error)
                .bind(job_id)
                .execute(&self.pool)
            })
            .await
            .map_err(|e| QueueError::Storage(e.into()))?;
        }
        Ok(())
    }

    async fn recover_abandoned(&self, threshold_seconds: i64) -> Result<u64> {
        let cutoff = to_rfc3339(Utc::now() - chrono::Duration::seconds(threshold_seconds));
        let result = retry_on_busy(|| {
            sqlx::query(
                r#"
                UPDATE jobs
                SET state = 'pending', locked_by = NULL, locked_at = NULL
                WHERE state = 'processing' AND locked_at < ?
                "#,
            )
            .bind(&cutoff)
            .execute(&self.pool)
        })
        .await
        .map_err(|e| QueueError::Storage(e.into()))?;
        Ok(result.rows_affected())
    }

    async fn retry_dlq(&self, job_id: &str, reset_attempts: bool) -> Result<bool> {
        let now = to_rfc3339(Utc::now());
        let result = if reset_attempts {
            retry_on_busy(|| {
                sqlx::query(
                    r#"
                    UPDATE jobs
                    SET state = 'pending', attempts = 0, next_run_at = ?, updated_at = ?, last_error = NULL
                    WHERE id = ? AND state = 'dead'
                    "#,
                )
                .bind(&now)
                .bind(&now)
                .bind(job_id)
                .execute(&self.pool)
            })
            .await
        } else {
            retry_on_busy(|| {
                sqlx::query(
                    r#"
                    UPDATE jobs
                    SET state = 'pending', next_run_at = ?, updated_at = ?, last_error = NULL
                    WHERE id = ? AND state = 'dead'
                    "#,
                )
                .bind(&now)
                .bind(&now)
                .bind(job_id)
                .execute(&self.pool)
            })
            .await
        }
        .map_err(|e| QueueError::Storage(e.into()))?;

        Ok(result.rows_affected() > 0)
    }

    async fn delete_dlq(&self, job_id: &str) -> Result<bool> {
        let result = retry_on_busy(|| {
            sqlx::query("DELETE FROM jobs WHERE id = ? AND state = 'dead'")
                .bind(job_id)
                .execute(&self.pool)
        })
        .await
        .map_err(|e| QueueError::Storage(e.into()))?;
        Ok(result.rows_affected() > 0)
    }

    async fn get_job(&self, job_id: &str) -> Result<Option<Job>> {
        let row = sqlx::query("SELECT * FROM jobs WHERE id = ?")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| QueueError::Storage(e.into()))?;
        row.map(|r| Self::row_to_job(&r).map_err(QueueError::Storage))
            .transpose()
    }

    async fn list_jobs(&self, state: Option<&str>, limit: i64) -> Result<Vec<Job>> {
        let rows = if let Some(state) = state {
            sqlx::query("SELECT * FROM jobs WHERE state = ? ORDER BY created_at DESC LIMIT ?")
                .bind(state)
                .bind(limit)
                .fetch_all(&self.pool)
                .await
        } else {
            sqlx::query("SELECT * FROM jobs ORDER BY created_at DESC LIMIT ?")
                .bind(limit)
                .fetch_all(&self.pool)
                .await
        }
        .map_err(|e| QueueError::Storage(e.into()))?;

        rows.iter()
            .map(|r| Self::row_to_job(r).map_err(QueueError::Storage))
            .collect()
    }

    async fn get_counts(&self) -> Result<JobCounts> {
        let rows = sqlx::query("SELECT state, COUNT(*) as count FROM jobs GROUP BY state")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| QueueError::Storage(e.into()))?;

        let mut counts = JobCounts::default();
        for row in rows {
            let state: String = row.try_get("state").map_err(|e| QueueError::Storage(e.into()))?;
            let count: i64 = row.try_get("count").map_err(|e| QueueError::Storage(e.into()))?;
            match JobState::parse(&state) {
                Some(JobState::Pending) => counts.pending = count,
                Some(JobState::Processing) => counts.processing = count,
                Some(JobState::Completed) => counts.completed = count,
                Some(JobState::Failed) => counts.failed = count,
                Some(JobState::Dead) => counts.dead = count,
                None => {}
            }
        }
        Ok(counts)
    }
}

#[async_trait]
impl ConfigStore for SqliteStore {
    async fn get_config(&self, key: &str) -> Result<Option<String>> {
        let row = sqlx::query("SELECT value FROM config WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| QueueError::Storage(e.into()))?;
        row.map(|r| r.try_get::<String, _>("value").map_err(|e| QueueError::Storage(e.into())))
            .transpose()
    }

    async fn set_config(&self, key: &str, value: &str) -> Result<()> {
        retry_on_busy(|| {
            sqlx::query("INSERT OR REPLACE INTO config (key, value) VALUES (?, ?)")
                .bind(key)
                .bind(value)
                .execute(&self.pool)
        })
        .await
        .map_err(|e| QueueError::Storage(e.into()))?;
        Ok(())
    }

    async fn get_all_config(&self) -> Result<Vec<(String, String)>> {
        let rows = sqlx::query("SELECT key, value FROM config")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| QueueError::Storage(e.into()))?;
        rows.iter()
            .map(|r| {
                Ok((
                    r.try_get("key").map_err(|e| QueueError::Storage(e.into()))?,
                    r.try_get("value").map_err(|e| QueueError::Storage(e.into()))?,
                ))
            })
            .collect()
    }
}

#[async_trait]
impl WorkerRegistry for SqliteStore {
    async fn register_worker(&self, worker_id: &str, pid: i64, now: DateTime<Utc>) -> Result<()> {
        let now = to_rfc3339(now);
        retry_on_busy(|| {
            sqlx::query(
                r#"
                INSERT OR REPLACE INTO workers (worker_id, pid, started_at, last_heartbeat)
                VALUES (?, ?, ?, ?)
                "#,
            )
            .bind(worker_id)
            .bind(pid)
            .bind(&now)
            .bind(&now)
            .execute(&self.pool)
        })
        .await
        .map_err(|e| QueueError::Storage(e.into()))?;
        Ok(())
    }

    async fn unregister_worker(&self, worker_id: &str) -> Result<()> {
        retry_on_busy(|| {
            sqlx::query("DELETE FROM workers WHERE worker_id = ?")
                .bind(worker_id)
                .execute(&self.pool)
        })
        .await
        .map_err(|e| QueueError::Storage(e.into()))?;
        Ok(())
    }

    async fn heartbeat(&self, worker_id: &str, now: DateTime<Utc>) -> Result<()> {
        let now = to_rfc3339(now);
        retry_on_busy(|| {
            sqlx::query("UPDATE workers SET last_heartbeat = ? WHERE worker_id = ?")
                .bind(&now)
                .bind(worker_id)
                .execute(&self.pool)
        })
        .await
        .map_err(|e| QueueError::Storage(e.into()))?;
        Ok(())
    }

    async fn list_workers(&self) -> Result<Vec<WorkerInfo>> {
        let rows = sqlx::query("SELECT * FROM workers ORDER BY started_at")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| QueueError::Storage(e.into()))?;

        rows.iter()
            .map(|r| {
                Ok(WorkerInfo {
                    worker_id: r.try_get("worker_id").map_err(|e| QueueError::Storage(e.into()))?,
                    pid: r.try_get("pid").map_err(|e| QueueError::Storage(e.into()))?,
                    started_at: parse_ts(&r.try_get::<String, _>("started_at").map_err(|e| QueueError::Storage(e.into()))?)
                        .map_err(QueueError::Storage)?,
                    last_heartbeat: parse_ts(
                        &r.try_get::<String, _>("last_heartbeat")
                            .map_err(|e| QueueError::Storage(e.into()))?,
                    )
                    .map_err(QueueError::Storage)?,
                })
            })
            .collect()
    }
}
