//! Storage-backend-agnostic traits for the dispatch engine.
//!
//! [`JobStore`] is the atomic dispatch core described in `spec.md` §4.1. Any
//! backend implementing it correctly — a single SQLite file, a row-locking
//! SQL engine with `SELECT ... FOR UPDATE SKIP LOCKED` — satisfies the
//! uniqueness-of-dispatch invariant; the engine above never assumes more than
//! this contract.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::job::{Job, JobCounts, NewJob, WorkerInfo};

/// The atomic job-acquisition and retry-scheduling primitives.
///
/// Implementations must uphold the invariants in `spec.md` §3 at every commit
/// boundary, and must make `acquire` an atomic select-then-update under a
/// write-exclusive transaction (see `spec.md` §4.1 and §9).
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new job in `pending`. Returns `false` if `id` already exists.
    async fn enqueue(&self, job: NewJob, default_max_retries: i64) -> Result<bool>;

    /// Atomically claim the oldest ready job for `worker_id`, if any.
    async fn acquire(&self, worker_id: &str) -> Result<Option<Job>>;

    /// Mark a job completed and clear its lease. Idempotent.
    async fn complete(&self, job_id: &str) -> Result<()>;

    /// Record a failed attempt; transitions to `dead` or reschedules with
    /// exponential backoff per `spec.md` §4.1. No-op with a logged warning if
    /// `job_id` does not exist.
    async fn fail(&self, job_id: &str, error: &str, backoff_base: i64) -> Result<()>;

    /// Reclaim `processing` jobs whose lease is older than `threshold_seconds`.
    /// Returns the number of jobs recovered.
    async fn recover_abandoned(&self, threshold_seconds: i64) -> Result<u64>;

    /// Move a `dead` job back to `pending`. Returns `false` if the job is
    /// absent or not `dead`.
    async fn retry_dlq(&self, job_id: &str, reset_attempts: bool) -> Result<bool>;

    /// Delete a `dead` job. Returns `false` if the job is absent or not `dead`.
    async fn delete_dlq(&self, job_id: &str) -> Result<bool>;

    /// Fetch a single job by id.
    async fn get_job(&self, job_id: &str) -> Result<Option<Job>>;

    /// List jobs, optionally filtered by state, newest `created_at` first.
    async fn list_jobs(&self, state: Option<&str>, limit: i64) -> Result<Vec<Job>>;

    /// Count jobs by state.
    async fn get_counts(&self) -> Result<JobCounts>;
}

/// Durable key/value configuration, seeded with defaults on first use.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    async fn get_config(&self, key: &str) -> Result<Option<String>>;
    async fn set_config(&self, key: &str, value: &str) -> Result<()>;
    async fn get_all_config(&self) -> Result<Vec<(String, String)>>;
}

/// Observability-only registry of live workers (`spec.md` §3).
#[async_trait]
pub trait WorkerRegistry: Send + Sync {
    async fn register_worker(&self, worker_id: &str, pid: i64, now: DateTime<Utc>) -> Result<()>;
    async fn unregister_worker(&self, worker_id: &str) -> Result<()>;
    async fn heartbeat(&self, worker_id: &str, now: DateTime<Utc>) -> Result<()>;
    async fn list_workers(&self) -> Result<Vec<WorkerInfo>>;
}
