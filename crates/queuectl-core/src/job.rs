//! The `Job` record and its state machine.
//!
//! See the module-level invariants enforced by [`crate::store::JobStore`]
//! implementations: lease fields track `state = processing` exactly,
//! `attempts <= max_retries + 1`, and terminal states carry no lease.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A job's position in the dispatch lifecycle.
///
/// `Pending` and `Failed` are functionally identical for dispatch purposes
/// (both are "ready" once `next_run_at <= now`); the distinction is kept for
/// observability only, per the open question this system resolves in favor
/// of keeping them separate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Pending,
    Processing,
    Completed,
    Failed,
    Dead,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Processing => "processing",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Dead => "dead",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(JobState::Pending),
            "processing" => Some(JobState::Processing),
            "completed" => Some(JobState::Completed),
            "failed" => Some(JobState::Failed),
            "dead" => Some(JobState::Dead),
            _ => None,
        }
    }

    /// States eligible for `acquire` once `next_run_at <= now`.
    pub fn is_ready_candidate(&self) -> bool {
        matches!(self, JobState::Pending | JobState::Failed)
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A durable unit of work: a shell command plus retry bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub command: String,
    pub state: JobState,
    pub attempts: i64,
    pub max_retries: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub next_run_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub locked_by: Option<String>,
    pub locked_at: Option<DateTime<Utc>>,
}

impl Job {
    /// The job's retry budget has been exhausted: this failure is `dead`.
    ///
    /// A job may be acquired at most `max_retries + 1` times before dying, so
    /// the budget is exhausted once `attempts` (already bumped by the acquire
    /// that produced this failure) exceeds `max_retries`.
    pub fn exhausted(&self) -> bool {
        self.attempts > self.max_retries
    }
}

/// The input accepted by [`crate::store::JobStore::enqueue`].
///
/// Mirrors the `enqueue` JSON schema from the CLI surface: `id` and `command`
/// are required, `max_retries` and `next_run_at` fall back to config/now.
#[derive(Debug, Clone, Deserialize)]
pub struct NewJob {
    pub id: String,
    pub command: String,
    #[serde(default)]
    pub max_retries: Option<i64>,
    #[serde(default)]
    pub next_run_at: Option<DateTime<Utc>>,
}

/// Registration metadata for a live worker, used only for observability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerInfo {
    pub worker_id: String,
    pub pid: i64,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
}

/// Aggregate job counts by state, as returned by `get_counts`.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct JobCounts {
    pub pending: i64,
    pub processing: i64,
    pub completed: i64,
    pub failed: i64,
    pub dead: i64,
}

impl JobCounts {
    pub fn total(&self) -> i64 {
        self.pending + self.processing + self.completed + self.failed + self.dead
    }
}
