//! Error taxonomy for the dispatch engine.
//!
//! Matches `spec.md` §7: user-input errors, storage contention (treated as
//! "no work" and never surfaced as [`QueueError`]), job execution failures
//! (data, not errors — see [`crate::executor::ExecutionResult`]), and fatal
//! storage errors, which propagate here.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("job not found: {0}")]
    NotFound(String),

    #[error("job already exists: {0}")]
    AlreadyExists(String),

    #[error("invalid job: {0}")]
    InvalidJob(String),

    #[error("job {0} is not in the dead letter queue")]
    NotDead(String),

    #[error("storage error: {0}")]
    Storage(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, QueueError>;
