//! # queuectl-core
//!
//! The dispatch and retry engine behind `queuectl`: a durable, multi-worker
//! job queue whose only shared resource is an embedded relational store.
//!
//! ## Architecture
//!
//! ```text
//! WorkerManager::run()
//!     │  recover_abandoned()
//!     │  spawn N worker processes
//!     ▼
//! Worker::run()  (one per OS process)
//!     │
//!     ├─► JobStore::acquire(worker_id)  ── BEGIN IMMEDIATE, select-then-update
//!     │
//!     ├─► Executor::execute(command, timeout)
//!     │
//!     └─► JobStore::complete | JobStore::fail(error, backoff_base)
//! ```
//!
//! ## Key invariants
//!
//! 1. **Exactly one worker holds a job's lease at a time** — enforced by the
//!    backend's `acquire` transaction, not by anything in this crate.
//! 2. **`attempts` only grows**, and only at `acquire`; a job reaches `dead`
//!    on its `(max_retries + 1)`th failure.
//! 3. **An abandoned lease still counts** — `recover_abandoned` resets state
//!    and lease fields but never decrements `attempts`.
//!
//! This crate defines the [`JobStore`], [`ConfigStore`], and
//! [`WorkerRegistry`] traits only; `queuectl-storage-sqlite` provides the
//! concrete SQLite-backed implementation.

pub mod config;
pub mod error;
pub mod executor;
pub mod job;
pub mod manager;
pub mod store;
pub mod worker;

pub use config::Config;
pub use error::{QueueError, Result};
pub use executor::{Executor, ExecutionResult, ShellExecutor};
pub use job::{Job, JobCounts, JobState, NewJob, WorkerInfo};
pub use manager::{ManagerConfig, WorkerManager, WORKER_RUN_SUBCOMMAND};
pub use store::{ConfigStore, JobStore, WorkerRegistry};
pub use worker::Worker;
