//! SQLite implementation of the `queuectl` job store.
//!
//! Provides a production-ready embedded-store backend for the
//! `queuectl-core` traits.
//!
//! # Features
//!
//! - Atomic dispatch via an explicit `BEGIN IMMEDIATE` transaction
//! - Exponential backoff retry scheduling
//! - Dead letter queue for permanently failed jobs
//! - Worker heartbeats for observability
//! - WAL journal mode so read traffic never blocks the dispatch transaction
//!
//! # Database Schema
//!
//! ```sql
//! CREATE TABLE jobs (
//!     id TEXT PRIMARY KEY,
//!     command TEXT NOT NULL,
//!     state TEXT NOT NULL,
//!     attempts INTEGER NOT NULL DEFAULT 0,
//!     max_retries INTEGER NOT NULL DEFAULT 3,
//!     created_at TEXT NOT NULL,
//!     updated_at TEXT NOT NULL,
//!     next_run_at TEXT NOT NULL,
//!     last_error TEXT,
//!     locked_by TEXT,
//!     locked_at TEXT
//! );
//! CREATE INDEX idx_jobs_state_next_run ON jobs (state, next_run_at);
//! CREATE INDEX idx_jobs_locked_by ON jobs (locked_by);
//!
//! CREATE TABLE config (key TEXT PRIMARY KEY, value TEXT NOT NULL);
//!
//! CREATE TABLE workers (
//!     worker_id TEXT PRIMARY KEY,
//!     pid INTEGER NOT NULL,
//!     started_at TEXT NOT NULL,
//!     last_heartbeat TEXT NOT NULL
//! );
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use queuectl_storage_sqlite::SqliteStore;
//!
//! let store = SqliteStore::connect("queuectl.db").await?;
//! store.init_schema().await?;
//! ```

mod store;

pub use store::SqliteStore;
