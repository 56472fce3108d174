//! Argument parsing for the `queuectl` binary.
//!
//! Structure follows the only `clap`-derive CLI in the reference corpus
//! (`posthog-cli`): a top-level `Cli` with global flags, a `Commands`
//! subcommand enum, and nested subcommand enums for multi-level groups
//! (`worker`, `dlq`, `config`).

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

/// Hidden subcommand name the manager re-invokes to run a single worker.
/// Kept in sync with [`queuectl_core::manager::WORKER_RUN_SUBCOMMAND`] by
/// `tests::worker_run_subcommand_name_matches_core`.
pub const WORKER_RUN_NAME: &str = "__worker-run";

#[derive(Parser)]
#[command(name = "queuectl", version, about = "Production-grade job queue system")]
pub struct Cli {
    /// Database file path
    #[arg(long, global = true, default_value = "queuectl.db")]
    pub db: PathBuf,

    /// Logging level
    #[arg(long, global = true, default_value = "INFO")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Initialize the database
    Init,

    /// Enqueue a job from JSON string or file
    Enqueue {
        /// Job JSON, e.g. '{"id":"j1","command":"echo hi"}'
        job_json: Option<String>,

        /// Job JSON file
        #[arg(short = 'f', long = "file")]
        file: Option<PathBuf>,
    },

    /// List jobs
    List {
        /// Filter by job state
        #[arg(long)]
        state: Option<String>,

        /// Maximum number of jobs to list
        #[arg(long, default_value_t = 100)]
        limit: i64,
    },

    /// Show system status
    Status,

    /// Worker management commands
    Worker {
        #[command(subcommand)]
        cmd: WorkerCommand,
    },

    /// Dead Letter Queue commands
    Dlq {
        #[command(subcommand)]
        cmd: DlqCommand,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        cmd: ConfigCommand,
    },

    /// Internal: run a single worker. Spawned by `worker start`; not a
    /// documented user-facing entry point.
    #[command(name = WORKER_RUN_NAME, hide = true)]
    WorkerRun(WorkerRunArgs),
}

#[derive(Subcommand)]
pub enum WorkerCommand {
    /// Start worker processes
    Start {
        /// Number of worker processes
        #[arg(long)]
        count: Option<u32>,

        /// Backoff base for retries
        #[arg(long)]
        base: Option<i64>,

        /// Max jobs to process (for testing)
        #[arg(long)]
        limit: Option<u64>,
    },

    /// Stop all workers
    Stop,
}

#[derive(Subcommand)]
pub enum DlqCommand {
    /// List dead jobs
    List,

    /// Retry a dead job
    Retry {
        job_id: String,

        /// Keep the attempt counter instead of resetting it to 0
        #[arg(long)]
        no_reset_attempts: bool,
    },

    /// Delete a dead job
    Delete { job_id: String },
}

#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Set configuration value
    Set { key: String, value: String },

    /// Get configuration value
    Get { key: String },

    /// Show all configuration
    Show,
}

#[derive(Args)]
pub struct WorkerRunArgs {
    #[arg(long)]
    pub worker_id: String,

    #[arg(long)]
    pub base: i64,

    #[arg(long)]
    pub limit: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn worker_run_subcommand_name_matches_core() {
        assert_eq!(WORKER_RUN_NAME, queuectl_core::manager::WORKER_RUN_SUBCOMMAND);
        let cmd = Cli::command();
        let names: Vec<_> = cmd.get_subcommands().map(|s| s.get_name()).collect();
        assert!(names.contains(&WORKER_RUN_NAME));
    }
}
