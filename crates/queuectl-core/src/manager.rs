//! Supervises N worker processes, runs startup recovery, and fans out
//! shutdown signals.
//!
//! Workers are independent OS processes — not threads — per `spec.md` §4.4:
//! each opens its own connection to the embedded store, and a crash in one
//! must not fault the others. The manager re-invokes its own binary with the
//! hidden [`WORKER_RUN_SUBCOMMAND`] to start each worker, the idiomatic
//! analogue of Python's `multiprocessing.Process` when the binary itself is
//! the worker entry point.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::process::{Child, Command};
use tokio::signal::unix::{signal as tokio_signal, SignalKind};
use tracing::{info, warn};

use crate::store::JobStore;

/// Hidden subcommand the CLI binary recognizes to run a single worker.
pub const WORKER_RUN_SUBCOMMAND: &str = "__worker-run";

/// Grace period before force-killing stragglers on shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

pub struct ManagerConfig {
    pub db_path: PathBuf,
    pub pid_file: PathBuf,
    pub worker_count: u32,
    pub backoff_base: i64,
    pub job_limit: Option<u64>,
    pub abandoned_threshold: i64,
}

/// Spawns and supervises `worker_count` OS processes.
pub struct WorkerManager {
    config: ManagerConfig,
}

impl WorkerManager {
    pub fn new(config: ManagerConfig) -> Self {
        Self { config }
    }

    /// Runs startup recovery, forks workers, and blocks until all exit or a
    /// termination signal is received.
    pub async fn run(&self, store: &dyn JobStore) -> anyhow::Result<()> {
        self.write_pid_file()?;

        let recovered = store
            .recover_abandoned(self.config.abandoned_threshold)
            .await?;
        if recovered > 0 {
            warn!(recovered, "recovered abandoned jobs on startup");
        }

        let exe = std::env::current_exe()?;
        let mut children: Vec<Child> = Vec::with_capacity(self.config.worker_count as usize);
        for _ in 0..self.config.worker_count {
            let worker_id = format!("worker-{}", uuid::Uuid::new_v4().simple());
            children.push(self.spawn_worker(&exe, &worker_id)?);
        }

        let mut sigterm = tokio_signal(SignalKind::terminate())?;
        let mut sigint = tokio_signal(SignalKind::interrupt())?;

        tokio::select! {
            _ = sigterm.recv() => info!("received SIGTERM, stopping workers"),
            _ = sigint.recv() => info!("received SIGINT, stopping workers"),
            _ = wait_all(&mut children) => info!("all workers exited"),
        }

        self.shutdown(children).await;
        let _ = std::fs::remove_file(&self.config.pid_file);
        Ok(())
    }

    fn spawn_worker(&self, exe: &Path, worker_id: &str) -> anyhow::Result<Child> {
        let mut cmd = Command::new(exe);
        cmd.arg(WORKER_RUN_SUBCOMMAND)
            .arg("--db")
            .arg(&self.config.db_path)
            .arg("--worker-id")
            .arg(worker_id)
            .arg("--base")
            .arg(self.config.backoff_base.to_string())
            .stdin(Stdio::null());
        if let Some(limit) = self.config.job_limit {
            cmd.arg("--limit").arg(limit.to_string());
        }
        let child = cmd.spawn()?;
        info!(worker_id, pid = child.id(), "started worker process");
        Ok(child)
    }

    fn write_pid_file(&self) -> anyhow::Result<()> {
        std::fs::write(&self.config.pid_file, std::process::id().to_string())?;
        Ok(())
    }

    async fn shutdown(&self, mut children: Vec<Child>) {
        for child in &mut children {
            if let Some(pid) = child.id() {
                let _ = signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
            }
        }

        let joined = tokio::time::timeout(SHUTDOWN_GRACE, wait_all(&mut children)).await;
        if joined.is_err() {
            for child in &mut children {
                warn!(pid = child.id(), "worker did not stop gracefully, forcing");
                let _ = child.start_kill();
            }
            let _ = wait_all(&mut children).await;
        }
    }
}

async fn wait_all(children: &mut [Child]) {
    for child in children.iter_mut() {
        let _ = child.wait().await;
    }
}
