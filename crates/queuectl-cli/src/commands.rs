//! Subcommand handlers: the glue between parsed CLI args and the engine.
//!
//! Every operation prints a `✓`-prefixed success line or a `✗`-prefixed
//! failure line and exits 1 on failure, per `spec.md` §7 — no machine
//! readable output is offered.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use queuectl_core::job::NewJob;
use queuectl_core::store::{JobStore, WorkerRegistry};
use queuectl_core::{
    Config, Executor, ManagerConfig, ShellExecutor, Worker, WorkerManager,
};
use queuectl_storage_sqlite::SqliteStore;
use tracing::info;

use crate::cli::{Cli, Commands, ConfigCommand, DlqCommand, WorkerCommand, WorkerRunArgs};
use crate::table::{print_table, truncate};

const PID_FILE: &str = ".queuectl.pid";

pub async fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Init => init(&cli.db).await,
        Commands::Enqueue { job_json, file } => enqueue(&cli.db, job_json, file).await,
        Commands::List { state, limit } => list(&cli.db, state, limit).await,
        Commands::Status => status(&cli.db).await,
        Commands::Worker { cmd } => match cmd {
            WorkerCommand::Start { count, base, limit } => {
                worker_start(&cli.db, count, base, limit).await
            }
            WorkerCommand::Stop => worker_stop(),
        },
        Commands::Dlq { cmd } => match cmd {
            DlqCommand::List => dlq_list(&cli.db).await,
            DlqCommand::Retry {
                job_id,
                no_reset_attempts,
            } => dlq_retry(&cli.db, &job_id, !no_reset_attempts).await,
            DlqCommand::Delete { job_id } => dlq_delete(&cli.db, &job_id).await,
        },
        Commands::Config { cmd } => match cmd {
            ConfigCommand::Set { key, value } => config_set(&cli.db, &key, &value).await,
            ConfigCommand::Get { key } => config_get(&cli.db, &key).await,
            ConfigCommand::Show => config_show(&cli.db).await,
        },
        Commands::WorkerRun(args) => worker_run(&cli.db, args).await,
    }
}

async fn open_store(db: &Path) -> anyhow::Result<SqliteStore> {
    let store = SqliteStore::connect(db).await?;
    store.init_schema().await?;
    Ok(store)
}

async fn init(db: &Path) -> anyhow::Result<()> {
    open_store(db).await?;
    println!("✓ Database initialized: {}", db.display());
    Ok(())
}

async fn enqueue(db: &Path, job_json: Option<String>, file: Option<PathBuf>) -> anyhow::Result<()> {
    let store = open_store(db).await?;
    let config = Config::new(Arc::new(store.clone())).await?;

    let raw = if let Some(path) = file {
        std::fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?
    } else if let Some(json) = job_json {
        json
    } else {
        eprintln!("✗ Provide either job JSON string or --file option");
        std::process::exit(1);
    };

    let value: serde_json::Value = match serde_json::from_str(&raw) {
        Ok(v) => v,
        Err(e) => {
            eprintln!("✗ Invalid JSON: {e}");
            std::process::exit(1);
        }
    };

    let id = match value.get("id").and_then(|v| v.as_str()) {
        Some(id) => id.to_string(),
        None => {
            eprintln!("✗ Job must have 'id' field");
            std::process::exit(1);
        }
    };
    let command = match value.get("command").and_then(|v| v.as_str()) {
        Some(c) => c.to_string(),
        None => {
            eprintln!("✗ Job must have 'command' field");
            std::process::exit(1);
        }
    };

    let max_retries = match value.get("max_retries") {
        Some(v) => match v.as_i64() {
            Some(n) if n >= 0 => Some(n),
            _ => {
                eprintln!("✗ max_retries must be a non-negative integer");
                std::process::exit(1);
            }
        },
        None => None,
    };
    let next_run_at = match value.get("next_run_at").and_then(|v| v.as_str()) {
        Some(s) => match chrono::DateTime::parse_from_rfc3339(s) {
            Ok(ts) => Some(ts.with_timezone(&chrono::Utc)),
            Err(e) => {
                eprintln!("✗ Invalid next_run_at: {e}");
                std::process::exit(1);
            }
        },
        None => None,
    };

    let default_max_retries = config.get_int("max_retries", 3).await;
    let effective_max_retries = max_retries.unwrap_or(default_max_retries);

    let new_job = NewJob {
        id: id.clone(),
        command: command.clone(),
        max_retries,
        next_run_at,
    };

    match store.enqueue(new_job, default_max_retries).await? {
        true => {
            println!("✓ Job enqueued: {id}");
            println!("  Command: {command}");
            println!("  Max retries: {effective_max_retries}");
            Ok(())
        }
        false => {
            eprintln!("✗ Failed to enqueue job: ID '{id}' already exists");
            std::process::exit(1);
        }
    }
}

async fn list(db: &Path, state: Option<String>, limit: i64) -> anyhow::Result<()> {
    let store = open_store(db).await?;
    let jobs = store.list_jobs(state.as_deref(), limit).await?;

    if jobs.is_empty() {
        println!("No jobs found");
        return Ok(());
    }

    let rows: Vec<Vec<String>> = jobs
        .iter()
        .map(|job| {
            vec![
                truncate(&job.id, 16),
                truncate(&job.command, 40),
                job.state.to_string(),
                format!("{}/{}", job.attempts, job.max_retries),
                job.next_run_at.format("%Y-%m-%dT%H:%M:%S").to_string(),
                job.updated_at.format("%Y-%m-%dT%H:%M:%S").to_string(),
            ]
        })
        .collect();

    print_table(
        &["Job ID", "Command", "State", "Attempts", "Next Run", "Updated"],
        &rows,
    );
    println!("\nTotal: {} job(s)", jobs.len());
    Ok(())
}

async fn status(db: &Path) -> anyhow::Result<()> {
    let store = open_store(db).await?;
    let counts = store.get_counts().await?;
    let workers = store.list_workers().await?;

    println!("=== QueueCTL Status ===\n");
    println!("Job Statistics:");
    print_table(
        &["State", "Count"],
        &[
            vec!["Pending".into(), counts.pending.to_string()],
            vec!["Processing".into(), counts.processing.to_string()],
            vec!["Completed".into(), counts.completed.to_string()],
            vec!["Failed".into(), counts.failed.to_string()],
            vec!["Dead (DLQ)".into(), counts.dead.to_string()],
            vec!["Total".into(), counts.total().to_string()],
        ],
    );

    println!("\nActive Workers: {}", workers.len());
    if !workers.is_empty() {
        let rows: Vec<Vec<String>> = workers
            .iter()
            .map(|w| {
                vec![
                    truncate(&w.worker_id, 8),
                    w.pid.to_string(),
                    w.started_at.format("%Y-%m-%dT%H:%M:%S").to_string(),
                    w.last_heartbeat.format("%Y-%m-%dT%H:%M:%S").to_string(),
                ]
            })
            .collect();
        print_table(&["Worker ID", "PID", "Started", "Last Heartbeat"], &rows);
    }
    Ok(())
}

async fn worker_start(
    db: &Path,
    count: Option<u32>,
    base: Option<i64>,
    limit: Option<u64>,
) -> anyhow::Result<()> {
    let store = open_store(db).await?;
    let config = Config::new(Arc::new(store.clone())).await?;

    let count = match count {
        Some(c) => c,
        None => config.get_int("worker_default_count", 1).await as u32,
    };
    let base = match base {
        Some(b) => b,
        None => config.get_int("backoff_base", 2).await,
    };
    let abandoned_threshold = config.get_int("abandoned_threshold", 3600).await;

    println!("Starting {count} worker(s)...");
    println!("  Database: {}", db.display());
    println!("  Backoff base: {base}");
    if let Some(limit) = limit {
        println!("  Job limit: {limit}");
    }

    let manager = WorkerManager::new(ManagerConfig {
        db_path: db.to_path_buf(),
        pid_file: PathBuf::from(PID_FILE),
        worker_count: count,
        backoff_base: base,
        job_limit: limit,
        abandoned_threshold,
    });

    manager.run(&store).await?;
    println!("✓ Workers stopped");
    Ok(())
}

fn worker_stop() -> anyhow::Result<()> {
    let pidfile = Path::new(PID_FILE);
    if !pidfile.exists() {
        eprintln!("✗ No workers running (PID file not found)");
        std::process::exit(1);
    }

    let contents = std::fs::read_to_string(pidfile)?;
    let pid: i32 = match contents.trim().parse() {
        Ok(pid) => pid,
        Err(e) => {
            eprintln!("✗ Failed to stop workers: {e}");
            std::process::exit(1);
        }
    };

    match nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), nix::sys::signal::Signal::SIGTERM) {
        Ok(()) => {
            println!("✓ Sent stop signal to worker manager (PID: {pid})");
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Failed to stop workers: {e}");
            std::process::exit(1);
        }
    }
}

async fn dlq_list(db: &Path) -> anyhow::Result<()> {
    let store = open_store(db).await?;
    let jobs = store.list_jobs(Some("dead"), 1000).await?;

    if jobs.is_empty() {
        println!("No dead jobs in DLQ");
        return Ok(());
    }

    let rows: Vec<Vec<String>> = jobs
        .iter()
        .map(|job| {
            vec![
                truncate(&job.id, 16),
                truncate(&job.command, 30),
                job.attempts.to_string(),
                truncate(job.last_error.as_deref().unwrap_or(""), 50),
                job.updated_at.format("%Y-%m-%dT%H:%M:%S").to_string(),
            ]
        })
        .collect();

    print_table(&["Job ID", "Command", "Attempts", "Last Error", "Updated"], &rows);
    println!("\nTotal: {} dead job(s)", jobs.len());
    Ok(())
}

async fn dlq_retry(db: &Path, job_id: &str, reset_attempts: bool) -> anyhow::Result<()> {
    let store = open_store(db).await?;
    if store.retry_dlq(job_id, reset_attempts).await? {
        println!("✓ Job moved from DLQ to pending: {job_id}");
        if reset_attempts {
            println!("  Attempts reset to 0");
        }
        Ok(())
    } else {
        eprintln!("✗ Job not found in DLQ: {job_id}");
        std::process::exit(1);
    }
}

async fn dlq_delete(db: &Path, job_id: &str) -> anyhow::Result<()> {
    let store = open_store(db).await?;
    if store.delete_dlq(job_id).await? {
        println!("✓ Job deleted from DLQ: {job_id}");
        Ok(())
    } else {
        eprintln!("✗ Job not found in DLQ: {job_id}");
        std::process::exit(1);
    }
}

async fn config_set(db: &Path, key: &str, value: &str) -> anyhow::Result<()> {
    let store = open_store(db).await?;
    let config = Config::new(Arc::new(store)).await?;
    config.set(key, value).await?;
    println!("✓ Config set: {key} = {value}");
    Ok(())
}

async fn config_get(db: &Path, key: &str) -> anyhow::Result<()> {
    let store = open_store(db).await?;
    let config = Config::new(Arc::new(store)).await?;
    match config.get(key).await? {
        Some(value) => {
            println!("{key} = {value}");
            Ok(())
        }
        None => {
            eprintln!("✗ Config key not found: {key}");
            std::process::exit(1);
        }
    }
}

async fn config_show(db: &Path) -> anyhow::Result<()> {
    let store = open_store(db).await?;
    let config = Config::new(Arc::new(store)).await?;
    let all = config.get_all().await?;

    if all.is_empty() {
        println!("No configuration set (using defaults)");
        return Ok(());
    }

    let rows: Vec<Vec<String>> = all.iter().map(|(k, v)| vec![k.clone(), v.clone()]).collect();
    print_table(&["Key", "Value"], &rows);
    Ok(())
}

/// Entry point re-invoked by [`WorkerManager`] for each worker process.
async fn worker_run(db: &Path, args: WorkerRunArgs) -> anyhow::Result<()> {
    let store = Arc::new(open_store(db).await?);
    let config = Config::new(store.clone()).await?;
    let executor: Arc<dyn Executor> = Arc::new(ShellExecutor);

    let job_store: Arc<dyn JobStore> = store.clone();
    let registry: Arc<dyn WorkerRegistry> = store.clone();

    let worker = Worker {
        worker_id: args.worker_id,
        store: job_store,
        registry,
        config,
        executor,
        backoff_base: args.base,
        job_limit: args.limit,
    };

    let (tx, rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(s) => s,
            Err(_) => return,
        };
        let mut sigint = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt()) {
            Ok(s) => s,
            Err(_) => return,
        };
        tokio::select! {
            _ = sigterm.recv() => info!("worker received SIGTERM"),
            _ = sigint.recv() => info!("worker received SIGINT"),
        }
        let _ = tx.send(true);
    });

    worker.run(rx).await?;
    Ok(())
}
