//! The long-lived worker loop: acquire, execute, record outcome, heartbeat.
//!
//! One identity per worker (`spec.md` §4.3). Shutdown is cooperative: a
//! `tokio::sync::watch` flag is checked both before the poll sleep and after
//! it, per the Design Notes in `spec.md` §9, so a shutdown request is never
//! missed while the worker is idling between jobs. A job already in flight
//! always runs to completion — there is no mid-job abort path.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::config::Config;
use crate::executor::Executor;
use crate::store::{JobStore, WorkerRegistry};

/// Bytes of stderr kept as `last_error` on failure, per `spec.md` §4.3.
const ERROR_EXCERPT_LEN: usize = 500;

pub struct Worker {
    pub worker_id: String,
    pub store: Arc<dyn JobStore>,
    pub registry: Arc<dyn WorkerRegistry>,
    pub config: Config,
    pub executor: Arc<dyn Executor>,
    pub backoff_base: i64,
    pub job_limit: Option<u64>,
}

impl Worker {
    /// Run the poll/execute/report loop until shutdown or `job_limit` is hit.
    ///
    /// `shutdown` is observed cooperatively; the caller is responsible for
    /// wiring OS signals to it (see `crate::manager::WorkerManager`).
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<u64> {
        self.registry
            .register_worker(&self.worker_id, std::process::id() as i64, Utc::now())
            .await?;
        info!(worker_id = %self.worker_id, "worker started");

        let mut processed = 0u64;
        let result = self.run_loop(&mut shutdown, &mut processed).await;

        self.registry.unregister_worker(&self.worker_id).await?;
        info!(worker_id = %self.worker_id, processed, "worker stopped");
        result.map(|()| processed)
    }

    async fn run_loop(
        &self,
        shutdown: &mut watch::Receiver<bool>,
        processed: &mut u64,
    ) -> anyhow::Result<()> {
        loop {
            if *shutdown.borrow() {
                break;
            }
            if let Some(limit) = self.job_limit {
                if *processed >= limit {
                    info!(worker_id = %self.worker_id, limit, "job limit reached");
                    break;
                }
            }

            match self.store.acquire(&self.worker_id).await {
                Ok(Some(job)) => {
                    info!(
                        worker_id = %self.worker_id,
                        job_id = %job.id,
                        attempt = job.attempts,
                        max_retries = job.max_retries,
                        "processing job"
                    );

                    let timeout_secs = self.config.get_int("job_timeout", 3600).await;
                    let result = self
                        .executor
                        .execute(&job.command, Duration::from_secs(timeout_secs as u64))
                        .await;

                    if result.succeeded() {
                        self.store.complete(&job.id).await?;
                        info!(worker_id = %self.worker_id, job_id = %job.id, "job completed");
                    } else {
                        let error_msg = if !result.stderr.is_empty() {
                            result.stderr.chars().take(ERROR_EXCERPT_LEN).collect()
                        } else {
                            format!("Exit code: {}", result.returncode)
                        };
                        self.store
                            .fail(&job.id, &error_msg, self.backoff_base)
                            .await?;
                        warn!(worker_id = %self.worker_id, job_id = %job.id, error = %error_msg, "job failed");
                    }

                    *processed += 1;
                    self.registry.heartbeat(&self.worker_id, Utc::now()).await?;
                }
                Ok(None) => {
                    let poll_interval = self.config.get_float("poll_interval", 1.0).await;
                    self.registry.heartbeat(&self.worker_id, Utc::now()).await?;
                    if wait_or_shutdown(shutdown, poll_interval).await {
                        break;
                    }
                }
                Err(e) => {
                    // Contention is handled inside the store (returns Ok(None));
                    // anything surfacing here is a genuine storage failure.
                    return Err(e.into());
                }
            }
        }
        Ok(())
    }
}

/// Sleeps for `secs`, waking early if shutdown is requested. Returns `true`
/// if shutdown was observed.
async fn wait_or_shutdown(shutdown: &mut watch::Receiver<bool>, secs: f64) -> bool {
    let sleep = tokio::time::sleep(Duration::from_secs_f64(secs.max(0.0)));
    tokio::select! {
        _ = sleep => *shutdown.borrow(),
        changed = shutdown.changed() => changed.is_err() || *shutdown.borrow(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::ExecutionResult;
    use crate::job::{Job, JobCounts, JobState, NewJob, WorkerInfo};
    use crate::store::{ConfigStore, JobStore, WorkerRegistry};
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;

    /// Minimal single-threaded store double, local to this test module —
    /// `queuectl-testing` can't be a dev-dependency here without creating a
    /// dependency cycle back onto this crate.
    #[derive(Default)]
    struct MockStore {
        jobs: StdMutex<HashMap<String, Job>>,
        config: StdMutex<HashMap<String, String>>,
    }

    #[async_trait::async_trait]
    impl JobStore for MockStore {
        async fn enqueue(&self, job: NewJob, default_max_retries: i64) -> crate::error::Result<bool> {
            let mut jobs = self.jobs.lock().unwrap();
            if jobs.contains_key(&job.id) {
                return Ok(false);
            }
            let now = Utc::now();
            jobs.insert(
                job.id.clone(),
                Job {
                    id: job.id,
                    command: job.command,
                    state: JobState::Pending,
                    attempts: 0,
                    max_retries: job.max_retries.unwrap_or(default_max_retries),
                    created_at: now,
                    updated_at: now,
                    next_run_at: job.next_run_at.unwrap_or(now),
                    last_error: None,
                    locked_by: None,
                    locked_at: None,
                },
            );
            Ok(true)
        }

        async fn acquire(&self, worker_id: &str) -> crate::error::Result<Option<Job>> {
            let mut jobs = self.jobs.lock().unwrap();
            let now = Utc::now();
            let id = jobs
                .values()
                .filter(|j| j.state.is_ready_candidate() && j.next_run_at <= now)
                .min_by_key(|j| j.created_at)
                .map(|j| j.id.clone());
            let Some(id) = id else { return Ok(None) };
            let job = jobs.get_mut(&id).unwrap();
            job.state = JobState::Processing;
            job.locked_by = Some(worker_id.to_string());
            job.attempts += 1;
            Ok(Some(job.clone()))
        }

        async fn complete(&self, job_id: &str) -> crate::error::Result<()> {
            if let Some(job) = self.jobs.lock().unwrap().get_mut(job_id) {
                job.state = JobState::Completed;
                job.locked_by = None;
            }
            Ok(())
        }

        async fn fail(&self, job_id: &str, error: &str, backoff_base: i64) -> crate::error::Result<()> {
            let mut jobs = self.jobs.lock().unwrap();
            let Some(job) = jobs.get_mut(job_id) else { return Ok(()) };
            if job.exhausted() {
                job.state = JobState::Dead;
            } else {
                let delay = backoff_base.pow(job.attempts as u32);
                job.state = JobState::Failed;
                job.next_run_at = Utc::now() + chrono::Duration::seconds(delay);
            }
            job.locked_by = None;
            job.last_error = Some(error.to_string());
            Ok(())
        }

        async fn recover_abandoned(&self, _threshold_seconds: i64) -> crate::error::Result<u64> {
            Ok(0)
        }

        async fn retry_dlq(&self, _job_id: &str, _reset_attempts: bool) -> crate::error::Result<bool> {
            Ok(false)
        }

        async fn delete_dlq(&self, _job_id: &str) -> crate::error::Result<bool> {
            Ok(false)
        }

        async fn get_job(&self, job_id: &str) -> crate::error::Result<Option<Job>> {
            Ok(self.jobs.lock().unwrap().get(job_id).cloned())
        }

        async fn list_jobs(&self, _state: Option<&str>, _limit: i64) -> crate::error::Result<Vec<Job>> {
            Ok(self.jobs.lock().unwrap().values().cloned().collect())
        }

        async fn get_counts(&self) -> crate::error::Result<JobCounts> {
            let mut counts = JobCounts::default();
            for job in self.jobs.lock().unwrap().values() {
                match job.state {
                    JobState::Pending => counts.pending += 1,
                    JobState::Processing => counts.processing += 1,
                    JobState::Completed => counts.completed += 1,
                    JobState::Failed => counts.failed += 1,
                    JobState::Dead => counts.dead += 1,
                }
            }
            Ok(counts)
        }
    }

    #[async_trait::async_trait]
    impl ConfigStore for MockStore {
        async fn get_config(&self, key: &str) -> crate::error::Result<Option<String>> {
            Ok(self.config.lock().unwrap().get(key).cloned())
        }

        async fn set_config(&self, key: &str, value: &str) -> crate::error::Result<()> {
            self.config.lock().unwrap().insert(key.to_string(), value.to_string());
            Ok(())
        }

        async fn get_all_config(&self) -> crate::error::Result<Vec<(String, String)>> {
            Ok(self
                .config
                .lock()
                .unwrap()
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect())
        }
    }

    #[async_trait::async_trait]
    impl WorkerRegistry for MockStore {
        async fn register_worker(&self, _worker_id: &str, _pid: i64, _now: chrono::DateTime<Utc>) -> crate::error::Result<()> {
            Ok(())
        }

        async fn unregister_worker(&self, _worker_id: &str) -> crate::error::Result<()> {
            Ok(())
        }

        async fn heartbeat(&self, _worker_id: &str, _now: chrono::DateTime<Utc>) -> crate::error::Result<()> {
            Ok(())
        }

        async fn list_workers(&self) -> crate::error::Result<Vec<WorkerInfo>> {
            Ok(Vec::new())
        }
    }

    /// Succeeds on commands containing "ok", fails otherwise.
    struct ScriptedExecutor;

    #[async_trait::async_trait]
    impl Executor for ScriptedExecutor {
        async fn execute(&self, command: &str, _timeout: Duration) -> ExecutionResult {
            if command.contains("ok") {
                ExecutionResult {
                    returncode: 0,
                    stdout: "done".into(),
                    stderr: String::new(),
                    duration: Duration::from_millis(1),
                }
            } else {
                ExecutionResult {
                    returncode: 1,
                    stdout: String::new(),
                    stderr: "boom".into(),
                    duration: Duration::from_millis(1),
                }
            }
        }
    }

    async fn worker_with(store: Arc<MockStore>, job_limit: Option<u64>) -> Worker {
        let config = Config::new(store.clone()).await.unwrap();
        Worker {
            worker_id: "test-worker".into(),
            store: store.clone(),
            registry: store,
            config,
            executor: Arc::new(ScriptedExecutor),
            backoff_base: 0,
            job_limit,
        }
    }

    #[tokio::test]
    async fn processes_jobs_until_limit_then_stops() {
        let store = Arc::new(MockStore::default());
        for i in 0..3 {
            store
                .enqueue(
                    NewJob {
                        id: format!("job-{i}"),
                        command: "echo ok".into(),
                        max_retries: None,
                        next_run_at: None,
                    },
                    3,
                )
                .await
                .unwrap();
        }

        let worker = worker_with(store.clone(), Some(2)).await;
        let (_tx, rx) = watch::channel(false);
        let processed = worker.run(rx).await.unwrap();

        assert_eq!(processed, 2);
        let counts = store.get_counts().await.unwrap();
        assert_eq!(counts.completed, 2);
        assert_eq!(counts.pending, 1);
    }

    #[tokio::test]
    async fn failing_job_is_rescheduled_with_stderr_excerpt() {
        let store = Arc::new(MockStore::default());
        store
            .enqueue(
                NewJob {
                    id: "job-1".into(),
                    command: "fail me".into(),
                    max_retries: Some(3),
                    next_run_at: None,
                },
                3,
            )
            .await
            .unwrap();

        let worker = worker_with(store.clone(), Some(1)).await;
        let (_tx, rx) = watch::channel(false);
        worker.run(rx).await.unwrap();

        let job = store.get_job("job-1").await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.last_error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn shutdown_flag_stops_the_loop_when_idle() {
        let store = Arc::new(MockStore::default());
        let worker = worker_with(store, None).await;
        let (tx, rx) = watch::channel(false);
        tx.send(true).unwrap();

        let processed = worker.run(rx).await.unwrap();
        assert_eq!(processed, 0);
    }
}
