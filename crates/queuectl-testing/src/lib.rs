//! In-memory [`queuectl_core::JobStore`]/[`ConfigStore`]/[`WorkerRegistry`]
//! for exercising the dispatch/retry engine without a real database.
//!
//! Mirrors the pack's `seesaw-testing` crate: a small, dependency-light
//! harness crate separate from the production code it tests. `acquire` uses
//! `try_lock` rather than blocking, the in-memory analogue of SQLite's
//! `BEGIN IMMEDIATE` contention behavior — a racing `acquire` returns `None`
//! rather than waiting.

use std::collections::HashMap;
use std::sync::Mutex as StdMutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use queuectl_core::error::Result;
use queuectl_core::job::{Job, JobCounts, JobState, NewJob, WorkerInfo};
use queuectl_core::store::{ConfigStore, JobStore, WorkerRegistry};

#[derive(Default)]
struct State {
    jobs: HashMap<String, Job>,
    config: HashMap<String, String>,
    workers: HashMap<String, WorkerInfo>,
}

/// An in-process, single-machine stand-in for a real job store.
///
/// Cheap to clone: internally an `Arc<Mutex<_>>`.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    state: std::sync::Arc<StdMutex<State>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for InMemoryStore {
    async fn enqueue(&self, job: NewJob, default_max_retries: i64) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        if state.jobs.contains_key(&job.id) {
            return Ok(false);
        }
        let now = Utc::now();
        state.jobs.insert(
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

    async fn acquire(&self, worker_id: &str) -> Result<Option<Job>> {
        let Ok(mut state) = self.state.try_lock() else {
            return Ok(None);
        };
        let now = Utc::now();
        let candidate_id = state
            .jobs
            .values()
            .filter(|j| j.state.is_ready_candidate() && j.next_run_at <= now)
            .min_by_key(|j| j.created_at)
            .map(|j| j.id.clone());

        let Some(id) = candidate_id else {
            return Ok(None);
        };
        let job = state.jobs.get_mut(&id).expect("candidate id came from map");
        job.state = JobState::Processing;
        job.locked_by = Some(worker_id.to_string());
        job.locked_at = Some(now);
        job.attempts += 1;
        job.updated_at = now;
        Ok(Some(job.clone()))
    }

    async fn complete(&self, job_id: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(job) = state.jobs.get_mut(job_id) {
            job.state = JobState::Completed;
            job.locked_by = None;
            job.locked_at = None;
            job.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn fail(&self, job_id: &str, error: &str, backoff_base: i64) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let Some(job) = state.jobs.get_mut(job_id) else {
            return Ok(());
        };
        let now = Utc::now();
        if job.exhausted() {
            job.state = JobState::Dead;
            job.locked_by = None;
            job.locked_at = None;
        } else {
            let delay = backoff_base.pow(job.attempts as u32);
            job.state = JobState::Failed;
            job.next_run_at = now + chrono::Duration::seconds(delay);
            job.locked_by = None;
            job.locked_at = None;
        }
        job.last_error = Some(error.to_string());
        job.updated_at = now;
        Ok(())
    }

    async fn recover_abandoned(&self, threshold_seconds: i64) -> Result<u64> {
        let mut state = self.state.lock().unwrap();
        let cutoff = Utc::now() - chrono::Duration::seconds(threshold_seconds);
        let mut recovered = 0;
        for job in state.jobs.values_mut() {
            if job.state == JobState::Processing && job.locked_at.map(|t| t < cutoff).unwrap_or(false) {
                job.state = JobState::Pending;
                job.locked_by = None;
                job.locked_at = None;
                recovered += 1;
            }
        }
        Ok(recovered)
    }

    async fn retry_dlq(&self, job_id: &str, reset_attempts: bool) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        let Some(job) = state.jobs.get_mut(job_id) else {
            return Ok(false);
        };
        if job.state != JobState::Dead {
            return Ok(false);
        }
        job.state = JobState::Pending;
        job.next_run_at = Utc::now();
        job.updated_at = Utc::now();
        job.last_error = None;
        if reset_attempts {
            job.attempts = 0;
        }
        Ok(true)
    }

    async fn delete_dlq(&self, job_id: &str) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        match state.jobs.get(job_id) {
            Some(job) if job.state == JobState::Dead => {
                state.jobs.remove(job_id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get_job(&self, job_id: &str) -> Result<Option<Job>> {
        Ok(self.state.lock().unwrap().jobs.get(job_id).cloned())
    }

    async fn list_jobs(&self, state: Option<&str>, limit: i64) -> Result<Vec<Job>> {
        let guard = self.state.lock().unwrap();
        let mut jobs: Vec<Job> = guard
            .jobs
            .values()
            .filter(|j| state.map(|s| j.state.as_str() == s).unwrap_or(true))
            .cloned()
            .collect();
        jobs.sort_by_key(|j| std::cmp::Reverse(j.created_at));
        jobs.truncate(limit.max(0) as usize);
        Ok(jobs)
    }

    async fn get_counts(&self) -> Result<JobCounts> {
        let guard = self.state.lock().unwrap();
        let mut counts = JobCounts::default();
        for job in guard.jobs.values() {
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

#[async_trait]
impl ConfigStore for InMemoryStore {
    async fn get_config(&self, key: &str) -> Result<Option<String>> {
        Ok(self.state.lock().unwrap().config.get(key).cloned())
    }

    async fn set_config(&self, key: &str, value: &str) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .config
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn get_all_config(&self) -> Result<Vec<(String, String)>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .config
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

#[async_trait]
impl WorkerRegistry for InMemoryStore {
    async fn register_worker(&self, worker_id: &str, pid: i64, now: DateTime<Utc>) -> Result<()> {
        self.state.lock().unwrap().workers.insert(
            worker_id.to_string(),
            WorkerInfo {
                worker_id: worker_id.to_string(),
                pid,
                started_at: now,
                last_heartbeat: now,
            },
        );
        Ok(())
    }

    async fn unregister_worker(&self, worker_id: &str) -> Result<()> {
        self.state.lock().unwrap().workers.remove(worker_id);
        Ok(())
    }

    async fn heartbeat(&self, worker_id: &str, now: DateTime<Utc>) -> Result<()> {
        if let Some(w) = self.state.lock().unwrap().workers.get_mut(worker_id) {
            w.last_heartbeat = now;
        }
        Ok(())
    }

    async fn list_workers(&self) -> Result<Vec<WorkerInfo>> {
        Ok(self.state.lock().unwrap().workers.values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[tokio::test]
    async fn acquire_is_exclusive_and_bumps_attempts() {
        let store = InMemoryStore::new();
        store
            .enqueue(
                NewJob {
                    id: "j1".into(),
                    command: "true".into(),
                    max_retries: None,
                    next_run_at: None,
                },
                3,
            )
            .await
            .unwrap();

        let job = store.acquire("w1").await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Processing);
        assert_eq!(job.attempts, 1);
        assert!(store.acquire("w2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn fail_exhausts_retry_budget_into_dead() {
        let store = InMemoryStore::new();
        store
            .enqueue(
                NewJob {
                    id: "j1".into(),
                    command: "false".into(),
                    max_retries: Some(2),
                    next_run_at: None,
                },
                3,
            )
            .await
            .unwrap();

        let job = store.acquire("w1").await.unwrap().unwrap();
        assert_eq!(job.attempts, 1);
        store.fail(&job.id, "boom", 0).await.unwrap();
        assert_eq!(
            store.get_job(&job.id).await.unwrap().unwrap().state,
            JobState::Failed
        );

        let job = store.acquire("w1").await.unwrap().unwrap();
        assert_eq!(job.attempts, 2);
        store.fail(&job.id, "boom again", 0).await.unwrap();
        assert_eq!(
            store.get_job(&job.id).await.unwrap().unwrap().state,
            JobState::Failed
        );

        let job = store.acquire("w1").await.unwrap().unwrap();
        assert_eq!(job.attempts, 3);
        store.fail(&job.id, "boom a third time", 0).await.unwrap();
        assert_eq!(
            store.get_job(&job.id).await.unwrap().unwrap().state,
            JobState::Dead
        );
    }

    #[tokio::test]
    async fn recover_abandoned_requeues_stale_lease() {
        let store = InMemoryStore::new();
        store
            .enqueue(
                NewJob {
                    id: "j1".into(),
                    command: "true".into(),
                    max_retries: None,
                    next_run_at: None,
                },
                3,
            )
            .await
            .unwrap();
        store.acquire("dead-worker").await.unwrap();

        assert_eq!(store.recover_abandoned(3600).await.unwrap(), 0);
        assert_eq!(store.recover_abandoned(0).await.unwrap(), 1);
        assert_eq!(
            store.get_job("j1").await.unwrap().unwrap().state,
            JobState::Pending
        );
    }

    /// Concurrent `acquire` calls against the shared mutex must never hand
    /// the same job to two workers, mirroring the SQLite backend's
    /// `BEGIN IMMEDIATE` contention guarantee.
    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn concurrent_acquire_never_double_claims() {
        const JOBS: usize = 200;
        const WORKERS: usize = 16;

        let store = InMemoryStore::new();
        for i in 0..JOBS {
            store
                .enqueue(
                    NewJob {
                        id: format!("job-{i}"),
                        command: "true".into(),
                        max_retries: None,
                        next_run_at: None,
                    },
                    3,
                )
                .await
                .unwrap();
        }

        let claimed = Arc::new(std::sync::Mutex::new(HashSet::new()));
        let mut workers = tokio::task::JoinSet::new();
        for w in 0..WORKERS {
            let store = store.clone();
            let claimed = claimed.clone();
            workers.spawn(async move {
                let worker_id = format!("worker-{w}");
                loop {
                    match store.acquire(&worker_id).await.unwrap() {
                        Some(job) => {
                            let inserted = claimed.lock().unwrap().insert(job.id.clone());
                            assert!(inserted, "double-claimed job {}", job.id);
                            store.complete(&job.id).await.unwrap();
                        }
                        None => {
                            let counts = store.get_counts().await.unwrap();
                            if counts.pending == 0 && counts.processing == 0 {
                                break;
                            }
                            tokio::task::yield_now().await;
                        }
                    }
                }
            });
        }

        while workers.join_next().await.is_some() {}
        assert_eq!(claimed.lock().unwrap().len(), JOBS);
        assert_eq!(store.get_counts().await.unwrap().completed, JOBS as i64);
    }
}
