//! The worker pool: N concurrent polling loops claiming and executing jobs.
//!
//! Each loop claims through the job repository, runs the command through the
//! process executor, and feeds the outcome back: success completes the job,
//! failure goes through the retry policy and may hand the job to the DLQ.
//! Shutdown is cooperative: a cancellation token is observed at poll
//! boundaries and every loop finishes its in-flight job first.

use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::dlq::DlqRepository;
use crate::executor::run_command;
use crate::job::{Job, JobState};
use crate::repo::JobRepository;
use crate::store::{FileStore, StoreError, WorkerInfo, WorkerRegistry};
use crate::QueueError;

pub const MIN_WORKERS: usize = 1;
pub const MAX_WORKERS: usize = 10;

/// Idle wait between polls when no job is available.
const POLL_INTERVAL: Duration = Duration::from_secs(1);
/// Wait after a store error before polling again.
const ERROR_BACKOFF: Duration = Duration::from_secs(2);

/// Point-in-time view of the pool, sourced from in-memory state.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStatus {
    pub running: bool,
    pub count: usize,
    pub started_at: Option<DateTime<Utc>>,
    pub workers: Vec<WorkerInfo>,
}

struct Running {
    token: CancellationToken,
    handles: Vec<JoinHandle<()>>,
    workers: Vec<WorkerInfo>,
    started_at: DateTime<Utc>,
}

pub struct WorkerPool {
    store: FileStore,
    repo: JobRepository,
    dlq: DlqRepository,
    state: Mutex<Option<Running>>,
}

impl WorkerPool {
    pub fn new(store: FileStore, repo: JobRepository, dlq: DlqRepository) -> Self {
        Self {
            store,
            repo,
            dlq,
            state: Mutex::new(None),
        }
    }

    /// Spawns `count` worker loops (1 to 10) and mirrors their descriptors
    /// to the worker registry. Starting an already-running pool warns and
    /// does nothing.
    pub fn start(&self, count: usize) -> Result<(), QueueError> {
        if !(MIN_WORKERS..=MAX_WORKERS).contains(&count) {
            return Err(QueueError::InvalidWorkerCount(count));
        }
        let mut state = self
            .state
            .lock()
            .map_err(|_| StoreError::BadState)?;
        if state.is_some() {
            tracing::warn!("workers are already running, ignoring start");
            return Ok(());
        }

        let token = CancellationToken::new();
        let started_at = Utc::now();
        let pid = std::process::id();
        let mut workers = Vec::with_capacity(count);
        let mut handles = Vec::with_capacity(count);
        for index in 1..=count {
            let id = format!("worker-{index}-{}", started_at.timestamp_millis());
            workers.push(WorkerInfo {
                id: id.clone(),
                index,
                pid,
                started_at,
            });
            handles.push(tokio::spawn(worker_loop(
                id,
                self.repo.clone(),
                self.dlq.clone(),
                token.clone(),
            )));
        }

        // The registry is an informational mirror; failing to write it does
        // not stop the pool.
        let registry = WorkerRegistry {
            workers: workers.clone(),
            pids: workers.iter().map(|w| w.pid).collect(),
            count,
            started_at: Some(started_at),
        };
        if let Err(err) = self.store.write_workers(&registry) {
            tracing::warn!(?err, "failed to mirror worker registry: {err}");
        }

        *state = Some(Running {
            token,
            handles,
            workers,
            started_at,
        });
        tracing::info!("started {count} worker(s)");
        Ok(())
    }

    /// Signals every loop to stop, waits for each to finish its in-flight
    /// job and exit, then clears the registry snapshot.
    pub async fn stop(&self) -> Result<(), QueueError> {
        let running = self
            .state
            .lock()
            .map_err(|_| StoreError::BadState)?
            .take();
        let Some(running) = running else {
            tracing::warn!("no workers are running");
            return Ok(());
        };

        tracing::info!("stopping workers gracefully");
        running.token.cancel();
        for result in join_all(running.handles).await {
            if let Err(err) = result {
                tracing::error!(?err, "worker task failed to join: {err}");
            }
        }
        self.store.write_workers(&WorkerRegistry::default())?;
        tracing::info!("all workers stopped");
        Ok(())
    }

    /// Reports from in-memory state, never from the persisted mirror: the
    /// mirror does not reflect other processes and may be stale.
    pub fn status(&self) -> Result<PoolStatus, QueueError> {
        let state = self
            .state
            .lock()
            .map_err(|_| StoreError::BadState)?;
        Ok(match state.as_ref() {
            Some(running) => PoolStatus {
                running: true,
                count: running.workers.len(),
                started_at: Some(running.started_at),
                workers: running.workers.clone(),
            },
            None => PoolStatus {
                running: false,
                count: 0,
                started_at: None,
                workers: Vec::new(),
            },
        })
    }
}

async fn worker_loop(
    id: String,
    repo: JobRepository,
    dlq: DlqRepository,
    token: CancellationToken,
) {
    tracing::info!(worker = %id, "worker started");
    loop {
        if token.is_cancelled() {
            break;
        }
        match repo.claim_next(&id) {
            Ok(Some(job)) => process_job(&id, job, &repo, &dlq).await,
            Ok(None) => {
                tokio::select! {
                    _ = tokio::time::sleep(POLL_INTERVAL) => {}
                    _ = token.cancelled() => break,
                }
            }
            Err(err) => {
                tracing::error!(worker = %id, ?err, "error polling for jobs: {err}");
                tokio::select! {
                    _ = tokio::time::sleep(ERROR_BACKOFF) => {}
                    _ = token.cancelled() => break,
                }
            }
        }
    }
    tracing::info!(worker = %id, "worker stopped");
}

async fn process_job(worker_id: &str, job: Job, repo: &JobRepository, dlq: &DlqRepository) {
    tracing::info!(
        worker = %worker_id,
        job_id = %job.id,
        attempt = job.attempts + 1,
        max_retries = job.max_retries,
        priority = job.priority,
        timeout = job.timeout,
        "processing job: {}",
        job.command,
    );

    let output = run_command(&job.command, job.timeout).await;

    if output.success {
        tracing::info!(
            worker = %worker_id,
            job_id = %job.id,
            "job completed in {:.2}s",
            output.execution_time,
        );
        if let Err(err) = repo.complete(&job.id, &output.stdout, Some(output.execution_time)) {
            tracing::error!(job_id = %job.id, ?err, "failed to record completion: {err}");
        }
        return;
    }

    let reason = if output.timed_out {
        "timeout".to_owned()
    } else {
        format!("exit code {}", output.exit_code)
    };
    tracing::warn!(
        worker = %worker_id,
        job_id = %job.id,
        "job failed ({reason}) after {:.2}s",
        output.execution_time,
    );

    match repo.fail(&job.id, &output.error_message()) {
        Ok(Some(updated)) => match updated.state {
            JobState::Dead => {
                if let Err(err) = dlq.move_to_dlq(&updated) {
                    tracing::error!(job_id = %updated.id, ?err, "failed to dead-letter job: {err}");
                }
            }
            JobState::Pending | JobState::Failed => {
                // Informational only: re-eligibility is governed by run_at.
                let delay = updated
                    .run_at
                    .map(|at| (at - Utc::now()).num_seconds().max(0))
                    .unwrap_or(0);
                tracing::info!(
                    job_id = %updated.id,
                    attempt = updated.attempts,
                    max_retries = updated.max_retries,
                    "job will be retried after ~{delay}s backoff",
                );
            }
            other => {
                tracing::warn!(job_id = %updated.id, state = %other, "unexpected state after failure");
            }
        },
        Ok(None) => {
            tracing::warn!(job_id = %job.id, "job disappeared while recording failure");
        }
        Err(err) => {
            tracing::error!(job_id = %job.id, ?err, "failed to record failure: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use crate::config::ConfigStore;
    use crate::job::{JobId, JobSpec};

    use super::*;

    fn pool() -> (tempfile::TempDir, JobRepository, DlqRepository, WorkerPool) {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        let config = ConfigStore::new(store.clone());
        let repo = JobRepository::new(store.clone(), config);
        let dlq = DlqRepository::new(store.clone(), repo.clone());
        let pool = WorkerPool::new(store, repo.clone(), dlq.clone());
        (dir, repo, dlq, pool)
    }

    async fn wait_until(mut check: impl FnMut() -> bool) {
        for _ in 0..100 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        panic!("condition not reached within 10s");
    }

    #[tokio::test]
    async fn start_rejects_out_of_range_counts() {
        let (_dir, _repo, _dlq, pool) = pool();
        assert_matches!(pool.start(0), Err(QueueError::InvalidWorkerCount(0)));
        assert_matches!(pool.start(11), Err(QueueError::InvalidWorkerCount(11)));
        assert!(!pool.status().unwrap().running);
    }

    #[tokio::test]
    async fn double_start_is_a_no_op() {
        let (_dir, _repo, _dlq, pool) = pool();
        pool.start(2).unwrap();
        pool.start(5).unwrap();
        let status = pool.status().unwrap();
        assert!(status.running);
        assert_eq!(status.count, 2);
        pool.stop().await.unwrap();
    }

    #[tokio::test]
    async fn stop_without_start_is_a_no_op() {
        let (_dir, _repo, _dlq, pool) = pool();
        pool.stop().await.unwrap();
        assert!(!pool.status().unwrap().running);
    }

    #[tokio::test]
    async fn workers_complete_a_job() {
        let (_dir, repo, _dlq, pool) = pool();
        repo.create(JobSpec::new("j1", "echo hello")).unwrap();
        let id: JobId = "j1".into();

        pool.start(2).unwrap();
        wait_until(|| {
            repo.get(&id)
                .unwrap()
                .is_some_and(|job| job.state == JobState::Completed)
        })
        .await;
        pool.stop().await.unwrap();

        let job = repo.get(&id).unwrap().unwrap();
        assert_eq!(job.result.as_deref(), Some("hello"));
        assert!(job.execution_time.is_some());
        assert_eq!(job.locked_by, None);
    }

    #[tokio::test]
    async fn failing_job_is_dead_lettered() {
        let (_dir, repo, dlq, pool) = pool();
        repo.create(JobSpec::new("j1", "echo oops >&2; exit 1").with_max_retries(1))
            .unwrap();
        let id: JobId = "j1".into();

        pool.start(1).unwrap();
        wait_until(|| !dlq.list_dead_jobs().unwrap().is_empty()).await;
        pool.stop().await.unwrap();

        let job = repo.get(&id).unwrap().unwrap();
        assert_eq!(job.state, JobState::Dead);
        assert_eq!(job.attempts, 1);
        assert_eq!(job.error.as_deref(), Some("oops"));
        assert_eq!(dlq.list_dead_jobs().unwrap()[0].id(), &id);
    }

    #[tokio::test]
    async fn stop_finishes_the_in_flight_job() {
        let (_dir, repo, _dlq, pool) = pool();
        repo.create(JobSpec::new("slow", "sleep 0.4; echo done")).unwrap();
        let id: JobId = "slow".into();

        pool.start(1).unwrap();
        wait_until(|| {
            repo.get(&id)
                .unwrap()
                .is_some_and(|job| job.state == JobState::Processing)
        })
        .await;

        pool.stop().await.unwrap();
        let job = repo.get(&id).unwrap().unwrap();
        assert_eq!(job.state, JobState::Completed);
        assert_eq!(job.result.as_deref(), Some("done"));
    }

    #[tokio::test]
    async fn registry_mirrors_start_and_stop() {
        let (_dir, _repo, _dlq, pool) = pool();
        pool.start(3).unwrap();

        let registry = pool.store.workers().unwrap();
        assert_eq!(registry.count, 3);
        assert_eq!(registry.workers.len(), 3);
        assert!(registry.workers[0].id.starts_with("worker-1-"));

        pool.stop().await.unwrap();
        let registry = pool.store.workers().unwrap();
        assert_eq!(registry.count, 0);
        assert!(registry.workers.is_empty());
    }
}
