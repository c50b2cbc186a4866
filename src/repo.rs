//! The job repository: CRUD, the atomic claim, and the retry outcome policy.
//!
//! Every mutation goes through the store's atomic read-modify-write, which is
//! the single synchronization point between worker loops. `claim_next`
//! linearizes concurrent claims: for any eligible job, exactly one caller
//! observes and consumes it.

use chrono::{TimeDelta, Utc};
use serde::Serialize;

use crate::backoff::Exponential;
use crate::config::ConfigStore;
use crate::job::{Job, JobId, JobSpec, JobState};
use crate::store::{FileStore, StoreError};
use crate::QueueError;

/// A processing-state lock older than this is considered abandoned and its
/// job reclaimable by another worker.
pub const STALE_LOCK: TimeDelta = TimeDelta::minutes(5);

const DEFAULT_TIMEOUT_SECS: u64 = 30;
const DEFAULT_PRIORITY: u8 = 3;
/// Highest priority. Lower numbers are scheduled first.
const PRIORITY_MIN: u8 = 1;
/// Lowest priority.
const PRIORITY_MAX: u8 = 5;

/// Counts of jobs per state.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Serialize)]
pub struct QueueStats {
    pub total: usize,
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub dead: usize,
}

#[derive(Clone)]
pub struct JobRepository {
    store: FileStore,
    config: ConfigStore,
}

impl JobRepository {
    pub fn new(store: FileStore, config: ConfigStore) -> Self {
        Self { store, config }
    }

    /// Creates a pending job from `spec`.
    ///
    /// `max_retries` defaults from config when unset. Priority is clamped
    /// into 1..=5 so an out-of-range value cannot outrank legitimately
    /// prioritized jobs. Fails with [`QueueError::DuplicateJob`] if the id
    /// is already taken, leaving the existing record untouched.
    pub fn create(&self, spec: JobSpec) -> Result<Job, QueueError> {
        if spec.id.is_empty() {
            return Err(QueueError::MissingField("id"));
        }
        if spec.command.trim().is_empty() {
            return Err(QueueError::MissingField("command"));
        }
        let max_retries = match spec.max_retries {
            Some(retries) => retries,
            None => self.config.max_retries()?,
        };
        let now = Utc::now();
        let job = Job {
            id: spec.id,
            command: spec.command,
            state: JobState::Pending,
            attempts: 0,
            max_retries,
            timeout: spec.timeout.unwrap_or(DEFAULT_TIMEOUT_SECS),
            priority: spec
                .priority
                .unwrap_or(DEFAULT_PRIORITY)
                .clamp(PRIORITY_MIN, PRIORITY_MAX),
            run_at: spec.run_at,
            created_at: now,
            updated_at: now,
            locked_by: None,
            locked_at: None,
            result: None,
            error: None,
            execution_time: None,
        };
        self.store.update_jobs(move |jobs| {
            if jobs.iter().any(|existing| existing.id == job.id) {
                Err(QueueError::DuplicateJob(job.id))
            } else {
                jobs.push(job.clone());
                Ok(job)
            }
        })?
    }

    pub fn get(&self, id: &JobId) -> Result<Option<Job>, StoreError> {
        Ok(self.store.jobs()?.into_iter().find(|job| &job.id == id))
    }

    pub fn list_all(&self) -> Result<Vec<Job>, StoreError> {
        self.store.jobs()
    }

    pub fn list_by_state(&self, state: JobState) -> Result<Vec<Job>, StoreError> {
        Ok(self
            .store
            .jobs()?
            .into_iter()
            .filter(|job| job.state == state)
            .collect())
    }

    /// Claims the next eligible job for `worker_id`, or `None` if nothing is
    /// runnable right now.
    ///
    /// Eligible: pending without a fresh lock (or processing under a stale
    /// one), and past `run_at`. Among eligible jobs the minimum by
    /// (priority, created_at) wins. The selected job comes back already
    /// marked processing and locked.
    pub fn claim_next(&self, worker_id: &str) -> Result<Option<Job>, StoreError> {
        let now = Utc::now();
        let stale_before = now - STALE_LOCK;
        self.store.update_jobs(|jobs| {
            let next = jobs
                .iter()
                .enumerate()
                .filter(|(_, job)| job.is_claimable(now, stale_before))
                .min_by(|(_, a), (_, b)| {
                    a.priority
                        .cmp(&b.priority)
                        .then(a.created_at.cmp(&b.created_at))
                })
                .map(|(index, _)| index);
            next.map(|index| {
                let job = &mut jobs[index];
                job.mark_claimed(worker_id, now);
                tracing::debug!(job_id = %job.id, %worker_id, "claimed job");
                job.clone()
            })
        })
    }

    /// Forces a job back to pending and clears its lock, without touching the
    /// attempt counter. Returns false for an unknown id.
    pub fn release_lock(&self, id: &JobId) -> Result<bool, StoreError> {
        self.store.update_jobs(|jobs| {
            match jobs.iter_mut().find(|job| &job.id == id) {
                Some(job) => {
                    job.release();
                    true
                }
                None => false,
            }
        })
    }

    /// Atomic increment; returns the new attempt count, or `None` for an
    /// unknown id.
    pub fn increment_attempts(&self, id: &JobId) -> Result<Option<u32>, StoreError> {
        self.store.update_jobs(|jobs| {
            jobs.iter_mut().find(|job| &job.id == id).map(|job| {
                job.attempts += 1;
                job.updated_at = Utc::now();
                job.attempts
            })
        })
    }

    /// Marks a job completed, storing its output and measured execution time.
    pub fn complete(
        &self,
        id: &JobId,
        result: &str,
        execution_time: Option<f64>,
    ) -> Result<Option<Job>, StoreError> {
        self.store.update_jobs(|jobs| {
            jobs.iter_mut().find(|job| &job.id == id).map(|job| {
                job.mark_completed(result, execution_time);
                job.clone()
            })
        })
    }

    /// The failure outcome policy.
    ///
    /// Increments the attempt counter, then either dead-letters the job (the
    /// new count has reached `max_retries`) or returns it to pending with
    /// `run_at` pushed `backoff_base ^ attempts` seconds into the future.
    /// Returns the post-transition record so the caller can branch on the
    /// resulting state; a dead result is the caller's cue to move the
    /// snapshot into the DLQ.
    pub fn fail(&self, id: &JobId, error: &str) -> Result<Option<Job>, StoreError> {
        let backoff = Exponential::new(self.config.backoff_base()?);
        self.store.update_jobs(|jobs| {
            jobs.iter_mut().find(|job| &job.id == id).map(|job| {
                job.attempts += 1;
                if job.attempts >= job.max_retries {
                    job.mark_dead(error);
                    tracing::warn!(job_id = %job.id, attempts = job.attempts, "job exhausted retries");
                } else {
                    let delay = backoff.backoff(job.attempts);
                    job.mark_retryable(error, delay);
                    tracing::info!(job_id = %job.id, attempts = job.attempts, "job failed, retrying in {delay}");
                }
                job.clone()
            })
        })
    }

    pub fn queue_stats(&self) -> Result<QueueStats, StoreError> {
        let jobs = self.store.jobs()?;
        let mut stats = QueueStats {
            total: jobs.len(),
            ..Default::default()
        };
        for job in &jobs {
            match job.state {
                JobState::Pending => stats.pending += 1,
                JobState::Processing => stats.processing += 1,
                JobState::Completed => stats.completed += 1,
                JobState::Failed => stats.failed += 1,
                JobState::Dead => stats.dead += 1,
            }
        }
        Ok(stats)
    }

    /// Hard-deletes a job record. Returns false for an unknown id.
    pub fn delete_job(&self, id: &JobId) -> Result<bool, StoreError> {
        self.store.update_jobs(|jobs| {
            let before = jobs.len();
            jobs.retain(|job| &job.id != id);
            jobs.len() != before
        })
    }

    pub fn clear_all(&self) -> Result<(), StoreError> {
        self.store.update_jobs(Vec::clear)
    }

    /// Re-activates a dead job as part of a DLQ retry: pending, zero
    /// attempts, lock and error cleared. If the record went missing
    /// out-of-band it is recreated from the DLQ snapshot, so the retry never
    /// half-applies.
    pub(crate) fn reactivate(&self, snapshot: &Job) -> Result<(), StoreError> {
        self.store.update_jobs(|jobs| {
            match jobs.iter_mut().find(|job| job.id == snapshot.id) {
                Some(job) => job.reset_for_retry(),
                None => {
                    let mut job = snapshot.clone();
                    job.reset_for_retry();
                    jobs.push(job);
                }
            }
        })
    }
}
