//! The dead letter queue: jobs that exhausted their retry budget.
//!
//! Entries are snapshots of dead jobs plus the time they were moved. The job
//! record itself stays in the job collection (state `dead`) until the entry
//! is retried or purged.

use chrono::Utc;
use serde::Serialize;

use crate::job::{DeadJob, Job, JobId};
use crate::repo::JobRepository;
use crate::store::{FileStore, StoreError};

/// Number of entries included in [`DlqRepository::stats`].
const STATS_RECENT: usize = 10;

#[derive(Debug, Clone, Serialize)]
pub struct DlqStats {
    pub total: usize,
    /// Most recently dead-lettered entries, newest first.
    pub recent: Vec<DeadJob>,
}

#[derive(Clone)]
pub struct DlqRepository {
    store: FileStore,
    jobs: JobRepository,
}

impl DlqRepository {
    pub fn new(store: FileStore, jobs: JobRepository) -> Self {
        Self { store, jobs }
    }

    /// Appends a dead job's snapshot to the DLQ. The job record is left in
    /// place so the id stays viewable until retried or purged.
    pub fn move_to_dlq(&self, job: &Job) -> Result<DeadJob, StoreError> {
        let entry = DeadJob {
            job: job.clone(),
            moved_to_dlq_at: Utc::now(),
        };
        self.store.update_dead_jobs(|dead| dead.push(entry.clone()))?;
        tracing::info!(job_id = %job.id, "job moved to dead letter queue");
        Ok(entry)
    }

    pub fn list_dead_jobs(&self) -> Result<Vec<DeadJob>, StoreError> {
        self.store.dead_jobs()
    }

    pub fn get_dead_job(&self, id: &JobId) -> Result<Option<DeadJob>, StoreError> {
        Ok(self
            .store
            .dead_jobs()?
            .into_iter()
            .find(|entry| entry.id() == id))
    }

    /// Revives a dead job: the record goes back to pending with zero
    /// attempts and the DLQ entry is removed, as one logical unit. Returns
    /// false (mutating nothing) if the id has no DLQ entry.
    pub fn retry_dead_job(&self, id: &JobId) -> Result<bool, StoreError> {
        self.store.update_dead_jobs(|dead| {
            let Some(index) = dead.iter().position(|entry| entry.id() == id) else {
                return Ok(false);
            };
            self.jobs.reactivate(&dead[index].job)?;
            dead.remove(index);
            Ok(true)
        })?
    }

    /// Retries every entry present when the call starts; returns the number
    /// revived. Entries added concurrently are not included.
    pub fn retry_all_dead_jobs(&self) -> Result<usize, StoreError> {
        let snapshot: Vec<JobId> = self
            .store
            .dead_jobs()?
            .into_iter()
            .map(|entry| entry.job.id)
            .collect();
        let mut count = 0;
        for id in &snapshot {
            if self.retry_dead_job(id)? {
                count += 1;
            }
        }
        Ok(count)
    }

    /// Removes one DLQ entry and hard-deletes its job record.
    pub fn delete_dead_job(&self, id: &JobId) -> Result<bool, StoreError> {
        let removed = self.store.update_dead_jobs(|dead| {
            let before = dead.len();
            dead.retain(|entry| entry.id() != id);
            dead.len() != before
        })?;
        if removed {
            self.jobs.delete_job(id)?;
        }
        Ok(removed)
    }

    /// Empties the DLQ and hard-deletes every corresponding job record.
    /// Irreversible. Returns the count purged.
    pub fn purge_all_dead_jobs(&self) -> Result<usize, StoreError> {
        let purged: Vec<JobId> = self
            .store
            .update_dead_jobs(|dead| dead.drain(..).map(|entry| entry.job.id).collect())?;
        for id in &purged {
            self.jobs.delete_job(id)?;
        }
        tracing::info!(count = purged.len(), "purged dead letter queue");
        Ok(purged.len())
    }

    pub fn stats(&self) -> Result<DlqStats, StoreError> {
        let dead = self.store.dead_jobs()?;
        let recent = dead.iter().rev().take(STATS_RECENT).cloned().collect();
        Ok(DlqStats {
            total: dead.len(),
            recent,
        })
    }
}

#[cfg(test)]
mod tests {
    use crate::config::ConfigStore;
    use crate::job::{JobSpec, JobState};

    use super::*;

    fn setup() -> (tempfile::TempDir, JobRepository, DlqRepository) {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        let config = ConfigStore::new(store.clone());
        let jobs = JobRepository::new(store.clone(), config);
        let dlq = DlqRepository::new(store, jobs.clone());
        (dir, jobs, dlq)
    }

    /// Drive a job through claim/fail cycles until it is dead, then move it
    /// to the DLQ, the way a worker loop would.
    fn dead_letter(jobs: &JobRepository, dlq: &DlqRepository, id: &str, max_retries: u32) {
        jobs.create(JobSpec::new(id, "false").with_max_retries(max_retries))
            .unwrap();
        let id: JobId = id.into();
        loop {
            let failed = jobs.fail(&id, "exit code 1").unwrap().unwrap();
            if failed.state == JobState::Dead {
                dlq.move_to_dlq(&failed).unwrap();
                break;
            }
        }
    }

    #[test]
    fn exhausted_job_lands_in_the_dlq() {
        let (_dir, jobs, dlq) = setup();
        jobs.create(JobSpec::new("j1", "false").with_max_retries(2))
            .unwrap();
        let id: JobId = "j1".into();

        jobs.claim_next("w").unwrap().unwrap();
        jobs.fail(&id, "boom").unwrap().unwrap();
        let second = jobs.fail(&id, "boom").unwrap().unwrap();
        assert_eq!(second.state, JobState::Dead);
        assert_eq!(second.attempts, 2);

        dlq.move_to_dlq(&second).unwrap();
        let dead = dlq.list_dead_jobs().unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].id(), &id);
        assert_eq!(dead[0].job.state, JobState::Dead);

        // The record is still viewable by id while in the DLQ.
        assert_eq!(jobs.get(&id).unwrap().unwrap().state, JobState::Dead);
    }

    #[test]
    fn retry_revives_and_the_job_is_claimable_again() {
        let (_dir, jobs, dlq) = setup();
        dead_letter(&jobs, &dlq, "j1", 1);
        let id: JobId = "j1".into();

        assert!(dlq.retry_dead_job(&id).unwrap());
        assert!(dlq.list_dead_jobs().unwrap().is_empty());

        let revived = jobs.get(&id).unwrap().unwrap();
        assert_eq!(revived.state, JobState::Pending);
        assert_eq!(revived.attempts, 0);
        assert_eq!(revived.locked_by, None);
        assert_eq!(revived.locked_at, None);
        assert_eq!(revived.error, None);
        assert_eq!(revived.run_at, None);

        let claimed = jobs.claim_next("w").unwrap().unwrap();
        assert_eq!(claimed.id, id);
    }

    #[test]
    fn get_dead_job_finds_entries_by_id() {
        let (_dir, jobs, dlq) = setup();
        dead_letter(&jobs, &dlq, "j1", 1);

        let entry = dlq.get_dead_job(&"j1".into()).unwrap().unwrap();
        assert_eq!(entry.job.state, JobState::Dead);
        assert!(dlq.get_dead_job(&"ghost".into()).unwrap().is_none());
    }

    #[test]
    fn retry_of_unknown_id_mutates_nothing() {
        let (_dir, jobs, dlq) = setup();
        dead_letter(&jobs, &dlq, "j1", 1);

        assert!(!dlq.retry_dead_job(&"ghost".into()).unwrap());
        assert_eq!(dlq.list_dead_jobs().unwrap().len(), 1);
        assert_eq!(
            jobs.get(&"j1".into()).unwrap().unwrap().state,
            JobState::Dead
        );
    }

    #[test]
    fn retry_recreates_a_missing_job_record() {
        let (_dir, jobs, dlq) = setup();
        dead_letter(&jobs, &dlq, "j1", 1);
        let id: JobId = "j1".into();
        jobs.delete_job(&id).unwrap();

        assert!(dlq.retry_dead_job(&id).unwrap());
        let revived = jobs.get(&id).unwrap().unwrap();
        assert_eq!(revived.state, JobState::Pending);
        assert_eq!(revived.attempts, 0);
    }

    #[test]
    fn retry_all_counts_successes() {
        let (_dir, jobs, dlq) = setup();
        dead_letter(&jobs, &dlq, "a", 1);
        dead_letter(&jobs, &dlq, "b", 1);
        dead_letter(&jobs, &dlq, "c", 1);

        assert_eq!(dlq.retry_all_dead_jobs().unwrap(), 3);
        assert!(dlq.list_dead_jobs().unwrap().is_empty());
        assert_eq!(jobs.list_by_state(JobState::Pending).unwrap().len(), 3);
    }

    #[test]
    fn purge_removes_entries_and_records() {
        let (_dir, jobs, dlq) = setup();
        dead_letter(&jobs, &dlq, "a", 1);
        dead_letter(&jobs, &dlq, "b", 1);

        assert_eq!(dlq.purge_all_dead_jobs().unwrap(), 2);
        assert!(dlq.list_dead_jobs().unwrap().is_empty());
        assert!(jobs.get(&"a".into()).unwrap().is_none());
        assert!(jobs.get(&"b".into()).unwrap().is_none());
    }

    #[test]
    fn delete_dead_job_removes_entry_and_record() {
        let (_dir, jobs, dlq) = setup();
        dead_letter(&jobs, &dlq, "a", 1);
        dead_letter(&jobs, &dlq, "b", 1);

        assert!(dlq.delete_dead_job(&"a".into()).unwrap());
        assert!(!dlq.delete_dead_job(&"a".into()).unwrap());
        assert_eq!(dlq.list_dead_jobs().unwrap().len(), 1);
        assert!(jobs.get(&"a".into()).unwrap().is_none());
        assert!(jobs.get(&"b".into()).unwrap().is_some());
    }

    #[test]
    fn stats_report_newest_first() {
        let (_dir, jobs, dlq) = setup();
        for i in 0..12 {
            dead_letter(&jobs, &dlq, &format!("job-{i}"), 1);
        }

        let stats = dlq.stats().unwrap();
        assert_eq!(stats.total, 12);
        assert_eq!(stats.recent.len(), 10);
        assert_eq!(stats.recent[0].id().as_str(), "job-11");
        assert_eq!(stats.recent[9].id().as_str(), "job-2");
    }
}
