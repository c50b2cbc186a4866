use std::fmt::Display;
use std::str::FromStr;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

pub mod spec;

pub use spec::JobSpec;

/// Caller-chosen unique identifier of a job.
#[derive(Debug, Eq, PartialEq, Clone, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl From<&str> for JobId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<String> for JobId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl JobId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The states a job moves through.
///
/// `pending → processing → {completed | pending (retry) | dead}`. A dead job
/// can be revived back to `pending` via the DLQ. The engine no longer parks
/// jobs in `failed` (retry timing is carried by `run_at` instead), but the
/// variant is kept for filtering and for stores written by older versions.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Pending,
    Processing,
    Completed,
    Failed,
    Dead,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Processing => "processing",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Dead => "dead",
        }
    }
}

impl Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobState::Pending),
            "processing" => Ok(JobState::Processing),
            "completed" => Ok(JobState::Completed),
            "failed" => Ok(JobState::Failed),
            "dead" => Ok(JobState::Dead),
            other => Err(format!(
                "unknown state '{other}', expected one of: pending, processing, completed, failed, dead"
            )),
        }
    }
}

/// A unit of work: a shell command plus the metadata tracking it through the
/// state machine.
///
/// Every field is persisted; optional fields serialize as `null` when absent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub command: String,
    pub state: JobState,
    pub attempts: u32,
    pub max_retries: u32,
    pub timeout: u64,
    pub priority: u8,
    pub run_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub locked_by: Option<String>,
    pub locked_at: Option<DateTime<Utc>>,
    pub result: Option<String>,
    pub error: Option<String>,
    pub execution_time: Option<f64>,
}

impl Job {
    /// Whether this job can be handed to a worker right now.
    ///
    /// Pending with no fresh lock, or processing under a lock older than
    /// `stale_before` (a claim whose worker never finished, e.g. after a
    /// crash), and past its `run_at` if one is set.
    pub(crate) fn is_claimable(&self, now: DateTime<Utc>, stale_before: DateTime<Utc>) -> bool {
        let eligible = match self.state {
            JobState::Pending => {
                !(self.locked_by.is_some() && self.locked_at.is_some_and(|at| at >= stale_before))
            }
            JobState::Processing => {
                self.locked_by.is_some() && self.locked_at.is_some_and(|at| at < stale_before)
            }
            _ => false,
        };
        eligible
            && match self.run_at {
                Some(run_at) => run_at <= now,
                None => true,
            }
    }

    pub(crate) fn mark_claimed(&mut self, worker_id: &str, now: DateTime<Utc>) {
        self.state = JobState::Processing;
        self.locked_by = Some(worker_id.to_owned());
        self.locked_at = Some(now);
        self.updated_at = now;
    }

    pub(crate) fn mark_completed(&mut self, result: &str, execution_time: Option<f64>) {
        self.state = JobState::Completed;
        self.locked_by = None;
        self.locked_at = None;
        self.result = Some(result.to_owned());
        self.execution_time = execution_time;
        self.updated_at = Utc::now();
    }

    pub(crate) fn mark_dead(&mut self, error: &str) {
        self.state = JobState::Dead;
        self.locked_by = None;
        self.locked_at = None;
        self.error = Some(error.to_owned());
        self.updated_at = Utc::now();
    }

    pub(crate) fn mark_retryable(&mut self, error: &str, delay: TimeDelta) {
        let now = Utc::now();
        self.state = JobState::Pending;
        self.locked_by = None;
        self.locked_at = None;
        self.error = Some(error.to_owned());
        self.run_at = Some(now + delay);
        self.updated_at = now;
    }

    pub(crate) fn release(&mut self) {
        self.state = JobState::Pending;
        self.locked_by = None;
        self.locked_at = None;
        self.updated_at = Utc::now();
    }

    /// Reset to a fresh pending job, as performed by a DLQ retry.
    pub(crate) fn reset_for_retry(&mut self) {
        self.state = JobState::Pending;
        self.attempts = 0;
        self.locked_by = None;
        self.locked_at = None;
        self.error = None;
        self.run_at = None;
        self.updated_at = Utc::now();
    }
}

/// Terminal snapshot of a job that exhausted its retries, as stored in the
/// dead letter queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadJob {
    #[serde(flatten)]
    pub job: Job,
    pub moved_to_dlq_at: DateTime<Utc>,
}

impl DeadJob {
    pub fn id(&self) -> &JobId {
        &self.job.id
    }
}
