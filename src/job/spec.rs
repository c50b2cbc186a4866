use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;

use super::JobId;

/// Input for enqueuing a job.
///
/// Only `id` and `command` are required; everything else falls back to the
/// queue defaults when unset. Deserializable so the CLI can accept a job as a
/// JSON document.
///
/// ```
/// # use queuectl::job::JobSpec;
/// let spec = JobSpec::new("backup", "tar -czf backup.tar.gz /data")
///     .with_max_retries(5)
///     .with_priority(1);
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct JobSpec {
    pub id: JobId,
    pub command: String,
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub timeout: Option<u64>,
    #[serde(default)]
    pub priority: Option<u8>,
    #[serde(default)]
    pub run_at: Option<DateTime<Utc>>,
}

impl JobSpec {
    pub fn new(id: impl Into<JobId>, command: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            command: command.into(),
            max_retries: None,
            timeout: None,
            priority: None,
            run_at: None,
        }
    }

    pub fn with_max_retries(self, max_retries: u32) -> Self {
        Self {
            max_retries: Some(max_retries),
            ..self
        }
    }

    pub fn with_timeout(self, timeout_secs: u64) -> Self {
        Self {
            timeout: Some(timeout_secs),
            ..self
        }
    }

    pub fn with_priority(self, priority: u8) -> Self {
        Self {
            priority: Some(priority),
            ..self
        }
    }

    pub fn run_at(self, run_at: DateTime<Utc>) -> Self {
        Self {
            run_at: Some(run_at),
            ..self
        }
    }

    pub fn run_in(self, delay: Duration) -> Self {
        Self {
            run_at: Some(Utc::now() + delay),
            ..self
        }
    }
}
