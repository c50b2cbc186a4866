//! A command-line job queue: jobs are enqueued, claimed by worker loops,
//! executed as shell commands, and routed to completion, retry with
//! exponential backoff, or a dead letter queue once retries are exhausted.
//!
//! The pieces, leaves first: [`store::FileStore`] is the file-backed document
//! store whose per-collection atomic update is the single synchronization
//! point; [`repo::JobRepository`] holds the state machine, the claim, and the
//! retry policy; [`dlq::DlqRepository`] manages dead jobs; and
//! [`worker::WorkerPool`] runs the polling loops. Dispatch is at-least-once:
//! a claim abandoned by a crashed worker becomes reclaimable after a
//! staleness window, so commands may run more than once.

pub mod backoff;
pub mod config;
pub mod dlq;
pub mod executor;
pub mod job;
pub mod repo;
pub mod store;
pub mod worker;

use thiserror::Error;

use job::JobId;
use store::StoreError;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("job '{0}' already exists")]
    DuplicateJob(JobId),
    #[error("job is missing required field '{0}'")]
    MissingField(&'static str),
    #[error(
        "invalid worker count {0}: expected between {min} and {max}",
        min = worker::MIN_WORKERS,
        max = worker::MAX_WORKERS
    )]
    InvalidWorkerCount(usize),
    #[error("invalid value for '{key}': {reason}")]
    InvalidConfigValue { key: String, reason: String },
    #[error(transparent)]
    Store(#[from] StoreError),
}
