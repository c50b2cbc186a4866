//! File-backed document store for the queue.
//!
//! One JSON file per collection under a data directory: jobs, dead jobs,
//! config, and the worker registry snapshot. A per-collection mutex gives
//! `update_*` single-writer read-modify-write semantics within this process;
//! no cross-process locking is provided.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::job::{DeadJob, Job};

const JOBS_FILE: &str = "jobs.json";
const DLQ_FILE: &str = "dlq.json";
const CONFIG_FILE: &str = "config.json";
const WORKERS_FILE: &str = "workers.json";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("i/o error accessing the store")]
    Io(#[from] io::Error),
    #[error("error encoding or decoding stored data")]
    EncodeDecode(#[from] serde_json::Error),
    #[error("store lock poisoned")]
    BadState,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct JobsFile {
    #[serde(default)]
    jobs: Vec<Job>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct DlqFile {
    #[serde(default, rename = "deadJobs")]
    dead_jobs: Vec<DeadJob>,
}

pub type ConfigMap = BTreeMap<String, Value>;

/// Informational snapshot of the running workers, mirrored to disk for
/// display. Never read back as source of truth.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkerRegistry {
    #[serde(default)]
    pub workers: Vec<WorkerInfo>,
    #[serde(default)]
    pub pids: Vec<u32>,
    #[serde(default)]
    pub count: usize,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerInfo {
    pub id: String,
    pub index: usize,
    pub pid: u32,
    pub started_at: DateTime<Utc>,
}

struct Inner {
    dir: PathBuf,
    jobs: Mutex<()>,
    dlq: Mutex<()>,
    config: Mutex<()>,
    workers: Mutex<()>,
}

/// Handle to the on-disk store. Cheap to clone; clones share the collection
/// locks.
#[derive(Clone)]
pub struct FileStore {
    inner: Arc<Inner>,
}

impl FileStore {
    /// Opens the store at `dir`, creating the directory and seeding any
    /// missing collection files.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        let store = Self {
            inner: Arc::new(Inner {
                dir,
                jobs: Mutex::new(()),
                dlq: Mutex::new(()),
                config: Mutex::new(()),
                workers: Mutex::new(()),
            }),
        };
        store.seed()?;
        Ok(store)
    }

    pub fn dir(&self) -> &Path {
        &self.inner.dir
    }

    fn seed(&self) -> Result<(), StoreError> {
        self.seed_file(JOBS_FILE, &JobsFile::default())?;
        self.seed_file(DLQ_FILE, &DlqFile::default())?;
        self.seed_file(CONFIG_FILE, &crate::config::defaults())?;
        self.seed_file(WORKERS_FILE, &WorkerRegistry::default())?;
        Ok(())
    }

    fn seed_file<T: Serialize>(&self, name: &str, value: &T) -> Result<(), StoreError> {
        let path = self.inner.dir.join(name);
        if !path.exists() {
            self.write_file(name, value)?;
        }
        Ok(())
    }

    /// Missing or corrupt files read as the empty collection, matching the
    /// store's best-effort durability contract.
    fn read_file<T: Default + DeserializeOwned>(&self, name: &str) -> T {
        let path = self.inner.dir.join(name);
        fs::read_to_string(path)
            .ok()
            .and_then(|data| serde_json::from_str(&data).ok())
            .unwrap_or_default()
    }

    fn write_file<T: Serialize>(&self, name: &str, value: &T) -> Result<(), StoreError> {
        let path = self.inner.dir.join(name);
        let data = serde_json::to_string_pretty(value)?;
        fs::write(path, data)?;
        Ok(())
    }

    pub fn jobs(&self) -> Result<Vec<Job>, StoreError> {
        let _guard = self.inner.jobs.lock().map_err(|_| StoreError::BadState)?;
        Ok(self.read_file::<JobsFile>(JOBS_FILE).jobs)
    }

    /// Atomically read-modify-write the job collection. The closure's return
    /// value is passed back to the caller.
    pub fn update_jobs<T>(&self, f: impl FnOnce(&mut Vec<Job>) -> T) -> Result<T, StoreError> {
        let _guard = self.inner.jobs.lock().map_err(|_| StoreError::BadState)?;
        let mut file: JobsFile = self.read_file(JOBS_FILE);
        let out = f(&mut file.jobs);
        self.write_file(JOBS_FILE, &file)?;
        Ok(out)
    }

    pub fn dead_jobs(&self) -> Result<Vec<DeadJob>, StoreError> {
        let _guard = self.inner.dlq.lock().map_err(|_| StoreError::BadState)?;
        Ok(self.read_file::<DlqFile>(DLQ_FILE).dead_jobs)
    }

    /// Atomically read-modify-write the dead-jobs collection.
    pub fn update_dead_jobs<T>(
        &self,
        f: impl FnOnce(&mut Vec<DeadJob>) -> T,
    ) -> Result<T, StoreError> {
        let _guard = self.inner.dlq.lock().map_err(|_| StoreError::BadState)?;
        let mut file: DlqFile = self.read_file(DLQ_FILE);
        let out = f(&mut file.dead_jobs);
        self.write_file(DLQ_FILE, &file)?;
        Ok(out)
    }

    pub fn config(&self) -> Result<ConfigMap, StoreError> {
        let _guard = self.inner.config.lock().map_err(|_| StoreError::BadState)?;
        Ok(self.read_file(CONFIG_FILE))
    }

    pub fn update_config<T>(&self, f: impl FnOnce(&mut ConfigMap) -> T) -> Result<T, StoreError> {
        let _guard = self.inner.config.lock().map_err(|_| StoreError::BadState)?;
        let mut config: ConfigMap = self.read_file(CONFIG_FILE);
        let out = f(&mut config);
        self.write_file(CONFIG_FILE, &config)?;
        Ok(out)
    }

    pub fn workers(&self) -> Result<WorkerRegistry, StoreError> {
        let _guard = self.inner.workers.lock().map_err(|_| StoreError::BadState)?;
        Ok(self.read_file(WORKERS_FILE))
    }

    pub fn write_workers(&self, registry: &WorkerRegistry) -> Result<(), StoreError> {
        let _guard = self.inner.workers.lock().map_err(|_| StoreError::BadState)?;
        self.write_file(WORKERS_FILE, registry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{JobSpec, JobState};

    fn store() -> (tempfile::TempDir, FileStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        (dir, store)
    }

    fn job(id: &str) -> Job {
        let now = Utc::now();
        let spec = JobSpec::new(id, "true");
        Job {
            id: spec.id,
            command: spec.command,
            state: JobState::Pending,
            attempts: 0,
            max_retries: 3,
            timeout: 30,
            priority: 3,
            run_at: None,
            created_at: now,
            updated_at: now,
            locked_by: None,
            locked_at: None,
            result: None,
            error: None,
            execution_time: None,
        }
    }

    #[test]
    fn open_seeds_collection_files() {
        let (dir, _store) = store();
        for name in [JOBS_FILE, DLQ_FILE, CONFIG_FILE, WORKERS_FILE] {
            assert!(dir.path().join(name).exists(), "{name} should be seeded");
        }
    }

    #[test]
    fn jobs_round_trip() {
        let (_dir, store) = store();
        assert!(store.jobs().unwrap().is_empty());

        store.update_jobs(|jobs| jobs.push(job("j1"))).unwrap();

        let jobs = store.jobs().unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].id.as_str(), "j1");
        assert_eq!(jobs[0].run_at, None);
        assert_eq!(jobs[0].result, None);
    }

    #[test]
    fn update_returns_closure_value() {
        let (_dir, store) = store();
        let count = store
            .update_jobs(|jobs| {
                jobs.push(job("j1"));
                jobs.push(job("j2"));
                jobs.len()
            })
            .unwrap();
        assert_eq!(count, 2);
    }

    #[test]
    fn corrupt_file_reads_as_empty() {
        let (dir, store) = store();
        fs::write(dir.path().join(JOBS_FILE), "{not json").unwrap();
        assert!(store.jobs().unwrap().is_empty());
    }

    #[test]
    fn config_is_seeded_with_defaults() {
        let (_dir, store) = store();
        let config = store.config().unwrap();
        assert_eq!(config.get("max-retries"), Some(&Value::from(3)));
        assert_eq!(config.get("backoff-base"), Some(&Value::from(2)));
    }

    #[test]
    fn worker_registry_round_trip() {
        let (_dir, store) = store();
        assert!(!store.workers().unwrap().started_at.is_some());

        let registry = WorkerRegistry {
            workers: vec![WorkerInfo {
                id: "worker-1-0".to_owned(),
                index: 1,
                pid: 42,
                started_at: Utc::now(),
            }],
            pids: vec![42],
            count: 1,
            started_at: Some(Utc::now()),
        };
        store.write_workers(&registry).unwrap();

        let read = store.workers().unwrap();
        assert_eq!(read.count, 1);
        assert_eq!(read.workers[0].id, "worker-1-0");
    }
}
