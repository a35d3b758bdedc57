//! Durable storage for job bookkeeping.
//!
//! `JobStore` is the seam between the engine and wherever job state lives.
//! `FileJobStore` keeps one small JSON file per record under a state
//! directory; `MemoryJobStore` keeps everything in concurrent maps for tests
//! and embedded use.

use crate::checkpoint::write_atomic;
use crate::models::{Job, ProgressSnapshot, Result, StagehandError, is_valid_stage_id};
use dashmap::{DashMap, DashSet};
use fs2::FileExt;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// Durable key-value contract behind the registry, progress and stop flags.
///
/// Every write is a full overwrite of one record; last writer wins.
pub trait JobStore: Send + Sync {
    /// All jobs of a stage in creation order.
    fn load_jobs(&self, stage_id: &str) -> Result<Vec<Job>>;

    /// Replace the job list of a stage.
    fn save_jobs(&self, stage_id: &str, jobs: &[Job]) -> Result<()>;

    fn load_progress(&self, stage_id: &str, job_id: &str) -> Result<Option<ProgressSnapshot>>;

    fn save_progress(&self, stage_id: &str, snapshot: &ProgressSnapshot) -> Result<()>;

    /// Raise the stop flag (idempotent).
    fn raise_stop(&self, stage_id: &str) -> Result<()>;

    /// Remove the stop flag if present.
    fn clear_stop(&self, stage_id: &str) -> Result<()>;

    /// Presence check, no side effects.
    fn stop_raised(&self, stage_id: &str) -> bool;

    /// Take the exclusive run lock for a stage; `StageBusy` when held elsewhere.
    fn lock_stage(&self, stage_id: &str) -> Result<StageGuard>;
}

/// Held while a job runs; releases the stage lock on drop.
#[derive(Debug)]
pub struct StageGuard {
    stage_id: String,
    inner: GuardInner,
}

#[derive(Debug)]
enum GuardInner {
    File(File),
    Memory(Arc<DashSet<String>>),
}

impl StageGuard {
    pub fn stage_id(&self) -> &str {
        &self.stage_id
    }
}

impl Drop for StageGuard {
    fn drop(&mut self) {
        match &self.inner {
            GuardInner::File(file) => {
                if let Err(e) = FileExt::unlock(file) {
                    warn!(stage = %self.stage_id, error = %e, "Failed to release stage lock");
                }
            }
            GuardInner::Memory(held) => {
                held.remove(&self.stage_id);
            }
        }
        debug!(stage = %self.stage_id, "Stage lock released");
    }
}

fn check_stage_id(stage_id: &str) -> Result<()> {
    if is_valid_stage_id(stage_id) {
        Ok(())
    } else {
        Err(StagehandError::InvalidInput(format!(
            "invalid stage id '{stage_id}'"
        )))
    }
}

/// File-backed store rooted at a state directory.
///
/// Layout: `jobs_<stage>.json`, `progress_<stage>_<job>.json`,
/// `stop_<stage>.flag`, `<stage>.lock`.
#[derive(Debug, Clone)]
pub struct FileJobStore {
    dir: PathBuf,
}

impl FileJobStore {
    pub fn new(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir).map_err(|e| StagehandError::io("creating state dir", e))?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn jobs_path(&self, stage_id: &str) -> PathBuf {
        self.dir.join(format!("jobs_{stage_id}.json"))
    }

    fn progress_path(&self, stage_id: &str, job_id: &str) -> PathBuf {
        self.dir.join(format!("progress_{stage_id}_{job_id}.json"))
    }

    fn stop_path(&self, stage_id: &str) -> PathBuf {
        self.dir.join(format!("stop_{stage_id}.flag"))
    }

    fn lock_path(&self, stage_id: &str) -> PathBuf {
        self.dir.join(format!("{stage_id}.lock"))
    }

    fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(path)
            .map_err(|e| StagehandError::io(format!("reading {}", path.display()), e))?;
        serde_json::from_str(&content).map(Some).map_err(|e| {
            StagehandError::ParseError(format!("Invalid state file {}: {e}", path.display()))
        })
    }

    /// Write-then-rename so pollers never observe a torn file.
    fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
        let content = serde_json::to_string_pretty(value)
            .map_err(|e| StagehandError::Internal(format!("Serializing state: {e}")))?;
        write_atomic(path, content.as_bytes())
            .map_err(|e| StagehandError::io(format!("writing {}", path.display()), e))
    }
}

impl JobStore for FileJobStore {
    fn load_jobs(&self, stage_id: &str) -> Result<Vec<Job>> {
        check_stage_id(stage_id)?;
        Ok(Self::read_json(&self.jobs_path(stage_id))?.unwrap_or_default())
    }

    fn save_jobs(&self, stage_id: &str, jobs: &[Job]) -> Result<()> {
        check_stage_id(stage_id)?;
        Self::write_json(&self.jobs_path(stage_id), jobs)
    }

    fn load_progress(&self, stage_id: &str, job_id: &str) -> Result<Option<ProgressSnapshot>> {
        check_stage_id(stage_id)?;
        Self::read_json(&self.progress_path(stage_id, job_id))
    }

    fn save_progress(&self, stage_id: &str, snapshot: &ProgressSnapshot) -> Result<()> {
        check_stage_id(stage_id)?;
        Self::write_json(&self.progress_path(stage_id, &snapshot.job_id), snapshot)
    }

    fn raise_stop(&self, stage_id: &str) -> Result<()> {
        check_stage_id(stage_id)?;
        fs::write(self.stop_path(stage_id), "stop")
            .map_err(|e| StagehandError::io("writing stop flag", e))
    }

    fn clear_stop(&self, stage_id: &str) -> Result<()> {
        check_stage_id(stage_id)?;
        match fs::remove_file(self.stop_path(stage_id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StagehandError::io("removing stop flag", e)),
        }
    }

    fn stop_raised(&self, stage_id: &str) -> bool {
        is_valid_stage_id(stage_id) && self.stop_path(stage_id).exists()
    }

    fn lock_stage(&self, stage_id: &str) -> Result<StageGuard> {
        check_stage_id(stage_id)?;
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(self.lock_path(stage_id))
            .map_err(|e| StagehandError::io("opening stage lock", e))?;
        file.try_lock_exclusive()
            .map_err(|_| StagehandError::StageBusy(stage_id.to_string()))?;
        Ok(StageGuard {
            stage_id: stage_id.to_string(),
            inner: GuardInner::File(file),
        })
    }
}

/// In-memory store; state lives as long as the value.
#[derive(Debug, Default)]
pub struct MemoryJobStore {
    jobs: DashMap<String, Vec<Job>>,
    progress: DashMap<(String, String), ProgressSnapshot>,
    stops: DashSet<String>,
    locks: Arc<DashSet<String>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl JobStore for MemoryJobStore {
    fn load_jobs(&self, stage_id: &str) -> Result<Vec<Job>> {
        Ok(self
            .jobs
            .get(stage_id)
            .map(|jobs| jobs.value().clone())
            .unwrap_or_default())
    }

    fn save_jobs(&self, stage_id: &str, jobs: &[Job]) -> Result<()> {
        self.jobs.insert(stage_id.to_string(), jobs.to_vec());
        Ok(())
    }

    fn load_progress(&self, stage_id: &str, job_id: &str) -> Result<Option<ProgressSnapshot>> {
        Ok(self
            .progress
            .get(&(stage_id.to_string(), job_id.to_string()))
            .map(|p| p.value().clone()))
    }

    fn save_progress(&self, stage_id: &str, snapshot: &ProgressSnapshot) -> Result<()> {
        self.progress.insert(
            (stage_id.to_string(), snapshot.job_id.clone()),
            snapshot.clone(),
        );
        Ok(())
    }

    fn raise_stop(&self, stage_id: &str) -> Result<()> {
        self.stops.insert(stage_id.to_string());
        Ok(())
    }

    fn clear_stop(&self, stage_id: &str) -> Result<()> {
        self.stops.remove(stage_id);
        Ok(())
    }

    fn stop_raised(&self, stage_id: &str) -> bool {
        self.stops.contains(stage_id)
    }

    fn lock_stage(&self, stage_id: &str) -> Result<StageGuard> {
        if !self.locks.insert(stage_id.to_string()) {
            return Err(StagehandError::StageBusy(stage_id.to_string()));
        }
        Ok(StageGuard {
            stage_id: stage_id.to_string(),
            inner: GuardInner::Memory(Arc::clone(&self.locks)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::JobStatus;
    use tempfile::TempDir;

    fn exercise_stop_flag(store: &dyn JobStore) {
        assert!(!store.stop_raised("step7"));
        store.raise_stop("step7").unwrap();
        store.raise_stop("step7").unwrap();
        assert!(store.stop_raised("step7"));
        assert!(!store.stop_raised("step6"));
        store.clear_stop("step7").unwrap();
        store.clear_stop("step7").unwrap();
        assert!(!store.stop_raised("step7"));
    }

    fn exercise_lock(store: &dyn JobStore) {
        let guard = store.lock_stage("step5").unwrap();
        assert!(matches!(
            store.lock_stage("step5"),
            Err(StagehandError::StageBusy(_))
        ));
        let other = store.lock_stage("step6").unwrap();
        drop(guard);
        let again = store.lock_stage("step5").unwrap();
        assert_eq!(again.stage_id(), "step5");
        drop(other);
    }

    #[test]
    fn test_file_store_stop_flag_and_lock() {
        let dir = TempDir::new().unwrap();
        let store = FileJobStore::new(dir.path()).unwrap();
        exercise_stop_flag(&store);
        exercise_lock(&store);
    }

    #[test]
    fn test_memory_store_stop_flag_and_lock() {
        let store = MemoryJobStore::new();
        exercise_stop_flag(&store);
        exercise_lock(&store);
    }

    #[test]
    fn test_file_store_progress_roundtrip() {
        let dir = TempDir::new().unwrap();
        let store = FileJobStore::new(dir.path()).unwrap();
        assert!(store.load_progress("step6", "abc").unwrap().is_none());

        let snapshot = ProgressSnapshot::new("abc", 3, 10, JobStatus::Running);
        store.save_progress("step6", &snapshot).unwrap();
        assert_eq!(store.load_progress("step6", "abc").unwrap(), Some(snapshot));
        assert!(dir.path().join("progress_step6_abc.json").exists());
    }

    #[test]
    fn test_file_store_rejects_path_like_stage_ids() {
        let dir = TempDir::new().unwrap();
        let store = FileJobStore::new(dir.path()).unwrap();
        assert!(store.load_jobs("../escape").is_err());
        assert!(!store.stop_raised("../escape"));
    }

    #[test]
    fn test_two_file_stores_writing_one_registry_stay_parseable() {
        use crate::jobs::JobRegistry;

        let dir = TempDir::new().unwrap();
        let writers: Vec<_> = (0..2)
            .map(|_| {
                let registry = JobRegistry::new(Arc::new(FileJobStore::new(dir.path()).unwrap()));
                std::thread::spawn(move || {
                    for _ in 0..25 {
                        registry.create("step6", "in.csv", "out.csv").unwrap();
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.join().unwrap();
        }

        let store = FileJobStore::new(dir.path()).unwrap();
        let jobs = store.load_jobs("step6").unwrap();
        assert!(!jobs.is_empty());
        let stray = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name() != "jobs_step6.json")
            .count();
        assert_eq!(stray, 0);
    }
}
