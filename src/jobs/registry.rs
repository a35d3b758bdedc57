//! Append-only registry of jobs per stage.

use super::JobStore;
use crate::models::{Job, JobStatus, Result, StagehandError};
use chrono::Utc;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// Durable list of jobs, one list per stage.
///
/// Read-modify-write cycles are serialized in-process; across processes the
/// stage lock keeps a single writer per stage.
pub struct JobRegistry {
    store: Arc<dyn JobStore>,
    lock: Mutex<()>,
}

impl JobRegistry {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self {
            store,
            lock: Mutex::new(()),
        }
    }

    /// Append a new `running` job and return it.
    pub fn create(&self, stage_id: &str, input_ref: &str, output_ref: &str) -> Result<Job> {
        let _guard = self.lock.lock();
        let mut jobs = self.store.load_jobs(stage_id)?;
        let seq = u64::try_from(jobs.len()).map_err(|_| {
            StagehandError::Internal(format!("job sequence overflow in {stage_id}"))
        })?;
        let now = Utc::now();
        let job = Job {
            job_id: Uuid::new_v4().to_string(),
            stage_id: stage_id.to_string(),
            input_ref: input_ref.to_string(),
            output_ref: output_ref.to_string(),
            status: JobStatus::Running,
            seq,
            created_at: now,
            updated_at: now,
            error: None,
        };
        jobs.push(job.clone());
        self.store.save_jobs(stage_id, &jobs)?;
        info!(stage = %stage_id, job_id = %job.job_id, seq = job.seq, "Job registered");
        Ok(job)
    }

    /// Overwrite the status of one job.
    pub fn set_status(
        &self,
        stage_id: &str,
        job_id: &str,
        status: JobStatus,
        error: Option<String>,
    ) -> Result<Job> {
        let _guard = self.lock.lock();
        let mut jobs = self.store.load_jobs(stage_id)?;
        let job = jobs
            .iter_mut()
            .find(|j| j.job_id == job_id)
            .ok_or_else(|| StagehandError::InvalidInput(format!("unknown job '{job_id}'")))?;
        job.status = status;
        job.updated_at = Utc::now();
        if error.is_some() {
            job.error = error;
        }
        let updated = job.clone();
        self.store.save_jobs(stage_id, &jobs)?;
        debug!(stage = %stage_id, job_id = %job_id, status = %status, "Job status updated");
        Ok(updated)
    }

    /// Mark every `running` job of the stage as `stopped`; returns their ids.
    pub fn stop_running(&self, stage_id: &str) -> Result<Vec<String>> {
        let _guard = self.lock.lock();
        let mut jobs = self.store.load_jobs(stage_id)?;
        let now = Utc::now();
        let mut stopped = Vec::new();
        for job in jobs.iter_mut().filter(|j| j.status == JobStatus::Running) {
            job.status = JobStatus::Stopped;
            job.updated_at = now;
            stopped.push(job.job_id.clone());
        }
        if !stopped.is_empty() {
            self.store.save_jobs(stage_id, &jobs)?;
        }
        Ok(stopped)
    }

    /// All jobs of a stage in creation order.
    pub fn list(&self, stage_id: &str) -> Result<Vec<Job>> {
        let mut jobs = self.store.load_jobs(stage_id)?;
        jobs.sort_by_key(|j| j.seq);
        Ok(jobs)
    }

    pub fn get(&self, stage_id: &str, job_id: &str) -> Result<Option<Job>> {
        Ok(self
            .store
            .load_jobs(stage_id)?
            .into_iter()
            .find(|j| j.job_id == job_id))
    }
}
