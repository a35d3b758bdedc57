//! Durable per-job progress records.

use super::JobStore;
use crate::models::{JobStatus, ProgressSnapshot, Result};
use std::sync::Arc;
use tracing::debug;

/// Writes progress snapshots for one stage; external pollers read them back.
#[derive(Clone)]
pub struct ProgressReporter {
    store: Arc<dyn JobStore>,
    stage_id: String,
}

impl ProgressReporter {
    pub fn new(store: Arc<dyn JobStore>, stage_id: impl Into<String>) -> Self {
        Self {
            store,
            stage_id: stage_id.into(),
        }
    }

    /// Overwrite the job's snapshot.
    pub fn report(
        &self,
        job_id: &str,
        current_row: usize,
        total_rows: usize,
        status: JobStatus,
    ) -> Result<()> {
        let snapshot = ProgressSnapshot::new(job_id, current_row, total_rows, status);
        self.store.save_progress(&self.stage_id, &snapshot)?;
        debug!(stage = %self.stage_id, job_id = %job_id, current_row, total_rows, status = %status, "Progress");
        Ok(())
    }

    pub fn get(&self, job_id: &str) -> Result<Option<ProgressSnapshot>> {
        self.store.load_progress(&self.stage_id, job_id)
    }

    /// Flip an existing snapshot to `stopped`, keeping its counters.
    pub fn mark_stopped(&self, job_id: &str) -> Result<()> {
        if let Some(snapshot) = self.get(job_id)? {
            self.report(
                job_id,
                snapshot.current_row,
                snapshot.total_rows,
                JobStatus::Stopped,
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::MemoryJobStore;

    #[test]
    fn test_report_overwrites() {
        let reporter = ProgressReporter::new(Arc::new(MemoryJobStore::new()), "step7");
        assert!(reporter.get("j1").unwrap().is_none());

        reporter.report("j1", 0, 5, JobStatus::Running).unwrap();
        reporter.report("j1", 3, 5, JobStatus::Running).unwrap();
        let snap = reporter.get("j1").unwrap().unwrap();
        assert_eq!((snap.current_row, snap.total_rows), (3, 5));
        assert_eq!(snap.status, JobStatus::Running);
    }

    #[test]
    fn test_mark_stopped_keeps_counters() {
        let reporter = ProgressReporter::new(Arc::new(MemoryJobStore::new()), "step7");
        reporter.mark_stopped("absent").unwrap();
        assert!(reporter.get("absent").unwrap().is_none());

        reporter.report("j1", 2, 9, JobStatus::Running).unwrap();
        reporter.mark_stopped("j1").unwrap();
        let snap = reporter.get("j1").unwrap().unwrap();
        assert_eq!((snap.current_row, snap.total_rows), (2, 9));
        assert_eq!(snap.status, JobStatus::Stopped);
    }
}
