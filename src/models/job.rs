//! Job and progress records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle status shared by jobs and progress snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Running,
    Completed,
    Stopped,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, JobStatus::Running)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Running => write!(f, "running"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Stopped => write!(f, "stopped"),
            JobStatus::Failed => write!(f, "failed"),
        }
    }
}

/// One invocation of a stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Opaque unique token (UUID v4)
    pub job_id: String,
    /// Stage this job belongs to
    pub stage_id: String,
    /// Input table reference as given by the caller
    pub input_ref: String,
    /// Checkpointed output snapshot
    pub output_ref: String,
    pub status: JobStatus,
    /// Creation order within the stage, starting at 0
    pub seq: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Failure reason, when status is `failed`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Latest progress of a job, overwritten after every row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub job_id: String,
    /// In-scope rows attempted so far
    pub current_row: usize,
    /// Rows in scope for this run
    pub total_rows: usize,
    pub status: JobStatus,
    pub updated_at: DateTime<Utc>,
}

impl ProgressSnapshot {
    pub fn new(job_id: &str, current_row: usize, total_rows: usize, status: JobStatus) -> Self {
        Self {
            job_id: job_id.to_string(),
            current_row,
            total_rows,
            status,
            updated_at: Utc::now(),
        }
    }

    /// Completion percentage; an empty scope counts as done.
    pub fn percent(&self) -> f64 {
        if self.total_rows == 0 {
            return 100.0;
        }
        (self.current_row as f64 / self.total_rows as f64) * 100.0
    }
}
