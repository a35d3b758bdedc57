//! stagehand - Resumable, rate-limit-resilient batch stages over record tables.
//!
//! ## Architecture
//!
//! A stage turns "process one record through an unreliable external session"
//! into a safely interruptible, checkpointed job:
//! - **Table Store**: loads the input or resumes from the output snapshot,
//!   saves atomically after every row
//! - **Rotation Manager**: owns the (circuit, session) identity pair and
//!   replaces both on a schedule or when rate limited
//! - **Job Store**: registry, progress and stop flags that survive restarts
//! - **Batch Engine**: walks the table window by window, one row at a time
//!
//! ## Lookups
//!
//! - **Completion**: chat-completion answer over one field
//! - **Probe**: page title of the URL held in one field
//!
//! Both can be wrapped in `Retrying` for in-place backoff on transient failures.

pub mod checkpoint;
pub mod jobs;
pub mod lookup;
pub mod models;
pub mod pipeline;
pub mod session;

// Re-exports for convenience
pub use checkpoint::{LoadSource, TableFormat, TableStore};
pub use jobs::{
    CancellationChannel, FileJobStore, JobRegistry, JobStore, MemoryJobStore, ProgressReporter,
};
pub use lookup::{Lookup, LookupResult, Outcome, Precheck};
pub use models::{Config, Job, JobStatus, ProgressSnapshot, Result, Row, StagehandError, Table};
pub use pipeline::{BatchEngine, JobHandle, JobService, RunParams, RunReport, StartParams};
pub use session::{IdentityProvider, RotationManager};
