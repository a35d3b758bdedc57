//! Job bookkeeping that survives process restarts.
//!
//! - `JobStore`: durable storage seam (file-backed or in-memory)
//! - `JobRegistry`: append-only job list per stage
//! - `ProgressReporter`: latest progress per job
//! - `CancellationChannel`: stop flag per stage

mod progress;
mod registry;
mod signal;
mod store;

pub use progress::ProgressReporter;
pub use registry::JobRegistry;
pub use signal::CancellationChannel;
pub use store::{FileJobStore, JobStore, MemoryJobStore, StageGuard};
