//! Core data models for stagehand.
//!
//! - Configuration loaded from TOML
//! - The error taxonomy shared by every layer
//! - Record tables, jobs and progress snapshots

mod config;
mod error;
mod job;
mod record;

pub use config::*;
pub use error::*;
pub use job::*;
pub use record::*;
