//! Pipeline module - batch engine and the job service around it.

mod engine;
mod service;

pub use engine::*;
pub use service::*;
