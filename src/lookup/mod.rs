//! Per-row lookups.
//!
//! A lookup takes one row and the current session and reports what happened:
//! - `Found` / `Invalid`: terminal, the row is marked processed
//! - `Transient`: try again on a later run
//! - `RateLimited`: the engine rotates the identity and retries once

mod completion;
mod probe;
mod retry;

pub use completion::{CompletionLookup, Message};
pub use probe::{ProbeLookup, extract_title, normalize_url};
pub use retry::{Backoff, RetryStats, Retrying};

use crate::models::{Result, Row};
use std::future::Future;

/// Status written for rows whose precheck fails, unless the lookup says otherwise.
pub const SKIPPED_STATUS: &str = "skipped";

/// Classification of one lookup attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Found,
    Invalid,
    Transient,
    RateLimited,
}

impl Outcome {
    /// Terminal outcomes mark the row processed.
    pub fn is_terminal(self) -> bool {
        matches!(self, Outcome::Found | Outcome::Invalid)
    }
}

/// What a lookup produced for one row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LookupResult {
    pub outcome: Outcome,
    /// Stage-specific token written to the row's `status`
    pub status: String,
    /// Payload fields to write back
    pub fields: Vec<(String, String)>,
}

impl LookupResult {
    pub fn new(outcome: Outcome, status: impl Into<String>) -> Self {
        Self {
            outcome,
            status: status.into(),
            fields: Vec::new(),
        }
    }

    pub fn found(status: impl Into<String>) -> Self {
        Self::new(Outcome::Found, status)
    }

    pub fn invalid(status: impl Into<String>) -> Self {
        Self::new(Outcome::Invalid, status)
    }

    pub fn transient(status: impl Into<String>) -> Self {
        Self::new(Outcome::Transient, status)
    }

    pub fn rate_limited(status: impl Into<String>) -> Self {
        Self::new(Outcome::RateLimited, status)
    }

    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.push((name.into(), value.into()));
        self
    }
}

/// Result of the cheap local check run before any network work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Precheck {
    Proceed,
    /// Mark the row processed with this status without a lookup
    Skip(String),
}

impl Precheck {
    pub fn skip() -> Self {
        Precheck::Skip(SKIPPED_STATUS.to_string())
    }
}

/// Stage-specific processing of one row over a session of type `S`.
pub trait Lookup<S: Sync>: Send {
    fn precheck(&self, _row: &Row) -> Precheck {
        Precheck::Proceed
    }

    fn lookup(&mut self, session: &S, row: &Row)
    -> impl Future<Output = Result<LookupResult>> + Send;
}

/// Map a transport failure to a transient result.
pub(crate) fn transport_failure(e: &reqwest::Error) -> LookupResult {
    if e.is_timeout() {
        LookupResult::transient("timeout")
    } else {
        LookupResult::transient("connection_error")
    }
}
