//! Error types for stagehand.
//!
//! Taxonomy:
//! - Input errors: missing table, missing column, bad parameters. Fatal to a run.
//! - Transient errors: network, timeout, rate limiting. Caught per row.
//! - Resource errors: circuit or session lifecycle. Fatal while acquiring,
//!   swallowed while tearing down.

use thiserror::Error;

/// Top-level error type for stagehand.
#[derive(Debug, Error)]
pub enum StagehandError {
    // ═══════════════════════════════════════════════════════════════════
    // INPUT: the caller handed us something we cannot work with
    // ═══════════════════════════════════════════════════════════════════

    #[error("Configuration error: {0}")]
    Config(#[from] super::ConfigError),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Table not found: neither {output} nor {input} exists")]
    NotFound { input: String, output: String },

    #[error("Column '{column}' not found in {path}")]
    MissingColumn { column: String, path: String },

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Unknown stage: {0}")]
    UnknownStage(String),

    #[error("Stage '{0}' already has a running job")]
    StageBusy(String),

    // ═══════════════════════════════════════════════════════════════════
    // TRANSIENT: the remote side misbehaved, try again later
    // ═══════════════════════════════════════════════════════════════════

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Request timeout after {0:?}")]
    Timeout(std::time::Duration),

    // ═══════════════════════════════════════════════════════════════════
    // RESOURCE: circuit / automation session lifecycle
    // ═══════════════════════════════════════════════════════════════════

    #[error("Session error: {0}")]
    Session(String),

    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl StagehandError {
    /// Create an IO error with context.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Check if this error is worth retrying on the same row.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::Network(_))
    }

    /// Short status token recorded on a row when a lookup fails with this error.
    pub fn row_status(&self) -> &'static str {
        match self {
            Self::Timeout(_) => "timeout",
            Self::Network(e) if e.is_timeout() => "timeout",
            Self::Network(_) => "connection_error",
            _ => "error",
        }
    }
}

/// Result type alias for stagehand.
pub type Result<T> = std::result::Result<T, StagehandError>;
