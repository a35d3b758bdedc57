//! Retry with exponential backoff around any lookup.
//!
//! - Transient outcomes and retryable errors are retried in place
//! - An attempt that outlives its deadline is abandoned as a timeout
//! - Rate limits are returned immediately; rotating the identity is the
//!   engine's job, and waiting on the same identity does not help

use super::{Lookup, LookupResult, Outcome, Precheck};
use crate::models::{Result, RetryConfig, Row, StagehandError};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::debug;

/// Exponential backoff: `base * 2^attempt`, capped at `max`.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
}

impl Backoff {
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.base.saturating_mul(factor).min(self.max)
    }
}

/// Counters shared across clones of a retrying lookup.
#[derive(Debug, Default)]
pub struct RetryStats {
    attempts: AtomicU64,
    retries: AtomicU64,
    rate_limited: AtomicU64,
    total_wait_ms: AtomicU64,
}

impl RetryStats {
    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::Relaxed)
    }

    pub fn retries(&self) -> u64 {
        self.retries.load(Ordering::Relaxed)
    }

    pub fn rate_limited(&self) -> u64 {
        self.rate_limited.load(Ordering::Relaxed)
    }

    pub fn total_wait(&self) -> Duration {
        Duration::from_millis(self.total_wait_ms.load(Ordering::Relaxed))
    }
}

/// Wraps a lookup with in-place retries.
pub struct Retrying<L> {
    inner: L,
    max_attempts: u32,
    attempt_timeout: Duration,
    backoff: Backoff,
    stats: Arc<RetryStats>,
}

impl<L> Retrying<L> {
    pub fn new(inner: L, config: &RetryConfig) -> Self {
        Self {
            inner,
            max_attempts: config.max_attempts.max(1),
            attempt_timeout: config.attempt_timeout(),
            backoff: Backoff {
                base: Duration::from_millis(config.base_delay_ms),
                max: Duration::from_millis(config.max_delay_ms),
            },
            stats: Arc::new(RetryStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<RetryStats> {
        Arc::clone(&self.stats)
    }

    pub fn inner(&self) -> &L {
        &self.inner
    }

    /// Record a retry and return how long to wait before it.
    fn next_delay(&self, attempt: u32) -> Duration {
        let delay = self.backoff.delay(attempt);
        self.stats.retries.fetch_add(1, Ordering::Relaxed);
        self.stats
            .total_wait_ms
            .fetch_add(u64::try_from(delay.as_millis()).unwrap_or(u64::MAX), Ordering::Relaxed);
        delay
    }
}

impl<S, L> Lookup<S> for Retrying<L>
where
    S: Sync,
    L: Lookup<S>,
{
    fn precheck(&self, row: &Row) -> Precheck {
        self.inner.precheck(row)
    }

    async fn lookup(&mut self, session: &S, row: &Row) -> Result<LookupResult> {
        let mut attempt = 0;
        loop {
            self.stats.attempts.fetch_add(1, Ordering::Relaxed);
            let last_attempt = attempt + 1 >= self.max_attempts;

            let deadline = self.attempt_timeout;
            let outcome = tokio::time::timeout(deadline, self.inner.lookup(session, row))
                .await
                .unwrap_or_else(|_| Err(StagehandError::Timeout(deadline)));

            match outcome {
                Ok(result) if result.outcome == Outcome::RateLimited => {
                    self.stats.rate_limited.fetch_add(1, Ordering::Relaxed);
                    return Ok(result);
                }
                Ok(result) if result.outcome == Outcome::Transient && !last_attempt => {
                    debug!(attempt, status = %result.status, "Transient outcome, retrying");
                }
                Err(e) if e.is_retryable() && !last_attempt => {
                    debug!(attempt, error = %e, "Retryable error, retrying");
                }
                other => return other,
            }

            tokio::time::sleep(self.next_delay(attempt)).await;
            attempt += 1;
        }
    }
}
