//! Batch engine: walks a record table window by window, one row at a time.
//!
//! Pipeline flow:
//! Table → windows of `batch_size` → unprocessed rows → precheck → lookup
//! (rotating identities as needed) → checkpoint + progress after every row
//!
//! Guarantees:
//! - Rows are visited in table order; a processed row is never looked up again
//! - The snapshot is saved after every row, so a crash loses at most one row
//! - A raised stop flag is honored between rows and once more at the end

use crate::checkpoint::{LoadSource, TableStore};
use crate::jobs::{CancellationChannel, JobRegistry, JobStore, ProgressReporter};
use crate::lookup::{Lookup, LookupResult, Outcome, Precheck};
use crate::models::{EngineConfig, JobStatus, Result, Row, StagehandError, Table};
use crate::session::{Identity, IdentityProvider, RotationManager};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Parameters of one run.
#[derive(Debug, Clone)]
pub struct RunParams {
    offset: usize,
    /// Maximum rows in scope
    pub max_rows: usize,
    /// Rows per window
    pub batch_size: usize,
    /// Terminal outcomes between rotations (0 disables)
    pub rotation_interval: usize,
    /// Status pruned from the table after a completed run
    pub prune_status: Option<String>,
    /// Pause between lookups
    pub row_delay: Duration,
}

impl RunParams {
    /// Build parameters from engine defaults. A negative offset is rejected.
    pub fn new(engine: &EngineConfig, offset: i64) -> Result<Self> {
        let offset = usize::try_from(offset).map_err(|_| {
            StagehandError::InvalidInput(format!("offset must be non-negative, got {offset}"))
        })?;
        if engine.batch_size == 0 {
            return Err(StagehandError::InvalidInput(
                "batch_size must be at least 1".into(),
            ));
        }
        Ok(Self {
            offset,
            max_rows: engine.max_rows,
            batch_size: engine.batch_size,
            rotation_interval: engine.rotation_interval,
            prune_status: None,
            row_delay: engine.row_delay(),
        })
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Number of rows a table of `len` rows puts in scope.
    pub fn scope(&self, len: usize) -> usize {
        len.saturating_sub(self.offset).min(self.max_rows)
    }
}

/// Outcome of a finished run.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub status: JobStatus,
    /// In-scope rows attempted
    pub attempted: usize,
    /// Rows in scope
    pub total: usize,
    pub rotations: u64,
    /// Rows dropped by pruning
    pub pruned: usize,
    /// Whether the run started fresh or resumed a snapshot
    pub source: LoadSource,
    pub table: Table,
}

enum Walk {
    Finished,
    Stopped,
}

struct RunState<P: IdentityProvider> {
    identity: Option<Identity<P::Circuit, P::Session>>,
    attempted: usize,
    /// Terminal outcomes since the last rotation
    since_rotation: usize,
}

/// Drives one stage's table through a lookup.
pub struct BatchEngine<P: IdentityProvider> {
    stage_id: String,
    tables: TableStore,
    rotation: RotationManager<P>,
    cancel: CancellationChannel,
    progress: ProgressReporter,
    registry: Arc<JobRegistry>,
}

impl<P: IdentityProvider> BatchEngine<P> {
    pub fn new(
        stage_id: impl Into<String>,
        tables: TableStore,
        provider: P,
        store: Arc<dyn JobStore>,
        registry: Arc<JobRegistry>,
    ) -> Self {
        let stage_id = stage_id.into();
        Self {
            cancel: CancellationChannel::new(Arc::clone(&store), stage_id.clone()),
            progress: ProgressReporter::new(store, stage_id.clone()),
            stage_id,
            tables,
            rotation: RotationManager::new(provider),
            registry,
        }
    }

    /// Load (or resume) the table and run it. A table that cannot be loaded
    /// fails the job.
    pub async fn execute<L: Lookup<P::Session>>(
        &mut self,
        lookup: &mut L,
        params: &RunParams,
        job_id: &str,
        required_columns: &[String],
    ) -> Result<RunReport> {
        let (table, source) = match self.tables.load(required_columns) {
            Ok(loaded) => loaded,
            Err(e) => {
                warn!(stage = %self.stage_id, job_id = %job_id, error = %e, "Failed to load table");
                self.finish(job_id, 0, 0, JobStatus::Failed, Some(e.to_string()));
                return Err(e);
            }
        };
        self.run(table, source, lookup, params, job_id).await
    }

    /// Run an already loaded table.
    pub async fn run<L: Lookup<P::Session>>(
        &mut self,
        mut table: Table,
        source: LoadSource,
        lookup: &mut L,
        params: &RunParams,
        job_id: &str,
    ) -> Result<RunReport> {
        let scope = params.scope(table.len());
        let rotations_before = self.rotation.rotations();

        if scope == 0 {
            info!(
                stage = %self.stage_id,
                rows = table.len(),
                offset = params.offset,
                "Nothing in scope"
            );
            self.finish(job_id, 0, 0, JobStatus::Completed, None);
            return Ok(RunReport {
                status: JobStatus::Completed,
                attempted: 0,
                total: 0,
                rotations: 0,
                pruned: 0,
                source,
                table,
            });
        }

        info!(
            stage = %self.stage_id,
            job_id = %job_id,
            offset = params.offset,
            scope,
            batch_size = params.batch_size,
            resumed = source == LoadSource::Snapshot,
            "Starting run"
        );
        self.report(job_id, 0, scope, JobStatus::Running);

        let mut state = RunState::<P> {
            identity: None,
            attempted: 0,
            since_rotation: 0,
        };
        let walk = match self.rotation.acquire().await {
            Ok(identity) => {
                state.identity = Some(identity);
                self.walk(&mut table, lookup, params, job_id, scope, &mut state)
                    .await
            }
            Err(e) => Err(e),
        };

        let result = match walk {
            Ok(walk) => self.finalize(&mut table, params, job_id, scope, &state, walk),
            Err(e) => {
                warn!(stage = %self.stage_id, job_id = %job_id, error = %e, "Run failed");
                if let Err(save_err) = self.tables.save(&table) {
                    warn!(error = %save_err, "Failed to save table after failure");
                }
                self.finish(
                    job_id,
                    state.attempted,
                    scope,
                    JobStatus::Failed,
                    Some(e.to_string()),
                );
                Err(e)
            }
        };

        if let Some(identity) = state.identity.take() {
            self.rotation.release(identity).await;
        }

        let (status, pruned) = result?;
        let report = RunReport {
            status,
            attempted: state.attempted,
            total: scope,
            rotations: self.rotation.rotations() - rotations_before,
            pruned,
            source,
            table,
        };
        info!(
            stage = %self.stage_id,
            job_id = %job_id,
            status = %report.status,
            attempted = report.attempted,
            total = report.total,
            rotations = report.rotations,
            pruned = report.pruned,
            "Run finished"
        );
        Ok(report)
    }

    async fn walk<L: Lookup<P::Session>>(
        &mut self,
        table: &mut Table,
        lookup: &mut L,
        params: &RunParams,
        job_id: &str,
        scope: usize,
        state: &mut RunState<P>,
    ) -> Result<Walk> {
        let offset = params.offset;
        let end = offset + scope;
        let batch_size = params.batch_size.max(1);

        let mut window_start = offset;
        while window_start < end {
            let window_end = (window_start + batch_size).min(end);

            if self.cancel.is_stop_requested() {
                return Ok(Walk::Stopped);
            }

            if table.all_processed(window_start, window_end) {
                debug!(start = window_start, end = window_end, "Window already processed");
                state.attempted = window_end - offset;
                self.report(job_id, state.attempted, scope, JobStatus::Running);
                window_start = window_end;
                continue;
            }

            for idx in window_start..window_end {
                let Some(row) = table.row(idx) else {
                    break;
                };
                if row.processed {
                    state.attempted = idx + 1 - offset;
                    continue;
                }

                if self.cancel.is_stop_requested() {
                    return Ok(Walk::Stopped);
                }

                if let Precheck::Skip(status) = lookup.precheck(row) {
                    debug!(row = idx, status = %status, "Precheck failed, skipping");
                    if let Some(row) = table.row_mut(idx) {
                        row.processed = true;
                        row.status = status;
                    }
                    self.tables.save(table)?;
                    state.attempted = idx + 1 - offset;
                    self.report(job_id, state.attempted, scope, JobStatus::Running);
                    continue;
                }

                if params.rotation_interval > 0 && state.since_rotation >= params.rotation_interval
                {
                    info!(
                        stage = %self.stage_id,
                        after = state.since_rotation,
                        "Rotation interval reached"
                    );
                    self.rotate(state).await?;
                }

                let mut result = Self::attempt(lookup, state, row).await;
                if matches!(&result, Ok(r) if r.outcome == Outcome::RateLimited) {
                    warn!(stage = %self.stage_id, row = idx, "Rate limited, rotating identity");
                    self.rotate(state).await?;
                    result = Self::attempt(lookup, state, row).await;
                }

                let result = result.unwrap_or_else(|e| {
                    warn!(stage = %self.stage_id, row = idx, error = %e, "Lookup failed");
                    LookupResult::transient(e.row_status())
                });
                let terminal = result.outcome.is_terminal();

                for (name, value) in result.fields {
                    table.set_field(idx, &name, value);
                }
                if let Some(row) = table.row_mut(idx) {
                    row.status = result.status;
                    if terminal {
                        row.processed = true;
                    }
                }
                if terminal {
                    state.since_rotation += 1;
                }

                self.tables.save(table)?;
                state.attempted = idx + 1 - offset;
                self.report(job_id, state.attempted, scope, JobStatus::Running);
                debug!(row = idx, terminal, "Row done");

                if idx + 1 < end && !params.row_delay.is_zero() {
                    tokio::time::sleep(params.row_delay).await;
                }
            }

            window_start = window_end;
        }

        Ok(Walk::Finished)
    }

    async fn attempt<L: Lookup<P::Session>>(
        lookup: &mut L,
        state: &RunState<P>,
        row: &Row,
    ) -> Result<LookupResult> {
        let identity = state
            .identity
            .as_ref()
            .ok_or_else(|| StagehandError::Internal("no live identity".into()))?;
        lookup.lookup(&identity.session, row).await
    }

    async fn rotate(&mut self, state: &mut RunState<P>) -> Result<()> {
        let old = state.identity.take();
        state.identity = Some(self.rotation.rotate(old).await?);
        state.since_rotation = 0;
        Ok(())
    }

    /// Write the terminal state. Returns the final status and pruned count.
    fn finalize(
        &self,
        table: &mut Table,
        params: &RunParams,
        job_id: &str,
        scope: usize,
        state: &RunState<P>,
        walk: Walk,
    ) -> Result<(JobStatus, usize)> {
        let stopped = matches!(walk, Walk::Stopped) || self.cancel.is_stop_requested();
        let status = if stopped {
            JobStatus::Stopped
        } else {
            JobStatus::Completed
        };

        if stopped {
            info!(
                stage = %self.stage_id,
                job_id = %job_id,
                attempted = state.attempted,
                "Stop requested, winding down"
            );
        }

        let mut pruned = 0;
        if let (JobStatus::Completed, Some(prune)) = (status, params.prune_status.as_deref()) {
            pruned = table.remove_status(prune);
            if pruned > 0 {
                info!(stage = %self.stage_id, status = %prune, pruned, "Pruned rows");
            }
        }
        if let Err(e) = self.tables.save(table) {
            self.finish(
                job_id,
                state.attempted,
                scope,
                JobStatus::Failed,
                Some(e.to_string()),
            );
            return Err(e);
        }

        self.finish(job_id, state.attempted, scope, status, None);
        Ok((status, pruned))
    }

    /// Terminal progress snapshot plus registry status.
    fn finish(
        &self,
        job_id: &str,
        attempted: usize,
        total: usize,
        status: JobStatus,
        error: Option<String>,
    ) {
        self.report(job_id, attempted, total, status);
        if let Err(e) = self
            .registry
            .set_status(&self.stage_id, job_id, status, error)
        {
            warn!(stage = %self.stage_id, job_id = %job_id, error = %e, "Failed to update job status");
        }
    }

    fn report(&self, job_id: &str, current: usize, total: usize, status: JobStatus) {
        if let Err(e) = self.progress.report(job_id, current, total, status) {
            warn!(stage = %self.stage_id, job_id = %job_id, error = %e, "Failed to write progress");
        }
    }
}
