//! Job service: the surface callers use to start, stop and watch stage jobs.

use super::{BatchEngine, RunParams, RunReport};
use crate::checkpoint::TableStore;
use crate::jobs::{
    CancellationChannel, FileJobStore, JobRegistry, JobStore, ProgressReporter, StageGuard,
};
use crate::lookup::{CompletionLookup, Lookup, ProbeLookup, Retrying};
use crate::models::{
    Config, Job, JobStatus, ProgressSnapshot, Result, StageConfig, StageKind, StagehandError,
};
use crate::session::{CircuitProvider, DirectProvider, IdentityProvider};
use std::path::Path;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{Instrument, info, info_span, warn};

/// Per-job overrides of the engine defaults.
#[derive(Debug, Clone)]
pub struct StartParams {
    pub max_rows: Option<usize>,
    pub batch_size: Option<usize>,
    /// First row in scope; negative values are rejected
    pub offset: i64,
    pub rotation_interval: Option<usize>,
    /// Apply the stage's `prune_status` after a completed run
    pub prune: bool,
}

impl Default for StartParams {
    fn default() -> Self {
        Self {
            max_rows: None,
            batch_size: None,
            offset: 0,
            rotation_interval: None,
            prune: true,
        }
    }
}

/// A started job. The registry remains the durable record; the handle lets
/// an in-process caller await the result.
#[derive(Debug)]
pub struct JobHandle {
    pub job_id: String,
    pub stage_id: String,
    task: JoinHandle<Result<RunReport>>,
}

impl JobHandle {
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the run to end.
    pub async fn wait(self) -> Result<RunReport> {
        self.task
            .await
            .map_err(|e| StagehandError::Internal(format!("job task failed: {e}")))?
    }
}

/// Starts and supervises stage jobs over a shared job store.
pub struct JobService {
    config: Arc<Config>,
    store: Arc<dyn JobStore>,
    registry: Arc<JobRegistry>,
}

impl JobService {
    pub fn new(config: Config, store: Arc<dyn JobStore>) -> Self {
        Self {
            config: Arc::new(config),
            registry: Arc::new(JobRegistry::new(Arc::clone(&store))),
            store,
        }
    }

    /// Service over a file store in the configured state directory.
    pub fn from_config(config: Config) -> Result<Self> {
        let store = FileJobStore::new(&config.state.dir)?;
        Ok(Self::new(config, Arc::new(store)))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn stage(&self, stage_id: &str) -> Result<&StageConfig> {
        self.config
            .stage(stage_id)
            .map_err(|_| StagehandError::UnknownStage(stage_id.to_string()))
    }

    /// Start a job for `stage_id` over `input` and return immediately.
    ///
    /// Fails with `StageBusy` while another job of the stage holds its lock.
    pub fn start_job(
        &self,
        stage_id: &str,
        input: &Path,
        params: StartParams,
    ) -> Result<JobHandle> {
        let stage = self.stage(stage_id)?;

        let mut engine_config = self.config.engine.clone();
        if let Some(max_rows) = params.max_rows {
            engine_config.max_rows = max_rows;
        }
        if let Some(batch_size) = params.batch_size {
            engine_config.batch_size = batch_size;
        }
        if let Some(interval) = params.rotation_interval {
            engine_config.rotation_interval = interval;
        }
        let mut run_params = RunParams::new(&engine_config, params.offset)?;
        if params.prune {
            run_params.prune_status = stage.prune_status.clone();
        }

        let input_path = stage.input_path(input);
        let output_path = stage.output_path(input);
        let launch = Launch {
            stage_id: stage_id.to_string(),
            tables: TableStore::new(&input_path, &output_path),
            params: run_params,
            required_columns: stage.all_required_columns(),
        };

        // Build the lookup before touching any state so config errors leave no trace
        let lookup = StageLookup::build(&self.config, stage)?;

        let guard = self.store.lock_stage(stage_id)?;
        CancellationChannel::new(Arc::clone(&self.store), stage_id).clear()?;

        let job = self.registry.create(
            stage_id,
            &input_path.display().to_string(),
            &output_path.display().to_string(),
        )?;
        let progress = ProgressReporter::new(Arc::clone(&self.store), stage_id);
        if let Err(e) = progress.report(&job.job_id, 0, 0, JobStatus::Running) {
            let failed = self.registry.set_status(
                stage_id,
                &job.job_id,
                JobStatus::Failed,
                Some(e.to_string()),
            );
            if let Err(mark_err) = failed {
                warn!(
                    stage = %stage_id,
                    job_id = %job.job_id,
                    error = %mark_err,
                    "Failed to mark job failed"
                );
            }
            return Err(e);
        }

        info!(
            stage = %stage_id,
            job_id = %job.job_id,
            input = %input_path.display(),
            circuit = stage.use_circuit,
            "Job started"
        );

        let task = match (lookup, stage.use_circuit) {
            (StageLookup::Completion(l), true) => self.spawn(self.circuit(), l, launch, &job, guard),
            (StageLookup::Completion(l), false) => self.spawn(self.direct(), l, launch, &job, guard),
            (StageLookup::Probe(l), true) => self.spawn(self.circuit(), l, launch, &job, guard),
            (StageLookup::Probe(l), false) => self.spawn(self.direct(), l, launch, &job, guard),
        };

        Ok(JobHandle {
            job_id: job.job_id,
            stage_id: stage_id.to_string(),
            task,
        })
    }

    /// Ask the stage's running job to stop. Idempotent; returns the ids of
    /// jobs that were marked stopped.
    pub fn request_stop(&self, stage_id: &str) -> Result<Vec<String>> {
        CancellationChannel::new(Arc::clone(&self.store), stage_id).request_stop()?;
        let stopped = self.registry.stop_running(stage_id)?;
        let progress = ProgressReporter::new(Arc::clone(&self.store), stage_id);
        for job_id in &stopped {
            progress.mark_stopped(job_id)?;
        }
        Ok(stopped)
    }

    pub fn get_progress(
        &self,
        stage_id: &str,
        job_id: &str,
    ) -> Result<Option<ProgressSnapshot>> {
        self.store.load_progress(stage_id, job_id)
    }

    /// Jobs of a stage in creation order.
    pub fn list_jobs(&self, stage_id: &str) -> Result<Vec<Job>> {
        self.registry.list(stage_id)
    }

    fn direct(&self) -> DirectProvider {
        DirectProvider::new(self.config.http.clone())
    }

    fn circuit(&self) -> CircuitProvider {
        CircuitProvider::new(self.config.circuit.clone(), self.config.http.clone())
    }

    fn spawn<P, L>(
        &self,
        provider: P,
        mut lookup: Retrying<L>,
        launch: Launch,
        job: &Job,
        guard: StageGuard,
    ) -> JoinHandle<Result<RunReport>>
    where
        P: IdentityProvider + 'static,
        L: Lookup<P::Session> + 'static,
    {
        let Launch {
            stage_id,
            tables,
            params,
            required_columns,
        } = launch;
        let span = info_span!("job", stage = %stage_id, job_id = %job.job_id);
        let job_id = job.job_id.clone();
        let mut engine = BatchEngine::new(
            stage_id,
            tables,
            provider,
            Arc::clone(&self.store),
            Arc::clone(&self.registry),
        );

        tokio::spawn(
            async move {
                let result = engine
                    .execute(&mut lookup, &params, &job_id, &required_columns)
                    .await;
                drop(guard);

                let stats = lookup.stats();
                info!(
                    attempts = stats.attempts(),
                    retries = stats.retries(),
                    rate_limited = stats.rate_limited(),
                    waited = ?stats.total_wait(),
                    "Lookup stats"
                );
                result
            }
            .instrument(span),
        )
    }
}

/// Everything a run needs besides the provider and lookup.
struct Launch {
    stage_id: String,
    tables: TableStore,
    params: RunParams,
    required_columns: Vec<String>,
}

enum StageLookup {
    Completion(Retrying<CompletionLookup>),
    Probe(Retrying<ProbeLookup>),
}

impl StageLookup {
    fn build(config: &Config, stage: &StageConfig) -> Result<Self> {
        Ok(match stage.kind {
            StageKind::Completion => {
                let api_key = config.resolve_api_key()?;
                let lookup = CompletionLookup::new(config.completion.clone(), Some(api_key), stage);
                StageLookup::Completion(Retrying::new(lookup, &config.retry))
            }
            StageKind::Probe => {
                StageLookup::Probe(Retrying::new(ProbeLookup::new(stage)?, &config.retry))
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::MemoryJobStore;
    use crate::lookup::tests::serve;
    use crate::models::{RetryConfig, Table};
    use std::path::PathBuf;
    use tempfile::TempDir;

    const STAGE: &str = "probe_sites";

    fn config(dir: &Path) -> Config {
        let mut config = Config::default();
        config.engine.row_delay_ms = 0;
        config.retry = RetryConfig {
            max_attempts: 1,
            base_delay_ms: 1,
            max_delay_ms: 1,
            ..Default::default()
        };
        config.stages.insert(
            STAGE.to_string(),
            StageConfig {
                kind: StageKind::Probe,
                input_dir: Some(dir.to_path_buf()),
                output_dir: dir.join("out"),
                output_prefix: "Probed_".into(),
                required_columns: Vec::new(),
                source_field: "Website".into(),
                target_field: "Website Title".into(),
                prune_status: Some("no_result".into()),
                use_circuit: false,
                system_prompt: None,
                block_markers: vec!["access denied".into()],
            },
        );
        config
    }

    fn write_input(dir: &Path, urls: &[&str]) -> PathBuf {
        let mut content = String::from("Website\n");
        for url in urls {
            content.push_str(url);
            content.push('\n');
        }
        std::fs::write(dir.join("sites.csv"), content).unwrap();
        PathBuf::from("sites.csv")
    }

    fn service(dir: &Path) -> (JobService, Arc<MemoryJobStore>) {
        let store = Arc::new(MemoryJobStore::new());
        (JobService::new(config(dir), store.clone()), store)
    }

    #[tokio::test]
    async fn test_start_job_runs_to_completion() {
        let dir = TempDir::new().unwrap();
        let base = serve(vec![
            (200, "<title>One</title>".into()),
            (404, String::new()),
            (200, "<title>Three</title>".into()),
        ])
        .await;
        let input = write_input(dir.path(), &[&base, &base, &base]);
        let (service, _) = service(dir.path());

        let handle = service.start_job(STAGE, &input, StartParams::default()).unwrap();
        let job_id = handle.job_id.clone();
        let report = handle.wait().await.unwrap();

        assert_eq!(report.status, JobStatus::Completed);
        assert_eq!(report.pruned, 1);
        let jobs = service.list_jobs(STAGE).unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].status, JobStatus::Completed);

        let progress = service.get_progress(STAGE, &job_id).unwrap().unwrap();
        assert_eq!((progress.current_row, progress.total_rows), (3, 3));
        assert_eq!(progress.status, JobStatus::Completed);

        let output = dir.path().join("out").join("Probed_sites.csv");
        let table = Table::from_csv(&std::fs::read_to_string(output).unwrap()).unwrap();
        let titles: Vec<&str> = table
            .rows()
            .iter()
            .map(|r| r.get("Website Title").unwrap_or_default())
            .collect();
        assert_eq!(titles, vec!["One", "Three"]);
    }

    #[tokio::test]
    async fn test_start_clears_stale_stop_flag() {
        let dir = TempDir::new().unwrap();
        let base = serve(vec![(200, "<title>Up</title>".into())]).await;
        let input = write_input(dir.path(), &[&base]);
        let (service, store) = service(dir.path());
        store.raise_stop(STAGE).unwrap();

        let handle = service.start_job(STAGE, &input, StartParams::default()).unwrap();
        assert_eq!(handle.wait().await.unwrap().status, JobStatus::Completed);
        assert!(!store.stop_raised(STAGE));
    }

    #[tokio::test]
    async fn test_busy_stage_is_rejected_without_side_effects() {
        let dir = TempDir::new().unwrap();
        let input = write_input(dir.path(), &["example.com"]);
        let (service, store) = service(dir.path());

        let _held = store.lock_stage(STAGE).unwrap();
        store.raise_stop(STAGE).unwrap();

        let err = service
            .start_job(STAGE, &input, StartParams::default())
            .unwrap_err();
        assert!(matches!(err, StagehandError::StageBusy(_)));
        assert!(store.stop_raised(STAGE));
        assert!(service.list_jobs(STAGE).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_bad_requests_register_nothing() {
        let dir = TempDir::new().unwrap();
        let input = write_input(dir.path(), &["example.com"]);
        let (service, _) = service(dir.path());

        assert!(matches!(
            service.start_job("nope", &input, StartParams::default()),
            Err(StagehandError::UnknownStage(_))
        ));
        let params = StartParams {
            offset: -3,
            ..Default::default()
        };
        assert!(matches!(
            service.start_job(STAGE, &input, params),
            Err(StagehandError::InvalidInput(_))
        ));
        assert!(service.list_jobs(STAGE).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_input_fails_registered_job() {
        let dir = TempDir::new().unwrap();
        let (service, _) = service(dir.path());

        let handle = service
            .start_job(STAGE, Path::new("absent.csv"), StartParams::default())
            .unwrap();
        assert!(handle.wait().await.is_err());
        let jobs = service.list_jobs(STAGE).unwrap();
        assert_eq!(jobs[0].status, JobStatus::Failed);
    }

    #[test]
    fn test_request_stop_marks_running_jobs() {
        let dir = TempDir::new().unwrap();
        let (service, store) = service(dir.path());
        let job = service.registry.create(STAGE, "in", "out").unwrap();
        ProgressReporter::new(store.clone(), STAGE)
            .report(&job.job_id, 4, 10, JobStatus::Running)
            .unwrap();

        assert_eq!(service.request_stop(STAGE).unwrap(), vec![job.job_id.clone()]);
        assert!(service.request_stop(STAGE).unwrap().is_empty());

        assert!(store.stop_raised(STAGE));
        assert_eq!(service.list_jobs(STAGE).unwrap()[0].status, JobStatus::Stopped);
        let progress = service.get_progress(STAGE, &job.job_id).unwrap().unwrap();
        assert_eq!((progress.current_row, progress.status), (4, JobStatus::Stopped));
    }

    /// Memory store whose progress writes always fail.
    #[derive(Default)]
    struct ReadOnlyProgress {
        inner: MemoryJobStore,
    }

    impl JobStore for ReadOnlyProgress {
        fn load_jobs(&self, stage_id: &str) -> Result<Vec<Job>> {
            self.inner.load_jobs(stage_id)
        }

        fn save_jobs(&self, stage_id: &str, jobs: &[Job]) -> Result<()> {
            self.inner.save_jobs(stage_id, jobs)
        }

        fn load_progress(
            &self,
            stage_id: &str,
            job_id: &str,
        ) -> Result<Option<ProgressSnapshot>> {
            self.inner.load_progress(stage_id, job_id)
        }

        fn save_progress(&self, _stage_id: &str, _snapshot: &ProgressSnapshot) -> Result<()> {
            Err(StagehandError::io(
                "writing progress",
                std::io::Error::other("disk full"),
            ))
        }

        fn raise_stop(&self, stage_id: &str) -> Result<()> {
            self.inner.raise_stop(stage_id)
        }

        fn clear_stop(&self, stage_id: &str) -> Result<()> {
            self.inner.clear_stop(stage_id)
        }

        fn stop_raised(&self, stage_id: &str) -> bool {
            self.inner.stop_raised(stage_id)
        }

        fn lock_stage(&self, stage_id: &str) -> Result<StageGuard> {
            self.inner.lock_stage(stage_id)
        }
    }

    #[tokio::test]
    async fn test_initial_progress_failure_fails_the_job() {
        let dir = TempDir::new().unwrap();
        let input = write_input(dir.path(), &["example.com"]);
        let store = Arc::new(ReadOnlyProgress::default());
        let service = JobService::new(config(dir.path()), store.clone());

        let err = service
            .start_job(STAGE, &input, StartParams::default())
            .unwrap_err();
        assert!(matches!(err, StagehandError::Io { .. }));

        let jobs = service.list_jobs(STAGE).unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].status, JobStatus::Failed);
        assert!(jobs[0].error.as_deref().unwrap().contains("writing progress"));

        // The lock went with the failed start, so the stage is free again
        assert!(store.lock_stage(STAGE).is_ok());
    }
}
