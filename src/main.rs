//! stagehand CLI - run, stop and watch resumable batch stages.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use stagehand::models::StageKind;
use stagehand::{Config, JobService, JobStatus, LoadSource, StartParams};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{Level, info, warn};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "stagehand")]
#[command(version)]
#[command(about = "Resumable, rate-limit-resilient batch stages over record tables")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to configuration file
    #[arg(short, long, global = true, default_value = "stagehand.toml")]
    config: PathBuf,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a stage over an input table (resumes from its snapshot)
    Run {
        /// Stage id from the config
        #[arg(short, long)]
        stage: String,

        /// Input table (CSV, or JSON Lines for .jsonl files)
        #[arg(short, long)]
        input: PathBuf,

        /// Maximum rows in scope
        #[arg(long)]
        max_rows: Option<usize>,

        /// Rows per window
        #[arg(long)]
        batch_size: Option<usize>,

        /// First row in scope
        #[arg(long, default_value = "0", allow_negative_numbers = true)]
        offset: i64,

        /// Successful lookups between identity rotations (0 disables)
        #[arg(long)]
        rotation_interval: Option<usize>,

        /// Keep rows carrying the stage's prune status
        #[arg(long)]
        no_prune: bool,
    },

    /// Ask a stage's running job to stop
    Stop {
        #[arg(short, long)]
        stage: String,
    },

    /// Show the progress of one job
    Progress {
        #[arg(short, long)]
        stage: String,

        #[arg(short, long)]
        job: String,
    },

    /// List a stage's jobs in creation order
    Jobs {
        #[arg(short, long)]
        stage: String,
    },

    /// Validate configuration file
    Validate,

    /// Show example configuration
    Example,
}

fn setup_logging(verbose: bool) -> Result<()> {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber).context("Failed to set subscriber")
}

fn load_config(path: &Path) -> Result<Config> {
    Config::from_file(path).with_context(|| format!("Failed to load config from {path:?}"))
}

fn print_example_config() {
    let example = r#"# stagehand configuration file

[state]
dir = "state"

[engine]
batch_size = 50
max_rows = 2000
rotation_interval = 30   # successful lookups between identity rotations, 0 disables
row_delay_ms = 1000

[circuit]
program = "tor"
args = ["--SocksPort", "9050"]
socks_port = 9050
settle_after_stop_secs = 5
settle_after_start_secs = 7

[http]
timeout_secs = 30

[completion]
# API key (can also use OPENAI_API_KEY env var)
# api_key = "${OPENAI_API_KEY}"
base_url = "https://api.openai.com/v1"
model = "gpt-4o-mini"
max_tokens = 128
temperature = 0.2

[retry]
max_attempts = 2
base_delay_ms = 2000
max_delay_ms = 60000
attempt_timeout_secs = 120

[stages.normalize_names]
kind = "completion"
input_dir = "data/raw"
output_dir = "data/normalized"
output_prefix = "Normalized_"
required_columns = ["Company"]
source_field = "Full Name"
target_field = "Normalized Name"
system_prompt = "Return the person's first and last name only, nothing else."

[stages.probe_sites]
kind = "probe"
input_dir = "data/normalized"
output_dir = "data/probed"
output_prefix = "Probed_"
source_field = "Website"
target_field = "Website Title"
prune_status = "no_result"
use_circuit = true
block_markers = ["too many requests", "access denied", "your request has been blocked"]
"#;
    println!("{example}");
}

async fn run_stage(
    service: &JobService,
    stage: &str,
    input: PathBuf,
    params: StartParams,
) -> Result<()> {
    let handle = service
        .start_job(stage, &input, params)
        .with_context(|| format!("Failed to start stage '{stage}'"))?;
    let job_id = handle.job_id.clone();
    info!(stage = %stage, job_id = %job_id, "Job running (Ctrl-C to stop)");

    let pb = ProgressBar::new(0);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} ({percent}%) {msg}")
            .context("Invalid progress template")?
            .progress_chars("##-"),
    );

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut stopping = false;
    let mut ticker = tokio::time::interval(Duration::from_millis(500));

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match service.get_progress(stage, &job_id) {
                    Ok(Some(progress)) => {
                        pb.set_length(u64::try_from(progress.total_rows).unwrap_or(u64::MAX));
                        pb.set_position(u64::try_from(progress.current_row).unwrap_or(u64::MAX));
                    }
                    Ok(None) => {}
                    Err(e) => warn!(error = %e, "Failed to read progress"),
                }
                if handle.is_finished() {
                    break;
                }
            }
            _ = &mut ctrl_c, if !stopping => {
                stopping = true;
                pb.set_message("stopping after the current row...");
                service.request_stop(stage).context("Failed to request stop")?;
            }
        }
    }

    let report = handle.wait().await?;
    pb.finish_with_message(report.status.to_string());

    println!("\n=== Stage {stage} {} ===", report.status);
    println!("Job:         {job_id}");
    if report.source == LoadSource::Snapshot {
        println!("Resumed:     from existing snapshot");
    }
    println!("Attempted:   {}/{}", report.attempted, report.total);
    println!("Processed:   {}/{}", report.table.processed_count(), report.table.len());
    println!("Rotations:   {}", report.rotations);
    if report.pruned > 0 {
        println!("Pruned:      {}", report.pruned);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose)?;

    match cli.command {
        Commands::Example => {
            print_example_config();
        }

        Commands::Validate => {
            let config = load_config(&cli.config)?;

            let needs_key = config
                .stages
                .values()
                .any(|s| s.kind == StageKind::Completion);
            if needs_key {
                config
                    .resolve_api_key()
                    .context("Failed to resolve API key")?;
            }

            info!("Configuration is valid");
            info!("  State dir: {}", config.state.dir.display());
            info!(
                "  Batch size: {}, max rows: {}, rotation every {}",
                config.engine.batch_size, config.engine.max_rows, config.engine.rotation_interval
            );
            for (id, stage) in &config.stages {
                info!(
                    "  Stage {id}: {:?} {} -> {} (circuit: {})",
                    stage.kind, stage.source_field, stage.target_field, stage.use_circuit
                );
            }
        }

        Commands::Run {
            stage,
            input,
            max_rows,
            batch_size,
            offset,
            rotation_interval,
            no_prune,
        } => {
            let service = JobService::from_config(load_config(&cli.config)?)?;
            let params = StartParams {
                max_rows,
                batch_size,
                offset,
                rotation_interval,
                prune: !no_prune,
            };
            run_stage(&service, &stage, input, params).await?;
        }

        Commands::Stop { stage } => {
            let service = JobService::from_config(load_config(&cli.config)?)?;
            let stopped = service.request_stop(&stage)?;
            if stopped.is_empty() {
                println!("Stop flag raised for {stage}; no running job found");
            }
            for job_id in stopped {
                println!("Stopped job {job_id}");
            }
        }

        Commands::Progress { stage, job } => {
            let service = JobService::from_config(load_config(&cli.config)?)?;
            match service.get_progress(&stage, &job)? {
                Some(p) => println!(
                    "{}/{} ({:.1}%) {}",
                    p.current_row,
                    p.total_rows,
                    p.percent(),
                    p.status
                ),
                None => println!("No progress recorded for job {job}"),
            }
        }

        Commands::Jobs { stage } => {
            let service = JobService::from_config(load_config(&cli.config)?)?;
            let jobs = service.list_jobs(&stage)?;
            if jobs.is_empty() {
                println!("No jobs for {stage}");
            }
            for job in jobs {
                let marker = if job.status == JobStatus::Running { "*" } else { " " };
                println!(
                    "{marker} {:>3}  {}  {:<9}  {}  {}",
                    job.seq,
                    job.job_id,
                    job.status.to_string(),
                    job.created_at.format("%Y-%m-%d %H:%M:%S"),
                    job.error.as_deref().unwrap_or_default()
                );
            }
        }
    }

    Ok(())
}
