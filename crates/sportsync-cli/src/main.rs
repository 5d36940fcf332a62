use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use sportsync_core::RunStatus;
use sportsync_sync::{shutdown_signal, AppConfig, SyncApp};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "sportsync")]
#[command(about = "Scheduled multi-source sports statistics collector")]
struct Cli {
    /// Configuration file (defaults to $SPORTSYNC_CONFIG, then ./sportsync.yaml)
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    /// Debug-level logging unless RUST_LOG is set
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the scheduler until interrupted
    Start,
    /// Run one job immediately and print its result
    RunOnce { job_id: String },
    /// Show every registered job
    Status,
    /// Show recent results for a job
    History {
        job_id: String,
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
    /// Validate the configuration and exit
    CheckConfig,
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();
}

fn load_config(explicit: Option<PathBuf>) -> Result<AppConfig> {
    let path = AppConfig::resolve_path(explicit.as_deref());
    let mut config = AppConfig::load(&path)?;
    config.apply_env_overrides();
    info!(path = %path.display(), database = %config.database_path.display(), "configuration loaded");
    Ok(config)
}

fn when(value: Option<DateTime<Utc>>) -> String {
    value
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "-".to_string())
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::CheckConfig => {
            let config = load_config(cli.config)?;
            println!(
                "configuration ok: {} sources, {} jobs, database {}",
                config.sources.len(),
                config.jobs.len(),
                config.database_path.display()
            );
        }
        Commands::Start => {
            let app = SyncApp::from_config(load_config(cli.config)?)
                .await
                .context("starting sportsync")?;
            app.scheduler()
                .run_until_shutdown(shutdown_signal())
                .await?;
        }
        Commands::RunOnce { job_id } => {
            let app = SyncApp::from_config(load_config(cli.config)?).await?;
            let result = app
                .run_once(&job_id)
                .await
                .with_context(|| format!("running job {job_id}"))?;
            println!(
                "{} {}: {} record(s) in {:.1}s (run {})",
                result.job_id,
                result.status,
                result.records_collected,
                result.elapsed().num_milliseconds() as f64 / 1000.0,
                result.run_id
            );
            for error in &result.errors {
                println!("  error: {error}");
            }
            if result.status == RunStatus::Error {
                return Ok(ExitCode::FAILURE);
            }
        }
        Commands::Status => {
            let app = SyncApp::from_config(load_config(cli.config)?).await?;
            println!(
                "{:<20} {:<10} {:<14} {:<8} {:<7} {:<19} {:<19} {:>5} {:>5}",
                "JOB", "TYPE", "SOURCE", "CADENCE", "ENABLED", "LAST RUN", "NEXT RUN", "OK", "ERR"
            );
            for snapshot in app.status() {
                let job = &snapshot.job;
                println!(
                    "{:<20} {:<10} {:<14} {:<8} {:<7} {:<19} {:<19} {:>5} {:>5}",
                    job.job_id,
                    job.record_type.as_str(),
                    job.source,
                    job.cadence.as_str(),
                    if job.enabled { "yes" } else { "no" },
                    when(job.last_run),
                    when(job.next_run),
                    job.success_count,
                    job.error_count
                );
            }
        }
        Commands::History { job_id, limit } => {
            let app = SyncApp::from_config(load_config(cli.config)?).await?;
            for stored in app.history(&job_id, limit).await? {
                let result = &stored.result;
                println!(
                    "{}  {:<7} {:>6} record(s)  {:>6.1}s  {}",
                    when(Some(result.start_time)),
                    result.status.as_str(),
                    result.records_collected,
                    result.elapsed().num_milliseconds() as f64 / 1000.0,
                    result.errors.join("; ")
                );
            }
        }
    }

    Ok(ExitCode::SUCCESS)
}
