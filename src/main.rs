use std::path::PathBuf;

use anyhow::{Context, Result};
use bobsled::config::{self, BobsledConfig, LoggingConfig};
use bobsled::history::{Run, RunStatus};
use bobsled::storage::{self, RunFilter, StatusFilter, StorageError};
use chrono::Utc;
use clap::{Parser, Subcommand};
use uuid::Uuid;

#[derive(Parser)]
#[command(
    name = "bobsled",
    about = "Run history and daily status for scheduled jobs",
    version,
    long_about = None
)]
struct Cli {
    /// Configuration file (defaults to $BOBSLED_CONFIG, then /etc/bobsled/bobsled.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the per-entity, per-day status grid
    Report {
        /// Trailing window in days (defaults to the configured window)
        #[arg(long)]
        days: Option<u32>,

        /// JSON output for exporters
        #[arg(long)]
        json: bool,
    },

    /// Inspect and record runs
    Runs {
        #[command(subcommand)]
        action: RunsAction,
    },

    /// Manage the task directory
    Tasks {
        #[command(subcommand)]
        action: TasksAction,
    },
}

#[derive(Subcommand)]
enum RunsAction {
    /// List recorded runs in insertion order
    List {
        /// Comma-separated statuses (running, success, failure)
        #[arg(long, default_value = "")]
        status: String,

        /// Only runs of this task
        #[arg(long)]
        task: Option<String>,

        /// Only the N most recent matches
        #[arg(long)]
        latest: Option<usize>,
    },

    /// Record the start of a run and print its id
    Start {
        #[arg(long)]
        task: String,

        #[arg(long)]
        entity: String,
    },

    /// Record the outcome of a running run
    Finish {
        #[arg(long)]
        id: Uuid,

        /// success or failure
        #[arg(long)]
        status: RunStatus,

        /// Failure detail
        #[arg(long)]
        detail: Option<String>,
    },
}

#[derive(Subcommand)]
enum TasksAction {
    /// List the task directory
    List,

    /// Replace the task directory from a TOML file of [[task]] tables
    Load {
        /// Task file path
        file: PathBuf,
    },
}

fn default_filter(logging: &LoggingConfig) -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&logging.level))
}

fn init_tracing(logging: &LoggingConfig) {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(default_filter(logging))
        .with_writer(std::io::stderr);
    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // config loading logs through a default subscriber until the configured one is up
    let bootstrap = tracing_subscriber::fmt()
        .with_env_filter(default_filter(&LoggingConfig::default()))
        .with_writer(std::io::stderr)
        .finish();
    let cfg = tracing::subscriber::with_default(bootstrap, || {
        BobsledConfig::resolve(cli.config.as_deref())
    })?;
    init_tracing(&cfg.logging);

    match cli.command {
        Commands::Report { days, json } => {
            let days = days.unwrap_or(cfg.report.days);
            tracing::info!(days, "Building status report");
            let report = bobsled::check_status(&cfg, Some(days)).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else if report.is_empty() {
                println!("No runs in the last {} days.", days);
            } else {
                print!("{}", report);
            }
        }
        Commands::Runs { action } => {
            let store = storage::open(&cfg.storage).await?;
            match action {
                RunsAction::List {
                    status,
                    task,
                    latest,
                } => {
                    let mut filter = RunFilter::new().status(StatusFilter::parse(&status)?);
                    filter.task = task;
                    filter.latest = latest;
                    let runs = store.get_runs(&filter).await?;
                    if runs.is_empty() {
                        println!("No runs found.");
                    } else {
                        println!(
                            "{:<36} | {:<16} | {:<10} | {:<8} | {:<19} | Detail",
                            "Id", "Task", "Entity", "Status", "Started"
                        );
                        println!(
                            "{:-<36}-|-{:-<16}-|-{:-<10}-|-{:-<8}-|-{:-<19}-|-{:-<10}",
                            "", "", "", "", "", ""
                        );
                        for run in runs {
                            let outcome = if run.is_failure() && run.status != RunStatus::Failure {
                                "flagged".to_string()
                            } else {
                                run.status.to_string()
                            };
                            println!(
                                "{:<36} | {:<16} | {:<10} | {:<8} | {:<19} | {}",
                                run.id,
                                run.task,
                                run.entity,
                                outcome,
                                run.started_at.format("%Y-%m-%d %H:%M:%S").to_string(),
                                run.failure.as_deref().unwrap_or("")
                            );
                        }
                    }
                }
                RunsAction::Start { task, entity } => {
                    let run = Run::start(task, entity);
                    store.add_run(&run).await?;
                    println!("{}", run.id);
                }
                RunsAction::Finish { id, status, detail } => {
                    if !status.is_terminal() {
                        anyhow::bail!("a run can only finish as success or failure");
                    }
                    let mut run = store
                        .get_run(id)
                        .await?
                        .ok_or_else(|| StorageError::run_not_found(id))?;
                    run.status = status;
                    run.failure = detail;
                    run.finished_at = Some(Utc::now());
                    store.save_run(&run).await?;
                    println!("Run {} finished: {}", id, status);
                }
            }
        }
        Commands::Tasks { action } => {
            let store = storage::open(&cfg.storage).await?;
            match action {
                TasksAction::List => {
                    let tasks = store.get_tasks().await?;
                    if tasks.is_empty() {
                        println!("No tasks defined.");
                    } else {
                        for task in tasks {
                            println!("{:<24} {}", task.name, task.metadata);
                        }
                    }
                }
                TasksAction::Load { file } => {
                    let tasks = config::load_tasks(&file)?;
                    store
                        .set_tasks(&tasks)
                        .await
                        .with_context(|| format!("failed to store tasks from {}", file.display()))?;
                    println!("Loaded {} tasks.", tasks.len());
                }
            }
        }
    }

    Ok(())
}
