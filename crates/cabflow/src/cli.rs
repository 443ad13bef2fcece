//! Command-line interface
//!
//! `cabflow run` is the usual entry point: it applies migrations, starts the
//! stage workers and watches the intake directory. The other subcommands
//! split those roles across processes or inspect and repair state.

use anyhow::{Context, Result};
use cabflow_common::logging::{LogConfig, LogLevel};
use clap::{Parser, Subcommand};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::{Config, DatabaseConfig};
use crate::queue::{JobQueue, PgJobQueue, Topic};
use crate::tracker::BatchTracker;
use crate::trigger::DirectoryTrigger;
use crate::{Pipeline, MIGRATOR};

/// cabflow - CSV trip ingestion pipeline
#[derive(Parser, Debug)]
#[command(name = "cabflow")]
#[command(author, version, about, long_about = None)]
#[command(arg_required_else_help = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Apply migrations, run all stage workers and watch the intake directory
    Run {
        /// Intake directory (overrides DATA_INTAKE)
        #[arg(long)]
        intake: Option<PathBuf>,
    },

    /// Run the stage workers only
    Work,

    /// Watch the intake directory and enqueue new files only
    Watch {
        /// Intake directory (overrides DATA_INTAKE)
        #[arg(long)]
        intake: Option<PathBuf>,
    },

    /// Enqueue files for staging
    Submit {
        /// CSV files to ingest
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },

    /// Show recent batches and queue depths
    Status {
        /// Number of batches to show
        #[arg(short, long, default_value_t = 20)]
        limit: i64,

        /// Print batches as JSON
        #[arg(long)]
        json: bool,
    },

    /// List dead-lettered jobs, or requeue one
    DeadLetters {
        /// Only this topic (new-data, staged-data, cleaned-data, loaded-data)
        #[arg(long)]
        topic: Option<Topic>,

        /// Give the dead job with this id a fresh attempt budget
        #[arg(long)]
        requeue: Option<i64>,
    },

    /// Apply database migrations and exit
    Migrate,
}

/// Execute a parsed command line
/// Logging setup for the process. `-v` raises everything to debug;
/// otherwise `LOG_LEVEL` and `LOG_FILTER` decide. sqlx stays at warn unless
/// `LOG_FILTER` names it.
pub fn log_config(mut base: LogConfig, verbose: bool) -> LogConfig {
    if verbose {
        base.level = LogLevel::Debug;
    }
    base.with_default_directives("sqlx=warn")
}

pub async fn execute(cli: Cli) -> Result<()> {
    let mut config = Config::load().context("Failed to load configuration")?;

    match cli.command {
        Commands::Run { intake } => {
            if let Some(intake) = intake {
                config.trigger.intake_dir = intake;
            }
            let pool = connect(&config.database).await?;
            migrate(&pool).await?;
            run(pool, config, true, true).await
        },
        Commands::Work => {
            let pool = connect(&config.database).await?;
            run(pool, config, true, false).await
        },
        Commands::Watch { intake } => {
            if let Some(intake) = intake {
                config.trigger.intake_dir = intake;
            }
            let pool = connect(&config.database).await?;
            run(pool, config, false, true).await
        },
        Commands::Submit { paths } => {
            let pool = connect(&config.database).await?;
            submit(pool, config, paths).await
        },
        Commands::Status { limit, json } => {
            let pool = connect(&config.database).await?;
            status(pool, config, limit, json).await
        },
        Commands::DeadLetters { topic, requeue } => {
            let pool = connect(&config.database).await?;
            dead_letters(pool, config, topic, requeue).await
        },
        Commands::Migrate => {
            let pool = connect(&config.database).await?;
            migrate(&pool).await
        },
    }
}

async fn connect(database: &DatabaseConfig) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(database.max_connections)
        .min_connections(database.min_connections)
        .acquire_timeout(Duration::from_secs(database.connect_timeout_secs))
        .connect(&database.url)
        .await
        .context("Failed to connect to the database")?;

    info!("Database connection pool established");
    Ok(pool)
}

async fn migrate(pool: &PgPool) -> Result<()> {
    MIGRATOR
        .run(pool)
        .await
        .context("Failed to run migrations")?;

    info!("Database migrations completed");
    Ok(())
}

async fn run(pool: PgPool, config: Config, workers: bool, watch: bool) -> Result<()> {
    let queue: Arc<dyn JobQueue> = Arc::new(PgJobQueue::new(pool.clone(), config.queue.clone()));
    let shutdown = CancellationToken::new();

    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            shutdown_signal().await;
            shutdown.cancel();
        }
    });

    let pipeline = workers.then(|| Pipeline::new(pool, queue.clone(), config.clone()));

    let trigger = if watch {
        tokio::fs::create_dir_all(&config.trigger.intake_dir)
            .await
            .with_context(|| {
                format!("Failed to create intake directory {}", config.trigger.intake_dir.display())
            })?;
        Some(DirectoryTrigger::new(&config.trigger, queue))
    } else {
        None
    };

    let run_workers = async {
        if let Some(pipeline) = &pipeline {
            pipeline.run(shutdown.clone()).await;
        }
    };
    let run_trigger = async {
        if let Some(trigger) = trigger {
            trigger.run(shutdown.clone()).await;
        }
    };

    tokio::join!(run_workers, run_trigger);

    info!("Shut down gracefully");
    Ok(())
}

async fn submit(pool: PgPool, config: Config, paths: Vec<PathBuf>) -> Result<()> {
    let queue: Arc<dyn JobQueue> = Arc::new(PgJobQueue::new(pool.clone(), config.queue.clone()));
    let pipeline = Pipeline::new(pool, queue, config);

    for path in paths {
        let path = tokio::fs::canonicalize(&path)
            .await
            .with_context(|| format!("Cannot resolve {}", path.display()))?;
        pipeline.submit(&path).await?;
        println!("submitted {}", path.display());
    }

    Ok(())
}

async fn status(pool: PgPool, config: Config, limit: i64, json: bool) -> Result<()> {
    let tracker = BatchTracker::new(pool.clone());
    let batches = tracker.list_recent(limit).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&batches)?);
        return Ok(());
    }

    let queue = PgJobQueue::new(pool, config.queue);
    println!("Queues:");
    for topic in Topic::ALL {
        let depth = queue.depth(topic).await?;
        let dead = queue.dead_jobs(topic).await?.len();
        println!("  {:<14} {:>6} waiting {:>6} dead", topic.as_str(), depth, dead);
    }

    println!();
    println!("Recent batches:");
    if batches.is_empty() {
        println!("  (none)");
    }
    for batch in batches {
        let updated = batch
            .updated_at
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_default();
        println!(
            "  {}  {:<8}  {}  {}",
            batch.id,
            batch.state.as_str(),
            updated,
            batch.source_path.display()
        );
        if let Some(error) = batch.last_error {
            println!("            error: {error}");
        }
    }

    Ok(())
}

async fn dead_letters(
    pool: PgPool,
    config: Config,
    topic: Option<Topic>,
    requeue: Option<i64>,
) -> Result<()> {
    let queue = PgJobQueue::new(pool, config.queue);

    if let Some(id) = requeue {
        if queue.requeue_dead(id).await? {
            println!("requeued job {id}");
            return Ok(());
        }
        anyhow::bail!("No dead job with id {id}");
    }

    let topics: Vec<Topic> = match topic {
        Some(topic) => vec![topic],
        None => Topic::ALL.to_vec(),
    };

    let mut total = 0;
    for topic in topics {
        for job in queue.dead_jobs(topic).await? {
            total += 1;
            println!(
                "{:>8}  {:<13} attempts={}  {}",
                job.id, job.topic.as_str(), job.attempts, job.payload
            );
            if let Some(error) = job.last_error {
                println!("          {error}");
            }
        }
    }

    if total == 0 {
        println!("No dead-lettered jobs");
    }

    Ok(())
}

/// Wait for Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, finishing in-flight jobs");
        },
        _ = terminate => {
            info!("Received terminate signal, finishing in-flight jobs");
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_dead_letters_topic() {
        let cli = Cli::try_parse_from(["cabflow", "dead-letters", "--topic", "cleaned-data"]).unwrap();
        match cli.command {
            Commands::DeadLetters { topic, requeue } => {
                assert_eq!(topic, Some(Topic::CleanedData));
                assert_eq!(requeue, None);
            },
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_log_level_reaches_own_logs_without_verbose() {
        let base = LogConfig {
            level: LogLevel::Debug,
            ..Default::default()
        };
        let config = log_config(base, false);
        assert_eq!(config.level, LogLevel::Debug);
        assert_eq!(config.filter_directives.as_deref(), Some("sqlx=warn"));

        let config = log_config(LogConfig::default(), true);
        assert_eq!(config.level, LogLevel::Debug);
        assert!(!config.filter_directives.unwrap_or_default().contains("cabflow="));
    }

    #[test]
    fn test_submit_requires_a_path() {
        assert!(Cli::try_parse_from(["cabflow", "submit"]).is_err());
    }
}
