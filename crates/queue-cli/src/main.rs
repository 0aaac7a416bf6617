use std::{sync::Arc, time::Duration};

use anyhow::Context;
use clap::{Parser, Subcommand};
use queue_core::{AddJob, JobQueue, JobStatus, ListJobs, QueueConfig, QueueError, Retention};
use queue_store::StoreConfig;
use queue_worker::{HandlerRegistry, LogHandler, WorkerConfig};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "queue-cli", version, about = "CLI for the persistent job queue")]
struct Cli {
    /// postgres://... or sqlite://path
    #[arg(long, env = "DATABASE_URL", default_value = "sqlite://queue.db")]
    database_url: String,

    #[arg(long, env = "DATABASE_MAX_CONNECTIONS", default_value_t = 10)]
    max_connections: u32,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Add a job
    Add {
        #[arg(long = "type")]
        job_type: String,

        /// JSON payload string, e.g. '{"to":"a@example.com"}'
        #[arg(long, default_value = "{}")]
        json: String,

        #[arg(long, default_value = "default")]
        queue: String,

        /// Not claimable until this many milliseconds from now
        #[arg(long)]
        delay_ms: Option<u64>,

        #[arg(long)]
        max_attempts: Option<i32>,
    },

    /// List jobs, newest first
    List {
        #[arg(long)]
        queue: Option<String>,

        /// pending | processing | completed | failed
        #[arg(long)]
        status: Option<JobStatus>,

        #[arg(long)]
        limit: Option<i64>,
    },

    /// Show one job
    Get { id: Uuid },

    /// Job counts per status
    Stats {
        #[arg(long)]
        queue: Option<String>,

        /// Also print this process's Prometheus counters
        #[arg(long)]
        metrics: bool,
    },

    /// Return jobs with expired leases to the pool
    Recover,

    /// Delete old completed and failed jobs; a class without a window is kept
    Cleanup {
        #[arg(long)]
        completed_older_than_ms: Option<u64>,

        #[arg(long)]
        failed_older_than_ms: Option<u64>,
    },

    /// Apply database migrations
    Migrate,

    /// Run a worker (same as queue-worker binary, but convenient)
    Worker {
        #[arg(long, env = "QUEUE_NAME", default_value = "default")]
        queue: String,

        #[arg(long, env = "CONCURRENCY", default_value_t = 1)]
        concurrency: usize,

        #[arg(long, env = "LOCK_DURATION_MS", default_value_t = 30_000)]
        lock_ms: u64,

        #[arg(long, env = "POLL_INTERVAL_MS", default_value_t = 1_000)]
        poll_interval_ms: u64,
    },
}

fn print_json(value: &impl serde::Serialize) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "queue_cli=info,queue_worker=info,queue_core=warn,sqlx=warn".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    queue_core::metrics::init_metrics();

    let cli = Cli::parse();
    let store_cfg = StoreConfig {
        database_url: cli.database_url,
        max_connections: cli.max_connections,
    };
    let backend = queue_store::connect(&store_cfg)
        .await
        .with_context(|| format!("connecting to {}", store_cfg.database_url))?;
    backend.migrate().await.context("running migrations")?;

    let backend_name = backend.name();
    let queue = JobQueue::new(backend.into_store());

    match cli.command {
        Commands::Add {
            job_type,
            json,
            queue: queue_name,
            delay_ms,
            max_attempts,
        } => {
            let payload: Value = serde_json::from_str(&json).context("invalid JSON payload")?;

            let mut req = AddJob::new(job_type, payload).queue(queue_name);
            if let Some(ms) = delay_ms {
                req = req.delay(Duration::from_millis(ms));
            }
            if let Some(n) = max_attempts {
                req = req.max_attempts(n);
            }

            let job = queue.add_job(req).await?;
            println!("{}", job.id);
        }

        Commands::List {
            queue: queue_name,
            status,
            limit,
        } => {
            let jobs = queue
                .list_jobs(ListJobs {
                    queue: queue_name,
                    status,
                    limit,
                })
                .await?;
            print_json(&jobs)?;
        }

        Commands::Get { id } => match queue.get_job_by_id(id).await? {
            Some(job) => print_json(&job)?,
            None => return Err(QueueError::NotFound(id).into()),
        },

        Commands::Stats {
            queue: queue_name,
            metrics,
        } => {
            let stats = queue.get_job_stats(queue_name.as_deref()).await?;
            print_json(&stats)?;
            if metrics {
                print!("{}", queue_core::metrics::gather());
            }
        }

        Commands::Recover => {
            let n = queue.recover_stale_jobs().await?;
            println!("{n}");
        }

        Commands::Cleanup {
            completed_older_than_ms,
            failed_older_than_ms,
        } => {
            let n = queue
                .cleanup_jobs(Retention {
                    completed_older_than: completed_older_than_ms.map(Duration::from_millis),
                    failed_older_than: failed_older_than_ms.map(Duration::from_millis),
                })
                .await?;
            println!("{n}");
        }

        Commands::Worker {
            queue: queue_name,
            concurrency,
            lock_ms,
            poll_interval_ms,
        } => {
            let cfg = WorkerConfig {
                queue: queue_name,
                concurrency,
                lock_duration: Duration::from_millis(lock_ms),
                poll_interval: Duration::from_millis(poll_interval_ms),
                ..WorkerConfig::from_env()
            };
            let queue = queue.with_config(QueueConfig {
                lock_duration: cfg.lock_duration,
                ..QueueConfig::default()
            });

            let cancel = CancellationToken::new();
            let signal_cancel = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::info!("shutdown signal received, finishing in-flight jobs");
                }
                signal_cancel.cancel();
            });

            let handlers = HandlerRegistry::new().fallback(LogHandler);
            queue_worker::run_worker(queue, Arc::new(handlers), cfg, cancel).await?;
        }

        Commands::Migrate => println!("migrations applied ({backend_name})"),
    }

    Ok(())
}
