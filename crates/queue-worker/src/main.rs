use std::sync::Arc;

use queue_core::{JobQueue, QueueConfig};
use queue_store::StoreConfig;
use queue_worker::{HandlerRegistry, LogHandler, WorkerConfig};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "queue_worker=info,queue_core=info,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    queue_core::metrics::init_metrics();

    let store_cfg = StoreConfig::from_env();
    let cfg = WorkerConfig::from_env();

    let backend = queue_store::connect(&store_cfg).await?;
    backend.migrate().await?;

    let queue = JobQueue::new(backend.into_store()).with_config(QueueConfig {
        lock_duration: cfg.lock_duration,
        ..QueueConfig::default()
    });
    let handlers = HandlerRegistry::new().fallback(LogHandler);

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown signal received, finishing in-flight jobs");
        }
        signal_cancel.cancel();
    });

    queue_worker::run_worker(queue, Arc::new(handlers), cfg, cancel).await
}
