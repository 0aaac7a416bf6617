pub mod postgres;
pub mod sqlite;

use std::sync::Arc;

use queue_core::{JobStatus, QueueError, QueueStore};

use crate::config::StoreConfig;
use postgres::PostgresStore;
use sqlite::SqliteStore;

pub(crate) fn db_err(e: sqlx::Error) -> QueueError {
    QueueError::Database(e.to_string())
}

pub(crate) fn parse_status(s: &str) -> Result<JobStatus, QueueError> {
    s.parse()
        .map_err(|_| QueueError::Internal(format!("unknown job status: {s}")))
}

/// A connected store, whichever database `DATABASE_URL` pointed at.
#[derive(Clone)]
pub enum Backend {
    Postgres(PostgresStore),
    Sqlite(SqliteStore),
}

impl Backend {
    pub fn name(&self) -> &'static str {
        match self {
            Backend::Postgres(_) => "postgres",
            Backend::Sqlite(_) => "sqlite",
        }
    }

    pub async fn migrate(&self) -> Result<(), QueueError> {
        match self {
            Backend::Postgres(store) => store.migrate().await,
            Backend::Sqlite(store) => store.migrate().await,
        }
    }

    pub fn into_store(self) -> Arc<dyn QueueStore> {
        match self {
            Backend::Postgres(store) => Arc::new(store),
            Backend::Sqlite(store) => Arc::new(store),
        }
    }
}

pub async fn connect(cfg: &StoreConfig) -> Result<Backend, QueueError> {
    let url = cfg.database_url.as_str();
    let backend = if url.starts_with("postgres://") || url.starts_with("postgresql://") {
        Backend::Postgres(PostgresStore::connect(url, cfg.max_connections).await?)
    } else if url.starts_with("sqlite:") {
        Backend::Sqlite(SqliteStore::connect(url, cfg.max_connections).await?)
    } else {
        return Err(QueueError::Validation(
            "unsupported DATABASE_URL scheme (expected postgres:// or sqlite:)".to_string(),
        ));
    };

    tracing::info!(
        backend = backend.name(),
        max_connections = cfg.max_connections,
        "connected to job store"
    );
    Ok(backend)
}
