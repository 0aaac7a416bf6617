use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use queue_core::{
    Job, JobFilter, JobId, JobOrder, JobPatch, JobStats, JobStatus, QueueError, QueueStore,
    UpdateGuard,
};
use sqlx::migrate::Migrator;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use super::db_err;

pub static MIGRATOR: Migrator = sqlx::migrate!("../../migrations/sqlite");

macro_rules! job_columns {
    () => {
        r#"
              id,
              queue,
              job_type,
              payload,
              status,
              attempts,
              max_attempts,
              available_at,
              locked_until,
              last_error,
              created_at,
              updated_at,
              completed_at,
              failed_at
        "#
    };
}

/// SQLite backend. Every mutation is a single statement, which SQLite runs
/// under its database-wide write lock.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, QueueError> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(db_err)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        // Each connection to an in-memory database is its own database.
        let in_memory = database_url.contains(":memory:") || database_url.contains("mode=memory");
        let max_connections = if in_memory { 1 } else { max_connections };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .map_err(db_err)?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), QueueError> {
        MIGRATOR
            .run(&self.pool)
            .await
            .map_err(|e| QueueError::Database(e.to_string()))
    }
}

fn millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>, QueueError> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| QueueError::Internal(format!("timestamp out of range: {ms}")))
}

fn opt_from_millis(ms: Option<i64>) -> Result<Option<DateTime<Utc>>, QueueError> {
    ms.map(from_millis).transpose()
}

fn row_to_job(row: &SqliteRow) -> Result<Job, QueueError> {
    let id: String = row.try_get("id").map_err(db_err)?;
    let payload: String = row.try_get("payload").map_err(db_err)?;
    let status: String = row.try_get("status").map_err(db_err)?;

    Ok(Job {
        id: Uuid::parse_str(&id)
            .map_err(|e| QueueError::Internal(format!("bad job id {id}: {e}")))?,
        queue: row.try_get::<String, _>("queue").map_err(db_err)?,
        job_type: row.try_get::<String, _>("job_type").map_err(db_err)?,
        payload: serde_json::from_str(&payload)
            .map_err(|e| QueueError::Internal(format!("bad payload for job {id}: {e}")))?,
        status: super::parse_status(&status)?,
        attempts: row.try_get::<i32, _>("attempts").map_err(db_err)?,
        max_attempts: row.try_get::<i32, _>("max_attempts").map_err(db_err)?,
        available_at: from_millis(row.try_get("available_at").map_err(db_err)?)?,
        locked_until: opt_from_millis(row.try_get("locked_until").map_err(db_err)?)?,
        last_error: row
            .try_get::<Option<String>, _>("last_error")
            .map_err(db_err)?,
        created_at: from_millis(row.try_get("created_at").map_err(db_err)?)?,
        updated_at: from_millis(row.try_get("updated_at").map_err(db_err)?)?,
        completed_at: opt_from_millis(row.try_get("completed_at").map_err(db_err)?)?,
        failed_at: opt_from_millis(row.try_get("failed_at").map_err(db_err)?)?,
    })
}

#[async_trait]
impl QueueStore for SqliteStore {
    async fn insert(&self, job: &Job) -> Result<(), QueueError> {
        let payload = serde_json::to_string(&job.payload)
            .map_err(|e| QueueError::Internal(format!("unserializable payload: {e}")))?;

        sqlx::query(
            r#"
            INSERT INTO jobs (
              id, queue, job_type, payload, status, attempts, max_attempts,
              available_at, locked_until, last_error, created_at, updated_at,
              completed_at, failed_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
            "#,
        )
        .bind(job.id.to_string())
        .bind(&job.queue)
        .bind(&job.job_type)
        .bind(payload)
        .bind(job.status.as_str())
        .bind(job.attempts)
        .bind(job.max_attempts)
        .bind(millis(job.available_at))
        .bind(job.locked_until.map(millis))
        .bind(&job.last_error)
        .bind(millis(job.created_at))
        .bind(millis(job.updated_at))
        .bind(job.completed_at.map(millis))
        .bind(job.failed_at.map(millis))
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn select_one(&self, id: JobId) -> Result<Option<Job>, QueueError> {
        let row = sqlx::query(concat!("SELECT", job_columns!(), "FROM jobs WHERE id = ?1"))
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;

        row.as_ref().map(row_to_job).transpose()
    }

    async fn select_many(&self, filter: &JobFilter, limit: i64) -> Result<Vec<Job>, QueueError> {
        let sql = match filter.order {
            JobOrder::Fifo => concat!(
                "SELECT",
                job_columns!(),
                r#"
                FROM jobs
                WHERE (?1 IS NULL OR queue = ?1)
                  AND (?2 IS NULL OR status = ?2)
                  AND (?3 IS NULL OR locked_until < ?3)
                ORDER BY available_at ASC, created_at ASC, rowid ASC
                LIMIT ?4
                "#
            ),
            JobOrder::NewestFirst => concat!(
                "SELECT",
                job_columns!(),
                r#"
                FROM jobs
                WHERE (?1 IS NULL OR queue = ?1)
                  AND (?2 IS NULL OR status = ?2)
                  AND (?3 IS NULL OR locked_until < ?3)
                ORDER BY created_at DESC, rowid DESC
                LIMIT ?4
                "#
            ),
        };

        let rows = sqlx::query(sql)
            .bind(filter.queue.as_deref())
            .bind(filter.status.map(|s| s.as_str()))
            .bind(filter.lease_expired_before.map(millis))
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;

        rows.iter().map(row_to_job).collect()
    }

    async fn claim(
        &self,
        queue: &str,
        now: DateTime<Utc>,
        locked_until: DateTime<Utc>,
    ) -> Result<Option<Job>, QueueError> {
        let row = sqlx::query(concat!(
            r#"
            UPDATE jobs
            SET status = 'processing',
                locked_until = ?3,
                attempts = attempts + 1,
                updated_at = ?2
            WHERE id = (
                SELECT id
                FROM jobs
                WHERE queue = ?1
                  AND status = 'pending'
                  AND available_at <= ?2
                ORDER BY available_at ASC, created_at ASC, rowid ASC
                LIMIT 1
              )
              AND status = 'pending'
            RETURNING"#,
            job_columns!()
        ))
        .bind(queue)
        .bind(millis(now))
        .bind(millis(locked_until))
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        row.as_ref().map(row_to_job).transpose()
    }

    async fn conditional_update(
        &self,
        id: JobId,
        guard: &UpdateGuard,
        patch: &JobPatch,
    ) -> Result<Option<Job>, QueueError> {
        let row = sqlx::query(concat!(
            r#"
            UPDATE jobs
            SET status = ?2,
                locked_until = NULL,
                available_at = COALESCE(?3, available_at),
                last_error = COALESCE(?4, last_error),
                completed_at = COALESCE(?5, completed_at),
                failed_at = COALESCE(?6, failed_at),
                updated_at = ?7
            WHERE id = ?1
              AND status = ?8
              AND (?9 IS NULL OR attempts = ?9)
              AND (?10 IS NULL OR locked_until < ?10)
            RETURNING"#,
            job_columns!()
        ))
        .bind(id.to_string())
        .bind(patch.status.as_str())
        .bind(patch.available_at.map(millis))
        .bind(&patch.last_error)
        .bind(patch.completed_at.map(millis))
        .bind(patch.failed_at.map(millis))
        .bind(millis(patch.updated_at))
        .bind(guard.status.as_str())
        .bind(guard.attempts)
        .bind(guard.lease_expired_before.map(millis))
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        row.as_ref().map(row_to_job).transpose()
    }

    async fn delete_finished_before(
        &self,
        status: JobStatus,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, QueueError> {
        let sql = match status {
            JobStatus::Completed => {
                "DELETE FROM jobs WHERE status = 'completed' AND completed_at <= ?1"
            }
            JobStatus::Failed => "DELETE FROM jobs WHERE status = 'failed' AND failed_at <= ?1",
            JobStatus::Pending | JobStatus::Processing => return Err(QueueError::InvalidState),
        };

        let affected = sqlx::query(sql)
            .bind(millis(cutoff))
            .execute(&self.pool)
            .await
            .map_err(db_err)?
            .rows_affected();
        Ok(affected)
    }

    async fn count_by_status(&self, queue: Option<&str>) -> Result<JobStats, QueueError> {
        let rows = sqlx::query(
            r#"
            SELECT status, COUNT(*) AS count
            FROM jobs
            WHERE (?1 IS NULL OR queue = ?1)
            GROUP BY status
            "#,
        )
        .bind(queue)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        let mut stats = JobStats::default();
        for row in rows {
            let status: String = row.try_get("status").map_err(db_err)?;
            let count: i64 = row.try_get("count").map_err(db_err)?;
            stats.add(super::parse_status(&status)?, count);
        }
        Ok(stats)
    }
}
