use async_trait::async_trait;
use chrono::{DateTime, Utc};
use queue_core::{
    Job, JobFilter, JobId, JobOrder, JobPatch, JobStats, JobStatus, QueueError, QueueStore,
    UpdateGuard,
};
use serde_json::Value;
use sqlx::migrate::Migrator;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use super::db_err;

pub static MIGRATOR: Migrator = sqlx::migrate!("../../migrations/postgres");

macro_rules! job_columns {
    () => {
        r#"
              id,
              queue,
              job_type,
              payload,
              status::text AS status,
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

#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, QueueError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(db_err)?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), QueueError> {
        MIGRATOR
            .run(&self.pool)
            .await
            .map_err(|e| QueueError::Database(e.to_string()))
    }
}

fn row_to_job(row: &PgRow) -> Result<Job, QueueError> {
    let status: String = row.try_get("status").map_err(db_err)?;

    Ok(Job {
        id: row.try_get::<Uuid, _>("id").map_err(db_err)?,
        queue: row.try_get::<String, _>("queue").map_err(db_err)?,
        job_type: row.try_get::<String, _>("job_type").map_err(db_err)?,
        payload: row.try_get::<Value, _>("payload").map_err(db_err)?,
        status: super::parse_status(&status)?,
        attempts: row.try_get::<i32, _>("attempts").map_err(db_err)?,
        max_attempts: row.try_get::<i32, _>("max_attempts").map_err(db_err)?,
        available_at: row
            .try_get::<DateTime<Utc>, _>("available_at")
            .map_err(db_err)?,
        locked_until: row
            .try_get::<Option<DateTime<Utc>>, _>("locked_until")
            .map_err(db_err)?,
        last_error: row
            .try_get::<Option<String>, _>("last_error")
            .map_err(db_err)?,
        created_at: row
            .try_get::<DateTime<Utc>, _>("created_at")
            .map_err(db_err)?,
        updated_at: row
            .try_get::<DateTime<Utc>, _>("updated_at")
            .map_err(db_err)?,
        completed_at: row
            .try_get::<Option<DateTime<Utc>>, _>("completed_at")
            .map_err(db_err)?,
        failed_at: row
            .try_get::<Option<DateTime<Utc>>, _>("failed_at")
            .map_err(db_err)?,
    })
}

#[async_trait]
impl QueueStore for PostgresStore {
    async fn insert(&self, job: &Job) -> Result<(), QueueError> {
        sqlx::query(
            r#"
            INSERT INTO jobs (
              id, queue, job_type, payload, status, attempts, max_attempts,
              available_at, locked_until, last_error, created_at, updated_at,
              completed_at, failed_at
            )
            VALUES ($1, $2, $3, $4, $5::job_status, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(job.id)
        .bind(&job.queue)
        .bind(&job.job_type)
        .bind(&job.payload)
        .bind(job.status.as_str())
        .bind(job.attempts)
        .bind(job.max_attempts)
        .bind(job.available_at)
        .bind(job.locked_until)
        .bind(&job.last_error)
        .bind(job.created_at)
        .bind(job.updated_at)
        .bind(job.completed_at)
        .bind(job.failed_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn select_one(&self, id: JobId) -> Result<Option<Job>, QueueError> {
        let row = sqlx::query(concat!("SELECT", job_columns!(), "FROM jobs WHERE id = $1"))
            .bind(id)
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
                WHERE ($1::text IS NULL OR queue = $1)
                  AND ($2::text IS NULL OR status::text = $2)
                  AND ($3::timestamptz IS NULL OR locked_until < $3)
                ORDER BY available_at ASC, created_at ASC, seq ASC
                LIMIT $4
                "#
            ),
            JobOrder::NewestFirst => concat!(
                "SELECT",
                job_columns!(),
                r#"
                FROM jobs
                WHERE ($1::text IS NULL OR queue = $1)
                  AND ($2::text IS NULL OR status::text = $2)
                  AND ($3::timestamptz IS NULL OR locked_until < $3)
                ORDER BY created_at DESC, seq DESC
                LIMIT $4
                "#
            ),
        };

        let rows = sqlx::query(sql)
            .bind(filter.queue.as_deref())
            .bind(filter.status.map(|s| s.as_str()))
            .bind(filter.lease_expired_before)
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
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        // SKIP LOCKED keeps concurrent claimers from blocking on (or taking) the same row.
        let row = sqlx::query(concat!(
            r#"
            WITH next AS (
              SELECT id AS next_id
              FROM jobs
              WHERE queue = $1
                AND status = 'pending'::job_status
                AND available_at <= $2
              ORDER BY available_at ASC, created_at ASC, seq ASC
              FOR UPDATE SKIP LOCKED
              LIMIT 1
            )
            UPDATE jobs
            SET status = 'processing'::job_status,
                locked_until = $3,
                attempts = attempts + 1,
                updated_at = $2
            FROM next
            WHERE jobs.id = next.next_id
            RETURNING"#,
            job_columns!()
        ))
        .bind(queue)
        .bind(now)
        .bind(locked_until)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;

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
            SET status = $2::job_status,
                locked_until = NULL,
                available_at = COALESCE($3, available_at),
                last_error = COALESCE($4, last_error),
                completed_at = COALESCE($5, completed_at),
                failed_at = COALESCE($6, failed_at),
                updated_at = $7
            WHERE id = $1
              AND status = $8::job_status
              AND ($9::int IS NULL OR attempts = $9)
              AND ($10::timestamptz IS NULL OR locked_until < $10)
            RETURNING"#,
            job_columns!()
        ))
        .bind(id)
        .bind(patch.status.as_str())
        .bind(patch.available_at)
        .bind(&patch.last_error)
        .bind(patch.completed_at)
        .bind(patch.failed_at)
        .bind(patch.updated_at)
        .bind(guard.status.as_str())
        .bind(guard.attempts)
        .bind(guard.lease_expired_before)
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
                "DELETE FROM jobs WHERE status = 'completed'::job_status AND completed_at <= $1"
            }
            JobStatus::Failed => {
                "DELETE FROM jobs WHERE status = 'failed'::job_status AND failed_at <= $1"
            }
            JobStatus::Pending | JobStatus::Processing => return Err(QueueError::InvalidState),
        };

        let affected = sqlx::query(sql)
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .map_err(db_err)?
            .rows_affected();
        Ok(affected)
    }

    async fn count_by_status(&self, queue: Option<&str>) -> Result<JobStats, QueueError> {
        let rows = sqlx::query(
            r#"
            SELECT status::text AS status, COUNT(*) AS count
            FROM jobs
            WHERE ($1::text IS NULL OR queue = $1)
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
