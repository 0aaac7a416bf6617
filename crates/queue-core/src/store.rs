use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{Job, JobId, JobStats, JobStatus, QueueError};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum JobOrder {
    /// `(available_at, created_at)` ascending: the claim order.
    #[default]
    Fifo,
    /// `created_at` descending.
    NewestFirst,
}

#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub queue: Option<String>,
    pub status: Option<JobStatus>,
    /// Only rows whose `locked_until` is strictly before this instant.
    pub lease_expired_before: Option<DateTime<Utc>>,
    pub order: JobOrder,
}

/// Predicate a conditional update must match to apply.
#[derive(Debug, Clone, Copy)]
pub struct UpdateGuard {
    pub status: JobStatus,
    pub attempts: Option<i32>,
    pub lease_expired_before: Option<DateTime<Utc>>,
}

impl UpdateGuard {
    /// Matches only the attempt that claimed `job`.
    pub fn held_by(job: &Job) -> Self {
        Self {
            status: JobStatus::Processing,
            attempts: Some(job.attempts),
            lease_expired_before: None,
        }
    }

    /// Matches `job`'s attempt only if its lease has run out by `now`.
    pub fn expired(job: &Job, now: DateTime<Utc>) -> Self {
        Self {
            lease_expired_before: Some(now),
            ..Self::held_by(job)
        }
    }
}

/// Fields written by a transition out of `processing`. `None` leaves a column as is;
/// `locked_until` is always cleared.
#[derive(Debug, Clone)]
pub struct JobPatch {
    pub status: JobStatus,
    pub available_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

/// Durable job storage. Implementations must make `claim` and
/// `conditional_update` atomic with respect to concurrent callers; the engine
/// holds no locks of its own.
#[async_trait]
pub trait QueueStore: Send + Sync {
    async fn insert(&self, job: &Job) -> Result<(), QueueError>;

    async fn select_one(&self, id: JobId) -> Result<Option<Job>, QueueError>;

    async fn select_many(&self, filter: &JobFilter, limit: i64) -> Result<Vec<Job>, QueueError>;

    /// Take the oldest available pending job in `queue`: mark it processing,
    /// lease it until `locked_until` and count the attempt, all in one step.
    async fn claim(
        &self,
        queue: &str,
        now: DateTime<Utc>,
        locked_until: DateTime<Utc>,
    ) -> Result<Option<Job>, QueueError>;

    /// Apply `patch` if the row still matches `guard`. Returns the updated row,
    /// or `None` when the guard did not match.
    async fn conditional_update(
        &self,
        id: JobId,
        guard: &UpdateGuard,
        patch: &JobPatch,
    ) -> Result<Option<Job>, QueueError>;

    /// Delete terminal rows with `status` whose completion/failure time is at or before `cutoff`.
    async fn delete_finished_before(
        &self,
        status: JobStatus,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, QueueError>;

    async fn count_by_status(&self, queue: Option<&str>) -> Result<JobStats, QueueError>;
}
