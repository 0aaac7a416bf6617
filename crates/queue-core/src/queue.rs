//! The job lifecycle: enqueue, claim, report, recover, clean up.
//!
//! ```text
//! pending ──claim──▶ processing ──success──▶ completed
//!    ▲                   │
//!    └──retry / recover──┤
//!                        └──exhausted──▶ failed
//! ```
//!
//! All mutual exclusion comes from the store's atomic claim and guarded
//! updates; `JobQueue` itself is stateless and cheap to clone.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::clock::{self, Clock, SystemClock};
use crate::job::{DEFAULT_LIST_LIMIT, DEFAULT_MAX_ATTEMPTS, DEFAULT_QUEUE, MAX_LIST_LIMIT};
use crate::metrics;
use crate::store::{JobFilter, JobOrder, JobPatch, QueueStore, UpdateGuard};
use crate::{AddJob, Job, JobId, JobStats, JobStatus, ListJobs, QueueError, Retention, RetryPolicy};

/// Rows examined per round of stale recovery.
pub const RECOVERY_BATCH: i64 = 500;

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub default_max_attempts: i32,
    /// Lease granted by a claim when the caller does not pass one.
    pub lock_duration: Duration,
    pub retry: RetryPolicy,
    /// Delay recovered jobs by the retry backoff instead of releasing them at once.
    pub backoff_on_recovery: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            default_max_attempts: DEFAULT_MAX_ATTEMPTS,
            lock_duration: Duration::from_secs(30),
            retry: RetryPolicy::default(),
            backoff_on_recovery: false,
        }
    }
}

/// Executes a claimed job. An `Err` fails the attempt and its message is
/// stored as the job's `last_error`.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &Job) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProcessOutcome {
    /// Nothing was claimable.
    Idle,
    Completed { job: Job },
    /// The handler failed; `job` is either back in `pending` or terminally `failed`.
    Failed { job: Job, error: String },
}

impl ProcessOutcome {
    pub fn claimed(&self) -> bool {
        !matches!(self, ProcessOutcome::Idle)
    }

    pub fn job(&self) -> Option<&Job> {
        match self {
            ProcessOutcome::Idle => None,
            ProcessOutcome::Completed { job } | ProcessOutcome::Failed { job, .. } => Some(job),
        }
    }
}

#[derive(Clone)]
pub struct JobQueue {
    store: Arc<dyn QueueStore>,
    config: QueueConfig,
    clock: Arc<dyn Clock>,
}

impl JobQueue {
    pub fn new(store: Arc<dyn QueueStore>) -> Self {
        Self {
            store,
            config: QueueConfig::default(),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_config(mut self, config: QueueConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn store(&self) -> &Arc<dyn QueueStore> {
        &self.store
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub async fn add_job(&self, req: AddJob) -> Result<Job, QueueError> {
        let queue = req.queue.unwrap_or_else(|| DEFAULT_QUEUE.to_string());
        if queue.trim().is_empty() {
            return Err(QueueError::Validation("queue must not be empty".into()));
        }
        if req.job_type.trim().is_empty() {
            return Err(QueueError::Validation("job type must not be empty".into()));
        }
        let max_attempts = req.max_attempts.unwrap_or(self.config.default_max_attempts);
        if max_attempts < 1 {
            return Err(QueueError::Validation(format!(
                "max_attempts must be at least 1, got {max_attempts}"
            )));
        }

        let now = self.clock.now();
        let job = Job {
            id: Uuid::new_v4(),
            queue,
            job_type: req.job_type,
            payload: req.payload,
            status: JobStatus::Pending,
            attempts: 0,
            max_attempts,
            available_at: clock::add(now, req.delay.unwrap_or_default()),
            locked_until: None,
            last_error: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
            failed_at: None,
        };

        self.store.insert(&job).await?;

        metrics::JOBS_ENQUEUED.inc();
        tracing::debug!(
            job_id=%job.id,
            queue=%job.queue,
            job_type=%job.job_type,
            available_at=%job.available_at,
            "job enqueued"
        );
        Ok(job)
    }

    /// Newest first.
    pub async fn list_jobs(&self, req: ListJobs) -> Result<Vec<Job>, QueueError> {
        let limit = req.limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT);
        let filter = JobFilter {
            queue: req.queue,
            status: req.status,
            lease_expired_before: None,
            order: JobOrder::NewestFirst,
        };
        self.store.select_many(&filter, limit).await
    }

    pub async fn get_job_by_id(&self, id: JobId) -> Result<Option<Job>, QueueError> {
        self.store.select_one(id).await
    }

    pub async fn get_job_stats(&self, queue: Option<&str>) -> Result<JobStats, QueueError> {
        self.store.count_by_status(queue).await
    }

    /// Claim the next available job on `queue`, if any.
    pub async fn claim_next_job(
        &self,
        queue: &str,
        lock_duration: Option<Duration>,
    ) -> Result<Option<Job>, QueueError> {
        if queue.trim().is_empty() {
            return Err(QueueError::Validation("queue must not be empty".into()));
        }
        let lock_duration = lock_duration.unwrap_or(self.config.lock_duration);
        if lock_duration.is_zero() {
            return Err(QueueError::Validation("lock duration must be positive".into()));
        }

        let now = self.clock.now();
        let job = self
            .store
            .claim(queue, now, clock::add(now, lock_duration))
            .await?;

        if let Some(job) = &job {
            metrics::JOBS_CLAIMED.inc();
            tracing::debug!(job_id=%job.id, queue=%job.queue, attempts=job.attempts, "job claimed");
        }
        Ok(job)
    }

    /// Report success for a job this caller claimed.
    pub async fn complete_job(&self, job: &Job) -> Result<Job, QueueError> {
        let now = self.clock.now();
        let patch = JobPatch {
            status: JobStatus::Completed,
            available_at: None,
            last_error: None,
            completed_at: Some(now),
            failed_at: None,
            updated_at: now,
        };

        let done = self
            .store
            .conditional_update(job.id, &UpdateGuard::held_by(job), &patch)
            .await?
            .ok_or(QueueError::LeaseLost(job.id))?;

        metrics::JOBS_COMPLETED.inc();
        tracing::info!(job_id=%done.id, queue=%done.queue, attempts=done.attempts, "job completed");
        Ok(done)
    }

    /// Report failure for a job this caller claimed: retry after backoff while
    /// attempts remain, otherwise fail it for good.
    pub async fn fail_job(&self, job: &Job, error: &str) -> Result<Job, QueueError> {
        let now = self.clock.now();
        let patch = if job.attempts_remaining() {
            let delay = self.config.retry.delay_for_attempt(job.attempts);
            JobPatch {
                status: JobStatus::Pending,
                available_at: Some(clock::add(now, delay)),
                last_error: Some(error.to_string()),
                completed_at: None,
                failed_at: None,
                updated_at: now,
            }
        } else {
            JobPatch {
                status: JobStatus::Failed,
                available_at: None,
                last_error: Some(error.to_string()),
                completed_at: None,
                failed_at: Some(now),
                updated_at: now,
            }
        };

        let updated = self
            .store
            .conditional_update(job.id, &UpdateGuard::held_by(job), &patch)
            .await?
            .ok_or(QueueError::LeaseLost(job.id))?;

        if updated.status == JobStatus::Failed {
            metrics::JOBS_FAILED.inc();
            tracing::warn!(
                job_id=%updated.id,
                queue=%updated.queue,
                attempts=updated.attempts,
                error=%error,
                "job failed permanently"
            );
        } else {
            metrics::JOBS_RETRIED.inc();
            tracing::info!(
                job_id=%updated.id,
                queue=%updated.queue,
                attempts=updated.attempts,
                retry_at=%updated.available_at,
                error=%error,
                "job failed, retry scheduled"
            );
        }
        Ok(updated)
    }

    /// Claim one job, run `handler` on it and record the outcome.
    pub async fn process_next_job(
        &self,
        queue: &str,
        lock_duration: Option<Duration>,
        handler: &dyn JobHandler,
    ) -> Result<ProcessOutcome, QueueError> {
        let Some(job) = self.claim_next_job(queue, lock_duration).await? else {
            return Ok(ProcessOutcome::Idle);
        };

        match handler.handle(&job).await {
            Ok(()) => {
                let job = self.complete_job(&job).await?;
                Ok(ProcessOutcome::Completed { job })
            }
            Err(e) => {
                let error = format!("{e:#}");
                let job = self.fail_job(&job, &error).await?;
                Ok(ProcessOutcome::Failed { job, error })
            }
        }
    }

    /// Return jobs whose lease expired without a report to the pool, or fail
    /// them if they have no attempts left. Returns how many were moved.
    pub async fn recover_stale_jobs(&self) -> Result<u64, QueueError> {
        let now = self.clock.now();
        let filter = JobFilter {
            queue: None,
            status: Some(JobStatus::Processing),
            lease_expired_before: Some(now),
            order: JobOrder::Fifo,
        };

        let mut recovered = 0u64;
        loop {
            let batch = self.store.select_many(&filter, RECOVERY_BATCH).await?;
            let mut moved = 0u64;

            for job in &batch {
                let error = format!(
                    "lock expired at {} before attempt {} reported an outcome",
                    job.locked_until.unwrap_or(now),
                    job.attempts
                );
                let patch = if job.attempts_remaining() {
                    let available_at = if self.config.backoff_on_recovery {
                        clock::add(now, self.config.retry.delay_for_attempt(job.attempts))
                    } else {
                        now
                    };
                    JobPatch {
                        status: JobStatus::Pending,
                        available_at: Some(available_at),
                        last_error: Some(error),
                        completed_at: None,
                        failed_at: None,
                        updated_at: now,
                    }
                } else {
                    JobPatch {
                        status: JobStatus::Failed,
                        available_at: None,
                        last_error: Some(error),
                        completed_at: None,
                        failed_at: Some(now),
                        updated_at: now,
                    }
                };

                let guard = UpdateGuard::expired(job, now);
                let updated = self.store.conditional_update(job.id, &guard, &patch).await?;
                if let Some(updated) = updated {
                    moved += 1;
                    tracing::warn!(
                        job_id=%updated.id,
                        queue=%updated.queue,
                        attempts=updated.attempts,
                        status=%updated.status,
                        "recovered stale job"
                    );
                }
            }

            recovered += moved;
            if (batch.len() as i64) < RECOVERY_BATCH || moved == 0 {
                break;
            }
        }

        if recovered > 0 {
            metrics::JOBS_RECOVERED.inc_by(recovered);
            tracing::info!(recovered, "stale job recovery finished");
        }
        Ok(recovered)
    }

    /// Delete completed/failed jobs whose terminal timestamp is at or before
    /// `now - threshold`. Returns the number of rows deleted.
    pub async fn cleanup_jobs(&self, retention: Retention) -> Result<u64, QueueError> {
        let now = self.clock.now();
        let mut deleted = 0;

        if let Some(age) = retention.completed_older_than {
            deleted += self
                .store
                .delete_finished_before(JobStatus::Completed, clock::sub(now, age))
                .await?;
        }
        if let Some(age) = retention.failed_older_than {
            deleted += self
                .store
                .delete_finished_before(JobStatus::Failed, clock::sub(now, age))
                .await?;
        }

        if deleted > 0 {
            metrics::JOBS_CLEANED.inc_by(deleted);
            tracing::info!(deleted, "cleaned up finished jobs");
        }
        Ok(deleted)
    }
}
