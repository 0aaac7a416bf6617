//! In-memory store for tests and local development.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::store::{JobFilter, JobOrder, JobPatch, QueueStore, UpdateGuard};
use crate::{Job, JobId, JobStats, JobStatus, QueueError};

#[derive(Debug)]
struct Row {
    seq: u64,
    job: Job,
}

#[derive(Debug, Default)]
struct Inner {
    next_seq: u64,
    rows: HashMap<JobId, Row>,
}

/// Every operation runs under one mutex, which gives the same all-or-nothing
/// conditional updates a database would.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    inner: Mutex<Inner>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, QueueError> {
        self.inner
            .lock()
            .map_err(|_| QueueError::Internal("in-memory store poisoned".to_string()))
    }
}

fn fifo_key(row: &Row) -> (DateTime<Utc>, DateTime<Utc>, u64) {
    (row.job.available_at, row.job.created_at, row.seq)
}

fn guard_matches(job: &Job, guard: &UpdateGuard) -> bool {
    job.status == guard.status
        && guard.attempts.is_none_or(|a| job.attempts == a)
        && guard
            .lease_expired_before
            .is_none_or(|at| job.locked_until.is_some_and(|l| l < at))
}

#[async_trait]
impl QueueStore for InMemoryStore {
    async fn insert(&self, job: &Job) -> Result<(), QueueError> {
        let mut inner = self.lock()?;
        if inner.rows.contains_key(&job.id) {
            return Err(QueueError::Database(format!("duplicate job id {}", job.id)));
        }
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.rows.insert(
            job.id,
            Row {
                seq,
                job: job.clone(),
            },
        );
        Ok(())
    }

    async fn select_one(&self, id: JobId) -> Result<Option<Job>, QueueError> {
        Ok(self.lock()?.rows.get(&id).map(|r| r.job.clone()))
    }

    async fn select_many(&self, filter: &JobFilter, limit: i64) -> Result<Vec<Job>, QueueError> {
        let inner = self.lock()?;
        let mut rows: Vec<&Row> = inner
            .rows
            .values()
            .filter(|r| {
                filter.queue.as_ref().is_none_or(|q| &r.job.queue == q)
                    && filter.status.is_none_or(|s| r.job.status == s)
                    && filter
                        .lease_expired_before
                        .is_none_or(|at| r.job.locked_until.is_some_and(|l| l < at))
            })
            .collect();

        match filter.order {
            JobOrder::Fifo => rows.sort_by_key(|r| fifo_key(r)),
            JobOrder::NewestFirst => {
                rows.sort_by_key(|r| std::cmp::Reverse((r.job.created_at, r.seq)))
            }
        }

        Ok(rows
            .into_iter()
            .take(limit.max(0) as usize)
            .map(|r| r.job.clone())
            .collect())
    }

    async fn claim(
        &self,
        queue: &str,
        now: DateTime<Utc>,
        locked_until: DateTime<Utc>,
    ) -> Result<Option<Job>, QueueError> {
        let mut inner = self.lock()?;
        let next = inner
            .rows
            .values()
            .filter(|r| {
                r.job.queue == queue
                    && r.job.status == JobStatus::Pending
                    && r.job.available_at <= now
            })
            .min_by_key(|r| fifo_key(r))
            .map(|r| r.job.id);

        let Some(id) = next else {
            return Ok(None);
        };
        let Some(row) = inner.rows.get_mut(&id) else {
            return Ok(None);
        };

        row.job.status = JobStatus::Processing;
        row.job.locked_until = Some(locked_until);
        row.job.attempts += 1;
        row.job.updated_at = now;
        Ok(Some(row.job.clone()))
    }

    async fn conditional_update(
        &self,
        id: JobId,
        guard: &UpdateGuard,
        patch: &JobPatch,
    ) -> Result<Option<Job>, QueueError> {
        let mut inner = self.lock()?;
        let Some(row) = inner.rows.get_mut(&id) else {
            return Ok(None);
        };
        if !guard_matches(&row.job, guard) {
            return Ok(None);
        }

        let job = &mut row.job;
        job.status = patch.status;
        job.locked_until = None;
        if let Some(at) = patch.available_at {
            job.available_at = at;
        }
        if let Some(err) = &patch.last_error {
            job.last_error = Some(err.clone());
        }
        if let Some(at) = patch.completed_at {
            job.completed_at = Some(at);
        }
        if let Some(at) = patch.failed_at {
            job.failed_at = Some(at);
        }
        job.updated_at = patch.updated_at;
        Ok(Some(job.clone()))
    }

    async fn delete_finished_before(
        &self,
        status: JobStatus,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, QueueError> {
        if !status.is_terminal() {
            return Err(QueueError::InvalidState);
        }

        let mut inner = self.lock()?;
        let before = inner.rows.len();
        inner.rows.retain(|_, r| {
            let finished_at = match status {
                JobStatus::Completed => r.job.completed_at,
                _ => r.job.failed_at,
            };
            !(r.job.status == status && finished_at.is_some_and(|at| at <= cutoff))
        });
        Ok((before - inner.rows.len()) as u64)
    }

    async fn count_by_status(&self, queue: Option<&str>) -> Result<JobStats, QueueError> {
        let inner = self.lock()?;
        let mut stats = JobStats::default();
        for row in inner.rows.values() {
            if queue.is_none_or(|q| row.job.queue == q) {
                stats.add(row.job.status, 1);
            }
        }
        Ok(stats)
    }
}
