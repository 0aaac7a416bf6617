use std::{any::Any, collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use queue_core::{Job, JobHandler, JobQueue, ProcessOutcome, Retention};
use tokio::task::{JoinError, JoinSet};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub queue: String,            // e.g. default
    pub concurrency: usize,       // independent claim loops
    pub lock_duration: Duration,  // e.g. 30s
    pub poll_interval: Duration,  // e.g. 1s
    pub stale_check_interval: Duration,
    pub cleanup_interval: Duration,
    pub retention: Retention,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            queue: "default".to_string(),
            concurrency: 1,
            lock_duration: Duration::from_secs(30),
            poll_interval: Duration::from_secs(1),
            stale_check_interval: Duration::from_secs(60),
            cleanup_interval: Duration::from_secs(3600),
            retention: Retention {
                completed_older_than: Some(Duration::from_secs(7 * 24 * 3600)),
                failed_older_than: Some(Duration::from_secs(30 * 24 * 3600)),
            },
        }
    }
}

/// Shortest poll or maintenance period; `tokio::time::interval` rejects zero.
pub const MIN_INTERVAL: Duration = Duration::from_millis(1);

fn env_millis(key: &str) -> Option<Duration> {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .map(Duration::from_millis)
}

impl WorkerConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let queue = std::env::var("QUEUE_NAME").unwrap_or(defaults.queue);
        let concurrency = std::env::var("CONCURRENCY")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.concurrency);

        Self {
            queue,
            concurrency,
            lock_duration: env_millis("LOCK_DURATION_MS").unwrap_or(defaults.lock_duration),
            poll_interval: env_millis("POLL_INTERVAL_MS").unwrap_or(defaults.poll_interval),
            stale_check_interval: env_millis("STALE_CHECK_INTERVAL_MS")
                .unwrap_or(defaults.stale_check_interval),
            cleanup_interval: env_millis("CLEANUP_INTERVAL_MS")
                .unwrap_or(defaults.cleanup_interval),
            retention: Retention {
                completed_older_than: env_millis("COMPLETED_RETENTION_MS")
                    .or(defaults.retention.completed_older_than),
                failed_older_than: env_millis("FAILED_RETENTION_MS")
                    .or(defaults.retention.failed_older_than),
            },
        }
        .clamped()
    }

    /// Raise zero poll and maintenance periods to [`MIN_INTERVAL`].
    pub fn clamped(mut self) -> Self {
        for (name, period) in [
            ("poll_interval", &mut self.poll_interval),
            ("stale_check_interval", &mut self.stale_check_interval),
            ("cleanup_interval", &mut self.cleanup_interval),
        ] {
            if *period < MIN_INTERVAL {
                tracing::warn!(setting = name, "zero period raised to 1ms");
                *period = MIN_INTERVAL;
            }
        }
        self
    }
}

/// Routes a job to the handler registered for its type.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
    fallback: Option<Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        mut self,
        job_type: impl Into<String>,
        handler: impl JobHandler + 'static,
    ) -> Self {
        self.handlers.insert(job_type.into(), Arc::new(handler));
        self
    }

    /// Handler for job types with no registered handler.
    pub fn fallback(mut self, handler: impl JobHandler + 'static) -> Self {
        self.fallback = Some(Arc::new(handler));
        self
    }
}

#[async_trait]
impl JobHandler for HandlerRegistry {
    async fn handle(&self, job: &Job) -> anyhow::Result<()> {
        match self.handlers.get(&job.job_type).or(self.fallback.as_ref()) {
            Some(handler) => handler.handle(job).await,
            None => anyhow::bail!("no handler registered for job type {:?}", job.job_type),
        }
    }
}

/// Logs the payload and succeeds.
pub struct LogHandler;

#[async_trait]
impl JobHandler for LogHandler {
    async fn handle(&self, job: &Job) -> anyhow::Result<()> {
        tracing::info!(
            job_id=%job.id,
            queue=%job.queue,
            job_type=%job.job_type,
            attempts=job.attempts,
            payload=%job.payload,
            "processing job"
        );
        Ok(())
    }
}

/// Runs each attempt on its own task; a panic is reported as a failed attempt.
struct Isolated(Arc<dyn JobHandler>);

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        *s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}

fn join_failure(e: JoinError) -> anyhow::Error {
    if e.is_panic() {
        let payload = e.into_panic();
        anyhow::anyhow!("handler panicked: {}", panic_message(payload.as_ref()))
    } else {
        anyhow::anyhow!("handler task cancelled: {e}")
    }
}

#[async_trait]
impl JobHandler for Isolated {
    async fn handle(&self, job: &Job) -> anyhow::Result<()> {
        let handler = self.0.clone();
        let job = job.clone();
        tokio::spawn(async move { handler.handle(&job).await })
            .await
            .unwrap_or_else(|e| Err(join_failure(e)))
    }
}

/// Run claim loops and periodic maintenance until `cancel` fires.
///
/// A job that is already executing when cancellation arrives is allowed to
/// finish and report; no new job is claimed afterwards.
pub async fn run_worker(
    queue: JobQueue,
    handler: Arc<dyn JobHandler>,
    cfg: WorkerConfig,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let cfg = cfg.clamped();
    let handler: Arc<dyn JobHandler> = Arc::new(Isolated(handler));

    tracing::info!(
        queue=%cfg.queue,
        concurrency=cfg.concurrency,
        lock_duration_ms = (cfg.lock_duration.as_millis() as u64),
        poll_interval_ms = (cfg.poll_interval.as_millis() as u64),
        stale_check_interval_ms = (cfg.stale_check_interval.as_millis() as u64),
        cleanup_interval_ms = (cfg.cleanup_interval.as_millis() as u64),
        "worker started"
    );

    let mut tasks = JoinSet::new();
    for slot in 0..cfg.concurrency.max(1) {
        tasks.spawn(claim_loop(
            slot,
            queue.clone(),
            handler.clone(),
            cfg.clone(),
            cancel.clone(),
        ));
    }
    tasks.spawn(maintenance_loop(queue, cfg, cancel));

    // Keep joining after a failure so the other loops finish their jobs.
    let mut failure = None;
    while let Some(res) = tasks.join_next().await {
        if let Err(e) = res {
            tracing::error!(error=%e, "worker task ended abnormally");
            if failure.is_none() {
                failure = Some(e);
            }
        }
    }

    tracing::info!("worker stopped");
    match failure {
        Some(e) => Err(e.into()),
        None => Ok(()),
    }
}

async fn claim_loop(
    slot: usize,
    queue: JobQueue,
    handler: Arc<dyn JobHandler>,
    cfg: WorkerConfig,
    cancel: CancellationToken,
) {
    while !cancel.is_cancelled() {
        let idle = match queue
            .process_next_job(&cfg.queue, Some(cfg.lock_duration), handler.as_ref())
            .await
        {
            Ok(ProcessOutcome::Idle) => true,
            Ok(ProcessOutcome::Completed { .. }) | Ok(ProcessOutcome::Failed { .. }) => false,
            Err(e) => {
                tracing::warn!(slot, queue=%cfg.queue, error=%e, "process_next_job failed");
                true
            }
        };

        if idle {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(cfg.poll_interval) => {}
            }
        }
    }
    tracing::debug!(slot, "claim loop stopped");
}

async fn maintenance_loop(queue: JobQueue, cfg: WorkerConfig, cancel: CancellationToken) {
    let mut stale_tick = tokio::time::interval(cfg.stale_check_interval);
    stale_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut cleanup_tick = tokio::time::interval(cfg.cleanup_interval);
    cleanup_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = stale_tick.tick() => {
                if let Err(e) = queue.recover_stale_jobs().await {
                    tracing::warn!(error=%e, "stale job recovery failed");
                }
            }
            _ = cleanup_tick.tick() => {
                if let Err(e) = queue.cleanup_jobs(cfg.retention).await {
                    tracing::warn!(error=%e, "job cleanup failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use chrono::{DateTime, Utc};
    use queue_core::{
        AddJob, InMemoryStore, JobFilter, JobId, JobPatch, JobStats, JobStatus, ListJobs,
        QueueError, QueueStore, UpdateGuard,
    };
    use serde_json::json;
    use tokio::sync::Notify;

    use super::*;

    fn fast_config() -> WorkerConfig {
        WorkerConfig {
            poll_interval: Duration::from_millis(10),
            stale_check_interval: Duration::from_millis(20),
            cleanup_interval: Duration::from_millis(20),
            ..WorkerConfig::default()
        }
    }

    struct Count(Arc<AtomicUsize>);

    #[async_trait]
    impl JobHandler for Count {
        async fn handle(&self, _job: &Job) -> anyhow::Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct AlwaysFail;

    #[async_trait]
    impl JobHandler for AlwaysFail {
        async fn handle(&self, _job: &Job) -> anyhow::Result<()> {
            anyhow::bail!("smtp unavailable")
        }
    }

    /// Signals `started`, then blocks until `release` is notified.
    struct Gate {
        started: Arc<Notify>,
        release: Arc<Notify>,
    }

    #[async_trait]
    impl JobHandler for Gate {
        async fn handle(&self, _job: &Job) -> anyhow::Result<()> {
            self.started.notify_one();
            self.release.notified().await;
            Ok(())
        }
    }

    async fn wait_for<F, Fut>(mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..500 {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn registry_dispatches_by_type() {
        let emails = Arc::new(AtomicUsize::new(0));
        let registry = HandlerRegistry::new().register("send_email", Count(emails.clone()));
        let queue = JobQueue::new(Arc::new(InMemoryStore::new()));

        queue.add_job(AddJob::new("send_email", json!({}))).await.unwrap();
        queue.add_job(AddJob::new("resize_image", json!({}))).await.unwrap();

        let first = queue.process_next_job("default", None, &registry).await.unwrap();
        assert!(matches!(first, ProcessOutcome::Completed { .. }));
        assert_eq!(emails.load(Ordering::SeqCst), 1);

        let second = queue.process_next_job("default", None, &registry).await.unwrap();
        let ProcessOutcome::Failed { error, .. } = second else {
            panic!("unknown type should fail, got {second:?}");
        };
        assert!(error.contains("resize_image"));
    }

    #[tokio::test]
    async fn registry_uses_fallback() {
        let hits = Arc::new(AtomicUsize::new(0));
        let registry = HandlerRegistry::new().fallback(Count(hits.clone()));
        let queue = JobQueue::new(Arc::new(InMemoryStore::new()));

        queue.add_job(AddJob::new("anything", json!({}))).await.unwrap();
        let outcome = queue.process_next_job("default", None, &registry).await.unwrap();
        assert!(matches!(outcome, ProcessOutcome::Completed { .. }));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn worker_drains_queue_until_cancelled() {
        let queue = JobQueue::new(Arc::new(InMemoryStore::new()));
        for i in 0..5 {
            queue.add_job(AddJob::new("count", json!(i))).await.unwrap();
        }
        queue
            .add_job(AddJob::new("count", json!("elsewhere")).queue("other"))
            .await
            .unwrap();

        let hits = Arc::new(AtomicUsize::new(0));
        let cancel = CancellationToken::new();
        let worker = tokio::spawn(run_worker(
            queue.clone(),
            Arc::new(Count(hits.clone())),
            WorkerConfig {
                concurrency: 2,
                ..fast_config()
            },
            cancel.clone(),
        ));

        wait_for(|| {
            let queue = queue.clone();
            async move { queue.get_job_stats(Some("default")).await.unwrap().completed == 5 }
        })
        .await;

        cancel.cancel();
        worker.await.unwrap().unwrap();

        assert_eq!(hits.load(Ordering::SeqCst), 5);
        let other = queue.get_job_stats(Some("other")).await.unwrap();
        assert_eq!(other.pending, 1);
    }

    #[tokio::test]
    async fn handler_errors_do_not_stop_the_worker() {
        let queue = JobQueue::new(Arc::new(InMemoryStore::new()));
        let job = queue
            .add_job(AddJob::new("mail", json!({})).max_attempts(1))
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        let worker = tokio::spawn(run_worker(
            queue.clone(),
            Arc::new(AlwaysFail),
            fast_config(),
            cancel.clone(),
        ));

        wait_for(|| {
            let queue = queue.clone();
            async move {
                queue.get_job_by_id(job.id).await.unwrap().map(|j| j.status)
                    == Some(JobStatus::Failed)
            }
        })
        .await;
        assert!(!worker.is_finished());

        cancel.cancel();
        worker.await.unwrap().unwrap();

        let failed = queue.get_job_by_id(job.id).await.unwrap().unwrap();
        assert_eq!(failed.last_error.as_deref(), Some("smtp unavailable"));
    }

    #[tokio::test]
    async fn shutdown_lets_in_flight_job_finish() {
        let queue = JobQueue::new(Arc::new(InMemoryStore::new()));
        let first = queue.add_job(AddJob::new("slow", json!(1))).await.unwrap();
        let second = queue.add_job(AddJob::new("slow", json!(2))).await.unwrap();

        let started = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        let cancel = CancellationToken::new();
        let worker = tokio::spawn(run_worker(
            queue.clone(),
            Arc::new(Gate {
                started: started.clone(),
                release: release.clone(),
            }),
            fast_config(),
            cancel.clone(),
        ));

        started.notified().await;
        cancel.cancel();
        release.notify_one();
        worker.await.unwrap().unwrap();

        let first = queue.get_job_by_id(first.id).await.unwrap().unwrap();
        assert_eq!(first.status, JobStatus::Completed);
        let second = queue.get_job_by_id(second.id).await.unwrap().unwrap();
        assert_eq!(second.status, JobStatus::Pending);
        assert_eq!(second.attempts, 0);
    }

    #[tokio::test]
    async fn maintenance_recovers_stale_jobs() {
        let queue = JobQueue::new(Arc::new(InMemoryStore::new()));
        let job = queue.add_job(AddJob::new("x", json!({}))).await.unwrap();
        // Claimed by a worker that then disappeared.
        queue
            .claim_next_job("default", Some(Duration::from_millis(1)))
            .await
            .unwrap()
            .unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        let cancel = CancellationToken::new();
        let worker = tokio::spawn(run_worker(
            queue.clone(),
            Arc::new(Count(Arc::new(AtomicUsize::new(0)))),
            fast_config(),
            cancel.clone(),
        ));

        wait_for(|| {
            let queue = queue.clone();
            async move {
                queue.get_job_by_id(job.id).await.unwrap().map(|j| j.status)
                    == Some(JobStatus::Completed)
            }
        })
        .await;
        cancel.cancel();
        worker.await.unwrap().unwrap();

        let done = queue.get_job_by_id(job.id).await.unwrap().unwrap();
        assert_eq!(done.attempts, 2);
        let listed = queue.list_jobs(ListJobs::default()).await.unwrap();
        assert_eq!(listed.len(), 1);
    }

    struct Explode;

    #[async_trait]
    impl JobHandler for Explode {
        async fn handle(&self, _job: &Job) -> anyhow::Result<()> {
            panic!("exploded");
        }
    }

    /// Fails the first few claims and scans with a database error, then delegates.
    struct UnreliableStore {
        inner: InMemoryStore,
        claim_failures: AtomicUsize,
        scan_failures: AtomicUsize,
    }

    fn take(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn outage() -> QueueError {
        QueueError::Database("connection reset by peer".into())
    }

    #[async_trait]
    impl QueueStore for UnreliableStore {
        async fn insert(&self, job: &Job) -> Result<(), QueueError> {
            self.inner.insert(job).await
        }

        async fn select_one(&self, id: JobId) -> Result<Option<Job>, QueueError> {
            self.inner.select_one(id).await
        }

        async fn select_many(
            &self,
            filter: &JobFilter,
            limit: i64,
        ) -> Result<Vec<Job>, QueueError> {
            if take(&self.scan_failures) {
                return Err(outage());
            }
            self.inner.select_many(filter, limit).await
        }

        async fn claim(
            &self,
            queue: &str,
            now: DateTime<Utc>,
            locked_until: DateTime<Utc>,
        ) -> Result<Option<Job>, QueueError> {
            if take(&self.claim_failures) {
                return Err(outage());
            }
            self.inner.claim(queue, now, locked_until).await
        }

        async fn conditional_update(
            &self,
            id: JobId,
            guard: &UpdateGuard,
            patch: &JobPatch,
        ) -> Result<Option<Job>, QueueError> {
            self.inner.conditional_update(id, guard, patch).await
        }

        async fn delete_finished_before(
            &self,
            status: JobStatus,
            cutoff: DateTime<Utc>,
        ) -> Result<u64, QueueError> {
            self.inner.delete_finished_before(status, cutoff).await
        }

        async fn count_by_status(&self, queue: Option<&str>) -> Result<JobStats, QueueError> {
            self.inner.count_by_status(queue).await
        }
    }

    #[test]
    fn zero_periods_are_clamped() {
        let cfg = WorkerConfig {
            poll_interval: Duration::ZERO,
            stale_check_interval: Duration::ZERO,
            cleanup_interval: Duration::ZERO,
            ..WorkerConfig::default()
        }
        .clamped();
        assert_eq!(cfg.poll_interval, MIN_INTERVAL);
        assert_eq!(cfg.stale_check_interval, MIN_INTERVAL);
        assert_eq!(cfg.cleanup_interval, MIN_INTERVAL);
        assert_eq!(cfg.lock_duration, Duration::from_secs(30));
    }

    #[tokio::test]
    async fn worker_keeps_running_with_zero_periods() {
        let queue = JobQueue::new(Arc::new(InMemoryStore::new()));
        let job = queue.add_job(AddJob::new("x", json!({}))).await.unwrap();

        let cancel = CancellationToken::new();
        let worker = tokio::spawn(run_worker(
            queue.clone(),
            Arc::new(Count(Arc::new(AtomicUsize::new(0)))),
            WorkerConfig {
                poll_interval: Duration::ZERO,
                stale_check_interval: Duration::ZERO,
                cleanup_interval: Duration::ZERO,
                ..WorkerConfig::default()
            },
            cancel.clone(),
        ));

        wait_for(|| {
            let queue = queue.clone();
            async move {
                queue.get_job_by_id(job.id).await.unwrap().map(|j| j.status)
                    == Some(JobStatus::Completed)
            }
        })
        .await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!worker.is_finished());

        cancel.cancel();
        worker.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn panicking_handler_fails_its_job_and_spares_other_slots() {
        let queue = JobQueue::new(Arc::new(InMemoryStore::new()));
        let slow = queue.add_job(AddJob::new("slow", json!({}))).await.unwrap();

        let started = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        let registry = HandlerRegistry::new()
            .register(
                "slow",
                Gate {
                    started: started.clone(),
                    release: release.clone(),
                },
            )
            .register("explode", Explode);

        let cancel = CancellationToken::new();
        let worker = tokio::spawn(run_worker(
            queue.clone(),
            Arc::new(registry),
            WorkerConfig {
                concurrency: 2,
                ..fast_config()
            },
            cancel.clone(),
        ));

        started.notified().await;
        let boom = queue
            .add_job(AddJob::new("explode", json!({})).max_attempts(1))
            .await
            .unwrap();

        wait_for(|| {
            let queue = queue.clone();
            async move {
                queue.get_job_by_id(boom.id).await.unwrap().map(|j| j.status)
                    == Some(JobStatus::Failed)
            }
        })
        .await;
        let failed = queue.get_job_by_id(boom.id).await.unwrap().unwrap();
        assert_eq!(failed.last_error.as_deref(), Some("handler panicked: exploded"));

        // The other slot is still inside its handler and must be allowed to finish.
        assert!(!worker.is_finished());
        release.notify_one();
        wait_for(|| {
            let queue = queue.clone();
            async move {
                queue.get_job_by_id(slow.id).await.unwrap().map(|j| j.status)
                    == Some(JobStatus::Completed)
            }
        })
        .await;

        cancel.cancel();
        worker.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn worker_survives_store_errors() {
        let store = Arc::new(UnreliableStore {
            inner: InMemoryStore::new(),
            claim_failures: AtomicUsize::new(3),
            scan_failures: AtomicUsize::new(2),
        });
        let queue = JobQueue::new(store.clone());
        for i in 0..3 {
            queue.add_job(AddJob::new("count", json!(i))).await.unwrap();
        }

        let hits = Arc::new(AtomicUsize::new(0));
        let cancel = CancellationToken::new();
        let worker = tokio::spawn(run_worker(
            queue.clone(),
            Arc::new(Count(hits.clone())),
            fast_config(),
            cancel.clone(),
        ));

        wait_for(|| {
            let queue = queue.clone();
            async move { queue.get_job_stats(None).await.unwrap().completed == 3 }
        })
        .await;
        wait_for(|| {
            let store = store.clone();
            async move { store.scan_failures.load(Ordering::SeqCst) == 0 }
        })
        .await;

        cancel.cancel();
        worker.await.unwrap().unwrap();

        assert_eq!(store.claim_failures.load(Ordering::SeqCst), 0);
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }
}
