//! Durable job queue engine: data model, retry policy, store abstraction and
//! the operations producers and workers call.

pub mod clock;
pub mod error;
pub mod job;
pub mod memory;
pub mod metrics;
pub mod queue;
pub mod retry;
pub mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::QueueError;
pub use job::{AddJob, Job, JobId, JobStats, JobStatus, ListJobs, Retention};
pub use memory::InMemoryStore;
pub use queue::{JobHandler, JobQueue, ProcessOutcome, QueueConfig};
pub use retry::{BackoffStrategy, RetryPolicy};
pub use store::{JobFilter, JobOrder, JobPatch, QueueStore, UpdateGuard};
