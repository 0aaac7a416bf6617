use thiserror::Error;

use crate::JobId;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("job not found: {0}")]
    NotFound(JobId),

    #[error("invalid job state")]
    InvalidState,

    /// The job is no longer held by the attempt that tried to report on it.
    #[error("lease lost for job {0}")]
    LeaseLost(JobId),

    #[error("database error: {0}")]
    Database(String),

    #[error("internal error: {0}")]
    Internal(String),
}
