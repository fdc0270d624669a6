//! Checkpoint transport error types.

use jobmig_core::{CoreError, JobId};
use thiserror::Error;

pub type CheckpointResult<T> = Result<T, CheckpointError>;

/// Non-success status returned by the checkpoint transport.
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("job {0} is not checkpointable")]
    NotCheckpointable(JobId),

    #[error("job not found: {0}")]
    JobNotFound(JobId),

    #[error("job {0} is not running")]
    NotRunning(JobId),

    #[error("not enough free nodes for job {job_id}: need {needed} cpus, {available} available")]
    InsufficientNodes {
        job_id: JobId,
        needed: u64,
        available: u64,
    },

    #[error("registry error: {0}")]
    Registry(#[from] CoreError),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
