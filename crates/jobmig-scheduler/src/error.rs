//! Scheduler error types.

use jobmig_checkpoint::CheckpointError;
use jobmig_core::JobId;
use thiserror::Error;

/// Errors that can occur while scheduling migrations.
///
/// None of these stop the agent. Parse errors are logged and replaced by
/// defaults, registry and commit errors skip a single job, and a failed
/// migration task ends the current cycle.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("invalid scheduler parameter {key}={value}: {reason}")]
    ConfigParse {
        key: String,
        value: String,
        reason: String,
    },

    #[error("cannot read job {job_id}: {reason}")]
    RegistryAccess { job_id: JobId, reason: String },

    #[error("migration of job {job_id} failed after a successful test: {source}")]
    MigrationCommit {
        job_id: JobId,
        #[source]
        source: CheckpointError,
    },

    #[error("migration task for job {job_id} did not complete: {reason}")]
    ConcurrencyStart { job_id: JobId, reason: String },
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;
