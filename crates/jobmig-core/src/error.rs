//! Core error types.

use thiserror::Error;

use crate::types::JobId;

/// Result type alias for registry lookups.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors raised while reading the cluster registry.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CoreError {
    #[error("unknown node: {0}")]
    UnknownNode(String),

    #[error("unknown job: {0}")]
    UnknownJob(JobId),
}
