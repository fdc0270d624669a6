//! The checkpoint/restore transport boundary.

use jobmig_core::JobId;
use serde::Serialize;

use crate::error::CheckpointResult;

/// Answer to a checkpoint-capability query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capability {
    pub capable: bool,
    /// Earliest Unix time (seconds) at which a restart could happen.
    pub earliest_restart: Option<u64>,
}

impl Capability {
    pub fn not_capable() -> Self {
        Self {
            capable: false,
            earliest_restart: None,
        }
    }
}

/// Parameters of a migration, identical for the test and commit calls.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MigrationRequest {
    pub job_id: JobId,
    /// `None` migrates every step of the job.
    pub step_id: Option<u32>,
    /// Candidate destination nodes. Empty lets the transport choose.
    pub destination_nodes: Vec<String>,
    /// Nodes the job must not land on.
    pub excluded_nodes: Vec<String>,
    /// Node to drain once the job has left it.
    pub drain_node: Option<String>,
    pub share: Option<bool>,
    pub spread: Option<bool>,
}

impl MigrationRequest {
    pub fn new(job_id: JobId) -> Self {
        Self {
            job_id,
            ..Self::default()
        }
    }

    pub fn with_destination(mut self, nodes: Vec<String>) -> Self {
        self.destination_nodes = nodes;
        self
    }

    pub fn with_excluded(mut self, nodes: Vec<String>) -> Self {
        self.excluded_nodes = nodes;
        self
    }
}

/// A checkpoint/restore transport able to relocate running jobs.
///
/// Calls may block on remote coordinators, so the scheduler issues
/// `test_migrate` and `migrate` from a blocking worker, never while it
/// holds registry locks.
pub trait CheckpointService: Send + Sync + 'static {
    /// Whether the job can be checkpointed right now.
    fn query_checkpointable(&self, job_id: JobId) -> CheckpointResult<Capability>;

    /// Dry run. Must not change the job in any observable way.
    fn test_migrate(&self, request: &MigrationRequest) -> CheckpointResult<()>;

    /// Checkpoint, move and restart the job. On failure the job keeps
    /// running where it was.
    fn migrate(&self, request: &MigrationRequest) -> CheckpointResult<()>;
}

/// Sink for the launch shim's checkpointability verdicts.
pub trait CheckpointMarker {
    fn mark_job_checkpointable(&self, job_id: JobId, capable: bool);
}
