//! Domain types for the cluster registry.
//!
//! These mirror what the controller keeps about jobs, nodes, partitions
//! and front ends. All types are serializable so a whole cluster can be
//! described in a single file.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Numeric job identifier.
pub type JobId = u32;

/// Numeric user identifier.
pub type UserId = u32;

// ── Jobs ───────────────────────────────────────────────────────────

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Running,
    Suspended,
    Completing,
    Completed,
    Failed,
    Cancelled,
}

/// A job as held by the registry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobRecord {
    pub job_id: JobId,
    /// Parent array job, when this record is one task of a job array.
    #[serde(default)]
    pub array_job_id: Option<JobId>,
    #[serde(default)]
    pub array_task_id: Option<u32>,
    pub user_id: UserId,
    pub partition: String,
    pub priority: u32,
    pub state: JobState,
    /// Names of the nodes currently allocated to the job.
    #[serde(default)]
    pub nodes: Vec<String>,
    /// Total CPUs allocated across all nodes.
    pub total_cpus: u32,
    /// Nodes the user explicitly asked for.
    #[serde(default)]
    pub required_nodes: Vec<String>,
    /// Nodes the user explicitly excluded.
    #[serde(default)]
    pub excluded_nodes: Vec<String>,
    /// The job holds its nodes exclusively.
    #[serde(default)]
    pub whole_node: bool,
    /// Unix timestamp (seconds) when the job started.
    #[serde(default)]
    pub start_time: u64,
    /// Unix timestamp (seconds) when the job's time limit expires.
    #[serde(default)]
    pub end_time: u64,
}

impl JobRecord {
    pub fn is_running(&self) -> bool {
        self.state == JobState::Running
    }

    pub fn is_completing(&self) -> bool {
        self.state == JobState::Completing
    }
}

// ── Nodes ──────────────────────────────────────────────────────────

/// A compute node. Its position in the node table is its bit index in
/// every [`NodeMask`](crate::NodeMask).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeRecord {
    pub name: String,
    pub cpus: u32,
    /// Down or drained nodes are never offered as destinations.
    #[serde(default)]
    pub down: bool,
}

// ── Partitions / front ends ────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PartitionRecord {
    pub name: String,
    #[serde(default)]
    pub nodes: Vec<String>,
}

/// A login/front-end host through which jobs are launched.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FrontEnd {
    pub name: String,
    pub available: bool,
}

/// Current Unix epoch in seconds.
pub fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
