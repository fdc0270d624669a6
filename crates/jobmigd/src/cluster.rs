//! Cluster description file.
//!
//! ```toml
//! sched_params = "bf_interval=30,bf_continue"
//!
//! [[nodes]]
//! name = "c01"
//! cpus = 16
//!
//! [[partitions]]
//! name = "batch"
//! nodes = ["c01", "c02"]
//!
//! [[jobs]]
//! job_id = 101
//! user_id = 1000
//! partition = "batch"
//! priority = 50
//! state = "running"
//! nodes = ["c01", "c02"]
//! total_cpus = 16
//! command = ["./solver"]
//! options = ["--no-checkpoint"]
//! ```

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use jobmig_checkpoint::{CheckpointShim, SimulatedCheckpoint};
use jobmig_core::{ClusterRegistry, FrontEnd, JobRecord, NodeRecord, PartitionRecord};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterFile {
    #[serde(default)]
    pub sched_params: Option<String>,
    pub nodes: Vec<NodeRecord>,
    #[serde(default)]
    pub partitions: Vec<PartitionRecord>,
    #[serde(default)]
    pub front_ends: Vec<FrontEnd>,
    #[serde(default)]
    pub jobs: Vec<JobEntry>,
}

/// A job plus how it was launched, which decides whether it can be
/// checkpointed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobEntry {
    #[serde(flatten)]
    pub record: JobRecord,
    #[serde(default)]
    pub command: Vec<String>,
    /// Launch options passed to the checkpoint shim.
    #[serde(default)]
    pub options: Vec<String>,
    /// The task's environment at launch.
    #[serde(default)]
    pub env: HashMap<String, String>,
}

/// A loaded cluster: the registry and the transport bound to it.
pub struct Cluster {
    pub registry: Arc<ClusterRegistry>,
    pub transport: Arc<SimulatedCheckpoint>,
}

impl ClusterFile {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let file: ClusterFile = toml::from_str(&content)?;
        Ok(file)
    }

    /// Build the registry. `params` overrides the file's `sched_params`.
    /// Running jobs are launched through `shim`, which marks them
    /// checkpointable or not.
    pub fn into_cluster(self, params: Option<String>, shim: &CheckpointShim) -> Cluster {
        let params = params.or(self.sched_params).unwrap_or_default();
        let node_count = self.nodes.len();
        let job_count = self.jobs.len();

        let registry = Arc::new(
            ClusterRegistry::new(
                self.nodes,
                self.partitions,
                self.jobs.iter().map(|j| j.record.clone()).collect(),
            )
            .with_sched_params(params)
            .with_front_ends(self.front_ends),
        );
        let transport = Arc::new(SimulatedCheckpoint::new(Arc::clone(&registry)));

        for job in self.jobs.into_iter().filter(|j| j.record.is_running()) {
            let env = job.env;
            let argv = shim.clone().with_options(&job.options).task_init(
                job.record.job_id,
                job.command,
                |key| env.get(key).cloned(),
                transport.as_ref(),
            );
            debug!(job_id = job.record.job_id, ?argv, "job launched");
        }

        info!(nodes = node_count, jobs = job_count, "cluster loaded");
        Cluster {
            registry,
            transport,
        }
    }
}
