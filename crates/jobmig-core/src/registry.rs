//! Cluster registry — the shared job/node/partition tables.
//!
//! The scheduler never owns this state. It takes the documented lock set
//! for the length of a scan, copies what it needs, and releases it before
//! sleeping or calling out to the checkpoint transport.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::debug;

use crate::error::{CoreError, CoreResult};
use crate::mask::NodeMask;
use crate::types::*;

/// Controller-wide configuration relevant to the scheduler.
#[derive(Debug, Clone, Default)]
pub struct ControllerConfig {
    /// The free-text scheduler parameter blob.
    pub sched_params: String,
}

/// Which registry table a last-update timestamp refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateKind {
    Config,
    Jobs,
    Nodes,
    Partitions,
}

// ── Tables ─────────────────────────────────────────────────────────

/// All jobs known to the controller, iterated in job-id order.
#[derive(Debug, Default)]
pub struct JobTable {
    jobs: BTreeMap<JobId, JobRecord>,
}

impl JobTable {
    pub fn new(jobs: impl IntoIterator<Item = JobRecord>) -> Self {
        Self {
            jobs: jobs.into_iter().map(|j| (j.job_id, j)).collect(),
        }
    }

    pub fn get(&self, job_id: JobId) -> Option<&JobRecord> {
        self.jobs.get(&job_id)
    }

    pub fn get_mut(&mut self, job_id: JobId) -> Option<&mut JobRecord> {
        self.jobs.get_mut(&job_id)
    }

    pub fn insert(&mut self, job: JobRecord) -> Option<JobRecord> {
        self.jobs.insert(job.job_id, job)
    }

    pub fn iter(&self) -> impl Iterator<Item = &JobRecord> {
        self.jobs.values()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn any_completing(&self) -> bool {
        self.jobs.values().any(JobRecord::is_completing)
    }
}

/// The node table. A node's position is its bit index in every mask.
#[derive(Debug, Default)]
pub struct NodeTable {
    nodes: Vec<NodeRecord>,
    index: HashMap<String, usize>,
}

impl NodeTable {
    pub fn new(nodes: Vec<NodeRecord>) -> Self {
        let index = nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.name.clone(), i))
            .collect();
        Self { nodes, index }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&NodeRecord> {
        self.nodes.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &NodeRecord> {
        self.nodes.iter()
    }

    pub fn index_of(&self, name: &str) -> CoreResult<usize> {
        self.index
            .get(name)
            .copied()
            .ok_or_else(|| CoreError::UnknownNode(name.to_string()))
    }

    /// Translate node names into a mask. Fails on the first unknown name.
    pub fn mask_of<S: AsRef<str>>(&self, names: &[S]) -> CoreResult<NodeMask> {
        let mut mask = NodeMask::new(self.nodes.len());
        for name in names {
            mask.set(self.index_of(name.as_ref())?);
        }
        Ok(mask)
    }

    pub fn names_of(&self, mask: &NodeMask) -> Vec<String> {
        mask.iter()
            .filter_map(|i| self.nodes.get(i).map(|n| n.name.clone()))
            .collect()
    }

    /// Nodes that are up.
    pub fn usable_mask(&self) -> NodeMask {
        NodeMask::from_indices(
            self.nodes.len(),
            self.nodes
                .iter()
                .enumerate()
                .filter(|(_, n)| !n.down)
                .map(|(i, _)| i),
        )
    }

    pub fn total_cpus(&self) -> u64 {
        self.nodes.iter().map(|n| u64::from(n.cpus)).sum()
    }

    pub fn set_down(&mut self, name: &str, down: bool) -> CoreResult<()> {
        let i = self.index_of(name)?;
        self.nodes[i].down = down;
        Ok(())
    }
}

// ── Registry ───────────────────────────────────────────────────────

/// The cluster-wide registry shared by the controller and the scheduler.
pub struct ClusterRegistry {
    config: RwLock<ControllerConfig>,
    partitions: RwLock<Vec<PartitionRecord>>,
    jobs: RwLock<JobTable>,
    nodes: RwLock<NodeTable>,
    front_ends: RwLock<Vec<FrontEnd>>,
    last_config_update: AtomicU64,
    last_job_update: AtomicU64,
    last_node_update: AtomicU64,
    last_part_update: AtomicU64,
    /// Change counters, indexed by [`UpdateKind`].
    revisions: [AtomicU64; 4],
    /// RPCs currently being serviced by the controller.
    pending_rpcs: AtomicU32,
}

/// The lock set held for one scan, acquired in registry lock order.
pub struct ScanGuard<'a> {
    pub config: RwLockReadGuard<'a, ControllerConfig>,
    pub partitions: RwLockReadGuard<'a, Vec<PartitionRecord>>,
    pub jobs: RwLockWriteGuard<'a, JobTable>,
    pub nodes: RwLockWriteGuard<'a, NodeTable>,
    pub front_ends: RwLockReadGuard<'a, Vec<FrontEnd>>,
}

impl ClusterRegistry {
    /// Create a registry. All last-update timestamps start at "now".
    pub fn new(
        nodes: Vec<NodeRecord>,
        partitions: Vec<PartitionRecord>,
        jobs: Vec<JobRecord>,
    ) -> Self {
        let now = epoch_secs();
        Self {
            config: RwLock::new(ControllerConfig::default()),
            partitions: RwLock::new(partitions),
            jobs: RwLock::new(JobTable::new(jobs)),
            nodes: RwLock::new(NodeTable::new(nodes)),
            front_ends: RwLock::new(Vec::new()),
            last_config_update: AtomicU64::new(now),
            last_job_update: AtomicU64::new(now),
            last_node_update: AtomicU64::new(now),
            last_part_update: AtomicU64::new(now),
            revisions: Default::default(),
            pending_rpcs: AtomicU32::new(0),
        }
    }

    pub fn with_sched_params(mut self, params: impl Into<String>) -> Self {
        self.config.get_mut().sched_params = params.into();
        self
    }

    pub fn with_front_ends(mut self, front_ends: Vec<FrontEnd>) -> Self {
        *self.front_ends.get_mut() = front_ends;
        self
    }

    /// Acquire config/partitions (read), jobs/nodes (write), front ends
    /// (read), in that order.
    pub async fn lock_for_scan(&self) -> ScanGuard<'_> {
        let config = self.config.read().await;
        let partitions = self.partitions.read().await;
        let jobs = self.jobs.write().await;
        let nodes = self.nodes.write().await;
        let front_ends = self.front_ends.read().await;
        ScanGuard {
            config,
            partitions,
            jobs,
            nodes,
            front_ends,
        }
    }

    pub fn jobs(&self) -> &RwLock<JobTable> {
        &self.jobs
    }

    pub fn nodes(&self) -> &RwLock<NodeTable> {
        &self.nodes
    }

    pub fn partitions(&self) -> &RwLock<Vec<PartitionRecord>> {
        &self.partitions
    }

    pub async fn sched_params(&self) -> String {
        self.config.read().await.sched_params.clone()
    }

    /// Replace the scheduler parameter blob, as a controller reconfigure does.
    pub async fn set_sched_params(&self, params: impl Into<String>) {
        self.config.write().await.sched_params = params.into();
        self.touch(UpdateKind::Config);
    }

    /// Insert or replace a job record.
    pub async fn upsert_job(&self, job: JobRecord) {
        debug!(job_id = job.job_id, state = ?job.state, "job record updated");
        self.jobs.write().await.insert(job);
        self.touch(UpdateKind::Jobs);
    }

    pub async fn set_job_state(&self, job_id: JobId, state: JobState) -> CoreResult<()> {
        {
            let mut jobs = self.jobs.write().await;
            let job = jobs.get_mut(job_id).ok_or(CoreError::UnknownJob(job_id))?;
            job.state = state;
        }
        self.touch(UpdateKind::Jobs);
        Ok(())
    }

    pub async fn set_node_down(&self, name: &str, down: bool) -> CoreResult<()> {
        self.nodes.write().await.set_down(name, down)?;
        self.touch(UpdateKind::Nodes);
        Ok(())
    }

    pub async fn set_partitions(&self, partitions: Vec<PartitionRecord>) {
        *self.partitions.write().await = partitions;
        self.touch(UpdateKind::Partitions);
    }

    pub async fn set_front_end_available(&self, name: &str, available: bool) -> bool {
        let mut front_ends = self.front_ends.write().await;
        match front_ends.iter_mut().find(|f| f.name == name) {
            Some(fe) => {
                fe.available = available;
                true
            }
            None => false,
        }
    }

    /// True if any job is mid-completion.
    pub async fn job_is_completing(&self) -> bool {
        self.jobs.read().await.any_completing()
    }

    /// True if no front ends are configured or at least one is available.
    pub async fn front_end_available(&self) -> bool {
        let front_ends = self.front_ends.read().await;
        front_ends.is_empty() || front_ends.iter().any(|f| f.available)
    }

    pub fn pending_rpcs(&self) -> u32 {
        self.pending_rpcs.load(Ordering::Relaxed)
    }

    pub fn set_pending_rpcs(&self, count: u32) {
        self.pending_rpcs.store(count, Ordering::Relaxed);
    }

    /// Record that a table changed now.
    pub fn touch(&self, kind: UpdateKind) {
        self.touch_at(kind, epoch_secs());
    }

    pub fn touch_at(&self, kind: UpdateKind, at: u64) {
        self.timestamp(kind).store(at, Ordering::Relaxed);
        self.revisions[kind as usize].fetch_add(1, Ordering::Relaxed);
    }

    /// Number of changes recorded for a table. Unlike the timestamps, two
    /// changes within the same second still read differently.
    pub fn revision(&self, kind: UpdateKind) -> u64 {
        self.revisions[kind as usize].load(Ordering::Relaxed)
    }

    pub fn last_update(&self, kind: UpdateKind) -> u64 {
        self.timestamp(kind).load(Ordering::Relaxed)
    }

    fn timestamp(&self, kind: UpdateKind) -> &AtomicU64 {
        match kind {
            UpdateKind::Config => &self.last_config_update,
            UpdateKind::Jobs => &self.last_job_update,
            UpdateKind::Nodes => &self.last_node_update,
            UpdateKind::Partitions => &self.last_part_update,
        }
    }
}
