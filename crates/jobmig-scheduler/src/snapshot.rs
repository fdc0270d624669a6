//! Running-job snapshots and the per-cycle job queue.

use std::collections::VecDeque;

use jobmig_checkpoint::CheckpointService;
use jobmig_core::{JobId, JobTable, NodeMask, NodeTable, UserId};
use tracing::{trace, warn};

use crate::error::SchedulerError;

/// What a scan needs to know about one running job, copied out of the
/// registry so nothing borrows the live tables past the scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunningJobSnapshot {
    pub job_id: JobId,
    pub array_job_id: Option<JobId>,
    pub array_task_id: Option<u32>,
    pub priority: u32,
    pub user_id: UserId,
    pub partition: String,
    /// Allocated nodes as a mask over the node table.
    pub nodes: NodeMask,
    /// Allocated node names in allocation order.
    pub node_names: Vec<String>,
    pub total_cpus: u32,
    pub required_nodes: Vec<String>,
    pub has_excluded_nodes: bool,
    pub whole_node: bool,
    pub checkpointable: bool,
    pub start_time: u64,
    pub end_time: u64,
}

impl RunningJobSnapshot {
    pub fn node_count(&self) -> usize {
        self.nodes.count()
    }

    pub fn is_serial(&self) -> bool {
        self.total_cpus == 1
    }
}

/// Running jobs for one cycle. Consumed front to back.
#[derive(Debug, Clone, Default)]
pub struct JobQueue {
    jobs: VecDeque<RunningJobSnapshot>,
}

impl JobQueue {
    pub fn push(&mut self, job: RunningJobSnapshot) {
        self.jobs.push_back(job);
    }

    /// Highest priority first. Equal priorities keep discovery order.
    pub fn sort_by_priority(&mut self) {
        self.jobs
            .make_contiguous()
            .sort_by(|a, b| b.priority.cmp(&a.priority));
    }

    pub fn pop(&mut self) -> Option<RunningJobSnapshot> {
        self.jobs.pop_front()
    }

    pub fn iter(&self) -> impl Iterator<Item = &RunningJobSnapshot> {
        self.jobs.iter()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

/// Snapshot every running job, in registry order.
///
/// A job whose node list or checkpoint state can't be read is logged and
/// left out; the rest of the queue is still built.
pub fn build_queue<C>(jobs: &JobTable, nodes: &NodeTable, checkpoint: &C) -> JobQueue
where
    C: CheckpointService + ?Sized,
{
    let mut queue = JobQueue::default();

    for job in jobs.iter().filter(|j| j.is_running()) {
        let mask = match nodes.mask_of(&job.nodes) {
            Ok(mask) => mask,
            Err(e) => {
                let err = SchedulerError::RegistryAccess {
                    job_id: job.job_id,
                    reason: e.to_string(),
                };
                warn!(error = %err, "skipping job");
                continue;
            }
        };

        let checkpointable = match checkpoint.query_checkpointable(job.job_id) {
            Ok(cap) => cap.capable,
            Err(e) => {
                let err = SchedulerError::RegistryAccess {
                    job_id: job.job_id,
                    reason: e.to_string(),
                };
                warn!(error = %err, "skipping job");
                continue;
            }
        };

        queue.push(RunningJobSnapshot {
            job_id: job.job_id,
            array_job_id: job.array_job_id,
            array_task_id: job.array_task_id,
            priority: job.priority,
            user_id: job.user_id,
            partition: job.partition.clone(),
            nodes: mask,
            node_names: job.nodes.clone(),
            total_cpus: job.total_cpus,
            required_nodes: job.required_nodes.clone(),
            has_excluded_nodes: !job.excluded_nodes.is_empty(),
            whole_node: job.whole_node,
            checkpointable,
            start_time: job.start_time,
            end_time: job.end_time,
        });
    }

    trace!(running = queue.len(), "job queue built");
    queue
}
