//! Migration eligibility.
//!
//! A cheap heuristic run on every candidate before anything is asked of
//! the checkpoint transport. It flags jobs that look spread over more
//! nodes than they need. Where a job should go is left to the transport.
//!
//! Rules, first failure wins:
//!
//! ```text
//! not checkpointable          → no
//! explicit required nodes     → no
//! whole-node allocation       → no
//! serial (1 cpu)              → policy.serial_is_eligible
//! parallel (>1 cpu)           → policy.parallel_is_eligible
//! otherwise                   → yes
//! ```

use jobmig_core::NodeTable;

use crate::config::DEFAULT_SERIAL_AVOID_DIGIT;
use crate::snapshot::RunningJobSnapshot;

/// Cluster-wide capacity used by the parallel rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClusterTotals {
    pub total_cpus: u64,
    pub node_count: u64,
}

impl ClusterTotals {
    pub fn from_nodes(nodes: &NodeTable) -> Self {
        Self {
            total_cpus: nodes.total_cpus(),
            node_count: nodes.len() as u64,
        }
    }

    /// CPUs per node, rounded down, never below 1.
    pub fn average_node_capacity(&self) -> u64 {
        self.total_cpus
            .checked_div(self.node_count)
            .unwrap_or(0)
            .max(1)
    }

    /// Fewest nodes that could hold `cpus` at average capacity.
    pub fn minimal_nodes(&self, cpus: u32) -> u64 {
        u64::from(cpus).div_ceil(self.average_node_capacity())
    }
}

/// The replaceable part of the heuristic.
pub trait MigrationPolicy: Send + Sync {
    fn serial_is_eligible(&self, job: &RunningJobSnapshot) -> bool;
    fn parallel_is_eligible(&self, job: &RunningJobSnapshot, totals: &ClusterTotals) -> bool;
}

/// Serial jobs already on a node whose next-to-last name character is
/// `avoid_digit` stay; parallel jobs move only if they use more nodes
/// than the average capacity requires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DefaultPolicy {
    pub avoid_digit: char,
}

impl Default for DefaultPolicy {
    fn default() -> Self {
        Self {
            avoid_digit: DEFAULT_SERIAL_AVOID_DIGIT,
        }
    }
}

impl MigrationPolicy for DefaultPolicy {
    fn serial_is_eligible(&self, job: &RunningJobSnapshot) -> bool {
        let Some(node) = job.node_names.first() else {
            return true;
        };
        node.chars().rev().nth(1) != Some(self.avoid_digit)
    }

    fn parallel_is_eligible(&self, job: &RunningJobSnapshot, totals: &ClusterTotals) -> bool {
        job.node_count() as u64 > totals.minimal_nodes(job.total_cpus)
    }
}

/// Whether `job` may be moved. Rules are checked in order and the first
/// one that applies decides.
pub fn is_eligible<P>(job: &RunningJobSnapshot, totals: &ClusterTotals, policy: &P) -> bool
where
    P: MigrationPolicy + ?Sized,
{
    if !job.checkpointable {
        return false;
    }
    if !job.required_nodes.is_empty() {
        return false;
    }
    if job.whole_node {
        return false;
    }
    if job.is_serial() {
        return policy.serial_is_eligible(job);
    }
    if job.total_cpus > 1 {
        return policy.parallel_is_eligible(job, totals);
    }
    true
}
