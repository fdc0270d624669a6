//! Registry-backed transport.
//!
//! Stands in for a real checkpoint/restore cycle: a committed migration
//! rewrites the job's node list in the registry. Checkpointability is
//! tracked here, fed by the launch shim through [`CheckpointMarker`].
//!
//! `test_migrate` and `migrate` take registry locks with the blocking API,
//! so they must run on a blocking worker, never on an async task.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use jobmig_core::{ClusterRegistry, JobId, JobTable, NodeMask, NodeTable, UpdateKind, epoch_secs};
use tracing::{debug, info};

use crate::error::{CheckpointError, CheckpointResult};
use crate::service::{Capability, CheckpointMarker, CheckpointService, MigrationRequest};

/// Seconds a checkpoint takes before the job can restart elsewhere.
const RESTART_DELAY_SECS: u64 = 5;

/// In-process [`CheckpointService`] that moves jobs by editing the registry.
pub struct SimulatedCheckpoint {
    registry: Arc<ClusterRegistry>,
    capable: Mutex<HashMap<JobId, bool>>,
}

impl SimulatedCheckpoint {
    pub fn new(registry: Arc<ClusterRegistry>) -> Self {
        Self {
            registry,
            capable: Mutex::new(HashMap::new()),
        }
    }

    fn is_capable(&self, job_id: JobId) -> bool {
        self.capable
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&job_id)
            .copied()
            .unwrap_or(false)
    }

    /// Choose destination nodes for the request without changing anything.
    fn plan(
        &self,
        jobs: &JobTable,
        nodes: &NodeTable,
        request: &MigrationRequest,
    ) -> CheckpointResult<Vec<usize>> {
        let job_id = request.job_id;
        let job = jobs.get(job_id).ok_or(CheckpointError::JobNotFound(job_id))?;
        if !job.is_running() {
            return Err(CheckpointError::NotRunning(job_id));
        }
        if !self.is_capable(job_id) {
            return Err(CheckpointError::NotCheckpointable(job_id));
        }

        let mut candidates = if request.destination_nodes.is_empty() {
            nodes.usable_mask()
        } else {
            let mut dest = nodes.mask_of(&request.destination_nodes)?;
            dest.and_assign(&nodes.usable_mask());
            dest
        };

        // Nodes held by any running job, this one included: a migration
        // always lands somewhere new.
        for other in jobs.iter().filter(|j| j.is_running()) {
            candidates.and_not_assign(&nodes.mask_of(&other.nodes)?);
        }

        let excluded = NodeMask::from_indices(
            nodes.len(),
            request
                .excluded_nodes
                .iter()
                .filter_map(|n| nodes.index_of(n).ok()),
        );
        candidates.and_not_assign(&excluded);

        // Fewest nodes first: take the biggest ones.
        let mut order: Vec<usize> = candidates.iter().collect();
        order.sort_by_key(|i| std::cmp::Reverse(nodes.get(*i).map_or(0, |n| n.cpus)));

        let needed = u64::from(job.total_cpus);
        let mut chosen = Vec::new();
        let mut cpus = 0u64;
        for i in order {
            if cpus >= needed {
                break;
            }
            cpus += nodes.get(i).map_or(0, |n| u64::from(n.cpus));
            chosen.push(i);
        }

        if cpus < needed || chosen.is_empty() {
            return Err(CheckpointError::InsufficientNodes {
                job_id,
                needed,
                available: cpus,
            });
        }
        chosen.sort_unstable();
        Ok(chosen)
    }
}

impl CheckpointMarker for SimulatedCheckpoint {
    fn mark_job_checkpointable(&self, job_id: JobId, capable: bool) {
        self.capable
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(job_id, capable);
    }
}

impl CheckpointService for SimulatedCheckpoint {
    fn query_checkpointable(&self, job_id: JobId) -> CheckpointResult<Capability> {
        if !self.is_capable(job_id) {
            return Ok(Capability::not_capable());
        }
        Ok(Capability {
            capable: true,
            earliest_restart: Some(epoch_secs() + RESTART_DELAY_SECS),
        })
    }

    fn test_migrate(&self, request: &MigrationRequest) -> CheckpointResult<()> {
        let jobs = self.registry.jobs().blocking_read();
        let nodes = self.registry.nodes().blocking_read();
        let chosen = self.plan(&jobs, &nodes, request)?;
        debug!(
            job_id = request.job_id,
            destination = ?nodes.names_of(&NodeMask::from_indices(nodes.len(), chosen)),
            "migration test passed"
        );
        Ok(())
    }

    fn migrate(&self, request: &MigrationRequest) -> CheckpointResult<()> {
        {
            let mut jobs = self.registry.jobs().blocking_write();
            let nodes = self.registry.nodes().blocking_read();
            let chosen = self.plan(&jobs, &nodes, request)?;
            let names = nodes.names_of(&NodeMask::from_indices(nodes.len(), chosen));

            let job = jobs
                .get_mut(request.job_id)
                .ok_or(CheckpointError::JobNotFound(request.job_id))?;
            info!(
                job_id = request.job_id,
                from = ?job.nodes,
                to = ?names,
                "job restarted on new nodes"
            );
            job.nodes = names;
        }
        self.registry.touch(UpdateKind::Jobs);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobmig_core::{JobRecord, JobState, NodeRecord};

    fn node(name: &str, cpus: u32) -> NodeRecord {
        NodeRecord {
            name: name.to_string(),
            cpus,
            down: false,
        }
    }

    fn job(job_id: JobId, nodes: &[&str], total_cpus: u32) -> JobRecord {
        JobRecord {
            job_id,
            array_job_id: None,
            array_task_id: None,
            user_id: 1000,
            partition: "batch".to_string(),
            priority: 10,
            state: JobState::Running,
            nodes: nodes.iter().map(|n| n.to_string()).collect(),
            total_cpus,
            required_nodes: Vec::new(),
            excluded_nodes: Vec::new(),
            whole_node: false,
            start_time: 0,
            end_time: 0,
        }
    }

    fn setup(jobs: Vec<JobRecord>) -> (Arc<ClusterRegistry>, SimulatedCheckpoint) {
        let registry = Arc::new(ClusterRegistry::new(
            vec![node("n01", 4), node("n02", 4), node("n03", 8), node("n04", 4)],
            Vec::new(),
            jobs,
        ));
        let transport = SimulatedCheckpoint::new(Arc::clone(&registry));
        (registry, transport)
    }

    #[test]
    fn query_reflects_marks() {
        let (_, transport) = setup(vec![job(1, &["n01"], 1)]);
        assert!(!transport.query_checkpointable(1).unwrap().capable);

        transport.mark_job_checkpointable(1, true);
        let cap = transport.query_checkpointable(1).unwrap();
        assert!(cap.capable);
        assert!(cap.earliest_restart.is_some());
    }

    #[test]
    fn test_migrate_has_no_side_effect() {
        let (registry, transport) = setup(vec![job(1, &["n01", "n02"], 8)]);
        transport.mark_job_checkpointable(1, true);

        transport.test_migrate(&MigrationRequest::new(1)).unwrap();

        let jobs = registry.jobs().blocking_read();
        assert_eq!(jobs.get(1).unwrap().nodes, vec!["n01", "n02"]);
    }

    #[test]
    fn migrate_consolidates_onto_fewer_nodes() {
        let (registry, transport) = setup(vec![job(1, &["n01", "n02"], 8)]);
        transport.mark_job_checkpointable(1, true);

        transport.migrate(&MigrationRequest::new(1)).unwrap();

        let jobs = registry.jobs().blocking_read();
        assert_eq!(jobs.get(1).unwrap().nodes, vec!["n03"]);
    }

    #[test]
    fn not_checkpointable_is_rejected() {
        let (_, transport) = setup(vec![job(1, &["n01"], 1)]);
        let err = transport.test_migrate(&MigrationRequest::new(1)).unwrap_err();
        assert!(matches!(err, CheckpointError::NotCheckpointable(1)));
    }

    #[test]
    fn unknown_and_stopped_jobs_are_rejected() {
        let mut stopped = job(2, &["n02"], 1);
        stopped.state = JobState::Completed;
        let (_, transport) = setup(vec![stopped]);
        transport.mark_job_checkpointable(2, true);

        assert!(matches!(
            transport.test_migrate(&MigrationRequest::new(9)),
            Err(CheckpointError::JobNotFound(9))
        ));
        assert!(matches!(
            transport.test_migrate(&MigrationRequest::new(2)),
            Err(CheckpointError::NotRunning(2))
        ));
    }

    #[test]
    fn excluded_and_busy_nodes_are_skipped() {
        let (registry, transport) = setup(vec![job(1, &["n01"], 1), job(2, &["n03"], 8)]);
        transport.mark_job_checkpointable(1, true);

        let request = MigrationRequest::new(1).with_excluded(vec!["n02".to_string()]);
        transport.migrate(&request).unwrap();

        let jobs = registry.jobs().blocking_read();
        assert_eq!(jobs.get(1).unwrap().nodes, vec!["n04"]);
    }

    #[test]
    fn no_room_reports_insufficient_nodes() {
        let (_, transport) = setup(vec![job(1, &["n01", "n02", "n04"], 12), job(2, &["n03"], 8)]);
        transport.mark_job_checkpointable(1, true);

        let err = transport.test_migrate(&MigrationRequest::new(1)).unwrap_err();
        assert!(matches!(
            err,
            CheckpointError::InsufficientNodes { job_id: 1, needed: 12, available: 0 }
        ));
    }

    #[test]
    fn destination_hint_limits_candidates() {
        let (registry, transport) = setup(vec![job(1, &["n01"], 1)]);
        transport.mark_job_checkpointable(1, true);

        let request = MigrationRequest::new(1).with_destination(vec!["n04".to_string()]);
        transport.migrate(&request).unwrap();

        let jobs = registry.jobs().blocking_read();
        assert_eq!(jobs.get(1).unwrap().nodes, vec!["n04"]);
    }
}
