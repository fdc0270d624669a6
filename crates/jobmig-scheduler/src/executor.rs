//! Two-phase migration: a dry run, then the real thing.
//!
//! ```text
//! test_migrate ──fail──▶ Rejected
//!      │ ok
//!      ├──stopped──▶ Cancelled
//!      ▼
//!   migrate ────fail──▶ Error      (job keeps running where it was)
//!      │ ok
//!      ▼
//!   Migrated
//! ```
//!
//! Both calls may block on remote coordinators, so [`MigrationExecutor`]
//! runs them on a blocking worker. The agent holds no registry locks while
//! the worker runs and can walk away from it on stop; the stop signal is
//! checked once more before the commit starts.

use std::sync::Arc;

use jobmig_checkpoint::{CheckpointService, MigrationRequest};
use jobmig_core::JobId;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, error, info};

use crate::error::SchedulerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationOutcome {
    Migrated,
    /// The dry run said no. Nothing changed.
    Rejected,
    /// The dry run passed but the commit failed.
    Error,
    /// The dry run passed but a stop arrived before the commit.
    Cancelled,
}

/// Run both phases on the calling thread. Never retries.
///
/// `stop` is read between the phases: once it is set no commit starts.
pub fn two_phase<C>(
    checkpoint: &C,
    request: &MigrationRequest,
    stop: &watch::Receiver<bool>,
) -> MigrationOutcome
where
    C: CheckpointService + ?Sized,
{
    let job_id = request.job_id;

    if let Err(e) = checkpoint.test_migrate(request) {
        debug!(job_id, reason = %e, "migration test rejected");
        return MigrationOutcome::Rejected;
    }

    if *stop.borrow() {
        info!(job_id, "stop requested after migration test, not committing");
        return MigrationOutcome::Cancelled;
    }

    match checkpoint.migrate(request) {
        Ok(()) => {
            info!(
                job_id,
                destination = ?request.destination_nodes,
                excluded = ?request.excluded_nodes,
                "job migrated"
            );
            MigrationOutcome::Migrated
        }
        Err(source) => {
            let err = SchedulerError::MigrationCommit { job_id, source };
            error!(error = %err, "job left in place");
            MigrationOutcome::Error
        }
    }
}

/// Hands migration attempts to a blocking worker.
pub struct MigrationExecutor<C: ?Sized> {
    checkpoint: Arc<C>,
}

impl<C: ?Sized> Clone for MigrationExecutor<C> {
    fn clone(&self) -> Self {
        Self {
            checkpoint: Arc::clone(&self.checkpoint),
        }
    }
}

impl<C: CheckpointService + ?Sized> MigrationExecutor<C> {
    pub fn new(checkpoint: Arc<C>) -> Self {
        Self { checkpoint }
    }

    pub fn checkpoint(&self) -> &Arc<C> {
        &self.checkpoint
    }

    /// Start [`two_phase`] on a blocking worker. The caller owns the
    /// handle and may stop waiting on it without cancelling the worker.
    pub fn spawn(
        &self,
        request: MigrationRequest,
        stop: watch::Receiver<bool>,
    ) -> JoinHandle<MigrationOutcome> {
        let checkpoint = Arc::clone(&self.checkpoint);
        tokio::task::spawn_blocking(move || two_phase(checkpoint.as_ref(), &request, &stop))
    }
}

/// Map a worker that died before reporting an outcome.
pub(crate) fn worker_failed(job_id: JobId, e: JoinError) -> SchedulerError {
    SchedulerError::ConcurrencyStart {
        job_id,
        reason: e.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobmig_checkpoint::{Capability, CheckpointError, CheckpointResult};
    use std::sync::Mutex;

    fn running() -> watch::Receiver<bool> {
        watch::channel(false).1
    }

    #[derive(Default)]
    struct Scripted {
        reject_test: bool,
        fail_commit: bool,
        panic_on_test: bool,
        calls: Mutex<Vec<(&'static str, MigrationRequest)>>,
    }

    impl Scripted {
        fn calls(&self) -> Vec<&'static str> {
            self.calls.lock().unwrap().iter().map(|(c, _)| *c).collect()
        }
    }

    impl CheckpointService for Scripted {
        fn query_checkpointable(&self, _: JobId) -> CheckpointResult<Capability> {
            Ok(Capability::not_capable())
        }

        fn test_migrate(&self, request: &MigrationRequest) -> CheckpointResult<()> {
            if self.panic_on_test {
                panic!("transport blew up");
            }
            self.calls.lock().unwrap().push(("test", request.clone()));
            if self.reject_test {
                return Err(CheckpointError::NotCheckpointable(request.job_id));
            }
            Ok(())
        }

        fn migrate(&self, request: &MigrationRequest) -> CheckpointResult<()> {
            self.calls.lock().unwrap().push(("commit", request.clone()));
            if self.fail_commit {
                return Err(CheckpointError::Transport("restart failed".into()));
            }
            Ok(())
        }
    }

    #[test]
    fn rejected_test_never_commits() {
        let svc = Scripted {
            reject_test: true,
            ..Default::default()
        };
        assert_eq!(
            two_phase(&svc, &MigrationRequest::new(3), &running()),
            MigrationOutcome::Rejected
        );
        assert_eq!(svc.calls(), vec!["test"]);
    }

    #[test]
    fn commit_uses_identical_request() {
        let svc = Scripted::default();
        let request = MigrationRequest::new(3).with_excluded(vec!["c11".to_string()]);

        assert_eq!(
            two_phase(&svc, &request, &running()),
            MigrationOutcome::Migrated
        );

        let calls = svc.calls.lock().unwrap();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].1, calls[1].1);
        assert_eq!(calls[1].1, request);
    }

    #[test]
    fn failed_commit_is_an_error_without_retry() {
        let svc = Scripted {
            fail_commit: true,
            ..Default::default()
        };
        assert_eq!(
            two_phase(&svc, &MigrationRequest::new(3), &running()),
            MigrationOutcome::Error
        );
        assert_eq!(svc.calls(), vec!["test", "commit"]);
    }

    #[test]
    fn stop_after_test_skips_commit() {
        let svc = Scripted::default();
        let (_stop, stopped) = watch::channel(true);
        assert_eq!(
            two_phase(&svc, &MigrationRequest::new(3), &stopped),
            MigrationOutcome::Cancelled
        );
        assert_eq!(svc.calls(), vec!["test"]);
    }

    #[tokio::test]
    async fn spawn_runs_on_blocking_worker() {
        let executor = MigrationExecutor::new(Arc::new(Scripted::default()));
        let outcome = executor.spawn(MigrationRequest::new(8), running()).await.unwrap();
        assert_eq!(outcome, MigrationOutcome::Migrated);
        assert_eq!(executor.checkpoint().calls(), vec!["test", "commit"]);
    }

    #[tokio::test]
    async fn panicking_transport_is_a_concurrency_error() {
        let executor = MigrationExecutor::new(Arc::new(Scripted {
            panic_on_test: true,
            ..Default::default()
        }));
        let err = executor
            .spawn(MigrationRequest::new(8), running())
            .await
            .map_err(|e| worker_failed(8, e))
            .unwrap_err();
        assert!(matches!(err, SchedulerError::ConcurrencyStart { job_id: 8, .. }));
    }
}
