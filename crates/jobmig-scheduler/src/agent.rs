//! The scheduling agent — one background task that wakes periodically and
//! moves at most one running job per wake.
//!
//! ```text
//!   Sleeping ──stop──▶ Stopped
//!      │ wake
//!      ▼
//!   PreconditionCheck ──skip (short sleep)──▶ Sleeping
//!      │
//!      ▼
//!   Scanning ──budget / rpc backlog──▶ Yielded ──continue──▶ Scanning
//!      │                                  │
//!      ▼                                  ▼
//!   CycleComplete ────────────────────▶ Sleeping
//! ```
//!
//! A scan holds the registry's scan lock set except while sleeping during
//! a yield and while a migration attempt is in flight. The attempt runs on
//! its own worker; a stop ends the cycle without waiting for it, and the
//! cycle stays active until the worker reports back.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use jobmig_checkpoint::{CheckpointService, MigrationRequest};
use jobmig_core::{ClusterRegistry, JobId, NodeTable, UpdateKind, UserId, epoch_secs};
use jobmig_timeline::NodeSpaceMap;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::config::{ReconfigureFlag, SchedulerConfig};
use crate::eligibility::{ClusterTotals, DefaultPolicy, MigrationPolicy, is_eligible};
use crate::error::SchedulerResult;
use crate::executor::{MigrationExecutor, MigrationOutcome, worker_failed};
use crate::snapshot::{JobQueue, RunningJobSnapshot, build_queue};
use crate::stats::{CycleSample, CycleStatistics, StatsCell};

/// Sleep after a skipped wake or a cycle with nothing to look at.
pub const SHORT_SLEEP: Duration = Duration::from_secs(1);

/// Pause taken with all locks released when a scan yields.
pub const YIELD_SLEEP: Duration = Duration::from_millis(500);

/// Pending RPCs at cycle end above which an unset `max_rpc_cnt` is reported.
pub const RPC_WARN_THRESHOLD: u32 = 150;

/// Why a wake did not run a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    TooSoon,
    JobsCompleting,
    RpcBacklog,
    NoFrontEnd,
    NoStateChange,
}

/// How a cycle ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleEnd {
    QueueExhausted,
    Migrated,
    /// Yielded and did not resume.
    Yielded,
    Stopped,
    /// Another cycle held the active flag.
    AlreadyActive,
    /// `bf_max_job_test` candidates examined.
    CandidateLimit,
    /// `bf_max_job_start` migration attempts made.
    StartLimit,
    NoRunningJobs,
}

/// What one call to [`MigrationAgent::run_cycle`] did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub examined: u32,
    pub tested: u32,
    pub yields: u32,
    pub migrated: Option<JobId>,
    pub end: CycleEnd,
}

/// Last-update stamps of the tables whose change makes a new cycle worth it.
#[derive(Debug, Clone, Copy)]
struct StateStamp {
    jobs: u64,
    nodes: u64,
    partitions: u64,
}

impl StateStamp {
    fn read(registry: &ClusterRegistry) -> Self {
        Self {
            jobs: registry.last_update(UpdateKind::Jobs),
            nodes: registry.last_update(UpdateKind::Nodes),
            partitions: registry.last_update(UpdateKind::Partitions),
        }
    }

    /// Stamps have one-second resolution, so a change in the same second
    /// as `t` counts.
    fn changed_since(&self, t: u64) -> bool {
        self.jobs >= t || self.nodes >= t || self.partitions >= t
    }
}

/// Running counts for one cycle.
#[derive(Debug, Default)]
struct Tally {
    examined: u32,
    tested: u32,
    yields: u32,
    slept: Duration,
    migrated: Option<JobId>,
    /// A migration worker was left running when the cycle ended.
    detached: bool,
}

/// Per-segment candidate counts, reset when a yielded scan resumes.
#[derive(Debug, Default)]
struct Caps {
    /// Jobs taken off the queue, skipped ones included.
    popped: u32,
    examined: u32,
    per_part: HashMap<String, u32>,
    per_user: HashMap<UserId, u32>,
}

impl Caps {
    /// Count `job` against the caps, or return false if a partition or
    /// user cap is already reached.
    fn admit(&mut self, job: &RunningJobSnapshot, config: &SchedulerConfig) -> bool {
        let part = self.per_part.get(&job.partition).copied().unwrap_or(0);
        if config.max_job_per_part != 0 && part >= config.max_job_per_part {
            return false;
        }
        let user = self.per_user.get(&job.user_id).copied().unwrap_or(0);
        if config.max_job_per_user != 0 && user >= config.max_job_per_user {
            return false;
        }
        self.examined += 1;
        *self.per_part.entry(job.partition.clone()).or_default() += 1;
        *self.per_user.entry(job.user_id).or_default() += 1;
        true
    }
}

// ── Shared handle ──────────────────────────────────────────────────

struct Shared {
    config: RwLock<Arc<SchedulerConfig>>,
    reconfigure: ReconfigureFlag,
    stats: StatsCell,
    stop: watch::Sender<bool>,
}

/// Control and diagnostics for a running agent. Cheap to clone.
#[derive(Clone)]
pub struct AgentHandle {
    shared: Arc<Shared>,
}

impl AgentHandle {
    /// Ask the agent to stop. A running scan ends at its next step, and a
    /// migration attempt in flight does not start its commit.
    pub fn stop(&self) {
        self.shared.stop.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.shared.stop.borrow()
    }

    /// Have the agent re-read its parameters before the next cycle.
    pub fn reconfigure(&self) {
        self.shared.reconfigure.raise();
    }

    pub fn stats(&self) -> CycleStatistics {
        self.shared.stats.snapshot()
    }

    pub fn config(&self) -> Arc<SchedulerConfig> {
        read_config(&self.shared)
    }
}

fn read_config(shared: &Shared) -> Arc<SchedulerConfig> {
    Arc::clone(&shared.config.read().unwrap_or_else(PoisonError::into_inner))
}

// ── Agent ──────────────────────────────────────────────────────────

/// The background scheduler. Build with [`MigrationAgent::new`], drive
/// with [`run`](MigrationAgent::run), control through the [`AgentHandle`].
pub struct MigrationAgent<C: ?Sized> {
    registry: Arc<ClusterRegistry>,
    executor: MigrationExecutor<C>,
    /// Overrides the configured [`DefaultPolicy`] when set.
    policy: Option<Box<dyn MigrationPolicy>>,
    shared: Arc<Shared>,
    stop_rx: watch::Receiver<bool>,
    /// Unix time the last cycle finished.
    last_cycle: u64,
    /// Unix time the last cycle started.
    scan_started: Option<u64>,
}

impl<C: CheckpointService + ?Sized> MigrationAgent<C> {
    /// Create an agent with default tunables. [`run`](Self::run) loads the
    /// registry's parameters before its first cycle.
    pub fn new(registry: Arc<ClusterRegistry>, checkpoint: Arc<C>) -> (Self, AgentHandle) {
        let (stop, stop_rx) = watch::channel(false);
        let shared = Arc::new(Shared {
            config: RwLock::new(Arc::new(SchedulerConfig::default())),
            reconfigure: ReconfigureFlag::default(),
            stats: StatsCell::default(),
            stop,
        });
        let handle = AgentHandle {
            shared: Arc::clone(&shared),
        };
        let agent = Self {
            registry,
            executor: MigrationExecutor::new(checkpoint),
            policy: None,
            shared,
            stop_rx,
            last_cycle: 0,
            scan_started: None,
        };
        (agent, handle)
    }

    pub fn with_policy(mut self, policy: impl MigrationPolicy + 'static) -> Self {
        self.policy = Some(Box::new(policy));
        self
    }

    pub fn with_config(self, config: SchedulerConfig) -> Self {
        self.replace_config(config);
        self
    }

    pub fn config(&self) -> Arc<SchedulerConfig> {
        read_config(&self.shared)
    }

    fn replace_config(&self, config: SchedulerConfig) {
        *self
            .shared
            .config
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Arc::new(config);
    }

    /// Re-parse the registry's parameter blob and swap it in whole.
    pub async fn reload_config(&self) {
        let params = self.registry.sched_params().await;
        let config = SchedulerConfig::load(&params);
        info!(
            interval_secs = config.interval_secs,
            max_job_test = config.max_job_test,
            max_rpc_cnt = config.max_rpc_cnt,
            continue_scan = config.continue_scan,
            "scheduler configuration applied"
        );
        self.replace_config(config);
    }

    fn stop_requested(&self) -> bool {
        *self.stop_rx.borrow()
    }

    fn rpc_backlogged(&self, config: &SchedulerConfig) -> bool {
        config.max_rpc_cnt != 0 && self.registry.pending_rpcs() >= config.max_rpc_cnt
    }

    /// Run until stopped. Returns the final statistics.
    ///
    /// A migration worker still running at stop is left to finish on its
    /// own. It does not start a commit after the stop.
    pub async fn run(mut self) -> CycleStatistics {
        self.reload_config().await;
        info!(
            interval_secs = self.config().interval_secs,
            "migration agent started"
        );

        let mut short_sleep = false;
        loop {
            let pause = if short_sleep {
                SHORT_SLEEP
            } else {
                self.config().interval()
            };
            tokio::select! {
                _ = tokio::time::sleep(pause) => {}
                _ = self.stop_rx.changed() => {}
            }
            if self.stop_requested() {
                info!("migration agent stopping");
                break;
            }

            if self.shared.reconfigure.take() {
                self.reload_config().await;
            }

            if let Some(reason) = self.check_preconditions(epoch_secs()).await {
                trace!(?reason, "cycle skipped");
                short_sleep = true;
                continue;
            }
            match self.run_cycle().await {
                Ok(report) => {
                    debug!(
                        examined = report.examined,
                        tested = report.tested,
                        migrated = ?report.migrated,
                        end = ?report.end,
                        "cycle finished"
                    );
                    short_sleep = report.end == CycleEnd::NoRunningJobs;
                }
                Err(e) => {
                    error!(error = %e, "cycle aborted");
                    short_sleep = false;
                }
            }
        }

        self.shared.stats.snapshot()
    }

    /// Decide whether a wake at `now` should run a cycle.
    pub async fn check_preconditions(&self, now: u64) -> Option<SkipReason> {
        let config = self.config();
        if self.last_cycle != 0 && now.saturating_sub(self.last_cycle) < config.interval_secs {
            return Some(SkipReason::TooSoon);
        }
        if self.registry.job_is_completing().await {
            return Some(SkipReason::JobsCompleting);
        }
        if self.rpc_backlogged(&config) {
            return Some(SkipReason::RpcBacklog);
        }
        if !self.registry.front_end_available().await {
            return Some(SkipReason::NoFrontEnd);
        }
        if let Some(started) = self.scan_started
            && !StateStamp::read(&self.registry).changed_since(started)
        {
            return Some(SkipReason::NoStateChange);
        }
        None
    }

    /// Run one scan cycle now, ignoring preconditions.
    ///
    /// Statistics are recorded however the cycle ends. An error means the
    /// migration worker failed; the agent carries on at the next wake. If
    /// a stop left the worker running, the cycle-active flag stays set
    /// until it finishes.
    pub async fn run_cycle(&mut self) -> SchedulerResult<CycleReport> {
        if !self.shared.stats.try_begin_cycle() {
            return Ok(CycleReport {
                examined: 0,
                tested: 0,
                yields: 0,
                migrated: None,
                end: CycleEnd::AlreadyActive,
            });
        }

        self.scan_started = Some(epoch_secs());
        let started = Instant::now();
        let mut tally = Tally::default();
        let result = self.scan(&mut tally).await;

        let sample = CycleSample {
            busy: started.elapsed().saturating_sub(tally.slept),
            examined: tally.examined,
            tested: tally.tested,
            migrated: tally.migrated.is_some(),
            yields: tally.yields,
        };
        if tally.detached {
            self.shared.stats.record_cycle(sample);
        } else {
            self.shared.stats.finish_cycle(sample);
        }
        self.last_cycle = epoch_secs();

        let pending = self.registry.pending_rpcs();
        if self.config().max_rpc_cnt == 0 && pending >= RPC_WARN_THRESHOLD {
            warn!(
                pending,
                "many pending RPCs at cycle end, consider setting max_rpc_cnt"
            );
        }

        let end = result?;
        Ok(CycleReport {
            examined: tally.examined,
            tested: tally.tested,
            yields: tally.yields,
            migrated: tally.migrated,
            end,
        })
    }

    async fn scan(&self, tally: &mut Tally) -> SchedulerResult<CycleEnd> {
        let config = self.config();
        let default_policy = DefaultPolicy {
            avoid_digit: config.serial_avoid_digit,
        };
        let policy: &dyn MigrationPolicy = match &self.policy {
            Some(p) => p.as_ref(),
            None => &default_policy,
        };
        let config_rev = self.registry.revision(UpdateKind::Config);
        let part_rev = self.registry.revision(UpdateKind::Partitions);

        let mut guard = self.registry.lock_for_scan().await;
        let now = epoch_secs();
        let checkpoint = self.executor.checkpoint().as_ref();

        let mut queue = build_queue(&guard.jobs, &guard.nodes, checkpoint);
        if queue.is_empty() {
            return Ok(CycleEnd::NoRunningJobs);
        }
        queue.sort_by_priority();
        let timeline = build_timeline(&guard.nodes, &queue, &config, now);
        let totals = ClusterTotals::from_nodes(&guard.nodes);
        let horizon = timeline.horizon();

        let mut budget_start = Instant::now();
        let mut caps = Caps::default();

        loop {
            if self.stop_requested() {
                debug!("scan stopped");
                return Ok(CycleEnd::Stopped);
            }
            if queue.is_empty() {
                return Ok(CycleEnd::QueueExhausted);
            }

            // A segment always gets through at least one job before the
            // time budget can end it.
            let budget_spent = caps.popped > 0 && budget_start.elapsed() >= config.yield_interval;
            if budget_spent || self.rpc_backlogged(&config) {
                tally.yields += 1;
                if !config.continue_scan {
                    debug!(remaining = queue.len(), "scan yielded, not resuming");
                    return Ok(CycleEnd::Yielded);
                }

                drop(guard);
                tally.slept += self.yield_pause().await;
                if self.stop_requested() {
                    return Ok(CycleEnd::Stopped);
                }
                if self.registry.revision(UpdateKind::Config) != config_rev
                    || self.registry.revision(UpdateKind::Partitions) != part_rev
                {
                    debug!("configuration or partitions changed during yield, abandoning scan");
                    return Ok(CycleEnd::Yielded);
                }

                guard = self.registry.lock_for_scan().await;
                budget_start = Instant::now();
                caps.popped = 0;
                caps.examined = 0;
                trace!(remaining = queue.len(), "scan resumed");
                continue;
            }

            let Some(job) = queue.pop() else {
                return Ok(CycleEnd::QueueExhausted);
            };
            caps.popped += 1;

            match guard.jobs.get(job.job_id) {
                Some(live) if live.is_running() && live.nodes == job.node_names => {}
                _ => {
                    trace!(job_id = job.job_id, "job changed since snapshot, skipping");
                    continue;
                }
            }

            if caps.examined >= config.max_job_test {
                debug!(max_job_test = config.max_job_test, "candidate limit reached");
                return Ok(CycleEnd::CandidateLimit);
            }
            if !caps.admit(&job, &config) {
                trace!(job_id = job.job_id, "partition or user cap reached, skipping");
                continue;
            }
            tally.examined += 1;

            if !is_eligible(&job, &totals, policy) {
                trace!(job_id = job.job_id, "not eligible");
                continue;
            }

            let until = if job.end_time > now { job.end_time } else { horizon };
            let destination = timeline.available_between(now, until);
            let needed = if job.is_serial() {
                1
            } else {
                totals.minimal_nodes(job.total_cpus)
            };
            if (destination.count() as u64) < needed {
                debug!(
                    job_id = job.job_id,
                    free = destination.count(),
                    needed,
                    "no room for job in timeline"
                );
                continue;
            }

            if config.max_job_start != 0 && tally.tested >= config.max_job_start {
                debug!(max_job_start = config.max_job_start, "start limit reached");
                return Ok(CycleEnd::StartLimit);
            }

            let request = MigrationRequest::new(job.job_id)
                .with_destination(guard.nodes.names_of(&destination))
                .with_excluded(config.exclude_nodes.clone());

            drop(guard);
            tally.tested += 1;
            let job_id = job.job_id;
            let mut worker = self.executor.spawn(request, self.stop_rx.clone());
            let outcome = tokio::select! {
                joined = &mut worker => joined.map_err(|e| worker_failed(job_id, e))?,
                () = stop_signal(self.stop_rx.clone()) => {
                    debug!(job_id, "scan stopped with a migration attempt in flight");
                    self.detach(job_id, worker);
                    tally.detached = true;
                    return Ok(CycleEnd::Stopped);
                }
            };
            match outcome {
                MigrationOutcome::Migrated => {
                    tally.migrated = Some(job_id);
                    return Ok(CycleEnd::Migrated);
                }
                MigrationOutcome::Cancelled => return Ok(CycleEnd::Stopped),
                MigrationOutcome::Rejected | MigrationOutcome::Error => {
                    guard = self.registry.lock_for_scan().await;
                }
            }
        }
    }

    /// Sleep for [`YIELD_SLEEP`] or until stopped. Returns the time slept.
    async fn yield_pause(&self) -> Duration {
        let started = Instant::now();
        tokio::select! {
            _ = tokio::time::sleep(YIELD_SLEEP) => {}
            () = stop_signal(self.stop_rx.clone()) => {}
        }
        started.elapsed()
    }

    /// Let a migration worker finish in the background. The cycle-active
    /// flag is cleared when it does.
    fn detach(&self, job_id: JobId, worker: JoinHandle<MigrationOutcome>) {
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            let migrated = match worker.await {
                Ok(outcome) => {
                    debug!(job_id, ?outcome, "detached migration worker finished");
                    outcome == MigrationOutcome::Migrated
                }
                Err(e) => {
                    error!(error = %worker_failed(job_id, e), "detached migration worker failed");
                    false
                }
            };
            shared.stats.release_cycle(migrated);
        });
    }
}

/// Resolves once the stop flag is set.
async fn stop_signal(mut stop: watch::Receiver<bool>) {
    while !*stop.borrow_and_update() {
        if stop.changed().await.is_err() {
            // Sender gone: nobody can stop us any more.
            std::future::pending::<()>().await;
        }
    }
}

/// Build the scan's availability timeline over `[now, now + window)`.
///
/// Every usable node starts free. Running jobs that pass the age and
/// priority thresholds then hold their nodes until their end time, rounded
/// up to the resolution. Only the first `max_job_array_resv` tasks of each
/// job array get a reservation.
pub fn build_timeline(
    nodes: &NodeTable,
    queue: &JobQueue,
    config: &SchedulerConfig,
    now: u64,
) -> NodeSpaceMap {
    let horizon = now.saturating_add(config.window_secs);
    let mut timeline = NodeSpaceMap::new(now, horizon, nodes.usable_mask());
    let mut array_tasks: HashMap<JobId, u32> = HashMap::new();

    for job in queue.iter() {
        if job.priority < config.min_prio_reserve {
            continue;
        }
        if now.saturating_sub(job.start_time) < config.min_age_reserve_secs {
            continue;
        }
        if let Some(array_id) = job.array_job_id {
            let reserved = array_tasks.entry(array_id).or_default();
            if *reserved >= config.max_job_array_resv {
                continue;
            }
            *reserved += 1;
        }

        let end = if job.end_time > now {
            round_up(job.end_time, config.resolution_secs)
        } else {
            horizon
        };
        timeline.reserve(job.start_time, end, &job.nodes);
    }

    trace!(intervals = timeline.len(), "timeline built");
    timeline
}

fn round_up(t: u64, resolution: u64) -> u64 {
    if resolution <= 1 {
        return t;
    }
    t.div_ceil(resolution).saturating_mul(resolution)
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobmig_checkpoint::{Capability, CheckpointResult};
    use jobmig_core::{FrontEnd, JobRecord, JobState, JobTable, NodeMask, NodeRecord};

    struct AlwaysCapable;

    impl CheckpointService for AlwaysCapable {
        fn query_checkpointable(&self, _: JobId) -> CheckpointResult<Capability> {
            Ok(Capability {
                capable: true,
                earliest_restart: None,
            })
        }
        fn test_migrate(&self, _: &MigrationRequest) -> CheckpointResult<()> {
            Ok(())
        }
        fn migrate(&self, _: &MigrationRequest) -> CheckpointResult<()> {
            Ok(())
        }
    }

    fn node(name: &str) -> NodeRecord {
        NodeRecord {
            name: name.to_string(),
            cpus: 4,
            down: false,
        }
    }

    fn job(job_id: JobId, nodes: &[&str], start_time: u64, end_time: u64) -> JobRecord {
        JobRecord {
            job_id,
            array_job_id: None,
            array_task_id: None,
            user_id: 1,
            partition: "batch".to_string(),
            priority: 10,
            state: JobState::Running,
            nodes: nodes.iter().map(|n| n.to_string()).collect(),
            total_cpus: 4,
            required_nodes: Vec::new(),
            excluded_nodes: Vec::new(),
            whole_node: false,
            start_time,
            end_time,
        }
    }

    fn setup(
        jobs: Vec<JobRecord>,
    ) -> (MigrationAgent<AlwaysCapable>, AgentHandle, Arc<ClusterRegistry>) {
        let registry = Arc::new(ClusterRegistry::new(
            vec![node("n01"), node("n02"), node("n03"), node("n04")],
            Vec::new(),
            jobs,
        ));
        let (agent, handle) = MigrationAgent::new(Arc::clone(&registry), Arc::new(AlwaysCapable));
        (agent, handle, registry)
    }

    fn queue_of(nodes: &NodeTable, jobs: Vec<JobRecord>) -> JobQueue {
        build_queue(&JobTable::new(jobs), nodes, &AlwaysCapable)
    }

    #[test]
    fn round_up_to_resolution() {
        assert_eq!(round_up(61, 60), 120);
        assert_eq!(round_up(120, 60), 120);
        assert_eq!(round_up(7, 1), 7);
    }

    #[test]
    fn timeline_reserves_running_jobs_until_rounded_end() {
        let nodes = NodeTable::new(vec![node("n01"), node("n02"), node("n03")]);
        let queue = queue_of(&nodes, vec![job(1, &["n01"], 900, 1_130)]);
        let config = SchedulerConfig::default();

        let timeline = build_timeline(&nodes, &queue, &config, 1_000);

        let spans: Vec<(u64, u64)> = timeline.intervals().map(|i| (i.begin, i.end)).collect();
        assert_eq!(spans, vec![(1_000, 1_140), (1_140, 1_000 + config.window_secs)]);
        assert_eq!(
            timeline.available_between(1_000, 1_100),
            NodeMask::from_indices(3, [1, 2])
        );
        assert_eq!(timeline.available_between(1_200, 1_300), NodeMask::full(3));
    }

    #[test]
    fn timeline_skips_young_and_low_priority_jobs() {
        let nodes = NodeTable::new(vec![node("n01"), node("n02"), node("n03")]);
        let mut low = job(1, &["n01"], 0, 0);
        low.priority = 1;
        let young = job(2, &["n02"], 990, 0);
        let old = job(3, &["n03"], 0, 0);
        let queue = queue_of(&nodes, vec![low, young, old]);
        let config = SchedulerConfig {
            min_prio_reserve: 5,
            min_age_reserve_secs: 60,
            ..SchedulerConfig::default()
        };

        let timeline = build_timeline(&nodes, &queue, &config, 1_000);

        assert_eq!(
            timeline.available_between(1_000, 2_000),
            NodeMask::from_indices(3, [0, 1])
        );
    }

    #[test]
    fn timeline_caps_array_task_reservations() {
        let nodes = NodeTable::new(vec![node("n01"), node("n02"), node("n03")]);
        let tasks = (0..3)
            .map(|i| {
                let mut t = job(10 + i, &[["n01", "n02", "n03"][i as usize]], 0, 0);
                t.array_job_id = Some(10);
                t.array_task_id = Some(i);
                t
            })
            .collect();
        let queue = queue_of(&nodes, tasks);
        let config = SchedulerConfig {
            max_job_array_resv: 2,
            ..SchedulerConfig::default()
        };

        let timeline = build_timeline(&nodes, &queue, &config, 1_000);

        assert_eq!(
            timeline.available_between(1_000, 2_000),
            NodeMask::from_indices(3, [2])
        );
    }

    #[tokio::test]
    async fn preconditions_in_order() {
        let (mut agent, _handle, registry) = setup(vec![job(1, &["n01"], 0, 0)]);
        assert_eq!(agent.check_preconditions(epoch_secs()).await, None);

        registry.set_job_state(1, JobState::Completing).await.unwrap();
        assert_eq!(
            agent.check_preconditions(epoch_secs()).await,
            Some(SkipReason::JobsCompleting)
        );
        registry.set_job_state(1, JobState::Running).await.unwrap();

        agent = agent.with_config(SchedulerConfig {
            max_rpc_cnt: 10,
            ..SchedulerConfig::default()
        });
        registry.set_pending_rpcs(10);
        assert_eq!(
            agent.check_preconditions(epoch_secs()).await,
            Some(SkipReason::RpcBacklog)
        );
        registry.set_pending_rpcs(0);

        agent.last_cycle = 1_000;
        assert_eq!(
            agent.check_preconditions(1_010).await,
            Some(SkipReason::TooSoon)
        );
        assert_eq!(agent.check_preconditions(1_030).await, None);
    }

    #[tokio::test]
    async fn front_end_outage_skips_cycle() {
        let registry = Arc::new(
            ClusterRegistry::new(vec![node("n01")], Vec::new(), Vec::new()).with_front_ends(vec![
                FrontEnd {
                    name: "fe1".to_string(),
                    available: false,
                },
            ]),
        );
        let (agent, _handle) = MigrationAgent::new(registry, Arc::new(AlwaysCapable));
        assert_eq!(
            agent.check_preconditions(epoch_secs()).await,
            Some(SkipReason::NoFrontEnd)
        );
    }

    #[tokio::test]
    async fn unchanged_state_skips_next_cycle() {
        let (mut agent, _handle, registry) = setup(Vec::new());
        for kind in [UpdateKind::Jobs, UpdateKind::Nodes, UpdateKind::Partitions] {
            registry.touch_at(kind, 1);
        }
        let report = agent.run_cycle().await.unwrap();
        assert_eq!(report.end, CycleEnd::NoRunningJobs);

        agent.last_cycle = 0;
        assert_eq!(
            agent.check_preconditions(epoch_secs()).await,
            Some(SkipReason::NoStateChange)
        );

        // Lands in the same second the scan started, or later.
        registry.set_node_down("n04", true).await.unwrap();
        assert_eq!(agent.check_preconditions(epoch_secs()).await, None);
    }

    #[tokio::test]
    async fn active_cycle_blocks_second_cycle() {
        let (mut agent, handle, _registry) = setup(Vec::new());
        assert!(agent.shared.stats.try_begin_cycle());

        let report = agent.run_cycle().await.unwrap();
        assert_eq!(report.end, CycleEnd::AlreadyActive);
        assert_eq!(handle.stats().cycle_count, 0);
    }

    #[tokio::test]
    async fn reload_replaces_config() {
        let (agent, handle, registry) = setup(Vec::new());
        registry.set_sched_params("bf_interval=7,bf_continue").await;
        agent.reload_config().await;
        assert_eq!(handle.config().interval_secs, 7);
        assert!(handle.config().continue_scan);
    }

    #[tokio::test]
    async fn stop_ends_run_loop() {
        let (agent, handle, _registry) = setup(Vec::new());
        let task = tokio::spawn(agent.run());
        handle.stop();
        assert!(handle.is_stopped());
        let stats = task.await.unwrap();
        assert!(!stats.active);
    }
}
