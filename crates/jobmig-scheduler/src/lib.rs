//! jobmig-scheduler — decides which running jobs to move and drives the
//! move through the checkpoint transport.
//!
//! # Flow of one cycle
//!
//! ```text
//! MigrationAgent wakes
//!   → preconditions (interval, completing jobs, rpc backlog, front ends, dirty state)
//!   → lock_for_scan
//!   → build_queue + sort by priority
//!   → build_timeline
//!   → per candidate: caps → is_eligible → timeline room
//!   → unlock → MigrationExecutor::spawn (test, then commit) raced against stop
//!   → at most one Migrated, then record CycleStatistics
//! ```
//!
//! # Modules
//!
//! - **`config`** — `SchedulerConfig::load` and the reconfigure flag
//! - **`snapshot`** — running-job snapshots and the job queue
//! - **`eligibility`** — the candidate heuristic and `MigrationPolicy`
//! - **`executor`** — the two-phase migration call
//! - **`agent`** — the background loop and its control handle
//! - **`stats`** — cumulative cycle statistics

pub mod agent;
pub mod config;
pub mod eligibility;
pub mod error;
pub mod executor;
pub mod snapshot;
pub mod stats;

pub use agent::{AgentHandle, CycleEnd, CycleReport, MigrationAgent, SkipReason, build_timeline};
pub use config::{ReconfigureFlag, SchedulerConfig};
pub use eligibility::{ClusterTotals, DefaultPolicy, MigrationPolicy, is_eligible};
pub use error::{SchedulerError, SchedulerResult};
pub use executor::{MigrationExecutor, MigrationOutcome, two_phase};
pub use snapshot::{JobQueue, RunningJobSnapshot, build_queue};
pub use stats::{CycleSample, CycleStatistics, StatsCell};
