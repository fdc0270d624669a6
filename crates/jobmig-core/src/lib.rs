//! jobmig-core — shared domain types for the migration scheduler.
//!
//! Holds the records the scheduler reads from the live cluster and the
//! in-process [`ClusterRegistry`] that guards them.
//!
//! # Lock ordering
//!
//! ```text
//! config (read) → partitions (read) → jobs (write) → nodes (write) → front ends (read)
//! ```
//!
//! Every caller that needs more than one table takes them in this order.
//! [`ClusterRegistry::lock_for_scan`] does it for the scheduler.

pub mod error;
pub mod mask;
pub mod registry;
pub mod types;

pub use error::{CoreError, CoreResult};
pub use mask::NodeMask;
pub use registry::{ClusterRegistry, ControllerConfig, JobTable, NodeTable, ScanGuard, UpdateKind};
pub use types::*;
