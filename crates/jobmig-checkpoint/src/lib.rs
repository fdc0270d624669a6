//! jobmig-checkpoint — the checkpoint/restore side of job migration.
//!
//! The scheduler only talks to [`CheckpointService`]: a capability query
//! plus the two halves of a migration, a side-effect-free test and the
//! committing call. Everything behind that trait (coordinators, image
//! transfer, restart) belongs to the transport.
//!
//! # Components
//!
//! - **`service`** — the transport trait and its request type
//! - **`shim`** — launch-time wrapper that makes a job checkpointable and
//!   cleans up coordinator state on task exit
//! - **`simulated`** — registry-backed transport that relocates jobs in
//!   place of a real checkpoint/restore cycle

pub mod error;
pub mod service;
pub mod shim;
pub mod simulated;

pub use error::{CheckpointError, CheckpointResult};
pub use service::{Capability, CheckpointMarker, CheckpointService, MigrationRequest};
pub use shim::CheckpointShim;
pub use simulated::SimulatedCheckpoint;
