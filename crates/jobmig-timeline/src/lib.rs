//! jobmig-timeline — node-space-time map used for conservative what-if
//! placement.
//!
//! The map partitions `[begin, horizon)` into chronologically linked
//! intervals. Each interval carries a mask of the nodes expected to be
//! free for its whole span. Reserving nodes only ever clears bits, so the
//! view of future availability shrinks monotonically within a scan.
//!
//! ```text
//! reserve(t1, t2, busy):
//!   [begin ─────────────── horizon)          one record
//!   [begin ── t1)[t1 ── t2)[t2 ── horizon)   split at t1 and t2
//!                 avail &= !busy             only the covered records
//!   merge first adjacent pair with equal masks
//! ```

pub mod timeline;

pub use timeline::{Interval, Intervals, NodeSpaceMap};
