//! Cumulative cycle statistics.
//!
//! One [`StatsCell`] lives for the whole agent. Its lock also guards the
//! cycle-active flag, so a second cycle can't start while one is in flight.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;

/// Counters read by diagnostics. Durations are in microseconds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleStatistics {
    pub cycle_count: u64,
    pub cycle_sum_us: u64,
    pub cycle_last_us: u64,
    pub cycle_max_us: u64,
    /// Candidates examined, summed over all cycles.
    pub depth_sum: u64,
    /// Candidates handed to the migration test, summed over all cycles.
    pub depth_try_sum: u64,
    pub last_depth: u32,
    pub last_depth_try: u32,
    pub migrations: u64,
    pub yields: u64,
    pub active: bool,
}

impl CycleStatistics {
    pub fn mean_cycle_us(&self) -> u64 {
        self.cycle_sum_us.checked_div(self.cycle_count).unwrap_or(0)
    }

    fn fold(&mut self, sample: CycleSample) {
        let busy_us = u64::try_from(sample.busy.as_micros()).unwrap_or(u64::MAX);
        self.cycle_count += 1;
        self.cycle_sum_us = self.cycle_sum_us.saturating_add(busy_us);
        self.cycle_last_us = busy_us;
        self.cycle_max_us = self.cycle_max_us.max(busy_us);
        self.depth_sum += u64::from(sample.examined);
        self.depth_try_sum += u64::from(sample.tested);
        self.last_depth = sample.examined;
        self.last_depth_try = sample.tested;
        self.migrations += u64::from(sample.migrated);
        self.yields += u64::from(sample.yields);
    }
}

/// What one cycle contributes to the totals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleSample {
    /// Wall time minus time spent sleeping during yields.
    pub busy: Duration,
    pub examined: u32,
    pub tested: u32,
    pub migrated: bool,
    pub yields: u32,
}

/// Cycle totals plus the cycle-active admission flag.
#[derive(Debug, Default)]
pub struct StatsCell {
    inner: Mutex<CycleStatistics>,
}

impl StatsCell {
    fn lock(&self) -> MutexGuard<'_, CycleStatistics> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Set the active flag. Returns false if a cycle is already running.
    pub fn try_begin_cycle(&self) -> bool {
        let mut stats = self.lock();
        if stats.active {
            return false;
        }
        stats.active = true;
        true
    }

    /// Fold a finished cycle into the totals and clear the active flag.
    pub fn finish_cycle(&self, sample: CycleSample) {
        let mut stats = self.lock();
        stats.fold(sample);
        stats.active = false;
    }

    /// Fold a cycle into the totals but leave it active: its migration
    /// worker is still running and will call [`release_cycle`](Self::release_cycle).
    pub fn record_cycle(&self, sample: CycleSample) {
        self.lock().fold(sample);
    }

    /// Clear the active flag once a detached migration worker is done.
    pub fn release_cycle(&self, migrated: bool) {
        let mut stats = self.lock();
        stats.migrations += u64::from(migrated);
        stats.active = false;
    }

    pub fn snapshot(&self) -> CycleStatistics {
        self.lock().clone()
    }
}
