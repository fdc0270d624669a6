//! Scheduler tunables parsed from the controller's parameter blob.
//!
//! The blob is a list of `key=value` tokens separated by commas or
//! whitespace, e.g. `bf_interval=60,bf_continue,max_rpc_cnt=150`.
//! Unknown tokens are ignored. A value that does not parse or falls below
//! its minimum is logged and replaced by that field's default; the rest of
//! the blob still applies.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, warn};

use crate::error::SchedulerError;

pub const DEFAULT_INTERVAL_SECS: u64 = 30;
pub const DEFAULT_RESOLUTION_SECS: u64 = 60;
pub const DEFAULT_WINDOW_MINS: u64 = 24 * 60;
pub const DEFAULT_MAX_JOB_TEST: u32 = 100;
pub const DEFAULT_MAX_JOB_ARRAY_RESV: u32 = 20;
pub const DEFAULT_YIELD_INTERVAL_USEC: u64 = 2_000_000;
pub const DEFAULT_SERIAL_AVOID_DIGIT: char = '1';

/// One immutable set of tunables, replaced whole on reconfigure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SchedulerConfig {
    /// Seconds between scheduling cycles (`bf_interval`).
    pub interval_secs: u64,
    /// Timeline granularity in seconds (`bf_resolution`).
    pub resolution_secs: u64,
    /// How far ahead the timeline looks, in seconds (`bf_window`, given in minutes).
    pub window_secs: u64,
    /// Candidates examined per cycle (`bf_max_job_test`).
    pub max_job_test: u32,
    /// Candidates examined per partition per cycle, 0 = unlimited (`bf_max_job_part`).
    pub max_job_per_part: u32,
    /// Candidates examined per user per cycle, 0 = unlimited (`bf_max_job_user`).
    pub max_job_per_user: u32,
    /// Migration attempts started per cycle, 0 = unlimited (`bf_max_job_start`).
    pub max_job_start: u32,
    /// Tasks per job array given a timeline reservation (`bf_max_job_array_resv`).
    pub max_job_array_resv: u32,
    /// Jobs younger than this get no timeline reservation (`bf_min_age_reserve`).
    pub min_age_reserve_secs: u64,
    /// Jobs below this priority get no timeline reservation (`bf_min_prio_reserve`).
    pub min_prio_reserve: u32,
    /// Busy time allowed before a scan yields its locks (`bf_yield_interval`, µs).
    pub yield_interval: Duration,
    /// Pending RPCs at which the scan yields, 0 = disabled (`max_rpc_cnt`).
    pub max_rpc_cnt: u32,
    /// Resume an interrupted scan instead of abandoning it (`bf_continue`).
    pub continue_scan: bool,
    /// Nodes a migrated job must not land on (`mg_exclude_nodes`, `:`-separated).
    pub exclude_nodes: Vec<String>,
    /// Serial jobs on nodes whose name has this as its next-to-last
    /// character stay put (`mg_serial_avoid_digit`).
    pub serial_avoid_digit: char,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval_secs: DEFAULT_INTERVAL_SECS,
            resolution_secs: DEFAULT_RESOLUTION_SECS,
            window_secs: DEFAULT_WINDOW_MINS * 60,
            max_job_test: DEFAULT_MAX_JOB_TEST,
            max_job_per_part: 0,
            max_job_per_user: 0,
            max_job_start: 0,
            max_job_array_resv: DEFAULT_MAX_JOB_ARRAY_RESV,
            min_age_reserve_secs: 0,
            min_prio_reserve: 0,
            yield_interval: Duration::from_micros(DEFAULT_YIELD_INTERVAL_USEC),
            max_rpc_cnt: 0,
            continue_scan: false,
            exclude_nodes: Vec::new(),
            serial_avoid_digit: DEFAULT_SERIAL_AVOID_DIGIT,
        }
    }
}

type Tokens<'a> = HashMap<&'a str, &'a str>;

impl SchedulerConfig {
    /// Parse a parameter blob. Never fails.
    pub fn load(params: &str) -> Self {
        let tokens = tokenize(params);
        let defaults = Self::default();

        let max_job_test = int_param(
            &tokens,
            &["bf_max_job_test", "max_job_bf"],
            1,
            defaults.max_job_test,
        );
        let max_job_per_part = int_param(&tokens, &["bf_max_job_part"], 0, 0u32);
        if max_job_per_part != 0 && max_job_per_part >= max_job_test {
            warn!(
                max_job_per_part,
                max_job_test, "bf_max_job_part >= bf_max_job_test, per-partition cap has no effect"
            );
        }
        let max_job_per_user = int_param(&tokens, &["bf_max_job_user"], 0, 0u32);
        if max_job_per_user != 0 && max_job_per_user >= max_job_test {
            warn!(
                max_job_per_user,
                max_job_test, "bf_max_job_user >= bf_max_job_test, per-user cap has no effect"
            );
        }

        let window_mins = int_param(&tokens, &["bf_window"], 1, DEFAULT_WINDOW_MINS);
        let yield_usec = int_param(
            &tokens,
            &["bf_yield_interval"],
            1,
            DEFAULT_YIELD_INTERVAL_USEC,
        );

        let config = Self {
            interval_secs: int_param(&tokens, &["bf_interval"], 1, defaults.interval_secs),
            resolution_secs: int_param(&tokens, &["bf_resolution"], 1, defaults.resolution_secs),
            window_secs: window_mins.saturating_mul(60),
            max_job_test,
            max_job_per_part,
            max_job_per_user,
            max_job_start: int_param(&tokens, &["bf_max_job_start"], 0, 0u32),
            max_job_array_resv: int_param(
                &tokens,
                &["bf_max_job_array_resv"],
                0,
                defaults.max_job_array_resv,
            ),
            min_age_reserve_secs: int_param(&tokens, &["bf_min_age_reserve"], 0, 0u64),
            min_prio_reserve: int_param(&tokens, &["bf_min_prio_reserve"], 0, 0u32),
            yield_interval: Duration::from_micros(yield_usec),
            max_rpc_cnt: int_param(&tokens, &["max_rpc_cnt", "max_rpc_count"], 0, 0u32),
            continue_scan: tokens.contains_key("bf_continue"),
            exclude_nodes: tokens
                .get("mg_exclude_nodes")
                .map(|v| {
                    v.split(':')
                        .filter(|n| !n.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
            serial_avoid_digit: serial_digit(&tokens),
        };

        debug!(?config, "scheduler configuration loaded");
        config
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// Split the blob into `key -> value`. The first occurrence of a key wins;
/// bare flags map to an empty value.
fn tokenize(params: &str) -> Tokens<'_> {
    let mut tokens = Tokens::new();
    for token in params
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|t| !t.is_empty())
    {
        let (key, value) = token.split_once('=').unwrap_or((token, ""));
        tokens.entry(key).or_insert(value);
    }
    tokens
}

fn int_param<T>(tokens: &Tokens<'_>, keys: &[&str], min: i64, default: T) -> T
where
    T: TryFrom<i64> + Copy + fmt::Display,
{
    let Some((key, raw)) = keys
        .iter()
        .find_map(|k| tokens.get(k).map(|v| (*k, *v)))
    else {
        return default;
    };

    let reason = match raw.trim().parse::<i64>() {
        Ok(v) if v < min => format!("must be at least {min}"),
        Ok(v) => match T::try_from(v) {
            Ok(value) => return value,
            Err(_) => "out of range".to_string(),
        },
        Err(e) => e.to_string(),
    };

    let err = SchedulerError::ConfigParse {
        key: key.to_string(),
        value: raw.to_string(),
        reason,
    };
    warn!(error = %err, %default, "using default for scheduler parameter");
    default
}

fn serial_digit(tokens: &Tokens<'_>) -> char {
    let Some(raw) = tokens.get("mg_serial_avoid_digit") else {
        return DEFAULT_SERIAL_AVOID_DIGIT;
    };
    let mut chars = raw.chars();
    match (chars.next(), chars.next()) {
        (Some(c), None) if c.is_ascii_digit() => c,
        _ => {
            let err = SchedulerError::ConfigParse {
                key: "mg_serial_avoid_digit".to_string(),
                value: raw.to_string(),
                reason: "expected a single digit".to_string(),
            };
            warn!(error = %err, default = %DEFAULT_SERIAL_AVOID_DIGIT, "using default for scheduler parameter");
            DEFAULT_SERIAL_AVOID_DIGIT
        }
    }
}

/// Out-of-band "configuration changed" signal, polled once per wake.
#[derive(Debug, Default)]
pub struct ReconfigureFlag {
    pending: Mutex<bool>,
}

impl ReconfigureFlag {
    pub fn raise(&self) {
        *self.pending.lock().unwrap_or_else(PoisonError::into_inner) = true;
    }

    /// Clear the flag, returning whether it was set.
    pub fn take(&self) -> bool {
        std::mem::take(&mut *self.pending.lock().unwrap_or_else(PoisonError::into_inner))
    }
}
