//! Synthetic-traffic conditioning: targets, requests and the cycle policy.
//!
//! [`SchedulePolicy`] is deterministic. Given a cycle number and the
//! failure history it decides which target to hit, with which method,
//! whether to send a datagram probe, and how long to wait afterwards.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// Number of entries in the healthy delay rotation.
pub const HEALTHY_ROTATION_LEN: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetCategory {
    /// Captive-portal style endpoints; always fetched in full.
    Connectivity,
    Search,
    /// Large bodies; only ever probed for headers.
    Media,
    Social,
    Commerce,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConditioningTarget {
    pub address: String,
    pub category: TargetCategory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RequestMethod {
    Head,
    Get,
    Options,
}

impl fmt::Display for RequestMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Head => "HEAD",
            Self::Get => "GET",
            Self::Options => "OPTIONS",
        };
        f.write_str(s)
    }
}

/// Methods used round-robin when neither the category nor the full-fetch
/// cadence pins one.
pub const METHOD_ROTATION: [RequestMethod; 2] = [RequestMethod::Head, RequestMethod::Options];

/// A request handed to the request client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Stream-oriented request (HTTP over TCP).
    Stream {
        address: String,
        method: RequestMethod,
    },
    /// Fire-and-forget datagram probe (`host:port`).
    Datagram { address: String, payload: Vec<u8> },
}

impl Request {
    #[must_use]
    pub fn address(&self) -> &str {
        match self {
            Self::Stream { address, .. } | Self::Datagram { address, .. } => address,
        }
    }
}

/// Timeouts applied to one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutPolicy {
    pub connect: Duration,
    pub read: Duration,
}

impl Default for TimeoutPolicy {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(10),
            read: Duration::from_secs(15),
        }
    }
}

/// What came back from one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Response {
    /// HTTP status for stream requests, `None` for datagrams.
    pub status: Option<u16>,
}

impl Response {
    /// Statuses below 400 count as success; datagrams succeed once sent.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status.is_none_or(|code| code < 400)
    }
}

/// Outcome of one conditioning cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConditioningCycleResult {
    pub cycle: u64,
    pub target: ConditioningTarget,
    pub method: RequestMethod,
    pub success: bool,
    pub attempt_count: u32,
    pub code: Option<u16>,
}

/// Deterministic cycle policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulePolicy {
    pub healthy_delays: [Duration; HEALTHY_ROTATION_LEN],
    pub failure_delay: Duration,
    pub backoff_ceiling: Duration,
    pub failure_threshold: u32,
    pub probe_every: u64,
    pub full_fetch_every: u64,
}

impl Default for SchedulePolicy {
    fn default() -> Self {
        Self {
            healthy_delays: [45, 60, 75, 50, 90, 65].map(Duration::from_secs),
            failure_delay: Duration::from_secs(20),
            backoff_ceiling: Duration::from_secs(300),
            failure_threshold: 3,
            probe_every: 3,
            full_fetch_every: 5,
        }
    }
}

impl SchedulePolicy {
    /// Build a policy from a delay table of arbitrary length.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::DelayTableSize`] unless the table has
    /// exactly [`HEALTHY_ROTATION_LEN`] entries.
    pub fn with_healthy_delays(mut self, delays: &[Duration]) -> Result<Self, ValidationError> {
        self.healthy_delays = delays
            .try_into()
            .map_err(|_| ValidationError::DelayTableSize {
                expected: HEALTHY_ROTATION_LEN,
                actual: delays.len(),
            })?;
        Ok(self)
    }

    /// Round-robin index into the target list: `cycle mod len`.
    #[must_use]
    pub fn target_index(&self, cycle: u64, target_count: usize) -> usize {
        if target_count == 0 {
            return 0;
        }
        // Bounded by target_count, so the narrowing cannot truncate.
        #[allow(clippy::cast_possible_truncation)]
        let index = (cycle % target_count as u64) as usize;
        index
    }

    /// Whether cycle `cycle` (0-based) is one of every `probe_every`th.
    #[must_use]
    pub fn is_probe_cycle(&self, cycle: u64) -> bool {
        is_nth(cycle, self.probe_every)
    }

    /// Method for `cycle` against a target of `category`.
    #[must_use]
    pub fn method_for(&self, cycle: u64, category: TargetCategory) -> RequestMethod {
        match category {
            TargetCategory::Connectivity => RequestMethod::Get,
            TargetCategory::Media => RequestMethod::Head,
            _ if is_nth(cycle, self.full_fetch_every) => RequestMethod::Get,
            _ => {
                #[allow(clippy::cast_possible_truncation)]
                let index = (cycle % METHOD_ROTATION.len() as u64) as usize;
                METHOD_ROTATION[index]
            }
        }
    }

    /// Delay before the cycle following `cycle`.
    ///
    /// `consecutive_failures` is the counter *after* this cycle was
    /// accounted for. Once it reaches the threshold the ceiling applies
    /// until a success resets the counter.
    #[must_use]
    pub fn next_delay(&self, cycle: u64, succeeded: bool, consecutive_failures: u32) -> Duration {
        if consecutive_failures >= self.failure_threshold {
            return self.backoff_ceiling;
        }
        if !succeeded {
            return self.failure_delay;
        }
        #[allow(clippy::cast_possible_truncation)]
        let index = (cycle % HEALTHY_ROTATION_LEN as u64) as usize;
        self.healthy_delays[index]
    }
}

/// 1-based "every nth": cycles n-1, 2n-1, … (0-based numbering).
fn is_nth(cycle: u64, every: u64) -> bool {
    every != 0 && cycle % every == every - 1
}
