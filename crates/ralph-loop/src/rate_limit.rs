//! Per-hour call budget.
//!
//! Counts agent invocations inside the current wall-clock hour bucket,
//! persisted across restarts in `.call_count` and `.last_reset`. The
//! counter resets whenever the bucket changes; when the budget is spent
//! the controller sleeps to the next hour boundary.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::info;

use supervision::clock;
use supervision::state::{self, StateFiles};
use supervision::SupervisionResult;

#[derive(Debug, Default, Serialize, Deserialize)]
struct CallCount {
    calls_made_this_hour: u32,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct LastReset {
    hour_bucket: u64,
}

/// Outcome of a rate-limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    /// Budget available; `calls_made` spent so far this hour.
    Proceed { calls_made: u32 },
    /// Budget exhausted; sleep this long to reach the next hour.
    Wait(Duration),
}

pub struct RateLimiter {
    files: StateFiles,
    max_calls_per_hour: u32,
}

impl RateLimiter {
    pub fn new(files: StateFiles, max_calls_per_hour: u32) -> Self {
        Self {
            files,
            max_calls_per_hour,
        }
    }

    pub fn max_calls_per_hour(&self) -> u32 {
        self.max_calls_per_hour
    }

    /// Calls already made in the current hour bucket, rolling the bucket
    /// over if the hour changed since the last check.
    pub fn calls_made(&self) -> SupervisionResult<u32> {
        self.roll_bucket(clock::epoch_secs())
    }

    /// Decide whether another call fits the budget.
    ///
    /// Blocks precisely when `calls_made == max_calls_per_hour`; the wait
    /// ends at the next hour boundary, where the bucket rolls over.
    pub fn check(&self) -> SupervisionResult<RateDecision> {
        let now = clock::epoch_secs();
        let calls = self.roll_bucket(now)?;
        if calls >= self.max_calls_per_hour {
            Ok(RateDecision::Wait(Duration::from_secs(
                clock::secs_until_next_hour(now),
            )))
        } else {
            Ok(RateDecision::Proceed { calls_made: calls })
        }
    }

    /// Record one agent invocation. Returns the updated count.
    pub fn record_call(&self) -> SupervisionResult<u32> {
        let calls = self.roll_bucket(clock::epoch_secs())?;
        let updated = CallCount {
            calls_made_this_hour: calls + 1,
        };
        state::store_json(&self.files.call_count(), &updated)?;
        Ok(updated.calls_made_this_hour)
    }

    fn roll_bucket(&self, now_epoch: u64) -> SupervisionResult<u32> {
        let bucket = clock::hour_bucket(now_epoch);
        let last: LastReset = state::load_json(&self.files.last_reset()).unwrap_or_default();
        if last.hour_bucket != bucket {
            info!(
                previous_bucket = last.hour_bucket,
                bucket, "Hour boundary crossed, resetting call counter"
            );
            state::store_json(&self.files.last_reset(), &LastReset { hour_bucket: bucket })?;
            state::store_json(&self.files.call_count(), &CallCount::default())?;
            return Ok(0);
        }
        let count: CallCount = state::load_json(&self.files.call_count()).unwrap_or_default();
        Ok(count.calls_made_this_hour)
    }
}
