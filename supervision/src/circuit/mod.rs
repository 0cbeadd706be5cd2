//! Circuit breaker over loop results.
//!
//! A three-state machine (CLOSED / HALF_OPEN / OPEN) that watches each
//! loop for two stagnation modes: consecutive loops without progress, and
//! the same error fingerprint repeating. The transition function is pure
//! and tested in isolation; persistence and the transition journal live in
//! [`CircuitBreaker`].
//!
//! OPEN is terminal for the current run; only an explicit reset re-enters
//! CLOSED.

pub mod fingerprint;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::clock;
use crate::error::SupervisionResult;
use crate::state::{self, StateFiles};

/// Breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BreakerState {
    /// Healthy, execution allowed.
    Closed,
    /// Stagnation suspected, probing for recovery.
    HalfOpen,
    /// Tripped, execution blocked until explicit reset.
    Open,
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "CLOSED"),
            Self::HalfOpen => write!(f, "HALF_OPEN"),
            Self::Open => write!(f, "OPEN"),
        }
    }
}

/// Persisted content of `.circuit_breaker_state`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitRecord {
    pub state: BreakerState,
    /// Consecutive loops with no file changes and no error.
    pub no_progress_count: u32,
    /// Consecutive loops with an error.
    pub error_count: u32,
    /// Consecutive loops whose error fingerprint matched the previous one.
    pub consecutive_same_error: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error_fingerprint: Option<String>,
    pub last_transition_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub opened_at: Option<String>,
}

impl CircuitRecord {
    /// A fresh CLOSED record with zeroed counters.
    pub fn fresh() -> Self {
        Self {
            state: BreakerState::Closed,
            no_progress_count: 0,
            error_count: 0,
            consecutive_same_error: 0,
            last_error_fingerprint: None,
            last_transition_at: clock::now_iso(),
            opened_at: None,
        }
    }
}

/// One loop's outcome, as the breaker sees it.
#[derive(Debug, Clone)]
pub struct LoopResult {
    pub loop_number: u64,
    pub files_changed: usize,
    pub had_error: bool,
    /// Last error-looking output line, when one was found.
    pub error_line: Option<String>,
    pub duration_ms: u64,
}

/// Journal entry in `.circuit_breaker_history`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitTransition {
    pub from: BreakerState,
    pub to: BreakerState,
    #[serde(rename = "loop")]
    pub loop_number: u64,
    pub reason: String,
    pub at: String,
}

/// Tunable transition thresholds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BreakerThresholds {
    /// CLOSED → HALF_OPEN at this many no-progress loops.
    pub no_progress_half_open: u32,
    /// HALF_OPEN → OPEN at this many no-progress loops.
    pub no_progress_open: u32,
    /// Any state → OPEN at this many identical consecutive errors.
    pub same_error_open: u32,
}

impl Default for BreakerThresholds {
    fn default() -> Self {
        Self {
            no_progress_half_open: 2,
            no_progress_open: 3,
            same_error_open: 5,
        }
    }
}

/// Whether the loop may continue after recording a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerVerdict {
    Proceed,
    Halt,
}

/// Pure transition function: fold one loop result into the record.
///
/// Returns the updated record and, when the state changed, the reason for
/// the transition. No clock reads and no I/O happen here; timestamps are
/// stamped by the caller.
pub fn apply_loop_result(
    record: &CircuitRecord,
    result: &LoopResult,
    thresholds: &BreakerThresholds,
) -> (CircuitRecord, Option<String>) {
    let mut next = record.clone();

    // Counter bookkeeping. The same-error counter tracks fingerprint
    // repetition independently of file changes (see DESIGN.md).
    if result.had_error {
        next.error_count = record.error_count + 1;
        match result.error_line.as_deref() {
            Some(line) => {
                let fp = fingerprint::fingerprint(line);
                if record.last_error_fingerprint.as_deref() == Some(fp.as_str()) {
                    next.consecutive_same_error = record.consecutive_same_error + 1;
                } else {
                    next.consecutive_same_error = 1;
                }
                next.last_error_fingerprint = Some(fp);
            }
            None => {
                next.consecutive_same_error = 0;
                next.last_error_fingerprint = None;
            }
        }
    } else {
        next.error_count = 0;
        next.consecutive_same_error = 0;
        next.last_error_fingerprint = None;
    }

    if result.files_changed == 0 && !result.had_error {
        next.no_progress_count = record.no_progress_count + 1;
    } else {
        next.no_progress_count = 0;
    }

    // State transitions.
    let reason = if record.state != BreakerState::Open
        && next.consecutive_same_error >= thresholds.same_error_open
    {
        next.state = BreakerState::Open;
        Some(format!(
            "same error repeated {}x (fingerprint {})",
            next.consecutive_same_error,
            next.last_error_fingerprint.as_deref().unwrap_or("?"),
        ))
    } else {
        match record.state {
            BreakerState::Closed => {
                if next.no_progress_count >= thresholds.no_progress_half_open {
                    next.state = BreakerState::HalfOpen;
                    Some(format!(
                        "{} consecutive loops without progress",
                        next.no_progress_count
                    ))
                } else {
                    None
                }
            }
            BreakerState::HalfOpen => {
                if result.files_changed >= 1 {
                    next.state = BreakerState::Closed;
                    Some(format!(
                        "progress resumed ({} files changed)",
                        result.files_changed
                    ))
                } else if next.no_progress_count >= thresholds.no_progress_open {
                    next.state = BreakerState::Open;
                    Some(format!(
                        "{} consecutive loops without progress",
                        next.no_progress_count
                    ))
                } else {
                    None
                }
            }
            BreakerState::Open => None,
        }
    };

    (next, reason)
}

/// The breaker: persistence + journal around the pure transition function.
pub struct CircuitBreaker {
    files: StateFiles,
    thresholds: BreakerThresholds,
}

impl CircuitBreaker {
    pub fn new(files: StateFiles) -> Self {
        Self {
            files,
            thresholds: BreakerThresholds::default(),
        }
    }

    pub fn with_thresholds(files: StateFiles, thresholds: BreakerThresholds) -> Self {
        Self { files, thresholds }
    }

    /// Load the persisted record, writing a fresh CLOSED one if the file
    /// is absent or corrupt.
    pub fn init(&self) -> SupervisionResult<CircuitRecord> {
        match state::load_json(&self.files.circuit_state()) {
            Some(record) => Ok(record),
            None => {
                let record = CircuitRecord::fresh();
                state::store_json(&self.files.circuit_state(), &record)?;
                Ok(record)
            }
        }
    }

    /// Current record, falling back to fresh without persisting.
    pub fn current(&self) -> CircuitRecord {
        state::load_json(&self.files.circuit_state()).unwrap_or_else(CircuitRecord::fresh)
    }

    /// Record one loop result. Called exactly once per loop, after the
    /// analyzer has produced its record.
    pub fn record_loop_result(&self, result: &LoopResult) -> SupervisionResult<BreakerVerdict> {
        let record = self.current();
        let (mut next, reason) = apply_loop_result(&record, result, &self.thresholds);

        if let Some(reason) = reason {
            let at = clock::now_iso();
            next.last_transition_at = at.clone();
            if next.state == BreakerState::Open {
                next.opened_at = Some(at.clone());
            }
            self.append_history(CircuitTransition {
                from: record.state,
                to: next.state,
                loop_number: result.loop_number,
                reason: reason.clone(),
                at,
            });
            match next.state {
                BreakerState::Open => warn!(
                    loop_number = result.loop_number,
                    from = %record.state,
                    "Circuit OPEN: {reason}"
                ),
                _ => info!(
                    loop_number = result.loop_number,
                    from = %record.state,
                    to = %next.state,
                    "Circuit transition: {reason}"
                ),
            }
        }

        state::store_json(&self.files.circuit_state(), &next)?;
        Ok(if next.state == BreakerState::Open {
            BreakerVerdict::Halt
        } else {
            BreakerVerdict::Proceed
        })
    }

    /// True iff the current state is OPEN.
    pub fn should_halt_execution(&self) -> bool {
        self.current().state == BreakerState::Open
    }

    /// Force CLOSED, zero all counters, journal the reset.
    pub fn reset(&self, reason: &str) -> SupervisionResult<()> {
        let previous = self.current();
        let record = CircuitRecord::fresh();
        self.append_history(CircuitTransition {
            from: previous.state,
            to: BreakerState::Closed,
            loop_number: 0,
            reason: format!("reset: {reason}"),
            at: record.last_transition_at.clone(),
        });
        state::store_json(&self.files.circuit_state(), &record)
    }

    /// The full transition journal, oldest first.
    pub fn history(&self) -> Vec<CircuitTransition> {
        state::load_json(&self.files.circuit_history()).unwrap_or_default()
    }

    fn append_history(&self, transition: CircuitTransition) {
        let mut history = self.history();
        history.push(transition);
        if let Err(e) = state::store_json(&self.files.circuit_history(), &history) {
            warn!("Failed to append circuit history: {e}");
        }
    }
}
