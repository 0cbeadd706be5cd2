//! Rolling exit-signal history.
//!
//! Three bounded sequences of loop numbers, each capped at the five most
//! recent entries. Insertion is always at the tail with the oldest entry
//! evicted; sequences are strictly increasing and never reorder.

use serde::{Deserialize, Serialize};

use crate::analyzer::ResponseAnalysis;
use crate::analyzer::structured;

/// Maximum entries retained per sequence.
pub const SIGNAL_WINDOW: usize = 5;

/// Persisted content of `.exit_signals`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExitSignalHistory {
    /// Loops classified as test-only.
    #[serde(default)]
    pub test_only_loops: Vec<u64>,
    /// Loops that produced a completion signal.
    #[serde(default)]
    pub done_signals: Vec<u64>,
    /// Loops whose structured block reported `STATUS: COMPLETE`.
    #[serde(default)]
    pub completion_indicators: Vec<u64>,
}

impl ExitSignalHistory {
    /// Fold one loop's analysis into the history.
    pub fn record(&mut self, analysis: &ResponseAnalysis) {
        if analysis.is_test_only {
            push_bounded(&mut self.test_only_loops, analysis.loop_number);
        }
        if analysis.has_completion_signal {
            push_bounded(&mut self.done_signals, analysis.loop_number);
        }
        if structured::reports_complete(&analysis.structured_fields) {
            push_bounded(&mut self.completion_indicators, analysis.loop_number);
        }
    }

    /// Length of the run of consecutive loop numbers ending at `current`
    /// in the test-only sequence.
    pub fn trailing_consecutive_test_only(&self, current: u64) -> usize {
        trailing_consecutive(&self.test_only_loops, current)
    }

    /// Length of the run of consecutive loop numbers ending at `current`
    /// in the done-signal sequence.
    pub fn trailing_consecutive_done(&self, current: u64) -> usize {
        trailing_consecutive(&self.done_signals, current)
    }
}

/// Append at the tail, keeping the sequence strictly increasing and
/// evicting from the head past the window size.
fn push_bounded(seq: &mut Vec<u64>, loop_number: u64) {
    if seq.last().is_some_and(|&last| loop_number <= last) {
        return;
    }
    seq.push(loop_number);
    if seq.len() > SIGNAL_WINDOW {
        seq.remove(0);
    }
}

/// Count trailing entries forming an unbroken `.., current-1, current` run.
fn trailing_consecutive(seq: &[u64], current: u64) -> usize {
    let mut expected = current;
    let mut count = 0;
    for &entry in seq.iter().rev() {
        if entry == expected {
            count += 1;
            if expected == 0 {
                break;
            }
            expected -= 1;
        } else {
            break;
        }
    }
    count
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_bounded_evicts_oldest() {
        let mut seq = Vec::new();
        for n in 1..=7 {
            push_bounded(&mut seq, n);
        }
        assert_eq!(seq, vec![3, 4, 5, 6, 7]);
    }

    #[test]
    fn test_push_bounded_rejects_non_increasing() {
        let mut seq = vec![4];
        push_bounded(&mut seq, 4);
        push_bounded(&mut seq, 3);
        assert_eq!(seq, vec![4]);
    }

    #[test]
    fn test_trailing_consecutive() {
        assert_eq!(trailing_consecutive(&[1, 2, 3], 3), 3);
        assert_eq!(trailing_consecutive(&[1, 3], 3), 1);
        assert_eq!(trailing_consecutive(&[1, 2], 3), 0);
        assert_eq!(trailing_consecutive(&[], 3), 0);
        assert_eq!(trailing_consecutive(&[3, 4, 6, 7], 7), 2);
    }

    #[test]
    fn test_record_routes_signals() {
        let mut history = ExitSignalHistory::default();
        let mut analysis = ResponseAnalysis::empty(5);
        analysis.is_test_only = true;
        analysis.has_completion_signal = true;
        analysis
            .structured_fields
            .insert("STATUS".into(), "COMPLETE".into());
        history.record(&analysis);

        assert_eq!(history.test_only_loops, vec![5]);
        assert_eq!(history.done_signals, vec![5]);
        assert_eq!(history.completion_indicators, vec![5]);
    }

    #[test]
    fn test_record_nothing_on_quiet_loop() {
        let mut history = ExitSignalHistory::default();
        history.record(&ResponseAnalysis::empty(1));
        assert!(history.test_only_loops.is_empty());
        assert!(history.done_signals.is_empty());
        assert!(history.completion_indicators.is_empty());
    }
}
