//! Stagnation regression tests — end-to-end breaker behavior over
//! realistic loop sequences, including persistence and the transition
//! journal.

use supervision::circuit::{
    BreakerState, BreakerVerdict, CircuitBreaker, CircuitRecord, CircuitTransition, LoopResult,
};
use supervision::state::StateFiles;

fn breaker(dir: &std::path::Path) -> CircuitBreaker {
    let b = CircuitBreaker::new(StateFiles::new(dir));
    b.init().unwrap();
    b
}

fn result(loop_number: u64, files: usize, error_line: Option<&str>) -> LoopResult {
    LoopResult {
        loop_number,
        files_changed: files,
        had_error: error_line.is_some(),
        error_line: error_line.map(String::from),
        duration_ms: 1500,
    }
}

/// Every OPEN journal entry must be explained by one of the two
/// stagnation modes.
fn assert_open_justified(history: &[CircuitTransition], record: &CircuitRecord) {
    for t in history {
        if t.to == BreakerState::Open {
            assert!(
                record.no_progress_count >= 3 || record.consecutive_same_error >= 5,
                "OPEN without a qualifying counter: {t:?}"
            );
        }
    }
}

#[test]
fn three_stagnant_loops_walk_closed_half_open_open() {
    let dir = tempfile::tempdir().unwrap();
    let b = breaker(dir.path());

    assert_eq!(
        b.record_loop_result(&result(1, 0, None)).unwrap(),
        BreakerVerdict::Proceed
    );
    assert_eq!(b.current().state, BreakerState::Closed);

    assert_eq!(
        b.record_loop_result(&result(2, 0, None)).unwrap(),
        BreakerVerdict::Proceed
    );
    assert_eq!(b.current().state, BreakerState::HalfOpen);

    assert_eq!(
        b.record_loop_result(&result(3, 0, None)).unwrap(),
        BreakerVerdict::Halt
    );
    let record = b.current();
    assert_eq!(record.state, BreakerState::Open);
    assert!(record.opened_at.is_some());
    assert!(b.should_halt_execution());

    let history = b.history();
    assert_eq!(history.len(), 2);
    assert_eq!(
        (history[0].from, history[0].to),
        (BreakerState::Closed, BreakerState::HalfOpen)
    );
    assert_eq!(
        (history[1].from, history[1].to),
        (BreakerState::HalfOpen, BreakerState::Open)
    );
    assert_open_justified(&history, &record);
}

#[test]
fn recovery_from_half_open_resets_counters() {
    let dir = tempfile::tempdir().unwrap();
    let b = breaker(dir.path());

    b.record_loop_result(&result(1, 0, None)).unwrap();
    b.record_loop_result(&result(2, 0, None)).unwrap();
    assert_eq!(b.current().state, BreakerState::HalfOpen);

    // Loop 3 modifies 5 files
    assert_eq!(
        b.record_loop_result(&result(3, 5, None)).unwrap(),
        BreakerVerdict::Proceed
    );
    let record = b.current();
    assert_eq!(record.state, BreakerState::Closed);
    assert_eq!(record.no_progress_count, 0);
    assert!(!b.should_halt_execution());
}

#[test]
fn five_identical_errors_open_regardless_of_other_signals() {
    let dir = tempfile::tempdir().unwrap();
    let b = breaker(dir.path());

    // Same normalized error each loop, with varying file activity
    for n in 1..=4 {
        let verdict = b
            .record_loop_result(&result(n, (n % 2) as usize, Some("error: widget exploded")))
            .unwrap();
        assert_eq!(verdict, BreakerVerdict::Proceed, "opened early at loop {n}");
    }
    let verdict = b
        .record_loop_result(&result(5, 1, Some("error: widget exploded")))
        .unwrap();
    assert_eq!(verdict, BreakerVerdict::Halt);

    let record = b.current();
    assert_eq!(record.state, BreakerState::Open);
    assert_eq!(record.consecutive_same_error, 5);
    assert!(record.last_error_fingerprint.is_some());

    let history = b.history();
    let opened = history.iter().find(|t| t.to == BreakerState::Open).unwrap();
    assert!(opened.reason.contains("fingerprint"));
    assert_eq!(opened.loop_number, 5);
    assert_open_justified(&history, &record);
}

#[test]
fn changing_error_text_never_trips_same_error_path() {
    let dir = tempfile::tempdir().unwrap();
    let b = breaker(dir.path());

    for n in 1..=8 {
        let line = format!("error: distinct failure kind {}", char::from(b'a' + n as u8));
        b.record_loop_result(&result(n, 1, Some(&line))).unwrap();
    }
    let record = b.current();
    assert_eq!(record.state, BreakerState::Closed);
    assert_eq!(record.consecutive_same_error, 1);
    assert_eq!(record.error_count, 8);
}

#[test]
fn open_persists_across_breaker_instances_until_reset() {
    let dir = tempfile::tempdir().unwrap();
    {
        let b = breaker(dir.path());
        for n in 1..=3 {
            b.record_loop_result(&result(n, 0, None)).unwrap();
        }
        assert!(b.should_halt_execution());
    }

    // A new instance reads the same state files
    let b2 = CircuitBreaker::new(StateFiles::new(dir.path()));
    assert!(b2.should_halt_execution());

    b2.reset("operator reset").unwrap();
    assert!(!b2.should_halt_execution());
    assert_eq!(b2.current().state, BreakerState::Closed);

    let last = b2.history().into_iter().last().unwrap();
    assert_eq!(last.to, BreakerState::Closed);
    assert!(last.reason.contains("operator reset"));
}
