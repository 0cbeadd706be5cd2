//! Supervisor configuration.
//!
//! `LoopConfig::default()` reads the recognized environment variables with
//! hard-coded fallbacks; CLI flags override on top in `main`.

use std::path::PathBuf;

/// Top-level loop configuration.
#[derive(Debug, Clone)]
pub struct LoopConfig {
    /// Agent command line, shlex-split at invocation time.
    /// Populated from `RALPH_AGENT_CMD`.
    pub agent_command: String,
    /// Instruction file piped to the agent on stdin.
    /// Populated from `RALPH_PROMPT_FILE` (default: PROMPT.md).
    pub prompt_file: PathBuf,
    /// Agent invocations allowed per wall-clock hour.
    /// Populated from `MAX_CALLS_PER_HOUR` (default: 100).
    pub max_calls_per_hour: u32,
    /// Consecutive test-only loops that force an evidence check.
    /// Populated from `MAX_CONSECUTIVE_TEST_LOOPS` (default: 3).
    pub max_consecutive_test_loops: u32,
    /// Consecutive done-signal loops that force an evidence check.
    /// Populated from `MAX_CONSECUTIVE_DONE_SIGNALS` (default: 2).
    pub max_consecutive_done_signals: u32,
    /// Per-invocation wall-clock timeout in minutes (default: 30).
    pub timeout_minutes: u64,
    /// Inter-loop backoff in seconds.
    /// Populated from `RALPH_LOOP_DELAY_SECS` (default: 5).
    pub loop_delay_secs: u64,
    /// Exit on the analyzer's signal alone, without running gates.
    pub skip_evidence: bool,
    /// Suppress the test-runner gate.
    /// Populated from `SKIP_TEST_VERIFICATION`.
    pub skip_tests: bool,
    /// Suppress the CLI gate.
    /// Populated from `SKIP_CLI_VERIFICATION`.
    pub skip_cli: bool,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            agent_command: std::env::var("RALPH_AGENT_CMD")
                .unwrap_or_else(|_| "claude --print --dangerously-skip-permissions".into()),
            prompt_file: std::env::var("RALPH_PROMPT_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("PROMPT.md")),
            max_calls_per_hour: env_u32("MAX_CALLS_PER_HOUR", 100),
            max_consecutive_test_loops: env_u32("MAX_CONSECUTIVE_TEST_LOOPS", 3),
            max_consecutive_done_signals: env_u32("MAX_CONSECUTIVE_DONE_SIGNALS", 2),
            timeout_minutes: 30,
            loop_delay_secs: std::env::var("RALPH_LOOP_DELAY_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(5),
            skip_evidence: false,
            skip_tests: env_flag("SKIP_TEST_VERIFICATION"),
            skip_cli: env_flag("SKIP_CLI_VERIFICATION"),
        }
    }
}

fn env_u32(name: &str, fallback: u32) -> u32 {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .filter(|v| *v > 0)
        .unwrap_or(fallback)
}

/// A set environment variable counts as true unless it is "0" or "false".
fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| !v.is_empty() && v != "0" && !v.eq_ignore_ascii_case("false"))
        .unwrap_or(false)
}
