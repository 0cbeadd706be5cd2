//! Loop controller — composes the subsystems into the supervision loop.
//!
//! Per iteration: rate limit, circuit check, agent invocation, response
//! analysis, circuit recording, status publish, exit decision. The
//! ordering guarantee is `.response_analysis` before
//! `.circuit_breaker_state` before `status.json` for every loop.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use supervision::circuit::fingerprint;
use supervision::state::{self, StateFiles};
use supervision::{
    BreakerVerdict, CircuitBreaker, CircuitRecord, EvidenceCollector, EvidenceConfig,
    EvidenceDocument, ExitSignalHistory, LoopResult, OverallStatus, ResponseAnalyzer,
};
use supervision::clock;

use crate::agent::{AgentRunner, ProgressDocument};
use crate::config::LoopConfig;
use crate::rate_limit::{RateDecision, RateLimiter};

/// Public loop status, mirrored into `status.json`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopStatus {
    Initializing,
    Running,
    Waiting,
    Exited,
    Halted,
    Failed,
}

impl std::fmt::Display for LoopStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Initializing => write!(f, "initializing"),
            Self::Running => write!(f, "running"),
            Self::Waiting => write!(f, "waiting"),
            Self::Exited => write!(f, "exited"),
            Self::Halted => write!(f, "halted"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// In-memory loop state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopState {
    pub loop_count: u64,
    pub calls_made_this_hour: u32,
    pub max_calls_per_hour: u32,
    pub status: LoopStatus,
    pub last_action: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_reason: Option<String>,
}

/// `status.json` shape: the loop state plus subsystem snapshots.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusDocument {
    pub updated_at: String,
    #[serde(flatten)]
    pub state: LoopState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub circuit: Option<CircuitRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub evidence: Option<OverallStatus>,
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Exit signal confirmed; the job is done.
    Exited,
    /// Circuit open or operator interrupt.
    Halted,
}

pub struct LoopController {
    config: LoopConfig,
    files: StateFiles,
    analyzer: ResponseAnalyzer,
    breaker: CircuitBreaker,
    collector: EvidenceCollector,
    rate: RateLimiter,
    runner: AgentRunner,
    shutdown: CancellationToken,
}

impl LoopController {
    pub fn new(config: LoopConfig, root: impl AsRef<Path>) -> Self {
        let root = root.as_ref().to_path_buf();
        let files = StateFiles::new(&root);

        let prompt_file = resolve_against(&root, &config.prompt_file);
        let runner = AgentRunner::new(
            files.clone(),
            config.agent_command.clone(),
            prompt_file,
            Duration::from_secs(config.timeout_minutes * 60),
        );
        let collector = EvidenceCollector::with_config(
            files.clone(),
            EvidenceConfig {
                skip_tests: config.skip_tests,
                skip_cli: config.skip_cli,
                ..EvidenceConfig::default()
            },
        );

        Self {
            analyzer: ResponseAnalyzer::new(files.clone()),
            breaker: CircuitBreaker::new(files.clone()),
            rate: RateLimiter::new(files.clone(), config.max_calls_per_hour),
            collector,
            runner,
            shutdown: CancellationToken::new(),
            files,
            config,
        }
    }

    /// Token a signal handler cancels to request shutdown.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Run the main loop to a terminal state.
    pub async fn run(&self) -> Result<RunOutcome> {
        let mut state = LoopState {
            loop_count: 1,
            calls_made_this_hour: 0,
            max_calls_per_hour: self.config.max_calls_per_hour,
            status: LoopStatus::Initializing,
            last_action: "initializing".into(),
            exit_reason: None,
        };

        match self.run_inner(&mut state).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                // Unrecoverable controller fault, distinct from agent failure
                state.status = LoopStatus::Failed;
                state.exit_reason = Some(e.to_string());
                error!("Controller failed: {e}");
                self.final_flush(&state);
                Err(e)
            }
        }
    }

    async fn run_inner(&self, state: &mut LoopState) -> Result<RunOutcome> {
        self.breaker.init()?;
        self.publish(state)?;
        info!(
            agent = %self.config.agent_command,
            max_calls_per_hour = self.config.max_calls_per_hour,
            "Supervisor starting"
        );

        loop {
            if self.shutdown.is_cancelled() {
                return Ok(self.halt(state, "interrupted by signal"));
            }

            // 1. Rate limit
            match self.rate.check()? {
                RateDecision::Wait(wait) => {
                    state.status = LoopStatus::Waiting;
                    state.last_action = format!(
                        "rate limit reached ({}/hour), sleeping {}s",
                        self.config.max_calls_per_hour,
                        wait.as_secs()
                    );
                    self.publish(state)?;
                    info!(wait_secs = wait.as_secs(), "Hourly call budget spent");
                    tokio::select! {
                        _ = tokio::time::sleep(wait) => {}
                        _ = self.shutdown.cancelled() => {
                            return Ok(self.halt(state, "interrupted by signal"));
                        }
                    }
                    continue;
                }
                RateDecision::Proceed { calls_made } => {
                    state.calls_made_this_hour = calls_made;
                }
            }

            // 2. Circuit check
            if self.breaker.should_halt_execution() {
                self.report_circuit_halt();
                return Ok(self.halt(state, "circuit open"));
            }

            let loop_number = state.loop_count;

            // 3. Invoke the agent
            state.status = LoopStatus::Running;
            state.last_action = format!("invoking agent (loop {loop_number})");
            self.publish(state)?;
            let invocation = self.runner.run(loop_number, &self.shutdown).await?;
            self.rate.record_call()?;
            state.calls_made_this_hour += 1;

            if invocation.interrupted {
                return Ok(self.halt(state, "interrupted by signal"));
            }

            // 4. Analyze the captured output
            let analysis = self.analyzer.analyze(loop_number, &invocation.log_path);

            // 5. Record the loop result with the breaker
            let output = std::fs::read_to_string(&invocation.log_path).unwrap_or_default();
            let error_line = fingerprint::find_error_line(&output);
            let had_error =
                invocation.timed_out || invocation.exit_code != Some(0) || error_line.is_some();
            let verdict = self.breaker.record_loop_result(&LoopResult {
                loop_number,
                files_changed: analysis.files_modified,
                had_error,
                error_line,
                duration_ms: invocation.duration_ms,
            })?;

            // 6. Publish
            state.last_action = format!(
                "loop {loop_number}: score {}, {} files changed",
                analysis.confidence_score, analysis.files_modified
            );
            self.publish(state)?;

            // 7. Exit decision
            let history: ExitSignalHistory =
                state::load_json(&self.files.exit_signals()).unwrap_or_default();
            let test_only_run = history.trailing_consecutive_test_only(loop_number);
            let done_run = history.trailing_consecutive_done(loop_number);
            let evidence_due = analysis.exit_signal
                || test_only_run >= self.config.max_consecutive_test_loops as usize
                || done_run >= self.config.max_consecutive_done_signals as usize;

            if evidence_due {
                info!(
                    loop_number,
                    exit_signal = analysis.exit_signal,
                    test_only_run,
                    done_run,
                    "Exit condition raised, checking evidence"
                );
                if self.config.skip_evidence {
                    return Ok(self.finish(state, "exit signal (evidence checks suppressed)"));
                }
                let doc = self.collector.run_all(loop_number).await;
                if doc.is_exit_allowed() {
                    return Ok(self.finish(state, "exit signal confirmed by evidence"));
                }
                self.report_refused_exit(&doc);
                state.last_action = format!(
                    "exit refused, failing gates: {}",
                    doc.failing_gates().join(", ")
                );
            }

            if verdict == BreakerVerdict::Halt {
                self.report_circuit_halt();
                return Ok(self.halt(state, "circuit open"));
            }

            // 8. Next loop after a short backoff
            state.loop_count += 1;
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(self.config.loop_delay_secs)) => {}
                _ = self.shutdown.cancelled() => {
                    return Ok(self.halt(state, "interrupted by signal"));
                }
            }
        }
    }

    fn finish(&self, state: &mut LoopState, reason: &str) -> RunOutcome {
        state.status = LoopStatus::Exited;
        state.exit_reason = Some(reason.to_string());
        info!(loop_count = state.loop_count, "Supervisor exiting: {reason}");
        self.final_flush(state);
        RunOutcome::Exited
    }

    fn halt(&self, state: &mut LoopState, reason: &str) -> RunOutcome {
        state.status = LoopStatus::Halted;
        state.exit_reason = Some(reason.to_string());
        warn!(loop_count = state.loop_count, "Supervisor halted: {reason}");
        self.final_flush(state);
        RunOutcome::Halted
    }

    /// Flush all state files on the way out, including a final
    /// `overall_status` pass so the dashboard never reads a stale verdict.
    fn final_flush(&self, state: &LoopState) {
        if let Some(mut doc) = state::load_json::<EvidenceDocument>(&self.files.evidence()) {
            doc.recompute_overall();
            doc.last_updated = clock::now_iso();
            if let Err(e) = state::store_json(&self.files.evidence(), &doc) {
                warn!("Final evidence flush failed: {e}");
            }
        }
        if let Err(e) = state::store_json(
            &self.files.progress(),
            &ProgressDocument {
                status: "idle".into(),
                loop_number: state.loop_count,
                elapsed_seconds: 0,
                last_output: String::new(),
                updated_at: clock::now_iso(),
            },
        ) {
            warn!("Final progress flush failed: {e}");
        }
        if let Err(e) = self.publish(state) {
            warn!("Final status publish failed: {e}");
        }
    }

    fn publish(&self, state: &LoopState) -> Result<()> {
        let evidence = state::load_json::<EvidenceDocument>(&self.files.evidence())
            .map(|doc| doc.overall_status);
        let doc = StatusDocument {
            updated_at: clock::now_iso(),
            state: state.clone(),
            circuit: Some(self.breaker.current()),
            evidence,
        };
        state::store_json(&self.files.status(), &doc).context("cannot publish status.json")
    }

    /// Operator-facing report for a circuit halt: the transition history
    /// and the fingerprint that tripped it.
    fn report_circuit_halt(&self) {
        let record = self.breaker.current();
        error!(
            no_progress = record.no_progress_count,
            same_error = record.consecutive_same_error,
            fingerprint = record.last_error_fingerprint.as_deref().unwrap_or("-"),
            "Circuit breaker is OPEN, halting"
        );
        for t in self.breaker.history() {
            error!(
                "  {} -> {} at loop {} ({}): {}",
                t.from, t.to, t.loop_number, t.at, t.reason
            );
        }
    }

    /// Operator-facing report for an evidence-gated exit refusal.
    fn report_refused_exit(&self, doc: &EvidenceDocument) {
        warn!(
            gates_failed = doc.overall_status.gates_failed,
            "Exit refused by evidence collector"
        );
        for name in doc.failing_gates() {
            if let Some(record) = doc.verification_gates.get(name) {
                warn!(gate = name, evidence = %record.evidence, "Failing gate");
            }
        }
    }
}

fn resolve_against(root: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        root.join(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loop_status_serialization() {
        assert_eq!(
            serde_json::to_string(&LoopStatus::Waiting).unwrap(),
            "\"waiting\""
        );
        assert_eq!(
            serde_json::to_string(&LoopStatus::Halted).unwrap(),
            "\"halted\""
        );
    }

    #[test]
    fn test_status_document_flattens_state() {
        let doc = StatusDocument {
            updated_at: "2026-01-01T00:00:00Z".into(),
            state: LoopState {
                loop_count: 4,
                calls_made_this_hour: 2,
                max_calls_per_hour: 100,
                status: LoopStatus::Running,
                last_action: "invoking agent (loop 4)".into(),
                exit_reason: None,
            },
            circuit: None,
            evidence: None,
        };
        let json = serde_json::to_value(&doc).unwrap();
        assert_eq!(json["loop_count"], 4);
        assert_eq!(json["status"], "running");
        assert!(json.get("exit_reason").is_none());
    }

    #[test]
    fn test_resolve_against() {
        let root = Path::new("/work");
        assert_eq!(
            resolve_against(root, Path::new("PROMPT.md")),
            PathBuf::from("/work/PROMPT.md")
        );
        assert_eq!(
            resolve_against(root, Path::new("/abs/PROMPT.md")),
            PathBuf::from("/abs/PROMPT.md")
        );
    }
}
