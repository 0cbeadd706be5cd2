use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing::{error, info};

use ralph_loop::controller::{LoopController, RunOutcome};
use ralph_loop::config::LoopConfig;
use supervision::state::{self, StateFiles};
use supervision::{EvidenceCollector, EvidenceConfig, EvidenceDocument};

/// Autonomous agent-loop supervisor with evidence-gated termination.
///
/// With no flags, runs the main loop: invoke the agent, analyze its
/// output, and keep iterating until an exit signal survives the evidence
/// gates or the circuit breaker opens.
#[derive(Debug, Parser)]
#[command(name = "ralph-loop", version)]
struct Cli {
    /// Delete all supervisor state files and exit.
    #[arg(long)]
    reset_all: bool,

    /// Run every evidence gate once, print a summary, and exit 0 iff
    /// exit is allowed.
    #[arg(long)]
    verify_evidence: bool,

    /// Print the current evidence record without running gates.
    #[arg(long)]
    evidence_status: bool,

    /// Exit on the analyzer's signal alone, without running gates.
    #[arg(long)]
    skip_evidence: bool,

    /// Suppress the test-runner gate.
    #[arg(long)]
    skip_tests: bool,

    /// Suppress the CLI gate.
    #[arg(long)]
    skip_cli: bool,

    /// Per-invocation wall-clock timeout in minutes.
    #[arg(long, value_name = "MINUTES")]
    timeout: Option<u64>,

    /// Agent command line (overrides RALPH_AGENT_CMD).
    #[arg(long, value_name = "CMD")]
    agent: Option<String>,

    /// Instruction file piped to the agent (overrides RALPH_PROMPT_FILE).
    #[arg(long, value_name = "PATH")]
    prompt_file: Option<PathBuf>,

    /// Calls-per-hour budget (overrides MAX_CALLS_PER_HOUR).
    #[arg(long, value_name = "N")]
    max_calls: Option<u32>,
}

impl Cli {
    fn into_config(self) -> LoopConfig {
        let mut config = LoopConfig::default();
        config.skip_evidence |= self.skip_evidence;
        config.skip_tests |= self.skip_tests;
        config.skip_cli |= self.skip_cli;
        if let Some(minutes) = self.timeout {
            config.timeout_minutes = minutes;
        }
        if let Some(agent) = self.agent {
            config.agent_command = agent;
        }
        if let Some(path) = self.prompt_file {
            config.prompt_file = path;
        }
        if let Some(max) = self.max_calls {
            config.max_calls_per_hour = max;
        }
        config
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    let code = match dispatch(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!("{e:#}");
            1
        }
    };
    std::process::exit(code);
}

async fn dispatch(cli: Cli) -> Result<i32> {
    let root = std::env::current_dir()?;
    let files = StateFiles::new(&root);

    if cli.reset_all {
        let removed = files.reset_all()?;
        for path in &removed {
            info!(path = %path.display(), "Removed state file");
        }
        println!("Reset complete ({} state files removed)", removed.len());
        return Ok(0);
    }

    if cli.evidence_status {
        return match state::load_json::<EvidenceDocument>(&files.evidence()) {
            Some(doc) => {
                print_evidence_summary(&doc);
                Ok(0)
            }
            None => {
                println!("No evidence recorded yet");
                Ok(0)
            }
        };
    }

    if cli.verify_evidence {
        let collector = EvidenceCollector::with_config(
            files.clone(),
            EvidenceConfig {
                skip_tests: cli.skip_tests,
                skip_cli: cli.skip_cli,
                ..EvidenceConfig::default()
            },
        );
        let loop_number = state::load_json::<EvidenceDocument>(&files.evidence())
            .map(|doc| doc.loop_number)
            .unwrap_or(0);
        let doc = collector.run_all(loop_number).await;
        print_evidence_summary(&doc);
        return Ok(if doc.is_exit_allowed() { 0 } else { 1 });
    }

    let config = cli.into_config();
    let controller = LoopController::new(config, &root);

    let shutdown = controller.shutdown_token();
    tokio::spawn(async move {
        wait_for_signal().await;
        shutdown.cancel();
    });

    match controller.run().await? {
        RunOutcome::Exited => Ok(0),
        RunOutcome::Halted => Ok(1),
    }
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        {
            Ok(s) => s,
            Err(e) => {
                error!("Cannot install SIGTERM handler: {e}");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

fn print_evidence_summary(doc: &EvidenceDocument) {
    println!(
        "Evidence session {} (loop {}, updated {})",
        doc.session_id, doc.loop_number, doc.last_updated
    );
    for (name, record) in &doc.verification_gates {
        println!("  {:<22} {}", name, record.status);
    }
    let overall = &doc.overall_status;
    println!(
        "  verified={} failed={} skipped={} exit_allowed={}",
        overall.gates_verified, overall.gates_failed, overall.gates_skipped, overall.exit_allowed
    );
}
