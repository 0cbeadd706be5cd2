//! Agent subprocess invocation.
//!
//! Launches the configured agent command with the instruction file on
//! stdin, captures stdout+stderr to a per-loop log, and enforces a
//! wall-clock timeout with a process-group kill so descendants die too.
//! A progress writer runs alongside the child, refreshing `progress.json`
//! every 2 seconds with the elapsed time and the tail of the log; it is
//! cancelled deterministically when the child terminates.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use supervision::state::{self, StateFiles};
use supervision::clock;

/// Bytes of log tail mirrored into `progress.json`.
const PROGRESS_TAIL_BYTES: usize = 400;
/// Progress refresh cadence.
const PROGRESS_INTERVAL: Duration = Duration::from_secs(2);

/// Content of `progress.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressDocument {
    pub status: String,
    #[serde(rename = "loop")]
    pub loop_number: u64,
    pub elapsed_seconds: u64,
    pub last_output: String,
    pub updated_at: String,
}

impl ProgressDocument {
    fn executing(loop_number: u64, elapsed: Duration, last_output: String) -> Self {
        Self {
            status: "executing".into(),
            loop_number,
            elapsed_seconds: elapsed.as_secs(),
            last_output,
            updated_at: clock::now_iso(),
        }
    }

    fn idle(loop_number: u64) -> Self {
        Self {
            status: "idle".into(),
            loop_number,
            elapsed_seconds: 0,
            last_output: String::new(),
            updated_at: clock::now_iso(),
        }
    }
}

/// Outcome of one agent invocation.
#[derive(Debug, Clone)]
pub struct AgentInvocation {
    pub loop_number: u64,
    pub log_path: PathBuf,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    /// A shutdown signal aborted the child before it finished.
    pub interrupted: bool,
    pub duration_ms: u64,
}

/// Runs the configured agent command once per loop.
pub struct AgentRunner {
    files: StateFiles,
    command: String,
    prompt_file: PathBuf,
    timeout: Duration,
}

impl AgentRunner {
    pub fn new(
        files: StateFiles,
        command: impl Into<String>,
        prompt_file: impl Into<PathBuf>,
        timeout: Duration,
    ) -> Self {
        Self {
            files,
            command: command.into(),
            prompt_file: prompt_file.into(),
            timeout,
        }
    }

    /// Launch the agent for `loop_number` and wait for it to finish,
    /// time out, or be interrupted by `shutdown`.
    pub async fn run(
        &self,
        loop_number: u64,
        shutdown: &CancellationToken,
    ) -> Result<AgentInvocation> {
        let prompt = std::fs::read_to_string(&self.prompt_file).with_context(|| {
            format!("cannot read prompt file {}", self.prompt_file.display())
        })?;

        let Some(argv) = shlex::split(&self.command) else {
            bail!("agent command is not parseable: {:?}", self.command);
        };
        let Some((program, args)) = argv.split_first() else {
            bail!("agent command is empty");
        };

        std::fs::create_dir_all(self.files.logs_dir())
            .context("cannot create logs directory")?;
        let log_path = self.files.loop_log(loop_number);
        // Truncate any log left over from a previous run of this loop number
        std::fs::write(&log_path, "")?;

        let mut cmd = tokio::process::Command::new(program);
        cmd.args(args)
            .current_dir(self.files.root())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // Own process group: a timeout kill reaches the whole tree.
        #[cfg(unix)]
        cmd.process_group(0);

        let started = Instant::now();
        let mut child = cmd
            .spawn()
            .with_context(|| format!("cannot launch agent binary {program:?}"))?;

        // Feed the prompt on its own task; a large instruction file must
        // not deadlock against a child that is already producing output.
        if let Some(mut stdin) = child.stdin.take() {
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(prompt.as_bytes()).await {
                    warn!("Failed to write prompt to agent stdin: {e}");
                }
            });
        }

        let stdout_pump = child.stdout.take().map(|r| spawn_pump(r, log_path.clone()));
        let stderr_pump = child.stderr.take().map(|r| spawn_pump(r, log_path.clone()));

        let progress_token = CancellationToken::new();
        let progress_task = tokio::spawn(progress_writer(
            self.files.clone(),
            loop_number,
            log_path.clone(),
            started,
            progress_token.clone(),
        ));

        let mut timed_out = false;
        let mut interrupted = false;
        let mut exit_code = None;

        // Handlers must not touch `child` while its wait future is alive;
        // the kill happens after the select releases the borrow.
        let waited = tokio::select! {
            waited = tokio::time::timeout(self.timeout, child.wait()) => Some(waited),
            _ = shutdown.cancelled() => None,
        };
        match waited {
            Some(Ok(Ok(status))) => exit_code = status.code(),
            Some(Ok(Err(e))) => warn!("Failed waiting for agent: {e}"),
            Some(Err(_)) => {
                warn!(
                    loop_number,
                    timeout_secs = self.timeout.as_secs(),
                    "Agent invocation timed out, killing process group"
                );
                timed_out = true;
                let _ = child.start_kill();
                let _ = child.wait().await;
            }
            None => {
                info!(loop_number, "Shutdown requested, aborting agent subprocess");
                interrupted = true;
                let _ = child.start_kill();
                let _ = child.wait().await;
            }
        }

        // Pumps finish at EOF once the child is gone.
        if let Some(pump) = stdout_pump {
            let _ = pump.await;
        }
        if let Some(pump) = stderr_pump {
            let _ = pump.await;
        }

        // Progress writer is cancelled before the invocation returns.
        progress_token.cancel();
        let _ = progress_task.await;
        if let Err(e) = state::store_json(
            &self.files.progress(),
            &ProgressDocument::idle(loop_number),
        ) {
            warn!("Failed to reset progress to idle: {e}");
        }

        let invocation = AgentInvocation {
            loop_number,
            log_path,
            exit_code,
            timed_out,
            interrupted,
            duration_ms: started.elapsed().as_millis() as u64,
        };
        debug!(
            loop_number,
            exit_code = ?invocation.exit_code,
            timed_out,
            duration_ms = invocation.duration_ms,
            "Agent invocation finished"
        );
        Ok(invocation)
    }
}

/// Copy a child stream into the per-loop log.
fn spawn_pump(
    mut reader: impl AsyncRead + Unpin + Send + 'static,
    log_path: PathBuf,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let file = tokio::fs::OpenOptions::new()
            .append(true)
            .open(&log_path)
            .await;
        let mut file = match file {
            Ok(f) => f,
            Err(e) => {
                warn!(path = %log_path.display(), "Cannot open agent log for append: {e}");
                return;
            }
        };
        let mut buf = [0u8; 8192];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    if let Err(e) = file.write_all(&buf[..n]).await {
                        warn!("Agent log write failed: {e}");
                        break;
                    }
                }
                Err(e) => {
                    debug!("Agent stream closed: {e}");
                    break;
                }
            }
        }
        let _ = file.flush().await;
    })
}

/// Periodic `progress.json` snapshots while the agent runs.
async fn progress_writer(
    files: StateFiles,
    loop_number: u64,
    log_path: PathBuf,
    started: Instant,
    token: CancellationToken,
) {
    loop {
        let snapshot = ProgressDocument::executing(
            loop_number,
            started.elapsed(),
            tail_of_log(&log_path, PROGRESS_TAIL_BYTES),
        );
        if let Err(e) = state::store_json(&files.progress(), &snapshot) {
            warn!("Failed to write progress snapshot: {e}");
        }
        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(PROGRESS_INTERVAL) => {}
        }
    }
}

/// Last `max_bytes` of the log, lossily decoded.
fn tail_of_log(path: &std::path::Path, max_bytes: usize) -> String {
    match std::fs::read(path) {
        Ok(bytes) => {
            let start = bytes.len().saturating_sub(max_bytes);
            String::from_utf8_lossy(&bytes[start..]).into_owned()
        }
        Err(_) => String::new(),
    }
}
