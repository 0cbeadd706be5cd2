//! State-file registry and atomic JSON persistence.
//!
//! Every piece of supervisor state is a small JSON document in the working
//! directory with a single writer (the controller). The dashboard reads the
//! same files concurrently, so writes go to a temp file in the same
//! directory and are renamed into place. A corrupt document is discarded
//! with a warning and the caller reinitializes it; a failed write is
//! retried once before becoming an error.

use std::fs;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::warn;

use crate::error::{SupervisionError, SupervisionResult};

/// Registry of every state-file path the supervisor owns.
#[derive(Debug, Clone)]
pub struct StateFiles {
    root: PathBuf,
}

impl StateFiles {
    /// Create a registry rooted at the working directory.
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    /// The working directory all paths are relative to.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Public loop-state snapshot (`status.json`).
    pub fn status(&self) -> PathBuf {
        self.root.join("status.json")
    }

    /// Live agent-invocation progress (`progress.json`).
    pub fn progress(&self) -> PathBuf {
        self.root.join("progress.json")
    }

    /// Analyzer record, overwritten each loop (`.response_analysis`).
    pub fn response_analysis(&self) -> PathBuf {
        self.root.join(".response_analysis")
    }

    /// Bounded exit-signal history (`.exit_signals`).
    pub fn exit_signals(&self) -> PathBuf {
        self.root.join(".exit_signals")
    }

    /// Current breaker record (`.circuit_breaker_state`).
    pub fn circuit_state(&self) -> PathBuf {
        self.root.join(".circuit_breaker_state")
    }

    /// Append-only transition journal (`.circuit_breaker_history`).
    pub fn circuit_history(&self) -> PathBuf {
        self.root.join(".circuit_breaker_history")
    }

    /// Evidence gates and overall verdict (`.ralph_evidence.json`).
    pub fn evidence(&self) -> PathBuf {
        self.root.join(".ralph_evidence.json")
    }

    /// Calls made in the current hour bucket (`.call_count`).
    pub fn call_count(&self) -> PathBuf {
        self.root.join(".call_count")
    }

    /// Hour bucket of the last rate-limit reset (`.last_reset`).
    pub fn last_reset(&self) -> PathBuf {
        self.root.join(".last_reset")
    }

    /// Directory for per-loop agent logs and test output.
    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    /// Per-loop agent output log.
    pub fn loop_log(&self, loop_number: u64) -> PathBuf {
        self.logs_dir().join(format!("loop_{loop_number}.log"))
    }

    /// Every state document this registry manages.
    pub fn all_state_files(&self) -> Vec<PathBuf> {
        vec![
            self.status(),
            self.progress(),
            self.response_analysis(),
            self.exit_signals(),
            self.circuit_state(),
            self.circuit_history(),
            self.evidence(),
            self.call_count(),
            self.last_reset(),
        ]
    }

    /// Delete every state file. Idempotent; missing files are not errors.
    ///
    /// Returns the paths that were actually removed.
    pub fn reset_all(&self) -> SupervisionResult<Vec<PathBuf>> {
        let mut removed = Vec::new();
        for path in self.all_state_files() {
            match fs::remove_file(&path) {
                Ok(()) => removed.push(path),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(SupervisionError::state(path, e.to_string())),
            }
        }
        Ok(removed)
    }
}

/// Load a JSON document, tolerating absence and corruption.
///
/// Missing file returns `None`. Unparseable content is a warning, not an
/// error: the caller reinitializes and the loop continues.
pub fn load_json<T: DeserializeOwned>(path: &Path) -> Option<T> {
    let contents = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
        Err(e) => {
            warn!(path = %path.display(), "Failed to read state file: {e}");
            return None;
        }
    };
    match serde_json::from_str(&contents) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(
                path = %path.display(),
                "Discarding corrupt state file: {e}"
            );
            None
        }
    }
}

/// Atomically store a JSON document: write a sibling temp file, rename over
/// the target. Retried once on failure, then surfaced as an error.
pub fn store_json<T: Serialize>(path: &Path, value: &T) -> SupervisionResult<()> {
    let json = serde_json::to_string_pretty(value)?;
    match write_atomic(path, &json) {
        Ok(()) => Ok(()),
        Err(first) => {
            warn!(path = %path.display(), "State write failed, retrying once: {first}");
            write_atomic(path, &json)
                .map_err(|e| SupervisionError::state(path, format!("{e} (after retry)")))
        }
    }
}

fn write_atomic(path: &Path, contents: &str) -> std::io::Result<()> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, contents)?;
    fs::rename(&tmp, path)
}
