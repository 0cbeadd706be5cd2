//! Supervision error types
//!
//! Structured errors for state persistence, git probing, and agent
//! bookkeeping. Analysis and evidence collection deliberately do not
//! surface errors to the loop; those flow into the data model instead.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for supervision operations
pub type SupervisionResult<T> = Result<T, SupervisionError>;

/// Errors that can occur inside the supervision subsystems
#[derive(Error, Debug)]
pub enum SupervisionError {
    /// A state document could not be written after a retry
    #[error("State file error at {path}: {message}")]
    StateFile { path: PathBuf, message: String },

    /// Git collaborator failed
    #[error("Git operation failed: {operation} - {message}")]
    Git { operation: String, message: String },

    /// The configured agent command is unusable
    #[error("Agent command error: {message}")]
    AgentCommand { message: String },

    /// IO error wrapper
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SupervisionError {
    /// Create a state-file error
    pub fn state(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::StateFile {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Create a git error
    pub fn git(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Git {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Create an agent-command error
    pub fn agent(message: impl Into<String>) -> Self {
        Self::AgentCommand {
            message: message.into(),
        }
    }
}
