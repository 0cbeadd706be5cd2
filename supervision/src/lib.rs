//! Supervision — deterministic subsystems of the ralph loop supervisor.
//!
//! This library holds everything the loop controller needs to decide
//! whether another agent invocation is worthwhile:
//!
//! - [`analyzer`]: classify one invocation's captured output into a
//!   structured record and feed the rolling exit-signal history.
//! - [`circuit`]: a three-state breaker over loop results that detects
//!   stagnation and repeated identical failures.
//! - [`evidence`]: six independent verification gates over repository
//!   artifacts, aggregated into an exit-allowed verdict.
//! - [`state`]: the state-file registry with atomic JSON persistence.
//! - [`clock`] and [`gitio`]: the time and version-control collaborators.
//!
//! The binary crate (`ralph-loop`) composes these into the main loop.

pub mod analyzer;
pub mod circuit;
pub mod clock;
pub mod error;
pub mod evidence;
pub mod gitio;
pub mod state;

pub use analyzer::{ExitSignalHistory, OutputFormat, ResponseAnalysis, ResponseAnalyzer};
pub use circuit::{
    BreakerState, BreakerThresholds, BreakerVerdict, CircuitBreaker, CircuitRecord,
    CircuitTransition, LoopResult,
};
pub use error::{SupervisionError, SupervisionResult};
pub use evidence::{
    EvidenceCollector, EvidenceConfig, EvidenceDocument, GateRecord, GateStatus, OverallStatus,
};
pub use state::StateFiles;
