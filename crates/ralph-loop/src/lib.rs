//! ralph-loop — supervisor binary internals.
//!
//! The CLI entry point lives in `main.rs`; these modules are exposed for
//! the binary and the integration tests.

pub mod agent;
pub mod config;
pub mod controller;
pub mod rate_limit;

pub use config::LoopConfig;
pub use controller::{LoopController, RunOutcome};
