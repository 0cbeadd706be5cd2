//! Evidence document — verification gates and the exit-allowed verdict.
//!
//! Termination is gated on verifiable repository artifacts, not on the
//! agent's say-so. Each gate owns a sub-record; `overall_status` is
//! recomputed from the gate map and acts as the commit marker for readers.

pub mod collector;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::clock;

pub use collector::{EvidenceCollector, EvidenceConfig};

/// Bumped on breaking changes to the document shape.
pub const EVIDENCE_SCHEMA_VERSION: u32 = 1;

/// The six gates, in execution order.
pub const GATE_NAMES: [&str; 6] = [
    "tests_passed",
    "documentation_exists",
    "cli_functional",
    "files_modified",
    "commits_made",
    "fix_plan_complete",
];

/// Status of a single verification gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GateStatus {
    /// Not yet run. Blocks exit.
    Pending,
    /// Probe succeeded.
    Verified,
    /// Probe failed. Blocks exit.
    Failed,
    /// Gate not applicable or suppressed. Never blocks exit.
    Skipped,
}

impl std::fmt::Display for GateStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "PENDING"),
            Self::Verified => write!(f, "VERIFIED"),
            Self::Failed => write!(f, "FAILED"),
            Self::Skipped => write!(f, "SKIPPED"),
        }
    }
}

/// One gate's sub-record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateRecord {
    pub status: GateStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verified_at: Option<String>,
    pub evidence: serde_json::Value,
}

impl GateRecord {
    pub fn pending() -> Self {
        Self {
            status: GateStatus::Pending,
            verified_at: None,
            evidence: serde_json::Value::Null,
        }
    }

    pub fn verified(evidence: serde_json::Value) -> Self {
        Self {
            status: GateStatus::Verified,
            verified_at: Some(clock::now_iso()),
            evidence,
        }
    }

    pub fn failed(evidence: serde_json::Value) -> Self {
        Self {
            status: GateStatus::Failed,
            verified_at: None,
            evidence,
        }
    }

    pub fn skipped(evidence: serde_json::Value) -> Self {
        Self {
            status: GateStatus::Skipped,
            verified_at: None,
            evidence,
        }
    }
}

/// Aggregate verdict over the gate map.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OverallStatus {
    pub all_gates_passed: bool,
    pub gates_verified: u32,
    pub gates_failed: u32,
    pub gates_skipped: u32,
    pub exit_allowed: bool,
}

impl OverallStatus {
    /// Recompute from the gate map.
    ///
    /// `exit_allowed` holds iff no gate FAILED and none is still PENDING;
    /// after a collector run no gate is PENDING, so every post-run
    /// snapshot satisfies `exit_allowed == (gates_failed == 0)`.
    pub fn recompute(gates: &BTreeMap<String, GateRecord>) -> Self {
        let mut verified = 0;
        let mut failed = 0;
        let mut skipped = 0;
        let mut pending = 0;
        for record in gates.values() {
            match record.status {
                GateStatus::Verified => verified += 1,
                GateStatus::Failed => failed += 1,
                GateStatus::Skipped => skipped += 1,
                GateStatus::Pending => pending += 1,
            }
        }
        Self {
            all_gates_passed: failed == 0 && pending == 0 && verified + skipped == gates.len() as u32,
            gates_verified: verified,
            gates_failed: failed,
            gates_skipped: skipped,
            exit_allowed: failed == 0 && pending == 0,
        }
    }
}

/// Persisted content of `.ralph_evidence.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvidenceDocument {
    pub schema_version: u32,
    pub session_id: String,
    pub created_at: String,
    pub last_updated: String,
    pub loop_number: u64,
    pub verification_gates: BTreeMap<String, GateRecord>,
    pub overall_status: OverallStatus,
}

impl EvidenceDocument {
    /// Fresh document for a new session: every gate PENDING, exit blocked.
    pub fn new_session() -> Self {
        let now = clock::now_iso();
        let verification_gates: BTreeMap<String, GateRecord> = GATE_NAMES
            .iter()
            .map(|name| (name.to_string(), GateRecord::pending()))
            .collect();
        let overall_status = OverallStatus::recompute(&verification_gates);
        Self {
            schema_version: EVIDENCE_SCHEMA_VERSION,
            session_id: uuid::Uuid::new_v4().to_string(),
            created_at: now.clone(),
            last_updated: now,
            loop_number: 0,
            verification_gates,
            overall_status,
        }
    }

    /// Recompute the aggregate verdict from the gate map.
    pub fn recompute_overall(&mut self) {
        self.overall_status = OverallStatus::recompute(&self.verification_gates);
    }

    /// The collector's contract with the controller.
    pub fn is_exit_allowed(&self) -> bool {
        self.overall_status.exit_allowed
    }

    /// Names of gates currently FAILED, for operator-facing reporting.
    pub fn failing_gates(&self) -> Vec<&str> {
        self.verification_gates
            .iter()
            .filter(|(_, record)| record.status == GateStatus::Failed)
            .map(|(name, _)| name.as_str())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_new_session_blocks_exit() {
        let doc = EvidenceDocument::new_session();
        assert_eq!(doc.verification_gates.len(), 6);
        assert!(!doc.is_exit_allowed());
        assert!(!doc.overall_status.all_gates_passed);
        assert_eq!(doc.overall_status.gates_failed, 0);
    }

    #[test]
    fn test_exit_allowed_iff_no_failures_after_run() {
        let mut doc = EvidenceDocument::new_session();
        for name in GATE_NAMES {
            doc.verification_gates
                .insert(name.to_string(), GateRecord::verified(json!({})));
        }
        doc.recompute_overall();
        assert!(doc.is_exit_allowed());
        assert!(doc.overall_status.all_gates_passed);

        doc.verification_gates.insert(
            "fix_plan_complete".into(),
            GateRecord::failed(json!({"uncompleted_items": ["thing"]})),
        );
        doc.recompute_overall();
        assert!(!doc.is_exit_allowed());
        assert_eq!(doc.overall_status.gates_failed, 1);
        assert_eq!(doc.failing_gates(), vec!["fix_plan_complete"]);
    }

    #[test]
    fn test_skipped_does_not_block_exit() {
        let mut doc = EvidenceDocument::new_session();
        for name in GATE_NAMES {
            doc.verification_gates
                .insert(name.to_string(), GateRecord::skipped(json!({})));
        }
        doc.recompute_overall();
        assert!(doc.is_exit_allowed());
        assert_eq!(doc.overall_status.gates_skipped, 6);
    }

    #[test]
    fn test_pending_blocks_exit() {
        let mut doc = EvidenceDocument::new_session();
        for name in &GATE_NAMES[1..] {
            doc.verification_gates
                .insert(name.to_string(), GateRecord::verified(json!({})));
        }
        // tests_passed still PENDING
        doc.recompute_overall();
        assert!(!doc.is_exit_allowed());
        assert_eq!(doc.overall_status.gates_failed, 0);
    }

    #[test]
    fn test_gate_status_serializes_screaming_case() {
        assert_eq!(
            serde_json::to_string(&GateStatus::Verified).unwrap(),
            "\"VERIFIED\""
        );
        assert_eq!(
            serde_json::to_string(&GateStatus::Pending).unwrap(),
            "\"PENDING\""
        );
    }
}
