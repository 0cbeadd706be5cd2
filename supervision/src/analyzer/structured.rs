//! Structured agent-output block parsing.
//!
//! Agents signal machine-readable status by emitting, anywhere in their
//! output, a block delimited by literal `---RALPH_STATUS---` and
//! `---END_RALPH_STATUS---` lines containing `KEY: VALUE` pairs. Unknown
//! keys are preserved verbatim; unrecognized values are treated as absence.

use std::collections::BTreeMap;

/// Opening sentinel line of the structured block.
pub const STATUS_BLOCK_START: &str = "---RALPH_STATUS---";
/// Closing sentinel line of the structured block.
pub const STATUS_BLOCK_END: &str = "---END_RALPH_STATUS---";

/// Recognized keys of the structured block.
pub mod keys {
    pub const STATUS: &str = "STATUS";
    pub const EXIT_SIGNAL: &str = "EXIT_SIGNAL";
    pub const TASKS_COMPLETED_THIS_LOOP: &str = "TASKS_COMPLETED_THIS_LOOP";
    pub const FILES_MODIFIED: &str = "FILES_MODIFIED";
    pub const TESTS_STATUS: &str = "TESTS_STATUS";
    pub const WORK_TYPE: &str = "WORK_TYPE";
    pub const RECOMMENDATION: &str = "RECOMMENDATION";
}

/// Extract the `KEY: VALUE` pairs of the structured block, if present.
///
/// Both sentinels must appear, in order, each on its own line. Lines
/// between them are parsed whitespace-tolerantly; later keys override
/// earlier ones; lines without a colon are ignored. A missing end sentinel
/// means the block is treated as absent (plain text output).
pub fn parse_status_block(output: &str) -> Option<BTreeMap<String, String>> {
    let mut fields = BTreeMap::new();
    let mut in_block = false;
    let mut saw_end = false;

    for line in output.lines() {
        let trimmed = line.trim();
        if !in_block {
            if trimmed == STATUS_BLOCK_START {
                in_block = true;
            }
            continue;
        }
        if trimmed == STATUS_BLOCK_END {
            saw_end = true;
            break;
        }
        if let Some((key, value)) = trimmed.split_once(':') {
            let key = key.trim();
            if !key.is_empty() {
                fields.insert(key.to_string(), value.trim().to_string());
            }
        }
    }

    if in_block && saw_end {
        Some(fields)
    } else {
        None
    }
}

/// Whether the block carries `EXIT_SIGNAL: true`.
pub fn exit_signal_requested(fields: &BTreeMap<String, String>) -> bool {
    fields
        .get(keys::EXIT_SIGNAL)
        .map(|v| v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

/// Whether the block reports `STATUS: COMPLETE`.
pub fn reports_complete(fields: &BTreeMap<String, String>) -> bool {
    fields
        .get(keys::STATUS)
        .map(|v| v.eq_ignore_ascii_case("COMPLETE"))
        .unwrap_or(false)
}
