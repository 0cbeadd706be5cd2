//! Response Analyzer — classifies one agent invocation's captured output.
//!
//! Reads the per-loop log, the working-tree diff, and the previous loop's
//! analysis, and produces a structured [`ResponseAnalysis`] record plus an
//! update to the rolling exit-signal history. The analyzer never fails the
//! loop; a missing or unreadable log yields a zeroed record.

pub mod signals;
pub mod structured;

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::gitio;
use crate::state::{self, StateFiles};

pub use signals::{ExitSignalHistory, SIGNAL_WINDOW};

/// Classification of the captured output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    /// A well-formed `---RALPH_STATUS---` block was found.
    Structured,
    /// Plain text (including malformed blocks).
    Text,
}

/// Confidence contribution of a well-formed structured block.
pub const SCORE_STRUCTURED_BLOCK: u32 = 100;
/// Contribution of completion keywords near the end of the output.
pub const SCORE_COMPLETION_KEYWORD: u32 = 20;
/// Contribution of output shrinking to under half the previous loop's.
pub const SCORE_SHRINKING_OUTPUT: u32 = 20;
/// Contribution of a test-only loop.
pub const SCORE_TEST_ONLY: u32 = 10;
/// Score at which the analyzer reports an exit signal.
pub const EXIT_THRESHOLD: u32 = 100;

/// Persisted content of `.response_analysis`, overwritten each loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseAnalysis {
    /// The loop this analysis refers to.
    #[serde(rename = "loop")]
    pub loop_number: u64,
    pub output_format: OutputFormat,
    /// Extracted `KEY: VALUE` pairs when the block is present.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub structured_fields: BTreeMap<String, String>,
    pub has_completion_signal: bool,
    pub is_test_only: bool,
    /// Distinct paths changed in the working tree relative to loop start.
    pub files_modified: usize,
    /// Byte count of the captured output.
    pub output_length: usize,
    pub confidence_score: u32,
    /// Final verdict: the agent believes it is done.
    pub exit_signal: bool,
}

impl ResponseAnalysis {
    /// A zeroed record for a loop with no usable output.
    pub fn empty(loop_number: u64) -> Self {
        Self {
            loop_number,
            output_format: OutputFormat::Text,
            structured_fields: BTreeMap::new(),
            has_completion_signal: false,
            is_test_only: false,
            files_modified: 0,
            output_length: 0,
            confidence_score: 0,
            exit_signal: false,
        }
    }
}

/// The analyzer. Holds the state-file registry so it can persist its
/// record and feed the exit-signal history.
pub struct ResponseAnalyzer {
    files: StateFiles,
}

impl ResponseAnalyzer {
    pub fn new(files: StateFiles) -> Self {
        Self { files }
    }

    /// Analyze the captured output of `loop_number` and persist the result.
    ///
    /// Writes `.response_analysis` unconditionally and appends to
    /// `.exit_signals` when signals were detected. Never fails the loop:
    /// persistence problems are logged and the in-memory record returned.
    pub fn analyze(&self, loop_number: u64, log_path: &Path) -> ResponseAnalysis {
        let output = match std::fs::read_to_string(log_path) {
            Ok(text) => text,
            Err(e) => {
                warn!(
                    path = %log_path.display(),
                    "Agent log unreadable, recording empty analysis: {e}"
                );
                String::new()
            }
        };

        let analysis = self.classify(loop_number, &output);

        if let Err(e) = state::store_json(&self.files.response_analysis(), &analysis) {
            warn!("Failed to persist response analysis: {e}");
        }

        let mut history: ExitSignalHistory =
            state::load_json(&self.files.exit_signals()).unwrap_or_default();
        history.record(&analysis);
        if let Err(e) = state::store_json(&self.files.exit_signals(), &history) {
            warn!("Failed to persist exit-signal history: {e}");
        }

        analysis
    }

    /// Deterministic classification of output bytes + diff summary.
    fn classify(&self, loop_number: u64, output: &str) -> ResponseAnalysis {
        let mut analysis = ResponseAnalysis::empty(loop_number);
        analysis.output_length = output.len();

        let structured_fields = structured::parse_status_block(output);
        if let Some(fields) = structured_fields {
            analysis.output_format = OutputFormat::Structured;
            analysis.structured_fields = fields;
        }

        let structured_exit = structured::exit_signal_requested(&analysis.structured_fields);
        analysis.has_completion_signal =
            structured_exit || has_completion_keywords(output);
        analysis.is_test_only = is_test_only_output(output);

        analysis.files_modified = match gitio::changed_files(self.files.root()) {
            Ok(files) => files.len(),
            Err(e) => {
                debug!("Diff collaborator unavailable: {e}");
                0
            }
        };

        let previous_length = state::load_json::<ResponseAnalysis>(&self.files.response_analysis())
            .filter(|prev| prev.loop_number < loop_number)
            .map(|prev| prev.output_length)
            .unwrap_or(0);

        let mut score = 0u32;
        if analysis.output_format == OutputFormat::Structured {
            score += SCORE_STRUCTURED_BLOCK;
        }
        if analysis.has_completion_signal {
            score += SCORE_COMPLETION_KEYWORD;
        }
        if previous_length > 1024 && analysis.output_length < previous_length / 2 {
            score += SCORE_SHRINKING_OUTPUT;
        }
        if analysis.is_test_only {
            score += SCORE_TEST_ONLY;
        }
        analysis.confidence_score = score;
        analysis.exit_signal = structured_exit || score >= EXIT_THRESHOLD;

        debug!(
            loop_number,
            format = ?analysis.output_format,
            score,
            exit_signal = analysis.exit_signal,
            "Analyzed agent output"
        );

        analysis
    }
}

/// Completion keywords, matched case-insensitively in the final 20% of the
/// output's lines. Early plan text frequently narrates future completion;
/// weighting the tail avoids those false positives.
fn has_completion_keywords(output: &str) -> bool {
    static KEYWORDS: OnceLock<Regex> = OnceLock::new();
    let re = KEYWORDS.get_or_init(|| {
        Regex::new(
            r"(?i)\b(complete|completed|finished|done|ready for review|all tasks? (are )?complete)\b",
        )
        .unwrap()
    });

    let lines: Vec<&str> = output.lines().collect();
    if lines.is_empty() {
        return false;
    }
    let tail_start = lines.len().saturating_sub((lines.len() + 4) / 5).min(lines.len() - 1);
    lines[tail_start..].iter().any(|line| re.is_match(line))
}

/// True iff the output shows test activity and no file-modification verbs.
fn is_test_only_output(output: &str) -> bool {
    static TEST_PATTERN: OnceLock<Regex> = OnceLock::new();
    static MODIFY_PATTERN: OnceLock<Regex> = OnceLock::new();

    let test_re = TEST_PATTERN.get_or_init(|| {
        Regex::new(
            r"(?im)(cargo test|npm test|bun test|pytest|go test|^\s*running tests|^\s*PASS\b|^\s*FAIL\b|\d+ (passing|failing)|test result:)",
        )
        .unwrap()
    });
    let modify_re = MODIFY_PATTERN.get_or_init(|| {
        Regex::new(r"(?i)\b(created|wrote|modified|edited|deleted|added)\b").unwrap()
    });

    test_re.is_match(output) && !modify_re.is_match(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn analyzer(dir: &Path) -> ResponseAnalyzer {
        ResponseAnalyzer::new(StateFiles::new(dir))
    }

    fn write_log(dir: &Path, name: &str, contents: &str) -> std::path::PathBuf {
        let path = dir.join(name);
        fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn test_empty_log_scores_zero() {
        let dir = tempfile::tempdir().unwrap();
        let log = write_log(dir.path(), "loop_1.log", "");
        let analysis = analyzer(dir.path()).analyze(1, &log);
        assert_eq!(analysis.confidence_score, 0);
        assert!(!analysis.exit_signal);
        assert_eq!(analysis.output_format, OutputFormat::Text);
    }

    #[test]
    fn test_missing_log_still_writes_record() {
        let dir = tempfile::tempdir().unwrap();
        let files = StateFiles::new(dir.path());
        let analysis = analyzer(dir.path()).analyze(1, &dir.path().join("no-such.log"));
        assert_eq!(analysis.confidence_score, 0);
        let persisted: ResponseAnalysis = state::load_json(&files.response_analysis()).unwrap();
        assert_eq!(persisted.loop_number, 1);
    }

    #[test]
    fn test_structured_block_guarantees_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let log = write_log(
            dir.path(),
            "loop_1.log",
            "---RALPH_STATUS---\nSTATUS: IN_PROGRESS\nEXIT_SIGNAL: false\n---END_RALPH_STATUS---\n",
        );
        let analysis = analyzer(dir.path()).analyze(1, &log);
        assert_eq!(analysis.output_format, OutputFormat::Structured);
        assert!(analysis.confidence_score >= EXIT_THRESHOLD);
        assert!(analysis.exit_signal);
    }

    #[test]
    fn test_structured_exit_signal_forces_verdict() {
        let dir = tempfile::tempdir().unwrap();
        let log = write_log(
            dir.path(),
            "loop_1.log",
            "---RALPH_STATUS---\nEXIT_SIGNAL: true\n---END_RALPH_STATUS---\n",
        );
        let analysis = analyzer(dir.path()).analyze(1, &log);
        assert!(analysis.exit_signal);
        assert!(analysis.has_completion_signal);
    }

    #[test]
    fn test_completion_keyword_weighted_to_tail() {
        // "complete" only in early plan text: no signal
        let mut early = String::from("plan: mark the feature complete later\n");
        for _ in 0..20 {
            early.push_str("working on module\n");
        }
        assert!(!has_completion_keywords(&early));

        // Same keyword in the final lines: signal
        let mut late = String::new();
        for _ in 0..20 {
            late.push_str("working on module\n");
        }
        late.push_str("All tasks are complete.\n");
        assert!(has_completion_keywords(&late));

        // Case-insensitive
        let mut upper = String::new();
        for _ in 0..20 {
            upper.push_str("working\n");
        }
        upper.push_str("DONE\n");
        assert!(has_completion_keywords(&upper));
    }

    #[test]
    fn test_test_only_detection() {
        assert!(is_test_only_output(
            "Running tests\ncargo test\ntest result: ok. 12 passed; 0 failed\n"
        ));
        assert!(!is_test_only_output(
            "cargo test\nmodified src/lib.rs to fix the failure\n"
        ));
        assert!(!is_test_only_output("thinking about the problem\n"));
    }

    #[test]
    fn test_shrinking_output_bonus() {
        let dir = tempfile::tempdir().unwrap();
        let a = analyzer(dir.path());

        let long = "x".repeat(4096);
        let log1 = write_log(dir.path(), "loop_1.log", &long);
        a.analyze(1, &log1);

        let log2 = write_log(dir.path(), "loop_2.log", "short output\n");
        let analysis = a.analyze(2, &log2);
        assert_eq!(analysis.confidence_score, SCORE_SHRINKING_OUTPUT);
    }

    #[test]
    fn test_confidence_is_deterministic() {
        let dir = tempfile::tempdir().unwrap();
        let text = "Running tests\n1 passing\nall done\n";
        let log = write_log(dir.path(), "loop_1.log", text);

        let first = analyzer(dir.path()).classify(1, text);
        let second = analyzer(dir.path()).classify(1, text);
        assert_eq!(first.confidence_score, second.confidence_score);
        assert_eq!(first.exit_signal, second.exit_signal);
        drop(log);
    }

    #[test]
    fn test_history_updated_on_signals() {
        let dir = tempfile::tempdir().unwrap();
        let files = StateFiles::new(dir.path());
        let a = analyzer(dir.path());

        for n in 1..=3 {
            let log = write_log(
                dir.path(),
                &format!("loop_{n}.log"),
                "Running tests\n3 passing\n",
            );
            a.analyze(n, &log);
        }

        let history: ExitSignalHistory = state::load_json(&files.exit_signals()).unwrap();
        assert_eq!(history.test_only_loops, vec![1, 2, 3]);
        assert_eq!(history.trailing_consecutive_test_only(3), 3);
    }
}
