//! Error-line fingerprinting for stagnation detection.
//!
//! The breaker compares one loop's failure to the previous loop's by
//! normalizing the last error-looking line (case-folded, whitespace
//! collapsed, digit runs and path tokens redacted) and hashing it. Two
//! loops that fail "the same way" produce the same digest even when line
//! numbers or temp paths differ.

use std::sync::OnceLock;

use regex::Regex;

fn error_line_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b(error|panic(ked)?|fatal|exception|traceback|failed to)\b").unwrap()
    })
}

/// The last non-empty line that looks like an error, if any.
pub fn find_error_line(output: &str) -> Option<String> {
    output
        .lines()
        .rev()
        .map(str::trim)
        .find(|line| !line.is_empty() && error_line_re().is_match(line))
        .map(String::from)
}

/// Normalize an error line for comparison.
pub fn normalize(line: &str) -> String {
    static DIGITS: OnceLock<Regex> = OnceLock::new();
    static WS: OnceLock<Regex> = OnceLock::new();
    let digits = DIGITS.get_or_init(|| Regex::new(r"\d+").unwrap());
    let ws = WS.get_or_init(|| Regex::new(r"\s+").unwrap());

    let lowered = line.to_lowercase();
    let pathless: String = lowered
        .split_whitespace()
        .map(|token| if token.contains('/') { "<path>" } else { token })
        .collect::<Vec<_>>()
        .join(" ");
    let redacted = digits.replace_all(&pathless, "<n>");
    ws.replace_all(redacted.trim(), " ").to_string()
}

/// Fixed-width digest of the normalized line.
pub fn fingerprint(line: &str) -> String {
    let digest = blake3::hash(normalize(line).as_bytes());
    digest.to_hex()[..16].to_string()
}
