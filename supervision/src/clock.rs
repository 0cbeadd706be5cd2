//! Clock helpers — ISO timestamps, epoch seconds, and wall-clock hour buckets.
//!
//! The rate limiter counts agent invocations per wall-clock hour; buckets are
//! epoch-seconds divided by 3600 so a bucket change always coincides with a
//! real hour boundary.

use chrono::{DateTime, SecondsFormat, Utc};

/// Current time as an RFC 3339 / ISO 8601 string, whole seconds.
///
/// Whole seconds keep the value digestible for git's `--since` parser.
pub fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Seconds since the Unix epoch.
pub fn epoch_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Wall-clock hour bucket for an epoch timestamp.
pub fn hour_bucket(epoch: u64) -> u64 {
    epoch / 3600
}

/// Seconds remaining until the next hour boundary.
///
/// Returns a full hour when called exactly on a boundary, so a sleeper
/// never wakes inside the bucket it was throttled in.
pub fn secs_until_next_hour(epoch: u64) -> u64 {
    3600 - (epoch % 3600)
}

/// Parse an RFC 3339 timestamp, tolerating the trailing-Z form.
pub fn parse_iso(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}
