//! UTC time helpers.
//!
//! All persisted timestamps are nanoseconds since the Unix epoch stored as
//! BIGINT, which reads and compares identically on PostgreSQL and SQLite.

use chrono::{DateTime, TimeZone, Utc};

pub const NANOS_PER_SEC: i64 = 1_000_000_000;

/// Current UTC time in nanoseconds since the Unix epoch.
pub fn now_nanos() -> i64 {
    Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX)
}

/// Seconds since the Unix epoch for a nanosecond timestamp.
pub fn nanos_to_secs(nanos: i64) -> i64 {
    nanos.div_euclid(NANOS_PER_SEC)
}

pub fn secs_to_nanos(secs: i64) -> i64 {
    secs.saturating_mul(NANOS_PER_SEC)
}

/// Render a nanosecond timestamp as RFC 3339 (responses and audit records).
pub fn nanos_to_rfc3339(nanos: i64) -> String {
    nanos_to_datetime(nanos).to_rfc3339()
}

pub fn nanos_to_datetime(nanos: i64) -> DateTime<Utc> {
    Utc.timestamp_nanos(nanos)
}
