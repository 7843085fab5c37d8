//! Timestamp helpers shared by snapshots, journals and cooldown bookkeeping.

use chrono::{DateTime, Utc};

/// RFC 3339 rendering used in every persisted record.
pub fn utc_iso(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339()
}

/// Parse an RFC 3339 timestamp, accepting a trailing `Z`.
pub fn parse_iso(raw: &str) -> Option<DateTime<Utc>> {
    let txt = raw.trim();
    if txt.is_empty() {
        return None;
    }
    DateTime::parse_from_rfc3339(txt)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Whole seconds elapsed from `earlier` to `later`, floored at zero.
pub fn secs_between(earlier: DateTime<Utc>, later: DateTime<Utc>) -> f64 {
    let ms = (later - earlier).num_milliseconds().max(0);
    ms as f64 / 1000.0
}
