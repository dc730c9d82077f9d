//! Column encoding helpers shared by the CRUD modules.
//!
//! Timestamps are stored as RFC 3339 with a fixed microsecond precision so
//! that lexicographic comparison in SQL matches chronological order.

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use rusqlite::types::Type;
use uuid::Uuid;

/// Current time at the precision the database keeps.
pub(crate) fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

pub(crate) fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_ts(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

pub(crate) fn parse_uuid(idx: usize, raw: &str) -> rusqlite::Result<Uuid> {
    Uuid::parse_str(raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

/// `?1, ?2, ... ?n` for `IN (...)` clauses.
pub(crate) fn placeholders(n: usize) -> String {
    (1..=n).map(|i| format!("?{i}")).collect::<Vec<_>>().join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_timestamp_text_sorts_chronologically() {
        let a = now();
        let b = a + Duration::microseconds(1);
        let c = a + Duration::seconds(1);
        assert!(ts(&a) < ts(&b));
        assert!(ts(&b) < ts(&c));
        assert_eq!(ts(&a).len(), ts(&c).len());
    }

    #[test]
    fn test_timestamp_round_trip() {
        let t = now();
        assert_eq!(parse_ts(0, &ts(&t)).unwrap(), t);
    }

    #[test]
    fn test_placeholders() {
        assert_eq!(placeholders(3), "?1, ?2, ?3");
    }
}
