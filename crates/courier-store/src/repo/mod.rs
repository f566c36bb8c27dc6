//! Repositories: plain functions over the raw connection, one module per
//! entity. All writes are idempotent upserts so the write-behind flusher
//! can replay them safely.

pub mod balance_ops;
pub mod chats;
pub mod files;
pub mod messages;
pub mod threads;
pub mod tool_calls;
pub mod users;

use chrono::{DateTime, Utc};

/// Parse an RFC3339 timestamp column.
pub(crate) fn parse_ts(s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                0,
                rusqlite::types::Type::Text,
                Box::new(e),
            )
        })
}

/// Parse an enum column via its `parse` function.
pub(crate) fn parse_enum<T>(
    s: &str,
    parse: fn(&str) -> Option<T>,
    what: &'static str,
) -> rusqlite::Result<T> {
    parse(s).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            format!("invalid {what}: {s}").into(),
        )
    })
}
