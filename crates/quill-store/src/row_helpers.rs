//! Typed column access. Anything that does not decode is reported as a
//! corrupt row naming the table and column.

use chrono::{DateTime, Utc};
use rusqlite::types::FromSql;
use rusqlite::Row;

use crate::error::StoreError;

fn corrupt(table: &'static str, column: &'static str, detail: String) -> StoreError {
    StoreError::CorruptRow {
        table,
        column,
        detail,
    }
}

pub fn get<T: FromSql>(
    row: &Row<'_>,
    idx: usize,
    table: &'static str,
    column: &'static str,
) -> Result<T, StoreError> {
    row.get(idx).map_err(|e| corrupt(table, column, e.to_string()))
}

/// Nullable column.
pub fn get_opt<T: FromSql>(
    row: &Row<'_>,
    idx: usize,
    table: &'static str,
    column: &'static str,
) -> Result<Option<T>, StoreError> {
    get::<Option<T>>(row, idx, table, column)
}

pub fn parse_json(
    raw: &str,
    table: &'static str,
    column: &'static str,
) -> Result<serde_json::Value, StoreError> {
    serde_json::from_str(raw).map_err(|e| corrupt(table, column, format!("invalid JSON: {e}")))
}

pub fn parse_enum<T: std::str::FromStr>(
    raw: &str,
    table: &'static str,
    column: &'static str,
) -> Result<T, StoreError> {
    raw.parse()
        .map_err(|_| corrupt(table, column, format!("unknown variant: {raw}")))
}

/// Timestamps are stored as RFC 3339 text (see `quill_core::format_timestamp`).
pub fn parse_timestamp(
    raw: &str,
    table: &'static str,
    column: &'static str,
) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| corrupt(table, column, format!("invalid timestamp {raw}: {e}")))
}
