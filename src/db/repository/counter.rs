use rusqlite::{params, Connection, OptionalExtension};

use crate::db::DatabaseError;

pub fn current_counter(conn: &Connection, scope: &str) -> Result<Option<i64>, DatabaseError> {
    let value = conn
        .query_row(
            "SELECT value FROM sequence_counters WHERE scope = ?1",
            params![scope],
            |row| row.get(0),
        )
        .optional()?;
    Ok(value)
}

/// Advance the counter for `scope` and return the new value.
///
/// A scope seen for the first time starts at `seed + 1`. Must run inside the
/// caller's write transaction so the increment commits with the record that
/// consumes it.
pub fn advance_counter(conn: &Connection, scope: &str, seed: i64) -> Result<i64, DatabaseError> {
    let value = conn.query_row(
        "INSERT INTO sequence_counters (scope, value) VALUES (?1, ?2 + 1)
         ON CONFLICT (scope) DO UPDATE SET value = value + 1
         RETURNING value",
        params![scope, seed],
        |row| row.get(0),
    )?;
    Ok(value)
}
