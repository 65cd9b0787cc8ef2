//! Payment attempt records, keyed by subject tag.

use rusqlite::{Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::{from_json, to_json, Result};

pub fn upsert<T: Serialize>(
    conn: &Connection,
    subject: &str,
    record: &T,
    completed_at: Option<u64>,
    updated_at: u64,
) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO payment_attempts (subject, data, completed_at, updated_at)
         VALUES (?1, ?2, ?3, ?4)",
        rusqlite::params![
            subject,
            to_json(record)?,
            completed_at.map(|t| t as i64),
            updated_at as i64,
        ],
    )?;
    Ok(())
}

pub fn get<T: DeserializeOwned>(conn: &Connection, subject: &str) -> Result<Option<T>> {
    let data: Option<String> = conn
        .query_row(
            "SELECT data FROM payment_attempts WHERE subject = ?1",
            [subject],
            |row| row.get(0),
        )
        .optional()?;
    data.as_deref().map(from_json).transpose()
}

/// Attempts that have not completed, oldest first.
pub fn list_incomplete<T: DeserializeOwned>(conn: &Connection) -> Result<Vec<T>> {
    let mut stmt = conn.prepare(
        "SELECT data FROM payment_attempts WHERE completed_at IS NULL ORDER BY updated_at",
    )?;
    let rows = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    rows.iter().map(|d| from_json(d)).collect()
}
