//! The local identity (single row).

use rusqlite::{Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::{from_json, to_json, Result};

/// Store the local identity, replacing any existing one.
pub fn save<T: Serialize>(conn: &Connection, identity: &T, created_at: u64) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO identity (id, data, created_at) VALUES (1, ?1, ?2)",
        rusqlite::params![to_json(identity)?, created_at as i64],
    )?;
    Ok(())
}

pub fn load<T: DeserializeOwned>(conn: &Connection) -> Result<Option<T>> {
    let data: Option<String> = conn
        .query_row("SELECT data FROM identity WHERE id = 1", [], |row| row.get(0))
        .optional()?;
    data.as_deref().map(from_json).transpose()
}
