//! Chunk transfer records, keyed by (peer, file_id, direction).

use rusqlite::{Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;

use rvmesh_types::{FileId, UserId};

use crate::{from_json, to_json, Result};

pub fn upsert<T: Serialize>(
    conn: &Connection,
    peer: &UserId,
    file_id: &FileId,
    direction: &str,
    record: &T,
    updated_at: u64,
) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO transfers (peer, file_id, direction, data, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        rusqlite::params![
            peer.as_slice(),
            file_id.as_slice(),
            direction,
            to_json(record)?,
            updated_at as i64,
        ],
    )?;
    Ok(())
}

pub fn get<T: DeserializeOwned>(
    conn: &Connection,
    peer: &UserId,
    file_id: &FileId,
    direction: &str,
) -> Result<Option<T>> {
    let data: Option<String> = conn
        .query_row(
            "SELECT data FROM transfers WHERE peer = ?1 AND file_id = ?2 AND direction = ?3",
            rusqlite::params![peer.as_slice(), file_id.as_slice(), direction],
            |row| row.get(0),
        )
        .optional()?;
    data.as_deref().map(from_json).transpose()
}

/// All records in one direction, most recently updated first.
pub fn list<T: DeserializeOwned>(conn: &Connection, direction: &str) -> Result<Vec<T>> {
    let mut stmt = conn.prepare(
        "SELECT data FROM transfers WHERE direction = ?1 ORDER BY updated_at DESC",
    )?;
    let rows = stmt
        .query_map([direction], |row| row.get::<_, String>(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    rows.iter().map(|d| from_json(d)).collect()
}

pub fn delete(conn: &Connection, peer: &UserId, file_id: &FileId, direction: &str) -> Result<bool> {
    let n = conn.execute(
        "DELETE FROM transfers WHERE peer = ?1 AND file_id = ?2 AND direction = ?3",
        rusqlite::params![peer.as_slice(), file_id.as_slice(), direction],
    )?;
    Ok(n > 0)
}
