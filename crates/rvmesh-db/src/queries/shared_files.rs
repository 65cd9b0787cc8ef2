//! Files offered for download by peers.

use rusqlite::{Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;

use rvmesh_types::FileId;

use crate::{from_json, to_json, Result};

pub fn upsert<T: Serialize>(
    conn: &Connection,
    file_id: &FileId,
    path: &str,
    metadata: &T,
    shared_at: u64,
) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO shared_files (file_id, path, data, shared_at)
         VALUES (?1, ?2, ?3, ?4)",
        rusqlite::params![file_id.as_slice(), path, to_json(metadata)?, shared_at as i64],
    )?;
    Ok(())
}

/// Local path and metadata of a shared file.
pub fn get<T: DeserializeOwned>(conn: &Connection, file_id: &FileId) -> Result<Option<(String, T)>> {
    let row: Option<(String, String)> = conn
        .query_row(
            "SELECT path, data FROM shared_files WHERE file_id = ?1",
            [file_id.as_slice()],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    row.map(|(path, data)| -> Result<(String, T)> { Ok((path, from_json(&data)?)) })
        .transpose()
}

pub fn list<T: DeserializeOwned>(conn: &Connection) -> Result<Vec<T>> {
    let mut stmt = conn.prepare("SELECT data FROM shared_files ORDER BY shared_at")?;
    let rows = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    rows.iter().map(|d| from_json(d)).collect()
}

pub fn remove(conn: &Connection, file_id: &FileId) -> Result<bool> {
    let n = conn.execute(
        "DELETE FROM shared_files WHERE file_id = ?1",
        [file_id.as_slice()],
    )?;
    Ok(n > 0)
}
