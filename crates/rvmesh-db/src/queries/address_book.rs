//! Established peers (post-handshake ratchet entries).

use rusqlite::{Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;

use rvmesh_types::UserId;

use crate::{from_json, to_json, Result};

pub fn upsert<T: Serialize>(
    conn: &Connection,
    peer_id: &UserId,
    nick: &str,
    entry: &T,
    updated_at: u64,
) -> Result<()> {
    conn.execute(
        "INSERT INTO address_book (peer_id, nick, data, updated_at)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(peer_id) DO UPDATE SET
            nick = excluded.nick, data = excluded.data, updated_at = excluded.updated_at",
        rusqlite::params![peer_id.as_slice(), nick, to_json(entry)?, updated_at as i64],
    )?;
    Ok(())
}

pub fn get<T: DeserializeOwned>(conn: &Connection, peer_id: &UserId) -> Result<Option<T>> {
    let data: Option<String> = conn
        .query_row(
            "SELECT data FROM address_book WHERE peer_id = ?1",
            [peer_id.as_slice()],
            |row| row.get(0),
        )
        .optional()?;
    data.as_deref().map(from_json).transpose()
}

pub fn exists(conn: &Connection, peer_id: &UserId) -> Result<bool> {
    let n: i64 = conn.query_row(
        "SELECT COUNT(*) FROM address_book WHERE peer_id = ?1",
        [peer_id.as_slice()],
        |row| row.get(0),
    )?;
    Ok(n > 0)
}

/// All entries, ordered by nick.
pub fn list<T: DeserializeOwned>(conn: &Connection) -> Result<Vec<T>> {
    let mut stmt = conn.prepare("SELECT data FROM address_book ORDER BY nick")?;
    let rows = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    rows.iter().map(|d| from_json(d)).collect()
}

pub fn remove(conn: &Connection, peer_id: &UserId) -> Result<bool> {
    let n = conn.execute(
        "DELETE FROM address_book WHERE peer_id = ?1",
        [peer_id.as_slice()],
    )?;
    Ok(n > 0)
}
