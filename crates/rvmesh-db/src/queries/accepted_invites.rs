//! Completed invites on the accepting side, keyed by initial RV.

use rusqlite::{Connection, OptionalExtension};

use rvmesh_types::{RvId, UserId};

use crate::{blob32, Result};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AcceptedRow {
    pub peer: UserId,
    pub reply: Vec<u8>,
    pub accepted_at: u64,
}

/// Remember the reply sent for `initial_rv`. The first record wins.
pub fn insert(
    conn: &Connection,
    initial_rv: &RvId,
    peer: &UserId,
    reply: &[u8],
    accepted_at: u64,
) -> Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO accepted_invites (initial_rv, peer_id, reply, accepted_at)
         VALUES (?1, ?2, ?3, ?4)",
        rusqlite::params![initial_rv.as_slice(), peer.as_slice(), reply, accepted_at as i64],
    )?;
    Ok(())
}

pub fn get(conn: &Connection, initial_rv: &RvId) -> Result<Option<AcceptedRow>> {
    let raw = conn
        .query_row(
            "SELECT peer_id, reply, accepted_at FROM accepted_invites WHERE initial_rv = ?1",
            [initial_rv.as_slice()],
            |row| {
                Ok((
                    row.get::<_, Vec<u8>>(0)?,
                    row.get::<_, Vec<u8>>(1)?,
                    row.get::<_, i64>(2)? as u64,
                ))
            },
        )
        .optional()?;
    raw.map(|(peer, reply, accepted_at)| -> Result<AcceptedRow> {
        Ok(AcceptedRow {
            peer: blob32(peer)?,
            reply,
            accepted_at,
        })
    })
    .transpose()
}
