//! Relay publishes written alongside the state change that caused them.
//!
//! Rows are removed once published; leftovers are republished on startup.

use rusqlite::Connection;

use rvmesh_types::RvId;

use crate::{blob32, Result};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutboxRow {
    pub id: i64,
    pub rv: RvId,
    pub payload: Vec<u8>,
    pub created_at: u64,
}

pub fn enqueue(conn: &Connection, rv: &RvId, payload: &[u8], created_at: u64) -> Result<i64> {
    conn.execute(
        "INSERT INTO outbox (rv, payload, created_at) VALUES (?1, ?2, ?3)",
        rusqlite::params![rv.as_slice(), payload, created_at as i64],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn remove(conn: &Connection, id: i64) -> Result<()> {
    conn.execute("DELETE FROM outbox WHERE id = ?1", [id])?;
    Ok(())
}

/// All pending publishes in insertion order.
pub fn pending(conn: &Connection) -> Result<Vec<OutboxRow>> {
    let mut stmt = conn.prepare("SELECT id, rv, payload, created_at FROM outbox ORDER BY id")?;
    let raw = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, Vec<u8>>(1)?,
                row.get::<_, Vec<u8>>(2)?,
                row.get::<_, i64>(3)? as u64,
            ))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    raw.into_iter()
        .map(|(id, rv, payload, created_at)| -> Result<OutboxRow> {
            Ok(OutboxRow {
                id,
                rv: blob32(rv)?,
                payload,
                created_at,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enqueue_pending_remove() {
        let conn = crate::open_memory().expect("open");
        let a = enqueue(&conn, &[1u8; 32], b"one", 1).expect("enqueue");
        let b = enqueue(&conn, &[2u8; 32], b"two", 2).expect("enqueue");
        assert!(b > a);

        let rows = pending(&conn).expect("pending");
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].payload, b"one");

        remove(&conn, a).expect("remove");
        let rows = pending(&conn).expect("pending");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].rv, [2u8; 32]);
    }
}
