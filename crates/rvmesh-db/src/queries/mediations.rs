//! Outstanding mediation requests, keyed by (mediator, target, kind).

use rusqlite::Connection;

use rvmesh_types::UserId;

use crate::{blob32, Result};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MediationRow {
    pub mediator: UserId,
    pub target: UserId,
    pub kind: String,
    pub requested_at: u64,
}

/// Record a request; a repeated request refreshes its timestamp.
pub fn upsert(
    conn: &Connection,
    mediator: &UserId,
    target: &UserId,
    kind: &str,
    requested_at: u64,
) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO mediate_requests (mediator, target, kind, requested_at)
         VALUES (?1, ?2, ?3, ?4)",
        rusqlite::params![mediator.as_slice(), target.as_slice(), kind, requested_at as i64],
    )?;
    Ok(())
}

pub fn exists(conn: &Connection, mediator: &UserId, target: &UserId, kind: &str) -> Result<bool> {
    let n: i64 = conn.query_row(
        "SELECT COUNT(*) FROM mediate_requests WHERE mediator = ?1 AND target = ?2 AND kind = ?3",
        rusqlite::params![mediator.as_slice(), target.as_slice(), kind],
        |row| row.get(0),
    )?;
    Ok(n > 0)
}

/// Remove the request a completed mediated handshake answered. Returns
/// whether one was outstanding.
pub fn resolve(conn: &Connection, mediator: &UserId, target: &UserId, kind: &str) -> Result<bool> {
    let n = conn.execute(
        "DELETE FROM mediate_requests WHERE mediator = ?1 AND target = ?2 AND kind = ?3",
        rusqlite::params![mediator.as_slice(), target.as_slice(), kind],
    )?;
    Ok(n > 0)
}

/// Remove and return requests made before `cutoff`.
pub fn take_expired(conn: &Connection, cutoff: u64) -> Result<Vec<MediationRow>> {
    let rows = select(
        conn,
        "SELECT mediator, target, kind, requested_at FROM mediate_requests WHERE requested_at < ?1",
        rusqlite::params![cutoff as i64],
    )?;
    conn.execute(
        "DELETE FROM mediate_requests WHERE requested_at < ?1",
        [cutoff as i64],
    )?;
    Ok(rows)
}

pub fn list(conn: &Connection) -> Result<Vec<MediationRow>> {
    select(
        conn,
        "SELECT mediator, target, kind, requested_at FROM mediate_requests ORDER BY requested_at",
        rusqlite::params![],
    )
}

fn select(conn: &Connection, sql: &str, params: &[&dyn rusqlite::ToSql]) -> Result<Vec<MediationRow>> {
    let mut stmt = conn.prepare(sql)?;
    let raw = stmt
        .query_map(params, |row| {
            Ok((
                row.get::<_, Vec<u8>>(0)?,
                row.get::<_, Vec<u8>>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, i64>(3)? as u64,
            ))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    raw.into_iter()
        .map(|(m, t, kind, requested_at)| -> Result<MediationRow> {
            Ok(MediationRow {
                mediator: blob32(m)?,
                target: blob32(t)?,
                kind,
                requested_at,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_and_expire() {
        let conn = crate::open_memory().expect("open");
        upsert(&conn, &[1u8; 32], &[2u8; 32], "introduction", 10).expect("insert");
        upsert(&conn, &[1u8; 32], &[3u8; 32], "introduction", 100).expect("insert");
        assert!(exists(&conn, &[1u8; 32], &[2u8; 32], "introduction").expect("exists"));
        assert!(!exists(&conn, &[1u8; 32], &[2u8; 32], "transitive_reset").expect("exists"));

        let expired = take_expired(&conn, 50).expect("expire");
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].target, [2u8; 32]);

        assert!(!resolve(&conn, &[9u8; 32], &[3u8; 32], "introduction").expect("other mediator"));
        assert!(!resolve(&conn, &[1u8; 32], &[3u8; 32], "transitive_reset").expect("other kind"));
        assert!(resolve(&conn, &[1u8; 32], &[3u8; 32], "introduction").expect("resolve"));
        assert!(list(&conn).expect("list").is_empty());
    }
}
