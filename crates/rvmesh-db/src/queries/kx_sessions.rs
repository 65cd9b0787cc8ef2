//! In-flight key exchange sessions.
//!
//! Sessions are keyed by their initial RV and indexed by step-3 RV and
//! `(peer_id, role)`.

use rusqlite::{Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;

use rvmesh_types::{RvId, UserId};

use crate::{blob32, from_json, to_json, Result};

/// Indexed columns of a session row.
#[derive(Clone, Debug)]
pub struct SessionKeys {
    pub initial_rv: RvId,
    pub step3_rv: Option<RvId>,
    pub role: &'static str,
    pub stage: &'static str,
    pub peer_id: Option<UserId>,
    pub created_at: u64,
}

/// Insert or replace a session.
pub fn upsert<T: Serialize>(conn: &Connection, keys: &SessionKeys, record: &T) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO kx_sessions
            (initial_rv, step3_rv, role, stage, peer_id, created_at, data)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        rusqlite::params![
            keys.initial_rv.as_slice(),
            keys.step3_rv.as_ref().map(|rv| rv.as_slice()),
            keys.role,
            keys.stage,
            keys.peer_id.as_ref().map(|id| id.as_slice()),
            keys.created_at as i64,
            to_json(record)?,
        ],
    )?;
    Ok(())
}

pub fn get<T: DeserializeOwned>(conn: &Connection, initial_rv: &RvId) -> Result<Option<T>> {
    let data: Option<String> = conn
        .query_row(
            "SELECT data FROM kx_sessions WHERE initial_rv = ?1",
            [initial_rv.as_slice()],
            |row| row.get(0),
        )
        .optional()?;
    data.as_deref().map(from_json).transpose()
}

pub fn get_by_step3<T: DeserializeOwned>(conn: &Connection, step3_rv: &RvId) -> Result<Option<T>> {
    let data: Option<String> = conn
        .query_row(
            "SELECT data FROM kx_sessions WHERE step3_rv = ?1",
            [step3_rv.as_slice()],
            |row| row.get(0),
        )
        .optional()?;
    data.as_deref().map(from_json).transpose()
}

/// Initial RVs of sessions with `peer_id` in `role`.
pub fn rvs_for_peer(conn: &Connection, peer_id: &UserId, role: &str) -> Result<Vec<RvId>> {
    let mut stmt = conn.prepare(
        "SELECT initial_rv FROM kx_sessions WHERE peer_id = ?1 AND role = ?2
         ORDER BY created_at",
    )?;
    let rows = stmt
        .query_map(rusqlite::params![peer_id.as_slice(), role], |row| {
            row.get::<_, Vec<u8>>(0)
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    rows.into_iter().map(blob32).collect()
}

pub fn delete(conn: &Connection, initial_rv: &RvId) -> Result<bool> {
    let n = conn.execute(
        "DELETE FROM kx_sessions WHERE initial_rv = ?1",
        [initial_rv.as_slice()],
    )?;
    Ok(n > 0)
}

pub fn list<T: DeserializeOwned>(conn: &Connection) -> Result<Vec<T>> {
    let mut stmt = conn.prepare("SELECT data FROM kx_sessions ORDER BY created_at")?;
    let rows = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    rows.iter().map(|d| from_json(d)).collect()
}

/// Initial RVs of sessions in one of `stages` created before `cutoff`.
pub fn created_before(conn: &Connection, cutoff: u64, stages: &[&str]) -> Result<Vec<RvId>> {
    let mut stmt = conn.prepare(
        "SELECT initial_rv, stage FROM kx_sessions WHERE created_at < ?1",
    )?;
    let rows = stmt
        .query_map([cutoff as i64], |row| {
            Ok((row.get::<_, Vec<u8>>(0)?, row.get::<_, String>(1)?))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    rows.into_iter()
        .filter(|(_, stage)| stages.contains(&stage.as_str()))
        .map(|(rv, _)| blob32(rv))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(rv: u8, peer: Option<u8>, created_at: u64) -> SessionKeys {
        SessionKeys {
            initial_rv: [rv; 32],
            step3_rv: Some([rv + 100; 32]),
            role: "target",
            stage: "awaiting_completion",
            peer_id: peer.map(|p| [p; 32]),
            created_at,
        }
    }

    #[test]
    fn test_upsert_get_and_step3_lookup() {
        let conn = crate::open_memory().expect("open");
        upsert(&conn, &keys(1, Some(9), 10), &"rec-1".to_string()).expect("upsert");

        let got: Option<String> = get(&conn, &[1u8; 32]).expect("get");
        assert_eq!(got.as_deref(), Some("rec-1"));

        let by3: Option<String> = get_by_step3(&conn, &[101u8; 32]).expect("get by step3");
        assert_eq!(by3.as_deref(), Some("rec-1"));

        upsert(&conn, &keys(1, Some(9), 10), &"rec-1b".to_string()).expect("replace");
        let got: Option<String> = get(&conn, &[1u8; 32]).expect("get");
        assert_eq!(got.as_deref(), Some("rec-1b"));
    }

    #[test]
    fn test_rvs_for_peer_and_delete() {
        let conn = crate::open_memory().expect("open");
        upsert(&conn, &keys(1, Some(9), 10), &1u32).expect("upsert");
        upsert(&conn, &keys(2, Some(9), 20), &2u32).expect("upsert");
        upsert(&conn, &keys(3, None, 30), &3u32).expect("upsert");

        let rvs = rvs_for_peer(&conn, &[9u8; 32], "target").expect("rvs");
        assert_eq!(rvs, vec![[1u8; 32], [2u8; 32]]);
        assert!(rvs_for_peer(&conn, &[9u8; 32], "source").expect("rvs").is_empty());

        assert!(delete(&conn, &[1u8; 32]).expect("delete"));
        assert!(!delete(&conn, &[1u8; 32]).expect("delete again"));
        assert_eq!(list::<u32>(&conn).expect("list"), vec![2, 3]);
    }

    #[test]
    fn test_created_before_filters_stage() {
        let conn = crate::open_memory().expect("open");
        upsert(&conn, &keys(1, None, 10), &1u32).expect("upsert");
        upsert(&conn, &keys(2, None, 50), &2u32).expect("upsert");

        let old = created_before(&conn, 20, &["awaiting_completion"]).expect("query");
        assert_eq!(old, vec![[1u8; 32]]);
        assert!(created_before(&conn, 20, &["awaiting_accept"])
            .expect("query")
            .is_empty());
    }
}
