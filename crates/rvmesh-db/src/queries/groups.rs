//! Group rosters.

use rusqlite::{Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;

use rvmesh_types::GroupId;

use crate::{from_json, to_json, Result};

pub fn upsert<T: Serialize>(
    conn: &Connection,
    group_id: &GroupId,
    generation: u64,
    roster: &T,
) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO group_rosters (group_id, generation, data) VALUES (?1, ?2, ?3)",
        rusqlite::params![group_id.as_slice(), generation as i64, to_json(roster)?],
    )?;
    Ok(())
}

pub fn get<T: DeserializeOwned>(conn: &Connection, group_id: &GroupId) -> Result<Option<T>> {
    let data: Option<String> = conn
        .query_row(
            "SELECT data FROM group_rosters WHERE group_id = ?1",
            [group_id.as_slice()],
            |row| row.get(0),
        )
        .optional()?;
    data.as_deref().map(from_json).transpose()
}

pub fn list<T: DeserializeOwned>(conn: &Connection) -> Result<Vec<T>> {
    let mut stmt = conn.prepare("SELECT data FROM group_rosters")?;
    let rows = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    rows.iter().map(|d| from_json(d)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upsert_get() {
        let conn = crate::open_memory().expect("open");
        upsert(&conn, &[1u8; 32], 0, &"g0".to_string()).expect("insert");
        upsert(&conn, &[1u8; 32], 1, &"g1".to_string()).expect("update");
        let got: Option<String> = get(&conn, &[1u8; 32]).expect("get");
        assert_eq!(got.as_deref(), Some("g1"));
        assert_eq!(list::<String>(&conn).expect("list").len(), 1);
    }
}
