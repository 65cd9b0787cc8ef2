//! # rvmesh-db
//!
//! Durable store for the rvmesh client: a single SQLite database at
//! `$RVMESH_DATA_DIR/rvmesh.db`.
//!
//! ## Schema
//!
//! - WAL mode, foreign keys enforced, busy timeout
//! - All timestamps are Unix epoch seconds
//! - Schema version stored in `PRAGMA user_version`
//! - Records are JSON documents keyed by indexed columns

pub mod locks;
pub mod migrations;
pub mod queries;
pub mod schema;

use rusqlite::Connection;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;

pub use locks::KeyedLocks;

/// Current schema version.
pub const SCHEMA_VERSION: u32 = 1;

/// Database error types.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("migration failed: {0}")]
    Migration(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl DbError {
    /// Whether the store itself is unusable (I/O failure, corruption).
    ///
    /// A missing row is a normal lookup outcome.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, DbError::NotFound(_))
    }
}

pub type Result<T> = std::result::Result<T, DbError>;

/// Open or create the database at the given path.
///
/// Configures WAL mode, foreign keys, and runs any pending migrations.
pub fn open(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)?;
    configure(&conn)?;
    migrations::run(&conn)?;
    Ok(conn)
}

/// Open an in-memory database (for testing).
pub fn open_memory() -> Result<Connection> {
    let conn = Connection::open_in_memory()?;
    configure(&conn)?;
    migrations::run(&conn)?;
    Ok(conn)
}

fn configure(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )?;
    Ok(())
}

/// Run `f` inside a single transaction. Commits on `Ok`, rolls back on `Err`.
pub fn transaction<T, E>(
    conn: &Connection,
    f: impl FnOnce(&rusqlite::Transaction<'_>) -> std::result::Result<T, E>,
) -> std::result::Result<T, E>
where
    E: From<DbError>,
{
    let tx = conn.unchecked_transaction().map_err(DbError::from)?;
    let out = f(&tx)?;
    tx.commit().map_err(DbError::from)?;
    Ok(out)
}

pub(crate) fn to_json<T: Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(|e| DbError::Serialization(e.to_string()))
}

pub(crate) fn from_json<T: DeserializeOwned>(text: &str) -> Result<T> {
    serde_json::from_str(text).map_err(|e| DbError::Serialization(e.to_string()))
}

/// Convert a BLOB column into a 32-byte identifier.
pub(crate) fn blob32(bytes: Vec<u8>) -> Result<[u8; 32]> {
    bytes
        .try_into()
        .map_err(|_| DbError::Serialization("expected 32-byte identifier".to_string()))
}
