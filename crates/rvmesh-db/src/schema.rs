//! SQL schema definitions.

/// Complete schema for the v1 database.
pub const SCHEMA_V1: &str = r#"
-- ============================================================
-- Identity
-- ============================================================

CREATE TABLE IF NOT EXISTS identity (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    data TEXT NOT NULL,
    created_at INTEGER NOT NULL
);

-- ============================================================
-- Key exchange
-- ============================================================

CREATE TABLE IF NOT EXISTS kx_sessions (
    initial_rv BLOB PRIMARY KEY,
    step3_rv BLOB UNIQUE,
    role TEXT NOT NULL,
    stage TEXT NOT NULL,
    peer_id BLOB,
    created_at INTEGER NOT NULL,
    data TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_kx_sessions_peer ON kx_sessions(peer_id, role);
CREATE INDEX IF NOT EXISTS idx_kx_sessions_created ON kx_sessions(created_at);

CREATE TABLE IF NOT EXISTS address_book (
    peer_id BLOB PRIMARY KEY,
    nick TEXT NOT NULL,
    data TEXT NOT NULL,
    updated_at INTEGER NOT NULL
);

-- Invites whose handshake completed on the accepting side, with the reply
-- that was published, so a replayed invite gets the same answer.
CREATE TABLE IF NOT EXISTS accepted_invites (
    initial_rv BLOB PRIMARY KEY,
    peer_id BLOB NOT NULL,
    reply BLOB NOT NULL,
    accepted_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS mediate_requests (
    mediator BLOB NOT NULL,
    target BLOB NOT NULL,
    kind TEXT NOT NULL,
    requested_at INTEGER NOT NULL,
    PRIMARY KEY (mediator, target, kind)
);

-- ============================================================
-- Transfers and payments
-- ============================================================

CREATE TABLE IF NOT EXISTS transfers (
    peer BLOB NOT NULL,
    file_id BLOB NOT NULL,
    direction TEXT NOT NULL,
    data TEXT NOT NULL,
    updated_at INTEGER NOT NULL,
    PRIMARY KEY (peer, file_id, direction)
);

CREATE TABLE IF NOT EXISTS shared_files (
    file_id BLOB PRIMARY KEY,
    path TEXT NOT NULL,
    data TEXT NOT NULL,
    shared_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS payment_attempts (
    subject TEXT PRIMARY KEY,
    data TEXT NOT NULL,
    completed_at INTEGER,
    updated_at INTEGER NOT NULL
);

-- ============================================================
-- Groups
-- ============================================================

CREATE TABLE IF NOT EXISTS group_rosters (
    group_id BLOB PRIMARY KEY,
    generation INTEGER NOT NULL,
    data TEXT NOT NULL
);

-- ============================================================
-- Outbound relay publishes awaiting delivery
-- ============================================================

CREATE TABLE IF NOT EXISTS outbox (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    rv BLOB NOT NULL,
    payload BLOB NOT NULL,
    created_at INTEGER NOT NULL
);
"#;
