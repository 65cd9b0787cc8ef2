//! # rvmesh-types
//!
//! Shared domain types used across the rvmesh workspace: identifiers,
//! public identities, handshake stages, chunk states, ratcheted peer
//! messages, group rosters and the event surface consumed by the
//! presentation layer.

pub mod events;
pub mod group;
pub mod identity;
pub mod kx;
pub mod payment;
pub mod transfer;
pub mod wire;

/// Common type aliases.
pub type Hash = [u8; 32];
/// Identity of a user: BLAKE3 hash of their Ed25519 public key.
pub type UserId = [u8; 32];
/// Rendezvous identifier on the relay.
pub type RvId = [u8; 32];
/// File identifier (hash of the file metadata).
pub type FileId = [u8; 32];
/// Content hash of a single chunk.
pub type ChunkHash = [u8; 32];
/// Group identifier.
pub type GroupId = [u8; 32];

/// Milli-atoms per atom (payment network unit granularity).
pub const MILLI_ATOMS_PER_ATOM: u64 = 1000;

/// Atoms per DCR.
pub const ATOMS_PER_DCR: u64 = 100_000_000;

/// Current Unix timestamp in seconds.
pub fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Short hex form of an identifier, used in log fields and display.
pub fn short_hex(id: &[u8; 32]) -> String {
    hex::encode(&id[..8])
}
