//! Rendezvous identifiers.

use rand::RngCore;
use rvmesh_types::RvId;

/// Generate a fresh, unguessable rendezvous identifier.
pub fn random_rv() -> RvId {
    let mut rv = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut rv);
    rv
}

/// Generate 32 random bytes for use as an identifier (group ids, etc).
pub fn random_id() -> [u8; 32] {
    random_rv()
}
