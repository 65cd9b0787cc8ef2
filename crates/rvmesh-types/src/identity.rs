//! Public identity of a user, as exchanged in invites and handshake replies.

use serde::{Deserialize, Serialize};
use serde_with::serde_as;

use crate::UserId;

/// The public half of a user's identity.
///
/// `id` is derived from `sig_key` by a keyed BLAKE3 derivation; callers holding an identity received over the
/// wire must check [`PublicIdentity::id_matches_key`] before trusting it.
#[serde_as]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicIdentity {
    #[serde_as(as = "serde_with::hex::Hex")]
    pub id: UserId,
    pub nick: String,
    /// Ed25519 verifying key.
    #[serde_as(as = "serde_with::hex::Hex")]
    pub sig_key: [u8; 32],
    /// Long-lived X25519 key used by handshakes addressed to this user.
    #[serde_as(as = "serde_with::hex::Hex")]
    pub kx_key: [u8; 32],
}

impl PublicIdentity {
    /// Whether `id` is consistent with `sig_key` under the given hash function.
    ///
    /// The hash is injected so that this crate stays free of crypto deps.
    pub fn id_matches_key(&self, hash: impl Fn(&[u8]) -> [u8; 32]) -> bool {
        hash(&self.sig_key) == self.id
    }

    /// Short hex form of the id.
    pub fn short_id(&self) -> String {
        crate::short_hex(&self.id)
    }
}

impl std::fmt::Display for PublicIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.nick, self.short_id())
    }
}
