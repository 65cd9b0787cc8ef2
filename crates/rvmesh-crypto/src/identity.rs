//! The local user's long-lived identity keys.

use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

use rvmesh_types::identity::PublicIdentity;

use crate::ed25519::{SigningKey, VerifyingKey};
use crate::x25519::X25519StaticSecret;
use crate::Result;

/// Local identity: an Ed25519 signing key and an X25519 key for handshakes.
#[derive(Clone)]
pub struct LocalIdentity {
    nick: String,
    signing_key: SigningKey,
    kx_secret: X25519StaticSecret,
}

/// On-disk form of a [`LocalIdentity`].
#[derive(Clone, Serialize, Deserialize, Zeroize)]
#[zeroize(drop)]
pub struct StoredIdentity {
    pub nick: String,
    pub sig_seed: [u8; 32],
    pub kx_seed: [u8; 32],
}

impl LocalIdentity {
    pub fn generate(nick: impl Into<String>) -> Self {
        Self {
            nick: nick.into(),
            signing_key: SigningKey::generate(),
            kx_secret: X25519StaticSecret::random(),
        }
    }

    pub fn from_stored(stored: &StoredIdentity) -> Self {
        Self {
            nick: stored.nick.clone(),
            signing_key: SigningKey::from_bytes(&stored.sig_seed),
            kx_secret: X25519StaticSecret::from_bytes(stored.kx_seed),
        }
    }

    pub fn to_stored(&self) -> StoredIdentity {
        StoredIdentity {
            nick: self.nick.clone(),
            sig_seed: self.signing_key.to_bytes(),
            kx_seed: self.kx_secret.to_bytes(),
        }
    }

    pub fn nick(&self) -> &str {
        &self.nick
    }

    pub fn id(&self) -> [u8; 32] {
        crate::blake3::user_id(&self.signing_key.verifying_key().to_bytes())
    }

    pub fn public(&self) -> PublicIdentity {
        let sig_key = self.signing_key.verifying_key().to_bytes();
        PublicIdentity {
            id: crate::blake3::user_id(&sig_key),
            nick: self.nick.clone(),
            sig_key,
            kx_key: self.kx_secret.public_key(),
        }
    }

    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.signing_key.sign(message)
    }

    pub fn kx_secret(&self) -> &X25519StaticSecret {
        &self.kx_secret
    }
}

impl std::fmt::Debug for LocalIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalIdentity")
            .field("nick", &self.nick)
            .field("id", &hex::encode(self.id()))
            .finish()
    }
}

/// Check that `ident.id` is derived from its signing key and that
/// `signature` over `message` verifies under it.
pub fn verify_signed_by(ident: &PublicIdentity, message: &[u8], signature: &[u8]) -> Result<()> {
    if !ident.id_matches_key(crate::blake3::user_id) {
        return Err(crate::CryptoError::InvalidInput(
            "identity id does not match signing key".to_string(),
        ));
    }
    VerifyingKey::from_bytes(&ident.sig_key)?.verify(message, signature)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_public_identity_consistent() {
        let me = LocalIdentity::generate("alice");
        let public = me.public();
        assert_eq!(public.id, me.id());
        assert!(public.id_matches_key(crate::blake3::user_id));
        assert_eq!(public.nick, "alice");
    }

    #[test]
    fn test_stored_roundtrip() {
        let me = LocalIdentity::generate("bob");
        let restored = LocalIdentity::from_stored(&me.to_stored());
        assert_eq!(me.public(), restored.public());
    }

    #[test]
    fn test_verify_signed_by() {
        let me = LocalIdentity::generate("carol");
        let sig = me.sign(b"payload");
        verify_signed_by(&me.public(), b"payload", &sig).expect("valid signature");

        let mut forged = me.public();
        forged.id = [0u8; 32];
        assert!(verify_signed_by(&forged, b"payload", &sig).is_err());
    }
}
