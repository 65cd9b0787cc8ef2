//! X25519 key agreement.
//!
//! Both long-lived identity keys and per-handshake ephemeral keys use
//! [`X25519StaticSecret`]; ephemerals must survive a restart while a
//! handshake is in flight.

use rand::rngs::OsRng;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroize;

/// An X25519 secret key.
#[derive(Clone, Zeroize)]
#[zeroize(drop)]
pub struct X25519StaticSecret {
    inner: StaticSecret,
}

/// An X25519 shared secret.
#[derive(Zeroize)]
#[zeroize(drop)]
pub struct SharedSecret {
    bytes: [u8; 32],
}

impl X25519StaticSecret {
    pub fn random() -> Self {
        Self {
            inner: StaticSecret::random_from_rng(OsRng),
        }
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self {
            inner: StaticSecret::from(bytes),
        }
    }

    pub fn to_bytes(&self) -> [u8; 32] {
        self.inner.to_bytes()
    }

    /// Public key bytes.
    pub fn public_key(&self) -> [u8; 32] {
        PublicKey::from(&self.inner).to_bytes()
    }

    pub fn diffie_hellman(&self, their_public: &[u8; 32]) -> SharedSecret {
        let shared = self.inner.diffie_hellman(&PublicKey::from(*their_public));
        SharedSecret {
            bytes: *shared.as_bytes(),
        }
    }
}

impl SharedSecret {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_diffie_hellman_agreement() {
        let alice = X25519StaticSecret::random();
        let bob = X25519StaticSecret::random();
        let ab = alice.diffie_hellman(&bob.public_key());
        let ba = bob.diffie_hellman(&alice.public_key());
        assert_eq!(ab.as_bytes(), ba.as_bytes());
    }

    #[test]
    fn test_from_bytes_roundtrip() {
        let secret = X25519StaticSecret::random();
        let restored = X25519StaticSecret::from_bytes(secret.to_bytes());
        assert_eq!(secret.public_key(), restored.public_key());
    }
}
