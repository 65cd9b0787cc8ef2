//! # rvmesh-crypto
//!
//! Cryptographic primitives for rvmesh. The suite is fixed; there is no
//! algorithm negotiation.
//!
//! ## Modules
//!
//! - [`blake3`]: Domain-separated BLAKE3 hashing and key derivation
//! - [`ed25519`]: Ed25519 signing and verification
//! - [`x25519`]: X25519 key agreement
//! - [`chacha20`]: ChaCha20-Poly1305 AEAD
//! - [`rv`]: Rendezvous identifier generation
//! - [`identity`]: The local user's long-lived keys
//! - [`ratchet`]: Per-peer symmetric ratchet established by a handshake

pub mod blake3;
pub mod chacha20;
pub mod ed25519;
pub mod identity;
pub mod ratchet;
pub mod rv;
pub mod x25519;

/// Error types for cryptographic operations.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    /// Ed25519 signature verification failed.
    #[error("signature verification failed")]
    SignatureVerification,

    /// AEAD decryption failed (authentication tag mismatch).
    #[error("AEAD decryption failed")]
    AeadDecryption,

    /// AEAD encryption failed.
    #[error("AEAD encryption failed")]
    AeadEncryption,

    /// No ratchet key matches the message's rendezvous point.
    #[error("no ratchet key for rendezvous point")]
    UnknownMessageRv,

    /// Invalid key length.
    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    /// Invalid input data.
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl CryptoError {
    /// Cryptographic failures reject a single input; none are fatal.
    pub fn is_fatal(&self) -> bool {
        false
    }
}

pub type Result<T> = std::result::Result<T, CryptoError>;
