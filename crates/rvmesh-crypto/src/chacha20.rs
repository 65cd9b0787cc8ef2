//! ChaCha20-Poly1305 AEAD encryption.

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Key, Nonce,
};

use crate::{CryptoError, Result};

pub const NONCE_SIZE: usize = 12;
pub const KEY_SIZE: usize = 32;
pub const TAG_SIZE: usize = 16;

/// Encrypt `plaintext`, returning ciphertext with the 16-byte tag appended.
pub fn encrypt(
    key: &[u8; KEY_SIZE],
    nonce: &[u8; NONCE_SIZE],
    plaintext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .encrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|_| CryptoError::AeadEncryption)
}

/// Decrypt and authenticate `ciphertext`.
pub fn decrypt(
    key: &[u8; KEY_SIZE],
    nonce: &[u8; NONCE_SIZE],
    ciphertext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .decrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| CryptoError::AeadDecryption)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let key = [0x42u8; KEY_SIZE];
        let nonce = [0x01u8; NONCE_SIZE];
        let ct = encrypt(&key, &nonce, b"hello", b"rv").expect("encrypt");
        assert_eq!(ct.len(), 5 + TAG_SIZE);
        assert_eq!(decrypt(&key, &nonce, &ct, b"rv").expect("decrypt"), b"hello");
    }

    #[test]
    fn test_wrong_aad_fails() {
        let key = [0x01u8; KEY_SIZE];
        let nonce = [0x01u8; NONCE_SIZE];
        let ct = encrypt(&key, &nonce, b"test", b"aad1").expect("encrypt");
        assert!(decrypt(&key, &nonce, &ct, b"aad2").is_err());
    }
}
