//! Per-peer symmetric ratchet established by a completed handshake.
//!
//! ## KDF chains
//!
//! The handshake root secret seeds two chains: one per direction. The
//! handshake initiator (the invite's Source) sends on the initiator chain
//! and receives on the responder chain; the Target does the opposite.
//!
//! Each chain step derives a message key, a nonce and a rendezvous id for
//! that message, then advances the chain key. Old chain keys are discarded
//! on advance.
//!
//! The receiver watches a window of upcoming rendezvous ids so that
//! messages delivered out of order still decrypt; keys for steps skipped
//! over are retained (bounded) until their message arrives.

use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

use rvmesh_types::RvId;

use crate::blake3::{self, contexts};
use crate::x25519::X25519StaticSecret;
use crate::{chacha20, CryptoError, Result};

/// Number of upcoming receive steps watched for incoming messages.
pub const RECV_WINDOW: u64 = 8;

/// Maximum number of retained keys for skipped messages.
pub const MAX_SKIPPED: usize = 64;

/// Which side of the handshake a ratchet belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RatchetRole {
    Initiator,
    Responder,
}

/// Keys for a single message.
#[derive(Clone, Serialize, Deserialize, Zeroize)]
#[zeroize(drop)]
struct MessageKeys {
    rv: RvId,
    key: [u8; 32],
    nonce: [u8; 12],
}

#[derive(Clone, Serialize, Deserialize, Zeroize)]
#[zeroize(drop)]
struct Chain {
    key: [u8; 32],
    step: u64,
}

impl Chain {
    fn new(root: &[u8; 32], context: &str) -> Self {
        Self {
            key: blake3::derive_key(context, root),
            step: 0,
        }
    }

    fn message_keys(&self) -> MessageKeys {
        let step = self.step.to_le_bytes();
        let input = blake3::encode_multi_field(&[&self.key, &step]);
        let nonce_full = blake3::derive_key(contexts::RATCHET_NONCE, &input);
        let mut nonce = [0u8; 12];
        nonce.copy_from_slice(&nonce_full[..12]);
        MessageKeys {
            rv: blake3::derive_key(contexts::RATCHET_MSG_RV, &input),
            key: blake3::derive_key(contexts::RATCHET_MSG_KEY, &input),
            nonce,
        }
    }

    fn advance(&mut self) {
        let step = self.step.to_le_bytes();
        let input = blake3::encode_multi_field(&[&self.key, &step]);
        self.key = blake3::derive_key(contexts::RATCHET_CHAIN_KEY, &input);
        self.step += 1;
    }
}

/// A live ratchet shared with one peer.
#[derive(Clone, Serialize, Deserialize)]
pub struct Ratchet {
    fingerprint: [u8; 32],
    send: Chain,
    recv: Chain,
    #[serde(default)]
    skipped: Vec<MessageKeys>,
}

impl Ratchet {
    /// Build a ratchet from a handshake root secret.
    pub fn new(root: [u8; 32], role: RatchetRole) -> Self {
        let initiator = Chain::new(&root, contexts::RATCHET_INITIATOR_CHAIN);
        let responder = Chain::new(&root, contexts::RATCHET_RESPONDER_CHAIN);
        let (send, recv) = match role {
            RatchetRole::Initiator => (initiator, responder),
            RatchetRole::Responder => (responder, initiator),
        };
        Self {
            fingerprint: blake3::derive_key(contexts::KX_FINGERPRINT, &root),
            send,
            recv,
            skipped: Vec::new(),
        }
    }

    /// Identifies the root this ratchet was built from. Equal on both
    /// sides of a completed handshake.
    pub fn fingerprint(&self) -> [u8; 32] {
        self.fingerprint
    }

    /// Replace the ratchet material in place with a new root.
    pub fn reset(&mut self, root: [u8; 32], role: RatchetRole) {
        *self = Ratchet::new(root, role);
    }

    pub fn send_step(&self) -> u64 {
        self.send.step
    }

    pub fn recv_step(&self) -> u64 {
        self.recv.step
    }

    /// Rendezvous id the next outgoing message will be published at.
    pub fn next_send_rv(&self) -> RvId {
        self.send.message_keys().rv
    }

    /// Encrypt one message and advance the send chain.
    ///
    /// Returns the rendezvous id to publish at and the ciphertext.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<(RvId, Vec<u8>)> {
        let mk = self.send.message_keys();
        let ct = chacha20::encrypt(&mk.key, &mk.nonce, plaintext, &mk.rv)?;
        self.send.advance();
        Ok((mk.rv, ct))
    }

    /// Rendezvous ids currently expected from the peer.
    pub fn recv_rvs(&self) -> Vec<RvId> {
        let mut out: Vec<RvId> = self.skipped.iter().map(|k| k.rv).collect();
        let mut chain = self.recv.clone();
        for _ in 0..RECV_WINDOW {
            out.push(chain.message_keys().rv);
            chain.advance();
        }
        out
    }

    /// Decrypt a message received at `rv`.
    ///
    /// The ratchet only advances if authentication succeeds.
    pub fn decrypt(&mut self, rv: &RvId, ciphertext: &[u8]) -> Result<Vec<u8>> {
        if let Some(pos) = self.skipped.iter().position(|k| &k.rv == rv) {
            let mk = &self.skipped[pos];
            let pt = chacha20::decrypt(&mk.key, &mk.nonce, ciphertext, &mk.rv)?;
            self.skipped.remove(pos);
            return Ok(pt);
        }

        let mut chain = self.recv.clone();
        let mut passed = Vec::new();
        for _ in 0..RECV_WINDOW {
            let mk = chain.message_keys();
            chain.advance();
            if &mk.rv == rv {
                let pt = chacha20::decrypt(&mk.key, &mk.nonce, ciphertext, &mk.rv)?;
                self.recv = chain;
                self.skipped.extend(passed);
                if self.skipped.len() > MAX_SKIPPED {
                    let excess = self.skipped.len() - MAX_SKIPPED;
                    self.skipped.drain(..excess);
                }
                return Ok(pt);
            }
            passed.push(mk);
        }
        Err(CryptoError::UnknownMessageRv)
    }
}

impl std::fmt::Debug for Ratchet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ratchet")
            .field("fingerprint", &hex::encode(&self.fingerprint[..8]))
            .field("send_step", &self.send.step)
            .field("recv_step", &self.recv.step)
            .finish()
    }
}

/// Root secret for a handshake.
///
/// `static_dh` is DH(source static, target ephemeral); `eph_dh` is
/// DH(source ephemeral, target ephemeral).
pub fn kx_root(
    static_dh: &[u8; 32],
    eph_dh: &[u8; 32],
    initial_rv: &RvId,
    step3_rv: &RvId,
) -> [u8; 32] {
    let input = blake3::encode_multi_field(&[static_dh, eph_dh, initial_rv, step3_rv]);
    blake3::derive_key(contexts::KX_ROOT, &input)
}

/// Build the Source's ratchet once the Target's reply is known.
pub fn source_ratchet(
    my_static: &X25519StaticSecret,
    my_eph: &X25519StaticSecret,
    target_eph: &[u8; 32],
    initial_rv: &RvId,
    step3_rv: &RvId,
) -> Ratchet {
    let static_dh = my_static.diffie_hellman(target_eph);
    let eph_dh = my_eph.diffie_hellman(target_eph);
    let root = kx_root(static_dh.as_bytes(), eph_dh.as_bytes(), initial_rv, step3_rv);
    Ratchet::new(root, RatchetRole::Initiator)
}

/// Key sealing the Target's reply, as computed by the Source.
pub fn source_reply_key(
    my_static: &X25519StaticSecret,
    target_eph: &[u8; 32],
    initial_rv: &RvId,
) -> [u8; 32] {
    let static_dh = my_static.diffie_hellman(target_eph);
    envelope_key(contexts::KX_REPLY_KEY, static_dh.as_bytes(), initial_rv)
}

/// Key sealing the Source's final message, as computed by the Source.
pub fn source_final_key(my_eph: &X25519StaticSecret, target_eph: &[u8; 32], step3_rv: &RvId) -> [u8; 32] {
    let eph_dh = my_eph.diffie_hellman(target_eph);
    envelope_key(contexts::KX_FINAL_KEY, eph_dh.as_bytes(), step3_rv)
}

fn envelope_key(context: &str, shared: &[u8; 32], rv: &RvId) -> [u8; 32] {
    blake3::derive_key(context, &blake3::encode_multi_field(&[shared, rv]))
}

/// Seal a handshake envelope. Envelope keys are single use, so the nonce
/// is fixed.
pub fn seal_envelope(key: &[u8; 32], rv: &RvId, plaintext: &[u8]) -> Result<Vec<u8>> {
    chacha20::encrypt(key, &[0u8; chacha20::NONCE_SIZE], plaintext, rv)
}

pub fn open_envelope(key: &[u8; 32], rv: &RvId, ciphertext: &[u8]) -> Result<Vec<u8>> {
    chacha20::decrypt(key, &[0u8; chacha20::NONCE_SIZE], ciphertext, rv)
}

/// The Target's partial ratchet material, held between acceptance and
/// receipt of the Source's final message.
#[derive(Clone, Serialize, Deserialize, Zeroize)]
#[zeroize(drop)]
pub struct HalfRatchet {
    eph_secret: [u8; 32],
    static_dh: [u8; 32],
}

impl HalfRatchet {
    /// Start a half ratchet from a fresh ephemeral key and the Source's
    /// long-lived X25519 key.
    pub fn new(eph: &X25519StaticSecret, source_kx_key: &[u8; 32]) -> Self {
        Self {
            eph_secret: eph.to_bytes(),
            static_dh: *eph.diffie_hellman(source_kx_key).as_bytes(),
        }
    }

    /// Ephemeral public key sent to the Source in the reply.
    pub fn eph_public(&self) -> [u8; 32] {
        X25519StaticSecret::from_bytes(self.eph_secret).public_key()
    }

    /// Key sealing the reply at `initial_rv`.
    pub fn reply_key(&self, initial_rv: &RvId) -> [u8; 32] {
        envelope_key(contexts::KX_REPLY_KEY, &self.static_dh, initial_rv)
    }

    /// Key sealing the Source's final message at `step3_rv`.
    pub fn final_key(&self, source_eph: &[u8; 32], step3_rv: &RvId) -> [u8; 32] {
        let eph = X25519StaticSecret::from_bytes(self.eph_secret);
        let eph_dh = eph.diffie_hellman(source_eph);
        envelope_key(contexts::KX_FINAL_KEY, eph_dh.as_bytes(), step3_rv)
    }

    /// Merge with the Source's ephemeral key to build the live ratchet.
    pub fn complete(&self, source_eph: &[u8; 32], initial_rv: &RvId, step3_rv: &RvId) -> Ratchet {
        let eph = X25519StaticSecret::from_bytes(self.eph_secret);
        let eph_dh = eph.diffie_hellman(source_eph);
        let root = kx_root(&self.static_dh, eph_dh.as_bytes(), initial_rv, step3_rv);
        Ratchet::new(root, RatchetRole::Responder)
    }
}

impl std::fmt::Debug for HalfRatchet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HalfRatchet")
            .field("eph_public", &hex::encode(&self.eph_public()[..8]))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (Ratchet, Ratchet) {
        let source_static = X25519StaticSecret::random();
        let source_eph = X25519StaticSecret::random();
        let target_eph = X25519StaticSecret::random();
        let initial_rv = [1u8; 32];
        let step3_rv = [2u8; 32];

        let half = HalfRatchet::new(&target_eph, &source_static.public_key());
        let source = source_ratchet(
            &source_static,
            &source_eph,
            &half.eph_public(),
            &initial_rv,
            &step3_rv,
        );
        let target = half.complete(&source_eph.public_key(), &initial_rv, &step3_rv);
        (source, target)
    }

    #[test]
    fn test_handshake_symmetry() {
        let (source, target) = pair();
        assert_eq!(source.fingerprint(), target.fingerprint());
        assert_eq!(source.next_send_rv(), target.recv_rvs()[0]);
        assert_eq!(target.next_send_rv(), source.recv_rvs()[0]);
    }

    #[test]
    fn test_envelope_keys_agree() {
        let source_static = X25519StaticSecret::random();
        let source_eph = X25519StaticSecret::random();
        let target_eph = X25519StaticSecret::random();
        let half = HalfRatchet::new(&target_eph, &source_static.public_key());
        let (irv, srv) = ([1u8; 32], [2u8; 32]);

        assert_eq!(
            half.reply_key(&irv),
            source_reply_key(&source_static, &half.eph_public(), &irv)
        );
        let fk = source_final_key(&source_eph, &half.eph_public(), &srv);
        assert_eq!(half.final_key(&source_eph.public_key(), &srv), fk);
        assert_ne!(half.reply_key(&irv), fk);

        let sealed = seal_envelope(&fk, &srv, b"final").expect("seal");
        assert_eq!(open_envelope(&fk, &srv, &sealed).expect("open"), b"final");
        assert!(open_envelope(&fk, &irv, &sealed).is_err());
    }

    #[test]
    fn test_encrypt_decrypt_both_directions() {
        let (mut source, mut target) = pair();
        let (rv, ct) = source.encrypt(b"hello target").expect("encrypt");
        assert_eq!(target.decrypt(&rv, &ct).expect("decrypt"), b"hello target");

        let (rv, ct) = target.encrypt(b"hello source").expect("encrypt");
        assert_eq!(source.decrypt(&rv, &ct).expect("decrypt"), b"hello source");
        assert_eq!(source.send_step(), 1);
        assert_eq!(source.recv_step(), 1);
    }

    #[test]
    fn test_out_of_order_within_window() {
        let (mut source, mut target) = pair();
        let m0 = source.encrypt(b"zero").expect("encrypt");
        let m1 = source.encrypt(b"one").expect("encrypt");
        let m2 = source.encrypt(b"two").expect("encrypt");

        assert_eq!(target.decrypt(&m2.0, &m2.1).expect("m2"), b"two");
        assert_eq!(target.decrypt(&m0.0, &m0.1).expect("m0"), b"zero");
        assert_eq!(target.decrypt(&m1.0, &m1.1).expect("m1"), b"one");
        // Keys are single use.
        assert!(target.decrypt(&m1.0, &m1.1).is_err());
    }

    #[test]
    fn test_tampered_message_does_not_advance() {
        let (mut source, mut target) = pair();
        let (rv, mut ct) = source.encrypt(b"data").expect("encrypt");
        ct[0] ^= 0xFF;
        assert!(target.decrypt(&rv, &ct).is_err());
        assert_eq!(target.recv_step(), 0);
    }

    #[test]
    fn test_unknown_rv() {
        let (_, mut target) = pair();
        assert!(matches!(
            target.decrypt(&[9u8; 32], b"junk"),
            Err(CryptoError::UnknownMessageRv)
        ));
    }

    #[test]
    fn test_reset_replaces_material() {
        let (mut source, _) = pair();
        let before = source.fingerprint();
        source.reset([7u8; 32], RatchetRole::Initiator);
        assert_ne!(source.fingerprint(), before);
        assert_eq!(source.send_step(), 0);
    }

    #[test]
    fn test_serde_roundtrip_preserves_position() {
        let (mut source, mut target) = pair();
        source.encrypt(b"a").expect("encrypt");
        let json = serde_json::to_string(&source).expect("serialize");
        let mut restored: Ratchet = serde_json::from_str(&json).expect("deserialize");
        let (rv, ct) = restored.encrypt(b"b").expect("encrypt");
        // Target skips step 0 and decrypts step 1.
        assert_eq!(target.decrypt(&rv, &ct).expect("decrypt"), b"b");
    }
}
