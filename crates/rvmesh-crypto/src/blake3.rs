//! Domain-separated BLAKE3 hashing.
//!
//! - [`hash`]: content addressing (chunks, file ids, user ids)
//! - [`derive_key`]: key derivation under a registered context string
//!
//! Every derivation uses one of the [`contexts`] constants.

/// Registered BLAKE3 context strings.
pub mod contexts {
    pub const USER_ID: &str = "rvmesh v1 user-id";
    pub const FILE_ID: &str = "rvmesh v1 file-id";
    pub const KX_ROOT: &str = "rvmesh v1 kx-root";
    pub const KX_FINGERPRINT: &str = "rvmesh v1 kx-fingerprint";
    pub const KX_REPLY_KEY: &str = "rvmesh v1 kx-reply-key";
    pub const KX_FINAL_KEY: &str = "rvmesh v1 kx-final-key";
    pub const RATCHET_INITIATOR_CHAIN: &str = "rvmesh v1 ratchet-initiator-chain";
    pub const RATCHET_RESPONDER_CHAIN: &str = "rvmesh v1 ratchet-responder-chain";
    pub const RATCHET_CHAIN_KEY: &str = "rvmesh v1 ratchet-chain-key";
    pub const RATCHET_MSG_KEY: &str = "rvmesh v1 ratchet-msg-key";
    pub const RATCHET_NONCE: &str = "rvmesh v1 ratchet-nonce";
    pub const RATCHET_MSG_RV: &str = "rvmesh v1 ratchet-msg-rv";

    /// All registered context strings.
    pub const ALL_CONTEXTS: &[&str] = &[
        USER_ID,
        FILE_ID,
        KX_ROOT,
        KX_FINGERPRINT,
        KX_REPLY_KEY,
        KX_FINAL_KEY,
        RATCHET_INITIATOR_CHAIN,
        RATCHET_RESPONDER_CHAIN,
        RATCHET_CHAIN_KEY,
        RATCHET_MSG_KEY,
        RATCHET_NONCE,
        RATCHET_MSG_RV,
    ];
}

/// Compute the BLAKE3 hash of the input data.
pub fn hash(data: &[u8]) -> [u8; 32] {
    *::blake3::hash(data).as_bytes()
}

/// Derive a key using BLAKE3's key derivation mode.
pub fn derive_key(context: &str, key_material: &[u8]) -> [u8; 32] {
    let mut hasher = ::blake3::Hasher::new_derive_key(context);
    hasher.update(key_material);
    *hasher.finalize().as_bytes()
}

/// Encode multiple dynamic fields as
/// `LE32(len(field1)) || field1 || LE32(len(field2)) || field2 || ...`
pub fn encode_multi_field(fields: &[&[u8]]) -> Vec<u8> {
    let total_len: usize = fields.iter().map(|f| 4 + f.len()).sum();
    let mut output = Vec::with_capacity(total_len);
    for field in fields {
        output.extend_from_slice(&(field.len() as u32).to_le_bytes());
        output.extend_from_slice(field);
    }
    output
}

/// User id for an Ed25519 verifying key.
pub fn user_id(sig_key: &[u8]) -> [u8; 32] {
    derive_key(contexts::USER_ID, sig_key)
}

/// File id for a metadata preimage.
pub fn file_id(preimage: &[u8]) -> [u8; 32] {
    derive_key(contexts::FILE_ID, preimage)
}
