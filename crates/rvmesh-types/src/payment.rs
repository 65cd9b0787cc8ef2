//! Payment subject tags and invoice references.

use serde::{Deserialize, Serialize};
use serde_with::serde_as;

use crate::{FileId, UserId};

/// Correlation key identifying what a payment attempt pays for.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubjectTag(String);

impl SubjectTag {
    /// Subject for purchasing one chunk of a file.
    pub fn chunk(file_id: &FileId, index: u32) -> Self {
        Self(format!("chunk:{}:{}", hex::encode(file_id), index))
    }

    /// Subject for a tip sent to a user.
    pub fn tip(user: &UserId, tag: u32) -> Self {
        Self(format!("tip:{}:{}", hex::encode(user), tag))
    }

    /// Wrap an arbitrary tag (e.g. one received over RPC).
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SubjectTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A payment request issued by the payment network.
#[serde_as]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invoice {
    /// Payment-network node that will settle the invoice.
    #[serde_as(as = "serde_with::hex::Hex")]
    pub payee: [u8; 32],
    /// Encoded payment request.
    pub payment_request: String,
    /// Hex payment hash, used to correlate settlement.
    pub payment_hash: String,
    pub amount_milli_atoms: u64,
    /// Unix time after which the payee will no longer settle it.
    pub expires_at: u64,
}
