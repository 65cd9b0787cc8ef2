//! Handshake wire formats.
//!
//! The invite travels out of band as URL-safe base64 of signed JSON. The
//! reply and final messages are published on the relay as [`KxWire`]
//! frames whose bodies are sealed with keys only the two parties can
//! derive.

use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_with::serde_as;

use rvmesh_crypto::blake3::encode_multi_field;
use rvmesh_crypto::identity::{verify_signed_by, LocalIdentity};
use rvmesh_types::identity::PublicIdentity;
use rvmesh_types::{RvId, UserId};

use crate::{KxError, Result};

/// A signed invitation to run a handshake at `initial_rv`.
#[serde_as]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invite {
    #[serde_as(as = "serde_with::hex::Hex")]
    pub initial_rv: RvId,
    pub inviter: PublicIdentity,
    /// Set when the invite is addressed to one specific user.
    #[serde_as(as = "Option<serde_with::hex::Hex>")]
    pub invitee: Option<UserId>,
    pub is_reset: bool,
    /// Third party that asked for this invite to be created.
    #[serde_as(as = "Option<serde_with::hex::Hex>")]
    pub mediator: Option<UserId>,
    pub created_at: u64,
    #[serde_as(as = "serde_with::hex::Hex")]
    pub signature: [u8; 64],
}

impl Invite {
    pub fn new_signed(
        identity: &LocalIdentity,
        initial_rv: RvId,
        invitee: Option<UserId>,
        is_reset: bool,
        mediator: Option<UserId>,
        created_at: u64,
    ) -> Self {
        let mut invite = Invite {
            initial_rv,
            inviter: identity.public(),
            invitee,
            is_reset,
            mediator,
            created_at,
            signature: [0u8; 64],
        };
        invite.signature = identity.sign(&invite.signed_data());
        invite
    }

    /// Format: length-prefixed fields, see [`encode_multi_field`].
    fn signed_data(&self) -> Vec<u8> {
        let none: &[u8] = &[];
        encode_multi_field(&[
            b"rvmesh-invite",
            &self.initial_rv,
            &self.inviter.id,
            &self.inviter.sig_key,
            &self.inviter.kx_key,
            self.inviter.nick.as_bytes(),
            self.invitee.as_ref().map(|v| v.as_slice()).unwrap_or(none),
            &[self.is_reset as u8],
            self.mediator.as_ref().map(|v| v.as_slice()).unwrap_or(none),
            &self.created_at.to_le_bytes(),
        ])
    }

    pub fn verify(&self) -> Result<()> {
        verify_signed_by(&self.inviter, &self.signed_data(), &self.signature)
            .map_err(|e| KxError::InvalidInvite(format!("bad invite signature: {e}")))
    }

    pub fn encode(&self) -> Result<String> {
        let json = serde_json::to_vec(self).map_err(|e| KxError::Encoding(e.to_string()))?;
        Ok(base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(json))
    }

    pub fn decode(encoded: &str) -> Result<Self> {
        let json = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .decode(encoded.trim())
            .map_err(|e| KxError::InvalidInvite(format!("invalid base64: {e}")))?;
        serde_json::from_slice(&json)
            .map_err(|e| KxError::InvalidInvite(format!("invalid invite JSON: {e}")))
    }
}

/// Contents of the Target's reply.
#[serde_as]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyBody {
    pub target: PublicIdentity,
    #[serde_as(as = "serde_with::hex::Hex")]
    pub step3_rv: RvId,
    /// RV the Target will listen on for future reset requests.
    #[serde_as(as = "serde_with::hex::Hex")]
    pub reset_rv: RvId,
    #[serde_as(as = "serde_with::hex::Hex")]
    pub signature: [u8; 64],
}

impl ReplyBody {
    pub fn new_signed(
        identity: &LocalIdentity,
        initial_rv: &RvId,
        target_eph: &[u8; 32],
        step3_rv: RvId,
        reset_rv: RvId,
    ) -> Self {
        let mut body = ReplyBody {
            target: identity.public(),
            step3_rv,
            reset_rv,
            signature: [0u8; 64],
        };
        body.signature = identity.sign(&body.signed_data(initial_rv, target_eph));
        body
    }

    fn signed_data(&self, initial_rv: &RvId, target_eph: &[u8; 32]) -> Vec<u8> {
        encode_multi_field(&[
            b"rvmesh-reply",
            initial_rv,
            target_eph,
            &self.target.id,
            &self.step3_rv,
            &self.reset_rv,
        ])
    }

    pub fn verify(&self, initial_rv: &RvId, target_eph: &[u8; 32]) -> Result<()> {
        verify_signed_by(
            &self.target,
            &self.signed_data(initial_rv, target_eph),
            &self.signature,
        )
        .map_err(|e| KxError::InvalidInvite(format!("bad reply signature: {e}")))
    }
}

/// Contents of the Source's final message.
#[serde_as]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalBody {
    /// RV the Source will listen on for future reset requests.
    #[serde_as(as = "serde_with::hex::Hex")]
    pub reset_rv: RvId,
    #[serde_as(as = "serde_with::hex::Hex")]
    pub signature: [u8; 64],
}

impl FinalBody {
    pub fn new_signed(
        identity: &LocalIdentity,
        step3_rv: &RvId,
        source_eph: &[u8; 32],
        reset_rv: RvId,
    ) -> Self {
        let mut body = FinalBody {
            reset_rv,
            signature: [0u8; 64],
        };
        body.signature = identity.sign(&body.signed_data(step3_rv, source_eph));
        body
    }

    fn signed_data(&self, step3_rv: &RvId, source_eph: &[u8; 32]) -> Vec<u8> {
        encode_multi_field(&[b"rvmesh-final", step3_rv, source_eph, &self.reset_rv])
    }

    pub fn verify(&self, source: &PublicIdentity, step3_rv: &RvId, source_eph: &[u8; 32]) -> Result<()> {
        verify_signed_by(source, &self.signed_data(step3_rv, source_eph), &self.signature)
            .map_err(|e| KxError::InvalidInvite(format!("bad final signature: {e}")))
    }
}

/// Handshake frames published on the relay.
#[serde_as]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kx", rename_all = "snake_case")]
pub enum KxWire {
    /// Published by the Target at `initial_rv`.
    Reply {
        #[serde_as(as = "serde_with::hex::Hex")]
        target_eph: [u8; 32],
        #[serde_as(as = "serde_with::base64::Base64")]
        sealed: Vec<u8>,
    },
    /// Published by the Source at `step3_rv`.
    Final {
        #[serde_as(as = "serde_with::hex::Hex")]
        source_eph: [u8; 32],
        #[serde_as(as = "serde_with::base64::Base64")]
        sealed: Vec<u8>,
    },
    /// A reset invite published at the peer's reset RV.
    ResetInvite { invite: String },
}

impl KxWire {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| KxError::Encoding(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| KxError::InvalidInvite(format!("malformed handshake frame: {e}")))
    }
}
