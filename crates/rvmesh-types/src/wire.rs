//! Messages exchanged between peers over an established ratchet.

use serde::{Deserialize, Serialize};
use serde_with::serde_as;

use crate::group::{GroupRoster, RosterUpdate};
use crate::identity::PublicIdentity;
use crate::payment::Invoice;
use crate::{ChunkHash, FileId, UserId};

/// A ratchet-encrypted peer message.
#[serde_as]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PeerMsg {
    /// Requester asks the mediator to introduce it to `target`.
    MediateIdentity {
        #[serde_as(as = "serde_with::hex::Hex")]
        target: UserId,
    },
    /// Requester asks the mediator to help reset its ratchet with `target`.
    TransitiveReset {
        #[serde_as(as = "serde_with::hex::Hex")]
        target: UserId,
    },
    /// Mediator asks the target to produce an invite for `requester`.
    InviteRequest {
        requester: PublicIdentity,
        for_reset: bool,
    },
    /// Target hands the mediator an invite to pass on to `to`.
    RelayInvite {
        #[serde_as(as = "serde_with::hex::Hex")]
        to: UserId,
        invite: String,
        for_reset: bool,
    },
    /// Mediator delivers an invite created by `inviter`.
    ForwardedInvite {
        #[serde_as(as = "serde_with::hex::Hex")]
        inviter: UserId,
        invite: String,
        for_reset: bool,
    },

    /// Downloader asks for an invoice for a chunk.
    GetChunk {
        #[serde_as(as = "serde_with::hex::Hex")]
        file_id: FileId,
        index: u32,
    },
    /// Uploader offers an invoice for a chunk.
    ChunkInvoice {
        #[serde_as(as = "serde_with::hex::Hex")]
        file_id: FileId,
        index: u32,
        invoice: Invoice,
    },
    /// Downloader reports a chunk invoice paid and requests its content.
    ChunkPaid {
        #[serde_as(as = "serde_with::hex::Hex")]
        file_id: FileId,
        index: u32,
        payment_hash: String,
    },
    /// Uploader delivers chunk content.
    ChunkData {
        #[serde_as(as = "serde_with::hex::Hex")]
        file_id: FileId,
        index: u32,
        #[serde_as(as = "serde_with::hex::Hex")]
        hash: ChunkHash,
        #[serde_as(as = "serde_with::base64::Base64")]
        data: Vec<u8>,
    },

    /// Sender paid us a tip.
    TipNotice { amount_milli_atoms: u64, tag: u32 },

    /// Incremental roster change from a group member.
    GroupUpdate { update: RosterUpdate },
    /// Full roster, sent by the admin to a newly joined member.
    GroupSnapshot { roster: GroupRoster },
}

impl PeerMsg {
    pub fn kind(&self) -> &'static str {
        match self {
            PeerMsg::MediateIdentity { .. } => "mediate_identity",
            PeerMsg::TransitiveReset { .. } => "transitive_reset",
            PeerMsg::InviteRequest { .. } => "invite_request",
            PeerMsg::RelayInvite { .. } => "relay_invite",
            PeerMsg::ForwardedInvite { .. } => "forwarded_invite",
            PeerMsg::GetChunk { .. } => "get_chunk",
            PeerMsg::ChunkInvoice { .. } => "chunk_invoice",
            PeerMsg::ChunkPaid { .. } => "chunk_paid",
            PeerMsg::ChunkData { .. } => "chunk_data",
            PeerMsg::TipNotice { .. } => "tip_notice",
            PeerMsg::GroupUpdate { .. } => "group_update",
            PeerMsg::GroupSnapshot { .. } => "group_snapshot",
        }
    }

    pub fn to_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }
}
