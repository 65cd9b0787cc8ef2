//! Persisted key exchange state.

use serde::{Deserialize, Serialize};
use serde_with::serde_as;

use rvmesh_crypto::ratchet::{HalfRatchet, Ratchet};
use rvmesh_db::queries::kx_sessions::SessionKeys;
use rvmesh_types::identity::PublicIdentity;
use rvmesh_types::kx::{KxRole, KxStage};
use rvmesh_types::{RvId, UserId};

use crate::{KxError, Result};

/// One in-flight handshake, keyed by `initial_rv`.
///
/// `half_ratchet` is present exactly while a Target waits for the final
/// message; it is dropped when the record fails or completes.
#[serde_as]
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KxRecord {
    pub role: KxRole,
    pub stage: KxStage,
    /// Counterpart identity, known to the Target from the invite and to
    /// the Source once the reply arrives.
    pub peer: Option<PublicIdentity>,
    #[serde_as(as = "serde_with::hex::Hex")]
    pub initial_rv: RvId,
    #[serde_as(as = "Option<serde_with::hex::Hex>")]
    pub step3_rv: Option<RvId>,
    pub half_ratchet: Option<HalfRatchet>,
    #[serde_as(as = "serde_with::hex::Hex")]
    pub my_reset_rv: RvId,
    pub created_at: u64,
    /// Identity the Source addressed the invite to.
    pub invitee: Option<PublicIdentity>,
    pub is_reset_request: bool,
    #[serde_as(as = "Option<serde_with::hex::Hex>")]
    pub mediator_id: Option<UserId>,
    /// Reply already published for this session, returned on a repeated accept.
    #[serde_as(as = "Option<serde_with::base64::Base64>")]
    pub reply: Option<Vec<u8>>,
    pub failure: Option<String>,
}

impl KxRecord {
    pub fn counterpart(&self) -> Option<&PublicIdentity> {
        self.peer.as_ref().or(self.invitee.as_ref())
    }

    pub fn session_keys(&self) -> SessionKeys {
        SessionKeys {
            initial_rv: self.initial_rv,
            step3_rv: self.step3_rv,
            role: self.role.as_str(),
            stage: self.stage.as_str(),
            peer_id: self.counterpart().map(|p| p.id),
            created_at: self.created_at,
        }
    }

    /// Move to `next`, enforcing forward-only progress.
    pub fn advance(&mut self, next: KxStage) -> Result<()> {
        if !self.stage.can_advance_to(next) {
            return Err(KxError::IllegalTransition {
                from: self.stage,
                to: next,
            });
        }
        self.stage = next;
        if next != KxStage::AwaitingCompletion {
            self.half_ratchet = None;
        }
        Ok(())
    }

    pub fn fail(&mut self, reason: impl Into<String>) -> Result<()> {
        self.advance(KxStage::Failed)?;
        self.failure = Some(reason.into());
        Ok(())
    }
}

/// An established bidirectional ratchet with a peer.
#[serde_as]
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PeerRatchetEntry {
    pub peer: PublicIdentity,
    pub ratchet: Ratchet,
    /// Where we accept reset invites from this peer.
    #[serde_as(as = "serde_with::hex::Hex")]
    pub my_reset_rv: RvId,
    /// Where the peer accepts reset invites from us.
    #[serde_as(as = "serde_with::hex::Hex")]
    pub their_reset_rv: RvId,
    #[serde(default)]
    pub ignored: bool,
    pub established_at: u64,
    #[serde(default)]
    pub reset_count: u32,
}
