//! Mediated introductions and transitive resets.
//!
//! ```text
//! requester --MediateIdentity/TransitiveReset--> mediator
//! mediator  --InviteRequest--------------------> target
//! target    --RelayInvite----------------------> mediator
//! mediator  --ForwardedInvite------------------> requester
//! ```
//!
//! The requester then accepts the forwarded invite and the regular
//! handshake runs directly between requester and target. Forwarded
//! invites are only accepted when a matching request is outstanding.

use tracing::{debug, info, warn};

use rvmesh_db::queries::{address_book, mediations};
use rvmesh_db::queries::mediations::MediationRow;
use rvmesh_types::events::ClientEvent;
use rvmesh_types::identity::PublicIdentity;
use rvmesh_types::kx::MediationKind;
use rvmesh_types::wire::PeerMsg;
use rvmesh_types::{short_hex, unix_now, UserId};

use crate::engine::{InviteMode, KxEngine};
use crate::invite::Invite;
use crate::{KxError, Result};

pub(crate) fn kind_for(for_reset: bool) -> MediationKind {
    if for_reset {
        MediationKind::TransitiveReset
    } else {
        MediationKind::Introduction
    }
}

impl<R: rvmesh_transport::RelayTransport> KxEngine<R> {
    /// Ask `mediator` to introduce us to `target`.
    pub async fn request_mediated_introduction(&self, mediator: &UserId, target: &UserId) -> Result<()> {
        self.request_mediation(mediator, target, MediationKind::Introduction)
            .await
    }

    /// Ask `mediator` to carry a reset invite between us and `target`,
    /// for when our direct ratchet with `target` is unusable.
    pub async fn request_transitive_reset(&self, mediator: &UserId, target: &UserId) -> Result<()> {
        self.request_mediation(mediator, target, MediationKind::TransitiveReset)
            .await
    }

    async fn request_mediation(
        &self,
        mediator: &UserId,
        target: &UserId,
        kind: MediationKind,
    ) -> Result<()> {
        let me = self.identity().id();
        if mediator == target || *mediator == me || *target == me {
            return Err(KxError::InvalidRequest(
                "mediator and target must be two other users".into(),
            ));
        }
        {
            let conn = self.db().lock().await;
            if !address_book::exists(&conn, mediator)? {
                return Err(KxError::UnknownPeer(short_hex(mediator)));
            }
            if kind == MediationKind::TransitiveReset && !address_book::exists(&conn, target)? {
                return Err(KxError::UnknownPeer(short_hex(target)));
            }
            mediations::upsert(&conn, mediator, target, kind.as_str(), unix_now())?;
        }

        let msg = match kind {
            MediationKind::Introduction => PeerMsg::MediateIdentity { target: *target },
            MediationKind::TransitiveReset => PeerMsg::TransitiveReset { target: *target },
        };
        self.send_msg(mediator, &msg).await?;
        info!(
            mediator = %short_hex(mediator),
            target = %short_hex(target),
            kind = kind.as_str(),
            "mediation requested"
        );
        Ok(())
    }

    /// Handle a mediation message from `from`. Returns `false` when `msg`
    /// is not part of the mediation protocol.
    pub async fn handle_mediation(&self, from: &PublicIdentity, msg: &PeerMsg) -> Result<bool> {
        match msg {
            PeerMsg::MediateIdentity { target } => {
                self.mediate(from, target, false).await?;
            }
            PeerMsg::TransitiveReset { target } => {
                self.mediate(from, target, true).await?;
            }
            PeerMsg::InviteRequest {
                requester,
                for_reset,
            } => {
                self.answer_invite_request(from, requester, *for_reset)
                    .await?;
            }
            PeerMsg::RelayInvite {
                to,
                invite,
                for_reset,
            } => {
                let forwarded = PeerMsg::ForwardedInvite {
                    inviter: from.id,
                    invite: invite.clone(),
                    for_reset: *for_reset,
                };
                match self.send_msg(to, &forwarded).await {
                    Err(KxError::UnknownPeer(_)) => {
                        warn!(to = %short_hex(to), "cannot forward invite to unknown peer");
                    }
                    other => other?,
                }
            }
            PeerMsg::ForwardedInvite {
                inviter,
                invite,
                for_reset,
            } => {
                match self
                    .accept_forwarded(from, inviter, invite, *for_reset)
                    .await
                {
                    Err(e) if e.is_absorbed() => {
                        debug!(error = %e, "forwarded invite rejected");
                    }
                    other => other?,
                }
            }
            _ => return Ok(false),
        }
        Ok(true)
    }

    /// Mediator side: ask `target` to produce an invite for `requester`.
    async fn mediate(&self, requester: &PublicIdentity, target: &UserId, for_reset: bool) -> Result<()> {
        if *target == requester.id {
            return Ok(());
        }
        let request = PeerMsg::InviteRequest {
            requester: requester.clone(),
            for_reset,
        };
        match self.send_msg(target, &request).await {
            Err(KxError::UnknownPeer(_)) => {
                warn!(
                    requester = %requester.short_id(),
                    target = %short_hex(target),
                    "mediation requested for a peer we do not know"
                );
                Ok(())
            }
            other => {
                other?;
                debug!(
                    requester = %requester.short_id(),
                    target = %short_hex(target),
                    for_reset,
                    "invite requested on behalf of peer"
                );
                Ok(())
            }
        }
    }

    /// Target side: create an invite addressed to `requester` and hand it
    /// back to the mediator.
    async fn answer_invite_request(
        &self,
        mediator: &PublicIdentity,
        requester: &PublicIdentity,
        for_reset: bool,
    ) -> Result<()> {
        if requester.id == self.identity().id()
            || !requester.id_matches_key(rvmesh_crypto::blake3::user_id)
        {
            warn!(mediator = %mediator.short_id(), "invalid invite request");
            return Ok(());
        }
        let mode = if for_reset {
            let known = {
                let conn = self.db().lock().await;
                address_book::exists(&conn, &requester.id)?
            };
            if !known {
                warn!(requester = %requester.short_id(), "reset requested by unknown peer");
                return Ok(());
            }
            InviteMode::ResetWith(requester.id)
        } else {
            InviteMode::MediatedTo(requester.clone())
        };

        let created = self
            .create_invite_with(mode, Some(mediator.id), false)
            .await?;
        self.send_msg(
            &mediator.id,
            &PeerMsg::RelayInvite {
                to: requester.id,
                invite: created.blob,
                for_reset,
            },
        )
        .await
    }

    /// Requester side: accept an invite relayed by `mediator` if we asked
    /// for one.
    async fn accept_forwarded(
        &self,
        mediator: &PublicIdentity,
        inviter: &UserId,
        blob: &str,
        for_reset: bool,
    ) -> Result<()> {
        let kind = kind_for(for_reset);
        let requested = {
            let conn = self.db().lock().await;
            mediations::exists(&conn, &mediator.id, inviter, kind.as_str())?
        };
        if !requested {
            return Err(KxError::InvalidInvite("unsolicited forwarded invite".into()));
        }
        let invite = Invite::decode(blob)?;
        invite.verify()?;
        if invite.inviter.id != *inviter || invite.is_reset != for_reset {
            return Err(KxError::InvalidInvite("forwarded invite does not match request".into()));
        }
        if invite.mediator != Some(mediator.id) {
            return Err(KxError::InvalidInvite("forwarded invite names another mediator".into()));
        }
        self.accept_decoded(invite).await?;
        Ok(())
    }

    /// Drop mediation requests older than `ttl` seconds and report them.
    pub async fn expire_mediations(&self, now: u64, ttl: u64) -> Result<Vec<MediationRow>> {
        let expired = {
            let conn = self.db().lock().await;
            mediations::take_expired(&conn, now.saturating_sub(ttl))?
        };
        for row in &expired {
            info!(
                mediator = %short_hex(&row.mediator),
                target = %short_hex(&row.target),
                kind = %row.kind,
                "mediation request expired"
            );
            self.events().emit(ClientEvent::MediationExpired {
                mediator: hex::encode(row.mediator),
                target: hex::encode(row.target),
                kind: row.kind.clone(),
            });
        }
        Ok(expired)
    }

    pub async fn pending_mediations(&self) -> Result<Vec<MediationRow>> {
        let conn = self.db().lock().await;
        Ok(mediations::list(&conn)?)
    }
}
