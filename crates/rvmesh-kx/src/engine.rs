//! Handshake state machine and inbound dispatch.

use std::sync::Arc;

use rusqlite::Connection;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use rvmesh_crypto::identity::LocalIdentity;
use rvmesh_crypto::ratchet::{
    open_envelope, seal_envelope, source_final_key, source_ratchet, source_reply_key, HalfRatchet,
    Ratchet,
};
use rvmesh_crypto::rv::random_rv;
use rvmesh_crypto::x25519::X25519StaticSecret;
use rvmesh_db::queries::{accepted_invites, address_book, kx_sessions, mediations, outbox};
use rvmesh_db::KeyedLocks;
use rvmesh_transport::RelayTransport;
use rvmesh_types::events::{ClientEvent, EventBus};
use rvmesh_types::identity::PublicIdentity;
use rvmesh_types::kx::{KxRole, KxStage};
use rvmesh_types::wire::PeerMsg;
use rvmesh_types::{short_hex, unix_now, RvId, UserId};

use crate::invite::{FinalBody, Invite, KxWire, ReplyBody};
use crate::mediation::kind_for;
use crate::record::{KxRecord, PeerRatchetEntry};
use crate::{KxError, Result};

/// Stages a handshake may be collected from once it is too old.
const COLLECTABLE_STAGES: [&str; 3] = ["awaiting_accept", "awaiting_completion", "failed"];

/// Who an invite is for.
#[derive(Clone, Debug)]
pub enum InviteMode {
    /// Anyone holding the blob may accept.
    Open,
    /// Only the given identity may accept.
    MediatedTo(PublicIdentity),
    /// Re-key an existing ratchet with this peer.
    ResetWith(UserId),
}

impl InviteMode {
    fn label(&self) -> &'static str {
        match self {
            InviteMode::Open => "open",
            InviteMode::MediatedTo(_) => "mediated",
            InviteMode::ResetWith(_) => "reset",
        }
    }
}

#[derive(Clone, Debug)]
pub struct CreatedInvite {
    pub initial_rv: RvId,
    pub blob: String,
}

#[derive(Clone, Debug)]
pub struct AcceptedInvite {
    pub initial_rv: RvId,
    pub inviter: PublicIdentity,
    pub reply: Vec<u8>,
    /// The invite had already been accepted; `reply` is the original.
    pub duplicate: bool,
}

/// Result of routing one relay blob.
#[derive(Clone, Debug)]
pub enum Inbound {
    /// A handshake with this peer completed.
    Completed(PublicIdentity),
    /// A reset invite from this peer was accepted.
    ResetAccepted(PublicIdentity),
    /// A decrypted message from an established peer.
    Message { from: PublicIdentity, msg: PeerMsg },
    /// Not for us, a duplicate, or undecodable.
    Ignored,
}

enum Route {
    Reply,
    Final,
    ResetInvite(PublicIdentity),
    Ratchet(UserId),
    Unknown,
}

/// Key exchange engine for one local identity.
///
/// Lock order is session lock, then peer lock, then the database.
pub struct KxEngine<R> {
    db: Arc<Mutex<Connection>>,
    identity: LocalIdentity,
    relay: Arc<R>,
    events: EventBus,
    session_locks: KeyedLocks<RvId>,
    pub(crate) peer_locks: KeyedLocks<UserId>,
}

impl<R: RelayTransport> KxEngine<R> {
    pub fn new(
        db: Arc<Mutex<Connection>>,
        identity: LocalIdentity,
        relay: Arc<R>,
        events: EventBus,
    ) -> Self {
        Self {
            db,
            identity,
            relay,
            events,
            session_locks: KeyedLocks::new(),
            peer_locks: KeyedLocks::new(),
        }
    }

    pub fn identity(&self) -> &LocalIdentity {
        &self.identity
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub(crate) fn db(&self) -> &Arc<Mutex<Connection>> {
        &self.db
    }

    // -----------------------------------------------------------------------
    // Source side
    // -----------------------------------------------------------------------

    /// Create an invite and persist the Source record.
    pub async fn create_invite(&self, mode: InviteMode) -> Result<CreatedInvite> {
        self.create_invite_with(mode, None, true).await
    }

    /// `publish_reset` controls whether a `ResetWith` invite is also
    /// published at the peer's reset RV; mediated resets travel through
    /// the mediator instead.
    pub(crate) async fn create_invite_with(
        &self,
        mode: InviteMode,
        mediator: Option<UserId>,
        publish_reset: bool,
    ) -> Result<CreatedInvite> {
        let now = unix_now();
        let initial_rv = random_rv();
        let label = mode.label();

        let (invitee, is_reset, publish_at) = match mode {
            InviteMode::Open => (None, false, None),
            InviteMode::MediatedTo(target) => {
                if target.id == self.identity.id() {
                    return Err(KxError::InvalidRequest("cannot invite ourselves".into()));
                }
                if !target.id_matches_key(rvmesh_crypto::blake3::user_id) {
                    return Err(KxError::InvalidRequest("identity does not match key".into()));
                }
                (Some(target), false, None)
            }
            InviteMode::ResetWith(peer) => {
                let entry = self.load_entry(&peer).await?;
                let at = publish_reset.then_some(entry.their_reset_rv);
                (Some(entry.peer), true, at)
            }
        };

        let invite = Invite::new_signed(
            &self.identity,
            initial_rv,
            invitee.as_ref().map(|p| p.id),
            is_reset,
            mediator,
            now,
        );
        let blob = invite.encode()?;

        let record = KxRecord {
            role: KxRole::Source,
            stage: KxStage::AwaitingAccept,
            peer: None,
            initial_rv,
            step3_rv: None,
            half_ratchet: None,
            my_reset_rv: random_rv(),
            created_at: now,
            invitee,
            is_reset_request: is_reset,
            mediator_id: mediator,
            reply: None,
            failure: None,
        };
        let frame = match publish_at {
            Some(rv) => Some((rv, KxWire::ResetInvite { invite: blob.clone() }.to_bytes()?)),
            None => None,
        };

        let _session = self.session_locks.lock(&initial_rv).await;
        let pending = {
            let conn = self.db.lock().await;
            rvmesh_db::transaction(&conn, |tx| -> Result<Option<i64>> {
                if let Some(peer) = record.counterpart() {
                    supersede(tx, &peer.id, KxRole::Source, &initial_rv)?;
                }
                kx_sessions::upsert(tx, &record.session_keys(), &record)?;
                Ok(match &frame {
                    Some((rv, bytes)) => Some(outbox::enqueue(tx, rv, bytes, now)?),
                    None => None,
                })
            })?
        };
        if let (Some(id), Some((rv, bytes))) = (pending, frame) {
            self.flush(id, rv, bytes).await?;
        }

        info!(rv = %short_hex(&initial_rv), mode = label, "invite created");
        Ok(CreatedInvite { initial_rv, blob })
    }

    /// Process the Target's reply at `initial_rv` and send the final message.
    pub async fn complete_from_reply(&self, initial_rv: &RvId, blob: &[u8]) -> Result<PublicIdentity> {
        let _session = self.session_locks.lock(initial_rv).await;

        let mut record = self
            .load_record(initial_rv)
            .await?
            .filter(|r| r.role == KxRole::Source && r.stage == KxStage::AwaitingAccept)
            .ok_or(KxError::StaleSession)?;

        let KxWire::Reply { target_eph, sealed } = KxWire::from_bytes(blob)? else {
            return Err(KxError::InvalidInvite("expected reply frame".into()));
        };
        let reply_key = source_reply_key(self.identity.kx_secret(), &target_eph, initial_rv);
        let plaintext = open_envelope(&reply_key, initial_rv, &sealed)
            .map_err(|_| KxError::InvalidInvite("reply does not open".into()))?;
        let body: ReplyBody = serde_json::from_slice(&plaintext)
            .map_err(|e| KxError::InvalidInvite(format!("malformed reply: {e}")))?;
        body.verify(initial_rv, &target_eph)?;

        if body.target.id == self.identity.id() {
            return Err(KxError::InvalidInvite("reply from ourselves".into()));
        }
        if let Some(expected) = &record.invitee {
            if expected.id != body.target.id {
                let reason = format!("reply from unexpected identity {}", body.target.short_id());
                record.fail(reason.clone())?;
                self.store_record(&record).await?;
                self.events.emit(ClientEvent::KxFailed {
                    session: hex::encode(initial_rv),
                    reason: reason.clone(),
                });
                warn!(rv = %short_hex(initial_rv), "{reason}");
                return Err(KxError::InvalidInvite(reason));
            }
        }

        let my_eph = X25519StaticSecret::random();
        let ratchet = source_ratchet(
            self.identity.kx_secret(),
            &my_eph,
            &target_eph,
            initial_rv,
            &body.step3_rv,
        );
        let final_body = FinalBody::new_signed(
            &self.identity,
            &body.step3_rv,
            &my_eph.public_key(),
            record.my_reset_rv,
        );
        let final_plain =
            serde_json::to_vec(&final_body).map_err(|e| KxError::Encoding(e.to_string()))?;
        let final_key = source_final_key(&my_eph, &target_eph, &body.step3_rv);
        let final_frame = KxWire::Final {
            source_eph: my_eph.public_key(),
            sealed: seal_envelope(&final_key, &body.step3_rv, &final_plain)?,
        }
        .to_bytes()?;

        record.peer = Some(body.target.clone());
        record.step3_rv = Some(body.step3_rv);
        record.advance(KxStage::Completed)?;

        self.promote(
            &record,
            body.target,
            ratchet,
            body.reset_rv,
            Some((body.step3_rv, final_frame)),
        )
        .await
    }

    // -----------------------------------------------------------------------
    // Target side
    // -----------------------------------------------------------------------

    /// Accept an invite blob and publish the reply.
    ///
    /// Accepting the same invite twice returns the original reply without
    /// creating a second session.
    pub async fn accept_invite(&self, blob: &str) -> Result<AcceptedInvite> {
        let invite = Invite::decode(blob)?;
        invite.verify()?;
        self.accept_decoded(invite).await
    }

    pub(crate) async fn accept_decoded(&self, invite: Invite) -> Result<AcceptedInvite> {
        let me = self.identity.id();
        if invite.inviter.id == me {
            return Err(KxError::InvalidInvite("invite from ourselves".into()));
        }
        if invite.invitee.is_some_and(|id| id != me) {
            return Err(KxError::InvalidInvite("invite addressed to another user".into()));
        }

        let initial_rv = invite.initial_rv;
        let _session = self.session_locks.lock(&initial_rv).await;

        let completed = {
            let conn = self.db.lock().await;
            accepted_invites::get(&conn, &initial_rv)?
        };
        if let Some(row) = completed {
            debug!(rv = %short_hex(&initial_rv), "invite already accepted and completed");
            return Ok(AcceptedInvite {
                initial_rv,
                inviter: invite.inviter,
                reply: row.reply,
                duplicate: true,
            });
        }

        if let Some(existing) = self.load_record(&initial_rv).await? {
            return match (existing.role, existing.reply) {
                (KxRole::Target, Some(reply)) => {
                    debug!(rv = %short_hex(&initial_rv), "invite already accepted");
                    Ok(AcceptedInvite {
                        initial_rv,
                        inviter: invite.inviter,
                        reply,
                        duplicate: true,
                    })
                }
                _ => Err(KxError::InvalidInvite("rendezvous already in use".into())),
            };
        }

        let eph = X25519StaticSecret::random();
        let half = HalfRatchet::new(&eph, &invite.inviter.kx_key);
        let step3_rv = random_rv();
        let my_reset_rv = random_rv();
        let body = ReplyBody::new_signed(
            &self.identity,
            &initial_rv,
            &half.eph_public(),
            step3_rv,
            my_reset_rv,
        );
        let plain = serde_json::to_vec(&body).map_err(|e| KxError::Encoding(e.to_string()))?;
        let reply = KxWire::Reply {
            target_eph: half.eph_public(),
            sealed: seal_envelope(&half.reply_key(&initial_rv), &initial_rv, &plain)?,
        }
        .to_bytes()?;

        let now = unix_now();
        let record = KxRecord {
            role: KxRole::Target,
            stage: KxStage::AwaitingCompletion,
            peer: Some(invite.inviter.clone()),
            initial_rv,
            step3_rv: Some(step3_rv),
            half_ratchet: Some(half),
            my_reset_rv,
            created_at: now,
            invitee: None,
            is_reset_request: invite.is_reset,
            mediator_id: invite.mediator,
            reply: Some(reply.clone()),
            failure: None,
        };

        let outbox_id = {
            let conn = self.db.lock().await;
            rvmesh_db::transaction(&conn, |tx| -> Result<i64> {
                supersede(tx, &invite.inviter.id, KxRole::Target, &initial_rv)?;
                kx_sessions::upsert(tx, &record.session_keys(), &record)?;
                Ok(outbox::enqueue(tx, &initial_rv, &reply, now)?)
            })?
        };
        self.flush(outbox_id, initial_rv, reply.clone()).await?;

        info!(
            rv = %short_hex(&initial_rv),
            inviter = %invite.inviter.short_id(),
            reset = invite.is_reset,
            "invite accepted"
        );
        Ok(AcceptedInvite {
            initial_rv,
            inviter: invite.inviter,
            reply,
            duplicate: false,
        })
    }

    /// Process the Source's final message at `step3_rv`.
    pub async fn complete_from_final(&self, step3_rv: &RvId, blob: &[u8]) -> Result<PublicIdentity> {
        let initial_rv = {
            let conn = self.db.lock().await;
            kx_sessions::get_by_step3::<KxRecord>(&conn, step3_rv)?
                .map(|r| r.initial_rv)
                .ok_or(KxError::StaleSession)?
        };
        let _session = self.session_locks.lock(&initial_rv).await;

        let mut record = self
            .load_record(&initial_rv)
            .await?
            .filter(|r| {
                r.role == KxRole::Target
                    && r.stage == KxStage::AwaitingCompletion
                    && r.step3_rv.as_ref() == Some(step3_rv)
            })
            .ok_or(KxError::StaleSession)?;
        let (Some(half), Some(peer)) = (record.half_ratchet.clone(), record.peer.clone()) else {
            return Err(KxError::StaleSession);
        };

        let KxWire::Final { source_eph, sealed } = KxWire::from_bytes(blob)? else {
            return Err(KxError::InvalidInvite("expected final frame".into()));
        };
        let plaintext = open_envelope(&half.final_key(&source_eph, step3_rv), step3_rv, &sealed)
            .map_err(|_| KxError::InvalidInvite("final does not open".into()))?;
        let body: FinalBody = serde_json::from_slice(&plaintext)
            .map_err(|e| KxError::InvalidInvite(format!("malformed final: {e}")))?;
        body.verify(&peer, step3_rv, &source_eph)?;

        let ratchet = half.complete(&source_eph, &initial_rv, step3_rv);
        record.advance(KxStage::Completed)?;
        self.promote(&record, peer, ratchet, body.reset_rv, None).await
    }

    /// Replace the session record with a ratchet entry in one transaction.
    async fn promote(
        &self,
        record: &KxRecord,
        peer: PublicIdentity,
        ratchet: Ratchet,
        their_reset_rv: RvId,
        publish: Option<(RvId, Vec<u8>)>,
    ) -> Result<PublicIdentity> {
        let now = unix_now();
        let _peer = self.peer_locks.lock(&peer.id).await;

        let (is_reset, pending, resolved) = {
            let conn = self.db.lock().await;
            rvmesh_db::transaction(&conn, |tx| -> Result<_> {
                let existing: Option<PeerRatchetEntry> = address_book::get(tx, &peer.id)?;
                let is_reset = existing.is_some();
                let entry = match existing {
                    Some(mut entry) => {
                        entry.peer = peer.clone();
                        entry.ratchet = ratchet;
                        entry.my_reset_rv = record.my_reset_rv;
                        entry.their_reset_rv = their_reset_rv;
                        entry.reset_count += 1;
                        entry
                    }
                    None => PeerRatchetEntry {
                        peer: peer.clone(),
                        ratchet,
                        my_reset_rv: record.my_reset_rv,
                        their_reset_rv,
                        ignored: false,
                        established_at: now,
                        reset_count: 0,
                    },
                };
                kx_sessions::delete(tx, &record.initial_rv)?;
                address_book::upsert(tx, &peer.id, &peer.nick, &entry, now)?;
                if let (KxRole::Target, Some(reply)) = (record.role, &record.reply) {
                    accepted_invites::insert(tx, &record.initial_rv, &peer.id, reply, now)?;
                }
                let resolved = match record.mediator_id {
                    Some(mediator) => {
                        let kind = kind_for(record.is_reset_request);
                        mediations::resolve(tx, &mediator, &peer.id, kind.as_str())?
                            .then_some((mediator, kind))
                    }
                    None => None,
                };
                let pending = match &publish {
                    Some((rv, bytes)) => Some(outbox::enqueue(tx, rv, bytes, now)?),
                    None => None,
                };
                Ok((is_reset, pending, resolved))
            })?
        };

        if let (Some(id), Some((rv, bytes))) = (pending, publish) {
            self.flush(id, rv, bytes).await?;
        }
        if let Some((mediator, kind)) = resolved {
            debug!(mediator = %short_hex(&mediator), kind = kind.as_str(), "mediation resolved");
        }

        info!(
            peer = %peer.short_id(),
            nick = %peer.nick,
            role = record.role.as_str(),
            reset = is_reset,
            "key exchange completed"
        );
        self.events.emit(ClientEvent::KxCompleted {
            peer: hex::encode(peer.id),
            nick: peer.nick.clone(),
            is_reset,
        });
        Ok(peer)
    }

    // -----------------------------------------------------------------------
    // Dispatch
    // -----------------------------------------------------------------------

    /// Route a blob received at `rv`.
    ///
    /// Duplicate and stale deliveries are absorbed as [`Inbound::Ignored`];
    /// only store failures surface as errors.
    pub async fn dispatch(&self, rv: &RvId, blob: &[u8]) -> Result<Inbound> {
        let outcome = match self.route(rv).await? {
            Route::Reply => self.complete_from_reply(rv, blob).await.map(Inbound::Completed),
            Route::Final => self.complete_from_final(rv, blob).await.map(Inbound::Completed),
            Route::ResetInvite(peer) => self
                .accept_reset_invite(&peer, blob)
                .await
                .map(|accepted| {
                    if accepted.duplicate {
                        Inbound::Ignored
                    } else {
                        Inbound::ResetAccepted(peer)
                    }
                }),
            Route::Ratchet(peer) => self.receive(&peer, rv, blob).await,
            Route::Unknown => Ok(Inbound::Ignored),
        };
        match outcome {
            Err(e) if e.is_absorbed() => {
                debug!(rv = %short_hex(rv), error = %e, "absorbed inbound blob");
                Ok(Inbound::Ignored)
            }
            other => other,
        }
    }

    async fn route(&self, rv: &RvId) -> Result<Route> {
        let conn = self.db.lock().await;
        if let Some(rec) = kx_sessions::get::<KxRecord>(&conn, rv)? {
            if rec.role == KxRole::Source {
                return Ok(Route::Reply);
            }
        }
        if kx_sessions::get_by_step3::<KxRecord>(&conn, rv)?.is_some() {
            return Ok(Route::Final);
        }
        let entries: Vec<PeerRatchetEntry> = address_book::list(&conn)?;
        for entry in entries {
            if entry.my_reset_rv == *rv {
                return Ok(Route::ResetInvite(entry.peer));
            }
            if entry.ratchet.recv_rvs().contains(rv) {
                return Ok(Route::Ratchet(entry.peer.id));
            }
        }
        Ok(Route::Unknown)
    }

    async fn accept_reset_invite(&self, from: &PublicIdentity, blob: &[u8]) -> Result<AcceptedInvite> {
        let KxWire::ResetInvite { invite } = KxWire::from_bytes(blob)? else {
            return Err(KxError::InvalidInvite("expected reset invite".into()));
        };
        let invite = Invite::decode(&invite)?;
        invite.verify()?;
        if invite.inviter.id != from.id || !invite.is_reset {
            return Err(KxError::InvalidInvite("reset invite from wrong peer".into()));
        }
        self.accept_decoded(invite).await
    }

    async fn receive(&self, peer: &UserId, rv: &RvId, blob: &[u8]) -> Result<Inbound> {
        let _peer = self.peer_locks.lock(peer).await;
        let conn = self.db.lock().await;
        let Some(mut entry) = address_book::get::<PeerRatchetEntry>(&conn, peer)? else {
            return Ok(Inbound::Ignored);
        };
        let plaintext = match entry.ratchet.decrypt(rv, blob) {
            Ok(p) => p,
            Err(e) => {
                debug!(peer = %short_hex(peer), error = %e, "undecryptable message");
                return Ok(Inbound::Ignored);
            }
        };
        address_book::upsert(&conn, peer, &entry.peer.nick, &entry, unix_now())?;
        drop(conn);

        if entry.ignored {
            debug!(peer = %short_hex(peer), "dropping message from ignored peer");
            return Ok(Inbound::Ignored);
        }
        match PeerMsg::from_bytes(&plaintext) {
            Ok(msg) => Ok(Inbound::Message {
                from: entry.peer,
                msg,
            }),
            Err(e) => {
                warn!(peer = %short_hex(peer), error = %e, "malformed peer message");
                Ok(Inbound::Ignored)
            }
        }
    }

    /// Every RV the router must be subscribed to.
    pub async fn watched_rvs(&self) -> Result<Vec<RvId>> {
        let conn = self.db.lock().await;
        let mut rvs = Vec::new();
        for rec in kx_sessions::list::<KxRecord>(&conn)? {
            match (rec.role, rec.stage) {
                (KxRole::Source, KxStage::AwaitingAccept) => rvs.push(rec.initial_rv),
                (KxRole::Target, KxStage::AwaitingCompletion) => rvs.extend(rec.step3_rv),
                _ => {}
            }
        }
        for entry in address_book::list::<PeerRatchetEntry>(&conn)? {
            rvs.push(entry.my_reset_rv);
            rvs.extend(entry.ratchet.recv_rvs());
        }
        Ok(rvs)
    }

    // -----------------------------------------------------------------------
    // Queries and maintenance
    // -----------------------------------------------------------------------

    pub async fn session_stage(&self, initial_rv: &RvId) -> Result<KxStage> {
        Ok(self
            .load_record(initial_rv)
            .await?
            .map(|r| r.stage)
            .unwrap_or(KxStage::Unknown))
    }

    /// Stage of the most recent handshake with `peer`, or `Completed` if
    /// only an established ratchet remains.
    pub async fn peer_stage(&self, peer: &UserId) -> Result<KxStage> {
        let conn = self.db.lock().await;
        let mut latest: Option<KxRecord> = None;
        for role in [KxRole::Source, KxRole::Target] {
            for rv in kx_sessions::rvs_for_peer(&conn, peer, role.as_str())? {
                if let Some(rec) = kx_sessions::get::<KxRecord>(&conn, &rv)? {
                    if latest.as_ref().map_or(true, |l| rec.created_at >= l.created_at) {
                        latest = Some(rec);
                    }
                }
            }
        }
        if let Some(rec) = latest {
            return Ok(rec.stage);
        }
        if address_book::exists(&conn, peer)? {
            Ok(KxStage::Completed)
        } else {
            Ok(KxStage::Unknown)
        }
    }

    /// Delete handshakes created more than `ttl` seconds before `now`.
    pub async fn gc_expired(&self, now: u64, ttl: u64) -> Result<usize> {
        let cutoff = now.saturating_sub(ttl);
        let rvs = {
            let conn = self.db.lock().await;
            kx_sessions::created_before(&conn, cutoff, &COLLECTABLE_STAGES)?
        };
        let mut removed = 0;
        for rv in rvs {
            let _session = self.session_locks.lock(&rv).await;
            let conn = self.db.lock().await;
            let stale = kx_sessions::get::<KxRecord>(&conn, &rv)?
                .is_some_and(|r| r.created_at < cutoff);
            if stale && kx_sessions::delete(&conn, &rv)? {
                debug!(rv = %short_hex(&rv), "expired key exchange removed");
                removed += 1;
            }
        }
        if removed > 0 {
            info!(removed, "expired key exchanges collected");
        }
        Ok(removed)
    }

    /// Republish outbox rows left behind by an interrupted publish.
    pub async fn resend_pending(&self) -> Result<usize> {
        let rows = {
            let conn = self.db.lock().await;
            outbox::pending(&conn)?
        };
        let mut sent = 0;
        for row in rows {
            self.flush(row.id, row.rv, row.payload).await?;
            sent += 1;
        }
        Ok(sent)
    }

    pub async fn set_ignored(&self, peer: &UserId, ignored: bool) -> Result<()> {
        let _peer = self.peer_locks.lock(peer).await;
        let conn = self.db.lock().await;
        let mut entry: PeerRatchetEntry = address_book::get(&conn, peer)?
            .ok_or_else(|| KxError::UnknownPeer(short_hex(peer)))?;
        entry.ignored = ignored;
        address_book::upsert(&conn, peer, &entry.peer.nick, &entry, unix_now())?;
        info!(peer = %short_hex(peer), ignored, "peer ignore flag updated");
        Ok(())
    }

    pub async fn remove_peer(&self, peer: &UserId) -> Result<bool> {
        let _peer = self.peer_locks.lock(peer).await;
        let conn = self.db.lock().await;
        Ok(address_book::remove(&conn, peer)?)
    }

    pub(crate) async fn load_entry(&self, peer: &UserId) -> Result<PeerRatchetEntry> {
        let conn = self.db.lock().await;
        address_book::get(&conn, peer)?.ok_or_else(|| KxError::UnknownPeer(short_hex(peer)))
    }

    async fn load_record(&self, initial_rv: &RvId) -> Result<Option<KxRecord>> {
        let conn = self.db.lock().await;
        Ok(kx_sessions::get(&conn, initial_rv)?)
    }

    async fn store_record(&self, record: &KxRecord) -> Result<()> {
        let conn = self.db.lock().await;
        kx_sessions::upsert(&conn, &record.session_keys(), record)?;
        Ok(())
    }

    /// Publish an outbox row and drop it once the relay accepted it.
    ///
    /// A relay failure leaves the row for [`Self::resend_pending`].
    pub(crate) async fn flush(&self, id: i64, rv: RvId, payload: Vec<u8>) -> Result<()> {
        match self.relay.publish(rv, payload).await {
            Ok(()) => {
                let conn = self.db.lock().await;
                outbox::remove(&conn, id)?;
            }
            Err(e) => warn!(rv = %short_hex(&rv), error = %e, "publish failed; left in outbox"),
        }
        Ok(())
    }
}

/// Remove older sessions with the same peer and role.
fn supersede(conn: &Connection, peer: &UserId, role: KxRole, keep: &RvId) -> Result<()> {
    for rv in kx_sessions::rvs_for_peer(conn, peer, role.as_str())? {
        if rv != *keep {
            kx_sessions::delete(conn, &rv)?;
            debug!(rv = %short_hex(&rv), "superseded older key exchange");
        }
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use rvmesh_transport::MemoryRelay;

    pub(crate) type Node = KxEngine<MemoryRelay>;

    pub(crate) fn node(relay: &Arc<MemoryRelay>, nick: &str) -> Node {
        let conn = rvmesh_db::open_memory().expect("open db");
        KxEngine::new(
            Arc::new(Mutex::new(conn)),
            LocalIdentity::generate(nick),
            relay.clone(),
            EventBus::new(64),
        )
    }

    /// Deliver every stored blob to every node until the relay is empty.
    pub(crate) async fn pump(relay: &MemoryRelay, nodes: &[&Node]) -> Vec<(usize, Inbound)> {
        let mut seen = Vec::new();
        loop {
            let rvs = relay.occupied();
            if rvs.is_empty() {
                return seen;
            }
            for rv in rvs {
                for blob in relay.drain(&rv) {
                    for (i, n) in nodes.iter().enumerate() {
                        let inbound = n.dispatch(&rv, &blob).await.expect("dispatch");
                        if !matches!(inbound, Inbound::Ignored) {
                            seen.push((i, inbound));
                        }
                    }
                }
            }
        }
    }

    pub(crate) async fn connect(relay: &MemoryRelay, a: &Node, b: &Node) {
        let invite = a.create_invite(InviteMode::Open).await.expect("invite");
        b.accept_invite(&invite.blob).await.expect("accept");
        pump(relay, &[a, b]).await;
    }

    #[tokio::test]
    async fn test_handshake_establishes_matching_ratchets() {
        let relay = Arc::new(MemoryRelay::new());
        let alice = node(&relay, "alice");
        let bob = node(&relay, "bob");
        let mut alice_events = alice.events().subscribe();

        let invite = alice.create_invite(InviteMode::Open).await.expect("invite");
        assert_eq!(
            alice.session_stage(&invite.initial_rv).await.expect("stage"),
            KxStage::AwaitingAccept
        );
        let accepted = bob.accept_invite(&invite.blob).await.expect("accept");
        assert!(!accepted.duplicate);
        assert_eq!(accepted.inviter.id, alice.identity().id());

        let seen = pump(&relay, &[&alice, &bob]).await;
        assert_eq!(seen.len(), 2);

        let a_entry = alice.load_entry(&bob.identity().id()).await.expect("alice entry");
        let b_entry = bob.load_entry(&alice.identity().id()).await.expect("bob entry");
        assert_eq!(a_entry.ratchet.fingerprint(), b_entry.ratchet.fingerprint());
        assert_eq!(a_entry.their_reset_rv, b_entry.my_reset_rv);
        assert_eq!(b_entry.their_reset_rv, a_entry.my_reset_rv);

        assert_eq!(
            alice.session_stage(&invite.initial_rv).await.expect("stage"),
            KxStage::Unknown
        );
        assert_eq!(
            bob.peer_stage(&alice.identity().id()).await.expect("stage"),
            KxStage::Completed
        );
        let ev = alice_events.recv().await.expect("event");
        assert!(matches!(ev.event, ClientEvent::KxCompleted { is_reset: false, .. }));
    }

    #[tokio::test]
    async fn test_concurrent_accept_yields_one_session() {
        let relay = Arc::new(MemoryRelay::new());
        let alice = node(&relay, "alice");
        let bob = node(&relay, "bob");
        let invite = alice.create_invite(InviteMode::Open).await.expect("invite");

        let (first, second) = tokio::join!(
            bob.accept_invite(&invite.blob),
            bob.accept_invite(&invite.blob)
        );
        let (first, second) = (first.expect("first"), second.expect("second"));
        assert_eq!(first.reply, second.reply);
        assert!(first.duplicate != second.duplicate);

        let conn = bob.db().lock().await;
        let sessions: Vec<KxRecord> = kx_sessions::list(&conn).expect("list");
        assert_eq!(sessions.len(), 1);
    }

    #[tokio::test]
    async fn test_accept_after_completion_is_replay() {
        let relay = Arc::new(MemoryRelay::new());
        let alice = node(&relay, "alice");
        let bob = node(&relay, "bob");
        let invite = alice.create_invite(InviteMode::Open).await.expect("invite");
        let first = bob.accept_invite(&invite.blob).await.expect("accept");
        pump(&relay, &[&alice, &bob]).await;
        let alice_id = alice.identity().id();
        assert_eq!(bob.peer_stage(&alice_id).await.expect("stage"), KxStage::Completed);

        let again = bob.accept_invite(&invite.blob).await.expect("accept again");
        assert!(again.duplicate);
        assert_eq!(again.reply, first.reply);
        assert_eq!(bob.peer_stage(&alice_id).await.expect("stage"), KxStage::Completed);
        assert!(relay.peek(&invite.initial_rv).is_empty());

        let conn = bob.db().lock().await;
        let sessions: Vec<KxRecord> = kx_sessions::list(&conn).expect("list");
        assert!(sessions.is_empty());
    }

    #[tokio::test]
    async fn test_own_invite_rejected() {
        let relay = Arc::new(MemoryRelay::new());
        let alice = node(&relay, "alice");
        let invite = alice.create_invite(InviteMode::Open).await.expect("invite");
        assert!(matches!(
            alice.accept_invite(&invite.blob).await,
            Err(KxError::InvalidInvite(_))
        ));
    }

    #[tokio::test]
    async fn test_addressed_invite_rejects_other_user() {
        let relay = Arc::new(MemoryRelay::new());
        let alice = node(&relay, "alice");
        let bob = node(&relay, "bob");
        let carol = node(&relay, "carol");
        let invite = alice
            .create_invite(InviteMode::MediatedTo(carol.identity().public()))
            .await
            .expect("invite");
        assert!(matches!(
            bob.accept_invite(&invite.blob).await,
            Err(KxError::InvalidInvite(_))
        ));
        carol.accept_invite(&invite.blob).await.expect("carol accepts");
    }

    #[tokio::test]
    async fn test_replayed_reply_is_ignored() {
        let relay = Arc::new(MemoryRelay::new());
        let alice = node(&relay, "alice");
        let bob = node(&relay, "bob");
        let invite = alice.create_invite(InviteMode::Open).await.expect("invite");
        let accepted = bob.accept_invite(&invite.blob).await.expect("accept");
        pump(&relay, &[&alice, &bob]).await;

        let before = alice.load_entry(&bob.identity().id()).await.expect("entry");
        let again = alice
            .dispatch(&invite.initial_rv, &accepted.reply)
            .await
            .expect("dispatch");
        assert!(matches!(again, Inbound::Ignored));
        let after = alice.load_entry(&bob.identity().id()).await.expect("entry");
        assert_eq!(before.ratchet.fingerprint(), after.ratchet.fingerprint());
        assert_eq!(after.reset_count, 0);
    }

    #[tokio::test]
    async fn test_reset_replaces_ratchet_in_place() {
        let relay = Arc::new(MemoryRelay::new());
        let alice = node(&relay, "alice");
        let bob = node(&relay, "bob");
        connect(&relay, &alice, &bob).await;
        let old = alice.load_entry(&bob.identity().id()).await.expect("entry");

        alice
            .create_invite(InviteMode::ResetWith(bob.identity().id()))
            .await
            .expect("reset invite");
        let seen = pump(&relay, &[&alice, &bob]).await;
        assert!(seen
            .iter()
            .any(|(i, ev)| *i == 1 && matches!(ev, Inbound::ResetAccepted(_))));

        let a_entry = alice.load_entry(&bob.identity().id()).await.expect("entry");
        let b_entry = bob.load_entry(&alice.identity().id()).await.expect("entry");
        assert_ne!(a_entry.ratchet.fingerprint(), old.ratchet.fingerprint());
        assert_eq!(a_entry.ratchet.fingerprint(), b_entry.ratchet.fingerprint());
        assert_eq!(a_entry.reset_count, 1);
        assert_eq!(a_entry.established_at, old.established_at);
    }

    #[tokio::test]
    async fn test_reset_with_unknown_peer_fails() {
        let relay = Arc::new(MemoryRelay::new());
        let alice = node(&relay, "alice");
        assert!(matches!(
            alice.create_invite(InviteMode::ResetWith([7u8; 32])).await,
            Err(KxError::UnknownPeer(_))
        ));
    }

    #[tokio::test]
    async fn test_gc_removes_only_expired() {
        let relay = Arc::new(MemoryRelay::new());
        let alice = node(&relay, "alice");
        let invite = alice.create_invite(InviteMode::Open).await.expect("invite");

        assert_eq!(alice.gc_expired(unix_now(), 3600).await.expect("gc"), 0);
        assert_eq!(alice.gc_expired(unix_now() + 7200, 3600).await.expect("gc"), 1);
        assert_eq!(
            alice.session_stage(&invite.initial_rv).await.expect("stage"),
            KxStage::Unknown
        );
    }

    #[tokio::test]
    async fn test_newer_invite_supersedes_older_for_same_invitee() {
        let relay = Arc::new(MemoryRelay::new());
        let alice = node(&relay, "alice");
        let bob = node(&relay, "bob");
        let first = alice
            .create_invite(InviteMode::MediatedTo(bob.identity().public()))
            .await
            .expect("first");
        let second = alice
            .create_invite(InviteMode::MediatedTo(bob.identity().public()))
            .await
            .expect("second");
        assert_eq!(
            alice.session_stage(&first.initial_rv).await.expect("stage"),
            KxStage::Unknown
        );
        assert_eq!(
            alice.session_stage(&second.initial_rv).await.expect("stage"),
            KxStage::AwaitingAccept
        );
    }

    #[tokio::test]
    async fn test_watched_rvs_track_handshake() {
        let relay = Arc::new(MemoryRelay::new());
        let alice = node(&relay, "alice");
        let bob = node(&relay, "bob");
        let invite = alice.create_invite(InviteMode::Open).await.expect("invite");
        assert!(alice
            .watched_rvs()
            .await
            .expect("rvs")
            .contains(&invite.initial_rv));

        connect(&relay, &alice, &bob).await;
        let entry = alice.load_entry(&bob.identity().id()).await.expect("entry");
        let rvs = alice.watched_rvs().await.expect("rvs");
        assert!(rvs.contains(&entry.my_reset_rv));
        assert!(rvs.iter().any(|rv| entry.ratchet.recv_rvs().contains(rv)));
    }
}
