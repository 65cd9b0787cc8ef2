//! Group rosters shared with established peers.
//!
//! The admin authors every Join, Kick and Dissolve; any member may author
//! its own Part. The author applies the update locally first and then sends
//! it to every other member. A newly joined member gets the full roster as
//! a snapshot instead.

use std::sync::Arc;

use rand::RngCore;
use rusqlite::Connection;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use rvmesh_db::queries::groups;
use rvmesh_db::{DbError, KeyedLocks};
use rvmesh_transport::{PeerMessenger, TransportError};
use rvmesh_types::events::{ClientEvent, EventBus};
use rvmesh_types::group::{ApplyOutcome, GroupRoster, RosterChange, RosterError, RosterUpdate};
use rvmesh_types::wire::PeerMsg;
use rvmesh_types::{short_hex, GroupId, UserId};

#[derive(Debug, thiserror::Error)]
pub enum GroupError {
    #[error("unknown group {0}")]
    UnknownGroup(String),

    #[error("roster error: {0}")]
    Roster(#[from] RosterError),

    #[error("database error: {0}")]
    Db(#[from] DbError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

impl GroupError {
    pub fn is_fatal(&self) -> bool {
        match self {
            GroupError::Db(e) => e.is_fatal(),
            GroupError::Transport(e) => e.is_fatal(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, GroupError>;

pub struct GroupService<M> {
    db: Arc<Mutex<Connection>>,
    messenger: Arc<M>,
    events: EventBus,
    me: UserId,
    locks: KeyedLocks<GroupId>,
}

impl<M: PeerMessenger> GroupService<M> {
    pub fn new(db: Arc<Mutex<Connection>>, messenger: Arc<M>, events: EventBus, me: UserId) -> Self {
        Self {
            db,
            messenger,
            events,
            me,
            locks: KeyedLocks::new(),
        }
    }

    /// Create a group administered by the local identity.
    pub async fn create_group(&self, name: &str) -> Result<GroupRoster> {
        let mut id = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut id);
        let roster = GroupRoster::new(id, name, self.me);
        self.store(&roster).await?;
        info!(group = %short_hex(&id), name, "group created");
        Ok(roster)
    }

    pub async fn get(&self, group_id: &GroupId) -> Result<Option<GroupRoster>> {
        let conn = self.db.lock().await;
        Ok(groups::get(&conn, group_id)?)
    }

    pub async fn list(&self) -> Result<Vec<GroupRoster>> {
        let conn = self.db.lock().await;
        Ok(groups::list(&conn)?)
    }

    /// Author `change` as the local identity and distribute it.
    pub async fn apply_local(&self, group_id: &GroupId, change: RosterChange) -> Result<GroupRoster> {
        let (roster, update, recipients) = {
            let _guard = self.locks.lock(group_id).await;
            let mut roster = self
                .get(group_id)
                .await?
                .ok_or_else(|| GroupError::UnknownGroup(hex::encode(group_id)))?;
            // Everyone who was a member before the change hears about it.
            let recipients: Vec<UserId> = roster
                .members
                .iter()
                .filter(|m| **m != self.me)
                .copied()
                .collect();
            let update = RosterUpdate {
                group_id: *group_id,
                generation: roster.generation + 1,
                change,
            };
            roster.apply(&update, &self.me)?;
            self.store(&roster).await?;
            (roster, update, recipients)
        };
        self.emit(&roster);

        for peer in &recipients {
            let msg = PeerMsg::GroupUpdate {
                update: update.clone(),
            };
            if let Err(e) = self.messenger.send(peer, msg).await {
                warn!(peer = %short_hex(peer), error = %e, "group update not sent");
            }
        }
        if let RosterChange::Join { member } = &update.change {
            self.messenger
                .send(
                    member,
                    PeerMsg::GroupSnapshot {
                        roster: roster.clone(),
                    },
                )
                .await?;
        }
        Ok(roster)
    }

    /// Apply an update received from `from`.
    pub async fn on_update(&self, from: &UserId, update: &RosterUpdate) -> Result<ApplyOutcome> {
        let _guard = self.locks.lock(&update.group_id).await;
        let Some(mut roster) = self.get(&update.group_id).await? else {
            debug!(group = %short_hex(&update.group_id), "update for unknown group");
            return Err(GroupError::UnknownGroup(hex::encode(update.group_id)));
        };
        if !roster.is_member(from) {
            return Err(RosterError::NotMember.into());
        }
        let outcome = roster.apply(update, from)?;
        if outcome == ApplyOutcome::Applied {
            self.store(&roster).await?;
            self.emit(&roster);
            debug!(
                group = %short_hex(&roster.id),
                generation = roster.generation,
                "group update applied"
            );
        }
        Ok(outcome)
    }

    /// Adopt a full roster sent by its admin.
    pub async fn on_snapshot(&self, from: &UserId, roster: GroupRoster) -> Result<bool> {
        if roster.admin != *from {
            return Err(RosterError::NotAdmin.into());
        }
        roster.validate()?;
        if !roster.is_member(&self.me) {
            return Err(RosterError::NotMember.into());
        }
        let _guard = self.locks.lock(&roster.id).await;
        if let Some(current) = self.get(&roster.id).await? {
            if current.admin != roster.admin {
                return Err(RosterError::NotAdmin.into());
            }
            if current.generation >= roster.generation {
                return Ok(false);
            }
        }
        self.store(&roster).await?;
        self.emit(&roster);
        info!(group = %short_hex(&roster.id), name = %roster.name, "joined group");
        Ok(true)
    }

    async fn store(&self, roster: &GroupRoster) -> Result<()> {
        let conn = self.db.lock().await;
        groups::upsert(&conn, &roster.id, roster.generation, roster)?;
        Ok(())
    }

    fn emit(&self, roster: &GroupRoster) {
        self.events.emit(ClientEvent::GroupUpdated {
            group_id: hex::encode(roster.id),
            generation: roster.generation,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rvmesh_transport::MemoryMessenger;

    const ADMIN: UserId = [1u8; 32];
    const BOB: UserId = [2u8; 32];
    const CAROL: UserId = [3u8; 32];

    fn service(me: UserId) -> (GroupService<MemoryMessenger>, MemoryMessenger) {
        let conn = rvmesh_db::open_memory().expect("open db");
        let messenger = MemoryMessenger::new();
        let svc = GroupService::new(
            Arc::new(Mutex::new(conn)),
            Arc::new(messenger.clone()),
            EventBus::new(16),
            me,
        );
        (svc, messenger)
    }

    /// Deliver everything `from` sent to `to`'s service.
    async fn deliver(
        msgs: &MemoryMessenger,
        from: UserId,
        to: UserId,
        svc: &GroupService<MemoryMessenger>,
    ) {
        for (peer, msg) in msgs.take() {
            if peer != to {
                continue;
            }
            match msg {
                PeerMsg::GroupUpdate { update } => {
                    svc.on_update(&from, &update).await.expect("update");
                }
                PeerMsg::GroupSnapshot { roster } => {
                    svc.on_snapshot(&from, roster).await.expect("snapshot");
                }
                _ => {}
            }
        }
    }

    #[tokio::test]
    async fn test_join_sends_snapshot_then_updates() {
        let (admin, admin_out) = service(ADMIN);
        let (bob, _) = service(BOB);

        let g = admin.create_group("devs").await.expect("create");
        admin
            .apply_local(&g.id, RosterChange::Join { member: BOB })
            .await
            .expect("join bob");
        deliver(&admin_out, ADMIN, BOB, &bob).await;

        let roster = bob.get(&g.id).await.expect("get").expect("bob has roster");
        assert_eq!(roster.members, vec![ADMIN, BOB]);
        assert_eq!(roster.generation, 1);

        admin
            .apply_local(&g.id, RosterChange::Join { member: CAROL })
            .await
            .expect("join carol");
        let sent = admin_out.take();
        assert!(sent
            .iter()
            .any(|(p, m)| *p == BOB && matches!(m, PeerMsg::GroupUpdate { .. })));
        assert!(sent
            .iter()
            .any(|(p, m)| *p == CAROL && matches!(m, PeerMsg::GroupSnapshot { .. })));

        for (peer, msg) in sent {
            if let (true, PeerMsg::GroupUpdate { update }) = (peer == BOB, msg) {
                assert_eq!(
                    bob.on_update(&ADMIN, &update).await.expect("apply"),
                    ApplyOutcome::Applied
                );
                // Redelivery is harmless.
                assert_eq!(
                    bob.on_update(&ADMIN, &update).await.expect("replay"),
                    ApplyOutcome::Stale
                );
            }
        }
        let roster = bob.get(&g.id).await.expect("get").expect("roster");
        assert_eq!(roster.members, vec![ADMIN, BOB, CAROL]);
    }

    #[tokio::test]
    async fn test_member_cannot_kick() {
        let (admin, admin_out) = service(ADMIN);
        let (bob, _) = service(BOB);
        let g = admin.create_group("devs").await.expect("create");
        admin
            .apply_local(&g.id, RosterChange::Join { member: BOB })
            .await
            .expect("join");
        admin
            .apply_local(&g.id, RosterChange::Join { member: CAROL })
            .await
            .expect("join");
        deliver(&admin_out, ADMIN, BOB, &bob).await;

        let err = bob
            .apply_local(&g.id, RosterChange::Kick { member: CAROL })
            .await
            .expect_err("bob is not admin");
        assert!(matches!(err, GroupError::Roster(RosterError::NotAdmin)));

        // Bob may leave on his own.
        let roster = bob
            .apply_local(&g.id, RosterChange::Part { member: BOB })
            .await
            .expect("part");
        assert!(!roster.is_member(&BOB));
    }

    #[tokio::test]
    async fn test_snapshot_from_non_admin_rejected() {
        let (bob, _) = service(BOB);
        let roster = GroupRoster {
            members: vec![ADMIN, BOB],
            ..GroupRoster::new([9u8; 32], "g", ADMIN)
        };
        assert!(matches!(
            bob.on_snapshot(&CAROL, roster.clone()).await,
            Err(GroupError::Roster(RosterError::NotAdmin))
        ));
        assert!(bob.on_snapshot(&ADMIN, roster.clone()).await.expect("adopt"));
        assert!(!bob.on_snapshot(&ADMIN, roster).await.expect("same generation"));
    }

    #[tokio::test]
    async fn test_generation_gap_rejected() {
        let (admin, _) = service(ADMIN);
        let (bob, _) = service(BOB);
        let g = admin.create_group("devs").await.expect("create");
        let roster = GroupRoster {
            members: vec![ADMIN, BOB],
            generation: 1,
            ..g.clone()
        };
        bob.on_snapshot(&ADMIN, roster).await.expect("adopt");

        let update = RosterUpdate {
            group_id: g.id,
            generation: 3,
            change: RosterChange::Join { member: CAROL },
        };
        assert!(matches!(
            bob.on_update(&ADMIN, &update).await,
            Err(GroupError::Roster(RosterError::GenerationGap { expected: 2, got: 3 }))
        ));
    }
}
