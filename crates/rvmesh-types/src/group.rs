//! Group rosters with an explicit administrator.
//!
//! The administrator is recorded in its own field and is always kept as
//! `members[0]`. Updates carry a generation number and must be applied in
//! delivery order; each accepted update bumps the generation by one.

use serde::{Deserialize, Serialize};
use serde_with::serde_as;

use crate::{GroupId, UserId};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RosterError {
    #[error("update is for a different group")]
    WrongGroup,

    #[error("group has been dissolved")]
    Dissolved,

    #[error("generation gap: expected {expected}, got {got}")]
    GenerationGap { expected: u64, got: u64 },

    #[error("only the group admin may do this")]
    NotAdmin,

    #[error("a member may only remove themselves")]
    NotSelf,

    #[error("not a member of the group")]
    NotMember,

    #[error("already a member of the group")]
    AlreadyMember,

    #[error("the admin cannot be removed from the group")]
    AdminRemoval,

    #[error("roster invariant violated: {0}")]
    Malformed(&'static str),
}

impl RosterError {
    /// Roster errors are all local rejections of a peer's update.
    pub fn is_fatal(&self) -> bool {
        false
    }
}

pub type Result<T> = std::result::Result<T, RosterError>;

/// A membership change.
#[serde_as]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RosterChange {
    Join {
        #[serde_as(as = "serde_with::hex::Hex")]
        member: UserId,
    },
    Part {
        #[serde_as(as = "serde_with::hex::Hex")]
        member: UserId,
    },
    Kick {
        #[serde_as(as = "serde_with::hex::Hex")]
        member: UserId,
    },
    Dissolve,
}

/// A roster update as delivered by the relay.
#[serde_as]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RosterUpdate {
    #[serde_as(as = "serde_with::hex::Hex")]
    pub group_id: GroupId,
    /// Generation the roster will have once this update is applied.
    pub generation: u64,
    pub change: RosterChange,
}

/// Result of applying an update.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    /// Update was at or behind the current generation.
    Stale,
}

#[serde_as]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupRoster {
    #[serde_as(as = "serde_with::hex::Hex")]
    pub id: GroupId,
    pub name: String,
    #[serde_as(as = "serde_with::hex::Hex")]
    pub admin: UserId,
    #[serde_as(as = "Vec<serde_with::hex::Hex>")]
    pub members: Vec<UserId>,
    pub generation: u64,
    #[serde(default)]
    pub dissolved: bool,
}

impl GroupRoster {
    pub fn new(id: GroupId, name: impl Into<String>, admin: UserId) -> Self {
        Self {
            id,
            name: name.into(),
            admin,
            members: vec![admin],
            generation: 0,
            dissolved: false,
        }
    }

    pub fn is_member(&self, user: &UserId) -> bool {
        self.members.contains(user)
    }

    /// Check structural invariants of a roster received as a snapshot.
    pub fn validate(&self) -> Result<()> {
        if self.members.first() != Some(&self.admin) {
            return Err(RosterError::Malformed("admin must be the first member"));
        }
        for (i, m) in self.members.iter().enumerate() {
            if self.members[..i].contains(m) {
                return Err(RosterError::Malformed("duplicate member"));
            }
        }
        Ok(())
    }

    /// Apply `update`, sent by `from`, in delivery order.
    pub fn apply(&mut self, update: &RosterUpdate, from: &UserId) -> Result<ApplyOutcome> {
        if update.group_id != self.id {
            return Err(RosterError::WrongGroup);
        }
        if update.generation <= self.generation {
            return Ok(ApplyOutcome::Stale);
        }
        if self.dissolved {
            return Err(RosterError::Dissolved);
        }
        let expected = self.generation + 1;
        if update.generation != expected {
            return Err(RosterError::GenerationGap {
                expected,
                got: update.generation,
            });
        }

        match &update.change {
            RosterChange::Join { member } => {
                self.require_admin(from)?;
                if self.is_member(member) {
                    return Err(RosterError::AlreadyMember);
                }
                self.members.push(*member);
            }
            RosterChange::Part { member } => {
                if from != member {
                    return Err(RosterError::NotSelf);
                }
                self.remove(member)?;
            }
            RosterChange::Kick { member } => {
                self.require_admin(from)?;
                self.remove(member)?;
            }
            RosterChange::Dissolve => {
                self.require_admin(from)?;
                self.dissolved = true;
            }
        }

        self.generation = expected;
        self.validate()?;
        Ok(ApplyOutcome::Applied)
    }

    fn require_admin(&self, from: &UserId) -> Result<()> {
        if *from != self.admin {
            return Err(RosterError::NotAdmin);
        }
        Ok(())
    }

    fn remove(&mut self, member: &UserId) -> Result<()> {
        if *member == self.admin {
            return Err(RosterError::AdminRemoval);
        }
        let pos = self
            .members
            .iter()
            .position(|m| m == member)
            .ok_or(RosterError::NotMember)?;
        // Preserve the order of the remaining members.
        self.members.remove(pos);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ADMIN: UserId = [1u8; 32];
    const BOB: UserId = [2u8; 32];
    const CAROL: UserId = [3u8; 32];

    fn update(generation: u64, change: RosterChange) -> RosterUpdate {
        RosterUpdate {
            group_id: [9u8; 32],
            generation,
            change,
        }
    }

    fn roster() -> GroupRoster {
        GroupRoster::new([9u8; 32], "friends", ADMIN)
    }

    #[test]
    fn test_join_then_part_keeps_order() {
        let mut r = roster();
        r.apply(&update(1, RosterChange::Join { member: BOB }), &ADMIN)
            .expect("join bob");
        r.apply(&update(2, RosterChange::Join { member: CAROL }), &ADMIN)
            .expect("join carol");
        assert_eq!(r.members, vec![ADMIN, BOB, CAROL]);

        r.apply(&update(3, RosterChange::Part { member: BOB }), &BOB)
            .expect("bob parts");
        assert_eq!(r.members, vec![ADMIN, CAROL]);
        assert_eq!(r.generation, 3);
    }

    #[test]
    fn test_kick_requires_admin() {
        let mut r = roster();
        r.apply(&update(1, RosterChange::Join { member: BOB }), &ADMIN)
            .expect("join bob");
        r.apply(&update(2, RosterChange::Join { member: CAROL }), &ADMIN)
            .expect("join carol");

        let err = r
            .apply(&update(3, RosterChange::Kick { member: CAROL }), &BOB)
            .expect_err("bob is not admin");
        assert_eq!(err, RosterError::NotAdmin);
        assert_eq!(r.generation, 2);

        r.apply(&update(3, RosterChange::Kick { member: CAROL }), &ADMIN)
            .expect("admin kicks");
        assert!(!r.is_member(&CAROL));
    }

    #[test]
    fn test_part_only_by_self() {
        let mut r = roster();
        r.apply(&update(1, RosterChange::Join { member: BOB }), &ADMIN)
            .expect("join");
        let err = r
            .apply(&update(2, RosterChange::Part { member: BOB }), &ADMIN)
            .expect_err("admin cannot part for bob");
        assert_eq!(err, RosterError::NotSelf);
    }

    #[test]
    fn test_admin_cannot_be_removed() {
        let mut r = roster();
        let err = r
            .apply(&update(1, RosterChange::Kick { member: ADMIN }), &ADMIN)
            .expect_err("kick admin");
        assert_eq!(err, RosterError::AdminRemoval);
        let err = r
            .apply(&update(1, RosterChange::Part { member: ADMIN }), &ADMIN)
            .expect_err("admin part");
        assert_eq!(err, RosterError::AdminRemoval);
        assert_eq!(r.members[0], r.admin);
    }

    #[test]
    fn test_stale_and_gap() {
        let mut r = roster();
        r.apply(&update(1, RosterChange::Join { member: BOB }), &ADMIN)
            .expect("join");
        let outcome = r
            .apply(&update(1, RosterChange::Join { member: CAROL }), &ADMIN)
            .expect("stale update");
        assert_eq!(outcome, ApplyOutcome::Stale);
        assert!(!r.is_member(&CAROL));

        let err = r
            .apply(&update(5, RosterChange::Join { member: CAROL }), &ADMIN)
            .expect_err("gap");
        assert_eq!(
            err,
            RosterError::GenerationGap {
                expected: 2,
                got: 5
            }
        );
    }

    #[test]
    fn test_dissolve_blocks_further_updates() {
        let mut r = roster();
        r.apply(&update(1, RosterChange::Dissolve), &ADMIN)
            .expect("dissolve");
        assert!(r.dissolved);
        let err = r
            .apply(&update(2, RosterChange::Join { member: BOB }), &ADMIN)
            .expect_err("dissolved");
        assert_eq!(err, RosterError::Dissolved);
    }

    #[test]
    fn test_validate_snapshot() {
        let mut r = roster();
        r.members = vec![BOB, ADMIN];
        assert!(r.validate().is_err());
        r.members = vec![ADMIN, BOB, BOB];
        assert!(r.validate().is_err());
    }
}
