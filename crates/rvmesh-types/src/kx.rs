//! Key-exchange roles and stages.

use serde::{Deserialize, Serialize};

/// Which side of a handshake the local client plays.
///
/// The Source generated the invite; the Target accepted it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KxRole {
    Source,
    Target,
}

impl KxRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            KxRole::Source => "source",
            KxRole::Target => "target",
        }
    }
}

/// Stage of an in-flight handshake.
///
/// Stages are ordered; a record only moves forward, except to `Failed`.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, ts_rs::TS,
)]
#[serde(rename_all = "snake_case")]
pub enum KxStage {
    Unknown,
    AwaitingAccept,
    AwaitingCompletion,
    Completed,
    Failed,
}

impl KxStage {
    /// Whether moving from `self` to `next` is a legal transition.
    pub fn can_advance_to(self, next: KxStage) -> bool {
        match (self, next) {
            (KxStage::Completed, _) | (KxStage::Failed, _) => false,
            (_, KxStage::Failed) => true,
            (from, to) => to > from,
        }
    }

    /// Whether the handshake is still waiting on the remote side.
    pub fn is_live(self) -> bool {
        matches!(self, KxStage::AwaitingAccept | KxStage::AwaitingCompletion)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            KxStage::Unknown => "unknown",
            KxStage::AwaitingAccept => "awaiting_accept",
            KxStage::AwaitingCompletion => "awaiting_completion",
            KxStage::Completed => "completed",
            KxStage::Failed => "failed",
        }
    }
}

impl std::fmt::Display for KxStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of an outstanding mediation request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediationKind {
    Introduction,
    TransitiveReset,
}

impl MediationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediationKind::Introduction => "introduction",
            MediationKind::TransitiveReset => "transitive_reset",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "introduction" => Some(MediationKind::Introduction),
            "transitive_reset" => Some(MediationKind::TransitiveReset),
            _ => None,
        }
    }
}
