//! # rvmesh-kx
//!
//! Key exchange between two identities over the relay, and the address
//! book of peers a handshake has completed with.
//!
//! ## Handshake
//!
//! ```text
//! Source                                   Target
//!   create_invite  -- invite blob (oob) -->
//!                  <-- reply @ initial_rv --  accept_invite
//!   complete_from_reply
//!                  -- final @ step3_rv   -->  complete_from_final
//! ```
//!
//! A completed handshake atomically replaces its session record with a
//! [`PeerRatchetEntry`]. Mediated introductions and transitive resets run
//! the same handshake with the invite relayed through a third peer.

pub mod engine;
pub mod invite;
pub mod mediation;
pub mod peers;
pub mod record;

pub use engine::{AcceptedInvite, CreatedInvite, Inbound, InviteMode, KxEngine};
pub use peers::PeerSummary;
pub use record::{KxRecord, PeerRatchetEntry};

use rvmesh_crypto::CryptoError;
use rvmesh_db::DbError;
use rvmesh_transport::TransportError;
use rvmesh_types::kx::KxStage;

/// Error types for key exchange operations.
#[derive(Debug, thiserror::Error)]
pub enum KxError {
    /// Malformed, forged, misaddressed or replayed handshake input.
    #[error("invalid invite: {0}")]
    InvalidInvite(String),

    /// Message for an unknown, expired or already-completed session.
    #[error("stale session")]
    StaleSession,

    #[error("unknown peer: {0}")]
    UnknownPeer(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("illegal stage transition {from} -> {to}")]
    IllegalTransition { from: KxStage, to: KxStage },

    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("database error: {0}")]
    Db(#[from] DbError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("encoding error: {0}")]
    Encoding(String),

    #[error("cancelled")]
    Cancelled,
}

impl KxError {
    /// Store failures end the component; everything else is local to one
    /// message or request.
    pub fn is_fatal(&self) -> bool {
        match self {
            KxError::Db(e) => e.is_fatal(),
            KxError::Transport(e) => e.is_fatal(),
            _ => false,
        }
    }

    /// Anomalies caused by duplicate or late relay delivery.
    pub fn is_absorbed(&self) -> bool {
        matches!(self, KxError::StaleSession | KxError::InvalidInvite(_))
    }
}

pub type Result<T> = std::result::Result<T, KxError>;
