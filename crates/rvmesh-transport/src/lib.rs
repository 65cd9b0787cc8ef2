//! # rvmesh-transport
//!
//! Seams to the outside world used by the rvmesh core, plus in-process
//! implementations for the daemon's local mode and for tests.
//!
//! - [`relay`]: store-and-forward relay addressed by rendezvous ids
//! - [`payment`]: Lightning-style payment network
//! - [`messenger`]: ratchet-encrypted messages to established peers
//! - [`backoff`]: bounded exponential backoff for readiness checks

pub mod backoff;
pub mod messenger;
pub mod payment;
pub mod relay;

pub use backoff::{wait_until_ready, Backoff};
pub use messenger::{MemoryMessenger, PeerMessenger};
pub use payment::{PaymentNetwork, SimLedger, SimPaymentNetwork};
pub use relay::{MemoryRelay, RelayTransport};

/// Error types for transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The relay rejected or could not accept a publish.
    #[error("relay error: {0}")]
    Relay(String),

    /// The payment network could not produce an invoice.
    #[error("invoice request failed: {0}")]
    InvoiceRequest(String),

    /// A payment was definitively rejected.
    #[error("payment failed: {0}")]
    PaymentFailed(String),

    /// No established ratchet with the peer.
    #[error("unknown peer: {0}")]
    UnknownPeer(String),

    /// Encoding an outbound message failed.
    #[error("encoding error: {0}")]
    Encoding(String),

    /// The local store failed while preparing a send.
    #[error("store error: {0}")]
    Store(String),

    /// Operation cancelled by the caller.
    #[error("cancelled")]
    Cancelled,
}

impl TransportError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, TransportError::Store(_))
    }
}

pub type Result<T> = std::result::Result<T, TransportError>;
