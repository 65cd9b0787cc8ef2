//! # rvmesh-payments
//!
//! Bounded, idempotent payment attempts keyed by subject tag.
//!
//! Each payable action (a chunk purchase, a tip) has one
//! [`PaymentAttempt`] record. The [`PaymentPolicy`] reuses an outstanding
//! invoice instead of requesting a new one, never pays more than
//! `max_attempts` times per cycle, and freezes the record once a payment
//! succeeds.

pub mod attempt;
pub mod policy;
pub mod tips;

pub use attempt::{AttemptStatus, PaymentAttempt};
pub use policy::{InvoiceSource, PaymentPolicy};
pub use tips::{tip_received, tip_user};

use rvmesh_db::DbError;
use rvmesh_transport::TransportError;

/// Default number of payments per attempt cycle.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Error types for payment operations.
#[derive(Debug, thiserror::Error)]
pub enum PaymentError {
    /// The subject used up its attempts; only an explicit retry resumes it.
    #[error("retries exhausted for {subject}: {}", last_error.as_deref().unwrap_or("no error recorded"))]
    RetriesExhausted {
        subject: String,
        last_error: Option<String>,
    },

    /// The payment network has no usable route right now.
    #[error("payment capability unavailable for {0}")]
    CapabilityUnavailable(String),

    /// The offered invoice can no longer be paid and we cannot request one.
    #[error("invoice expired for {0}")]
    InvoiceExpired(String),

    /// A single payment failed; the caller may attempt again.
    #[error("payment failed: {0}")]
    PaymentFailed(String),

    #[error("invoice amount {got} does not match {expected}")]
    AmountMismatch { expected: u64, got: u64 },

    #[error("no payment attempt for {0}")]
    NotFound(String),

    #[error("cancelled")]
    Cancelled,

    #[error("database error: {0}")]
    Db(#[from] DbError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

impl PaymentError {
    pub fn is_fatal(&self) -> bool {
        match self {
            PaymentError::Db(e) => e.is_fatal(),
            PaymentError::Transport(e) => e.is_fatal(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, PaymentError>;
