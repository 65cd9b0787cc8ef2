//! # rvmesh-transfer
//!
//! Paid, chunked file transfer between peers.
//!
//! ## Modules
//!
//! - [`chunker`]: 1 MiB chunk splitting and manifest construction.
//! - [`store`]: partial chunk storage and final file assembly.
//! - [`record`]: per-file transfer record with one slot per chunk.
//! - [`engine`]: download and upload state machines.

pub mod chunker;
pub mod engine;
pub mod record;
pub mod store;

pub use engine::TransferEngine;
pub use record::{ChunkSlot, ChunkTransferRecord, TransferStatus};
pub use store::ChunkStore;

use rvmesh_db::DbError;
use rvmesh_payments::PaymentError;
use rvmesh_transport::TransportError;
use rvmesh_types::transfer::{ChunkState, Direction};

/// Error types for transfer operations.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("no {direction:?} transfer of {file_id} with peer {peer}")]
    UnknownTransfer {
        peer: String,
        file_id: String,
        direction: Direction,
    },

    #[error("file {0} is not shared")]
    NotShared(String),

    #[error("chunk {index} out of range ({count} chunks)")]
    ChunkOutOfRange { index: u32, count: usize },

    #[error("chunk {index}: illegal transition {from:?} -> {to}")]
    InvalidTransition {
        index: u32,
        from: Option<ChunkState>,
        to: ChunkState,
    },

    /// Delivered bytes do not hash to the manifest entry.
    #[error("content mismatch for chunk {index} of {file_id}")]
    ContentMismatch { file_id: String, index: u32 },

    #[error("invalid file metadata: {0}")]
    InvalidMetadata(String),

    #[error("invoice for chunk {index} is {got} milli-atoms, expected {expected}")]
    PriceMismatch { index: u32, expected: u64, got: u64 },

    #[error("payment for chunk {0} has not settled")]
    NotSettled(u32),

    #[error("cancelled")]
    Cancelled,

    #[error("payment error: {0}")]
    Payment(#[from] PaymentError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("database error: {0}")]
    Db(#[from] DbError),

    /// A shared file can no longer be read from where it was shared.
    #[error("shared file {path} unavailable: {source}")]
    SourceUnavailable {
        path: String,
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransferError {
    /// Only durable-store failures are fatal. Filesystem errors affect a
    /// single transfer and are reported to the caller.
    pub fn is_fatal(&self) -> bool {
        match self {
            TransferError::Db(e) => e.is_fatal(),
            TransferError::Payment(e) => e.is_fatal(),
            TransferError::Transport(e) => e.is_fatal(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, TransferError>;
