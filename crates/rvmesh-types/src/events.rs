//! Events emitted by the core to the presentation/orchestration layer.
//!
//! Events are broadcast on an [`EventBus`]; subscribers decide how to
//! render or store them. Identifiers are hex-encoded.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::transfer::ChunkState;

/// A client event.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, ts_rs::TS)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
    KxCompleted {
        peer: String,
        nick: String,
        is_reset: bool,
    },
    KxFailed {
        session: String,
        reason: String,
    },
    ChunkStateChanged {
        file_id: String,
        chunk: u32,
        state: ChunkState,
    },
    TransferCompleted {
        file_id: String,
        path: String,
    },
    PaymentExhausted {
        subject: String,
        last_error: Option<String>,
    },
    ContentMismatch {
        file_id: String,
        chunk: u32,
    },
    PaymentCapabilityUnavailable {
        subject: String,
    },
    MediationExpired {
        mediator: String,
        target: String,
        kind: String,
    },
    TipReceived {
        peer: String,
        amount_milli_atoms: u64,
    },
    GroupUpdated {
        group_id: String,
        generation: u64,
    },
}

impl ClientEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::KxCompleted { .. } => "kx_completed",
            ClientEvent::KxFailed { .. } => "kx_failed",
            ClientEvent::ChunkStateChanged { .. } => "chunk_state_changed",
            ClientEvent::TransferCompleted { .. } => "transfer_completed",
            ClientEvent::PaymentExhausted { .. } => "payment_exhausted",
            ClientEvent::ContentMismatch { .. } => "content_mismatch",
            ClientEvent::PaymentCapabilityUnavailable { .. } => "payment_capability_unavailable",
            ClientEvent::MediationExpired { .. } => "mediation_expired",
            ClientEvent::TipReceived { .. } => "tip_received",
            ClientEvent::GroupUpdated { .. } => "group_updated",
        }
    }
}

/// An event as delivered to subscribers.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub sequence: u64,
    pub timestamp: u64,
    pub event: ClientEvent,
}

/// Broadcast bus for client events.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<EventEnvelope>,
    sequence: Arc<AtomicU64>,
}

impl EventBus {
    /// Create a new event bus with the given buffer capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            sequence: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Emit an event to all subscribers.
    pub fn emit(&self, event: ClientEvent) {
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::debug!(event = event.name(), sequence, "emit");
        // No subscribers is fine.
        let _ = self.sender.send(EventEnvelope {
            sequence,
            timestamp: crate::unix_now(),
            event,
        });
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.sender.subscribe()
    }

    /// Number of events emitted so far.
    pub fn sequence(&self) -> u64 {
        self.sequence.load(Ordering::SeqCst)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1000)
    }
}
