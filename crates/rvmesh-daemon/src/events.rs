//! Event logging and the recent-event buffer polled over RPC.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use rvmesh_types::events::{EventBus, EventEnvelope};

/// Events kept for polling clients.
pub const RECENT_EVENTS: usize = 1000;

/// Bounded buffer of the most recent events.
#[derive(Default)]
pub struct EventLog {
    recent: Mutex<VecDeque<EventEnvelope>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, envelope: EventEnvelope) {
        let mut recent = self.recent.lock().unwrap_or_else(|e| e.into_inner());
        if recent.len() == RECENT_EVENTS {
            recent.pop_front();
        }
        recent.push_back(envelope);
    }

    /// Buffered events with a sequence number above `after`.
    pub fn since(&self, after: u64) -> Vec<EventEnvelope> {
        self.recent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|e| e.sequence > after)
            .cloned()
            .collect()
    }
}

/// Log every event and keep it in `log` until shutdown.
pub async fn log_events(bus: EventBus, log: Arc<EventLog>, cancel: CancellationToken) {
    let mut rx = bus.subscribe();
    loop {
        let envelope = tokio::select! {
            _ = cancel.cancelled() => return,
            r = rx.recv() => r,
        };
        match envelope {
            Ok(envelope) => {
                let payload = serde_json::to_string(&envelope.event).unwrap_or_default();
                info!(
                    event = envelope.event.name(),
                    sequence = envelope.sequence,
                    %payload,
                    "event"
                );
                log.push(envelope);
            }
            Err(RecvError::Lagged(n)) => warn!(skipped = n, "event logger lagged"),
            Err(RecvError::Closed) => return,
        }
    }
}
