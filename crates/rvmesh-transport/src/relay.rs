//! Relay transport.
//!
//! The relay stores blobs at rendezvous ids and forwards them to
//! subscribers. Delivery within one RV is at-least-once; there is no
//! ordering guarantee across RVs.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tracing::debug;

use rvmesh_types::{short_hex, RvId};

use crate::Result;

/// Buffer size of a subscription channel.
pub const SUBSCRIPTION_BUFFER: usize = 256;

pub trait RelayTransport: Send + Sync + 'static {
    /// Publish `blob` at `rv`.
    fn publish(&self, rv: RvId, blob: Vec<u8>) -> impl Future<Output = Result<()>> + Send;

    /// Subscribe to blobs published at `rv`, including ones already stored.
    fn subscribe(
        &self,
        rv: RvId,
    ) -> impl Future<Output = Result<mpsc::Receiver<Vec<u8>>>> + Send;
}

#[derive(Default)]
struct RelayState {
    stored: HashMap<RvId, Vec<Vec<u8>>>,
    subscribers: HashMap<RvId, Vec<mpsc::Sender<Vec<u8>>>>,
    published: u64,
}

/// In-process store-and-forward relay shared by every node in a process.
#[derive(Clone, Default)]
pub struct MemoryRelay {
    state: Arc<Mutex<RelayState>>,
}

impl MemoryRelay {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, RelayState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Remove and return every blob stored at `rv`.
    pub fn drain(&self, rv: &RvId) -> Vec<Vec<u8>> {
        self.state().stored.remove(rv).unwrap_or_default()
    }

    /// Blobs stored at `rv`, left in place.
    pub fn peek(&self, rv: &RvId) -> Vec<Vec<u8>> {
        self.state().stored.get(rv).cloned().unwrap_or_default()
    }

    /// RVs that currently hold stored blobs.
    pub fn occupied(&self) -> Vec<RvId> {
        self.state()
            .stored
            .iter()
            .filter(|(_, blobs)| !blobs.is_empty())
            .map(|(rv, _)| *rv)
            .collect()
    }

    /// Total number of publishes accepted.
    pub fn published_count(&self) -> u64 {
        self.state().published
    }
}

impl RelayTransport for MemoryRelay {
    async fn publish(&self, rv: RvId, blob: Vec<u8>) -> Result<()> {
        let mut state = self.state();
        state.published += 1;
        if let Some(subs) = state.subscribers.get_mut(&rv) {
            subs.retain(|tx| !tx.is_closed());
            for tx in subs.iter() {
                if tx.try_send(blob.clone()).is_err() {
                    debug!(rv = %short_hex(&rv), "subscriber full, relying on stored copy");
                }
            }
        }
        state.stored.entry(rv).or_default().push(blob);
        Ok(())
    }

    async fn subscribe(&self, rv: RvId) -> Result<mpsc::Receiver<Vec<u8>>> {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let mut state = self.state();
        if let Some(blobs) = state.stored.get(&rv) {
            for blob in blobs {
                let _ = tx.try_send(blob.clone());
            }
        }
        state.subscribers.entry(rv).or_default().push(tx);
        Ok(rx)
    }
}
