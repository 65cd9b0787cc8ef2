//! Sending messages to peers over their established ratchet.

use std::future::Future;
use std::sync::{Arc, Mutex};

use rvmesh_types::wire::PeerMsg;
use rvmesh_types::UserId;

use crate::Result;

pub trait PeerMessenger: Send + Sync + 'static {
    /// Encrypt `msg` for `peer` and hand it to the relay.
    fn send(&self, peer: &UserId, msg: PeerMsg) -> impl Future<Output = Result<()>> + Send;
}

/// Messenger that records outbound messages instead of sending them.
#[derive(Clone, Default)]
pub struct MemoryMessenger {
    sent: Arc<Mutex<Vec<(UserId, PeerMsg)>>>,
}

impl MemoryMessenger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove and return everything sent so far.
    pub fn take(&self) -> Vec<(UserId, PeerMsg)> {
        std::mem::take(&mut *self.sent.lock().unwrap_or_else(|e| e.into_inner()))
    }
}

impl PeerMessenger for MemoryMessenger {
    async fn send(&self, peer: &UserId, msg: PeerMsg) -> Result<()> {
        self.sent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((*peer, msg));
        Ok(())
    }
}
