//! Messaging established peers over their ratchets.

use serde::Serialize;
use tracing::debug;

use rvmesh_db::queries::{address_book, outbox};
use rvmesh_transport::{PeerMessenger, RelayTransport, TransportError};
use rvmesh_types::wire::PeerMsg;
use rvmesh_types::{short_hex, unix_now, UserId};

use crate::engine::KxEngine;
use crate::record::PeerRatchetEntry;
use crate::{KxError, Result};

/// Address book row as shown to the user.
#[derive(Clone, Debug, Serialize)]
pub struct PeerSummary {
    pub id: String,
    pub nick: String,
    pub ignored: bool,
    pub established_at: u64,
    pub reset_count: u32,
    /// Matches on both ends of a healthy ratchet.
    pub fingerprint: String,
}

impl From<&PeerRatchetEntry> for PeerSummary {
    fn from(entry: &PeerRatchetEntry) -> Self {
        Self {
            id: hex::encode(entry.peer.id),
            nick: entry.peer.nick.clone(),
            ignored: entry.ignored,
            established_at: entry.established_at,
            reset_count: entry.reset_count,
            fingerprint: hex::encode(entry.ratchet.fingerprint()),
        }
    }
}

impl<R: RelayTransport> KxEngine<R> {
    pub async fn list_peers(&self) -> Result<Vec<PeerSummary>> {
        let conn = self.db().lock().await;
        let entries: Vec<PeerRatchetEntry> = address_book::list(&conn)?;
        Ok(entries.iter().map(PeerSummary::from).collect())
    }

    /// Encrypt and publish `msg` to `peer`.
    ///
    /// Messages to one peer are published in the order their sends took
    /// the peer lock.
    pub async fn send_msg(&self, peer: &UserId, msg: &PeerMsg) -> Result<()> {
        let plaintext = msg.to_bytes().map_err(|e| KxError::Encoding(e.to_string()))?;
        let _peer = self.peer_locks.lock(peer).await;

        let now = unix_now();
        let (id, rv, ciphertext) = {
            let conn = self.db().lock().await;
            let mut entry: PeerRatchetEntry = address_book::get(&conn, peer)?
                .ok_or_else(|| KxError::UnknownPeer(short_hex(peer)))?;
            let (rv, ciphertext) = entry.ratchet.encrypt(&plaintext)?;
            let id = rvmesh_db::transaction(&conn, |tx| -> Result<i64> {
                address_book::upsert(tx, peer, &entry.peer.nick, &entry, now)?;
                Ok(outbox::enqueue(tx, &rv, &ciphertext, now)?)
            })?;
            (id, rv, ciphertext)
        };
        self.flush(id, rv, ciphertext).await?;
        debug!(peer = %short_hex(peer), kind = msg.kind(), "message sent");
        Ok(())
    }
}

impl<R: RelayTransport> PeerMessenger for KxEngine<R> {
    async fn send(&self, peer: &UserId, msg: PeerMsg) -> rvmesh_transport::Result<()> {
        self.send_msg(peer, &msg).await.map_err(|e| match e {
            KxError::UnknownPeer(p) => TransportError::UnknownPeer(p),
            KxError::Transport(t) => t,
            KxError::Encoding(m) => TransportError::Encoding(m),
            other => TransportError::Store(other.to_string()),
        })
    }
}
