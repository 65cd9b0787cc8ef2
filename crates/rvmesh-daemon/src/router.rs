//! Inbound relay router.
//!
//! Keeps one relay subscription per watched RV and feeds every received
//! blob through the key exchange engine. Decrypted peer messages are then
//! handed to mediation, transfer, tip or group handling.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use rvmesh_kx::Inbound;
use rvmesh_transport::RelayTransport;
use rvmesh_types::identity::PublicIdentity;
use rvmesh_types::wire::PeerMsg;
use rvmesh_types::{short_hex, FileId, RvId, UserId};

use crate::DaemonState;

/// Subscriptions are also reconciled on this period, in case a change was
/// not signalled.
const RESUBSCRIBE_INTERVAL: Duration = Duration::from_secs(5);

const INBOUND_BUFFER: usize = 1024;

struct Subscriptions {
    active: HashMap<RvId, JoinHandle<()>>,
    tx: mpsc::Sender<(RvId, Vec<u8>)>,
}

impl Subscriptions {
    /// Subscribe to newly watched RVs and drop ones no longer watched.
    async fn reconcile(&mut self, state: &DaemonState) -> anyhow::Result<()> {
        let watched: HashSet<RvId> = match state.kx.watched_rvs().await {
            Ok(rvs) => rvs.into_iter().collect(),
            Err(e) if e.is_fatal() => return Err(e.into()),
            Err(e) => {
                warn!(error = %e, "could not list watched rvs");
                return Ok(());
            }
        };

        self.active.retain(|rv, task| {
            let keep = watched.contains(rv);
            if !keep {
                task.abort();
            }
            keep
        });

        for rv in watched {
            if self.active.contains_key(&rv) {
                continue;
            }
            let mut rx = state.relay.subscribe(rv).await?;
            let tx = self.tx.clone();
            let task = tokio::spawn(async move {
                while let Some(blob) = rx.recv().await {
                    if tx.send((rv, blob)).await.is_err() {
                        break;
                    }
                }
            });
            debug!(rv = %short_hex(&rv), "subscribed");
            self.active.insert(rv, task);
        }
        Ok(())
    }

    fn shutdown(&mut self) {
        for (_, task) in self.active.drain() {
            task.abort();
        }
    }
}

/// Route inbound relay traffic until shutdown. Returns an error only for
/// fatal store failures.
pub async fn run(state: Arc<DaemonState>) -> anyhow::Result<()> {
    let (tx, mut rx) = mpsc::channel(INBOUND_BUFFER);
    let mut subs = Subscriptions {
        active: HashMap::new(),
        tx,
    };
    subs.reconcile(&state).await?;
    let mut tick = tokio::time::interval(RESUBSCRIBE_INTERVAL);

    let result = loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => break Ok(()),
            Some((rv, blob)) = rx.recv() => {
                if let Err(e) = handle_blob(&state, &rv, &blob).await {
                    break Err(e);
                }
                if let Err(e) = subs.reconcile(&state).await {
                    break Err(e);
                }
            }
            _ = state.rv_changed.notified() => {
                if let Err(e) = subs.reconcile(&state).await {
                    break Err(e);
                }
            }
            _ = tick.tick() => {
                if let Err(e) = subs.reconcile(&state).await {
                    break Err(e);
                }
            }
        }
    };
    subs.shutdown();
    result
}

/// Route one blob received at `rv`.
pub async fn handle_blob(state: &Arc<DaemonState>, rv: &RvId, blob: &[u8]) -> anyhow::Result<()> {
    match state.kx.dispatch(rv, blob).await {
        Ok(Inbound::Completed(peer)) => {
            info!(peer = %short_hex(&peer.id), nick = %peer.nick, "key exchange completed");
        }
        Ok(Inbound::ResetAccepted(peer)) => {
            info!(peer = %short_hex(&peer.id), "accepted ratchet reset");
        }
        Ok(Inbound::Message { from, msg }) => handle_message(state, &from, msg).await?,
        Ok(Inbound::Ignored) => {}
        Err(e) if e.is_fatal() => return Err(e.into()),
        Err(e) => warn!(rv = %short_hex(rv), error = %e, "inbound blob rejected"),
    }
    Ok(())
}

/// Handle a decrypted message from an established peer.
pub async fn handle_message(state: &Arc<DaemonState>, from: &PublicIdentity, msg: PeerMsg) -> anyhow::Result<()> {
    let kind = msg.kind();
    match msg {
        PeerMsg::MediateIdentity { .. }
        | PeerMsg::TransitiveReset { .. }
        | PeerMsg::InviteRequest { .. }
        | PeerMsg::RelayInvite { .. }
        | PeerMsg::ForwardedInvite { .. } => match state.kx.handle_mediation(from, &msg).await {
            Ok(_) => state.rv_changed.notify_one(),
            Err(e) if e.is_fatal() => return Err(e.into()),
            Err(e) => warn!(peer = %short_hex(&from.id), kind, error = %e, "mediation message rejected"),
        },

        PeerMsg::ChunkInvoice {
            file_id,
            index,
            invoice,
        } => {
            let amount = invoice.amount_milli_atoms;
            match state
                .transfers
                .on_invoice_offered(&from.id, &file_id, index, invoice)
                .await
            {
                Ok(true) => {
                    let limit = state.config.payments.max_chunk_price_milli_atoms;
                    if limit > 0 && amount <= limit {
                        spawn_purchase(state.clone(), from.id, file_id, index);
                    }
                }
                Ok(false) => {}
                Err(e) if e.is_fatal() => return Err(e.into()),
                Err(e) => debug!(peer = %short_hex(&from.id), index, error = %e, "chunk invoice dropped"),
            }
        }

        PeerMsg::GetChunk { .. } | PeerMsg::ChunkPaid { .. } | PeerMsg::ChunkData { .. } => {
            match state.transfers.handle_message(&from.id, msg).await {
                Ok(_) => {}
                Err(e) if e.is_fatal() => return Err(e.into()),
                Err(e) => warn!(peer = %short_hex(&from.id), kind, error = %e, "transfer message rejected"),
            }
        }

        PeerMsg::TipNotice {
            amount_milli_atoms,
            tag,
        } => rvmesh_payments::tip_received(&state.events, &from.id, amount_milli_atoms, tag),

        PeerMsg::GroupUpdate { update } => match state.groups.on_update(&from.id, &update).await {
            Ok(_) => {}
            Err(e) if e.is_fatal() => return Err(e.into()),
            Err(e) => warn!(peer = %short_hex(&from.id), error = %e, "group update rejected"),
        },
        PeerMsg::GroupSnapshot { roster } => match state.groups.on_snapshot(&from.id, roster).await {
            Ok(_) => {}
            Err(e) if e.is_fatal() => return Err(e.into()),
            Err(e) => warn!(peer = %short_hex(&from.id), error = %e, "group snapshot rejected"),
        },
    }
    Ok(())
}

/// Pay for and request one chunk in the background.
fn spawn_purchase(state: Arc<DaemonState>, peer: UserId, file_id: FileId, index: u32) {
    tokio::spawn(async move {
        let cancel = state.shutdown.child_token();
        if let Err(e) = state.transfers.pay_chunk(&peer, &file_id, index, &cancel).await {
            warn!(peer = %short_hex(&peer), index, error = %e, "automatic chunk payment failed");
            return;
        }
        if let Err(e) = state.transfers.request_chunk(&peer, &file_id, index).await {
            warn!(peer = %short_hex(&peer), index, error = %e, "chunk request failed");
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil;
    use rvmesh_kx::InviteMode;
    use rvmesh_transport::{MemoryRelay, SimLedger};
    use rvmesh_types::transfer::Direction;

    /// Drain the relay into every node until it is empty.
    async fn pump(relay: &MemoryRelay, nodes: &[&Arc<DaemonState>]) {
        loop {
            let rvs = relay.occupied();
            if rvs.is_empty() {
                return;
            }
            for rv in rvs {
                for blob in relay.drain(&rv) {
                    for node in nodes {
                        handle_blob(node, &rv, &blob).await.expect("handle");
                    }
                }
            }
        }
    }

    #[tokio::test]
    async fn test_tip_notice_reaches_peer() {
        let dir = tempfile::tempdir().expect("tempdir");
        let relay = Arc::new(MemoryRelay::new());
        let ledger = SimLedger::new();
        let alice = testutil::state(&relay, &ledger, "alice", dir.path());
        let bob = testutil::state(&relay, &ledger, "bob", dir.path());

        let invite = alice.kx.create_invite(InviteMode::Open).await.expect("invite");
        bob.kx.accept_invite(&invite.blob).await.expect("accept");
        pump(&relay, &[&alice, &bob]).await;

        let mut events = bob.events.subscribe();
        let bob_id = bob.kx.identity().id();
        rvmesh_payments::tip_user(
            &alice.payments,
            alice.kx.as_ref(),
            &bob_id,
            250,
            0,
            3,
            &alice.shutdown,
        )
        .await
        .expect("tip");
        pump(&relay, &[&alice, &bob]).await;

        let mut tipped = false;
        while let Ok(env) = events.try_recv() {
            if let rvmesh_types::events::ClientEvent::TipReceived {
                amount_milli_atoms, ..
            } = env.event
            {
                tipped = amount_milli_atoms == 250;
            }
        }
        assert!(tipped);
    }

    #[tokio::test]
    async fn test_auto_purchase_downloads_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let relay = Arc::new(MemoryRelay::new());
        let ledger = SimLedger::new();
        let alice = testutil::state(&relay, &ledger, "alice", &dir.path().join("a"));
        let bob = testutil::state(&relay, &ledger, "bob", &dir.path().join("b"));
        std::fs::create_dir_all(dir.path().join("b")).expect("mkdir");

        let invite = alice.kx.create_invite(InviteMode::Open).await.expect("invite");
        bob.kx.accept_invite(&invite.blob).await.expect("accept");
        pump(&relay, &[&alice, &bob]).await;

        let src = dir.path().join("notes.txt");
        std::fs::write(&src, b"hello over the mesh").expect("write");
        let meta = alice.transfers.share_file(&src, 10).await.expect("share");
        let alice_id = alice.kx.identity().id();
        bob.transfers
            .begin_download(&alice_id, meta.clone())
            .await
            .expect("begin");

        for _ in 0..50 {
            pump(&relay, &[&alice, &bob]).await;
            let status = bob
                .transfers
                .status(&alice_id, &meta.file_id, Direction::Download)
                .await
                .expect("status");
            if status.completed == status.total {
                let path = status.completed_path.expect("path");
                assert_eq!(std::fs::read(path).expect("read"), b"hello over the mesh");
                return;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(
            bob.transfers
                .status(&alice_id, &meta.file_id, Direction::Download)
                .await
                .expect("status")
                .completed,
            1
        );
    }
}
