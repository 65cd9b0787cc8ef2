//! Integration test harness for rvmesh.
//!
//! Nodes share one in-memory relay and one simulated payment ledger.
//! [`Mesh::pump`] delivers relay traffic the way the daemon router does,
//! except that chunk invoices are never paid automatically: tests drive
//! payments themselves.
//!
//! Run all integration tests:
//! ```sh
//! cargo test -p rvmesh-integration-tests
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::Mutex;

use rvmesh_crypto::identity::LocalIdentity;
use rvmesh_kx::{Inbound, InviteMode, KxEngine};
use rvmesh_payments::PaymentPolicy;
use rvmesh_transfer::{ChunkStore, TransferEngine};
use rvmesh_transport::{MemoryRelay, SimLedger, SimPaymentNetwork};
use rvmesh_types::events::{ClientEvent, EventBus, EventEnvelope};
use rvmesh_types::wire::PeerMsg;
use rvmesh_types::UserId;

pub type Kx = KxEngine<MemoryRelay>;

/// One simulated client.
pub struct Node {
    pub db: Arc<Mutex<rusqlite::Connection>>,
    pub events: EventBus,
    pub network: Arc<SimPaymentNetwork>,
    pub kx: Arc<Kx>,
    pub payments: Arc<PaymentPolicy<SimPaymentNetwork>>,
    pub transfers: TransferEngine<Kx, SimPaymentNetwork>,
    pub downloads: PathBuf,
}

impl Node {
    pub fn id(&self) -> UserId {
        self.kx.identity().id()
    }
}

/// What a node did with one delivered blob.
#[derive(Debug, Clone)]
pub enum Delivered {
    Completed(UserId),
    ResetAccepted(UserId),
    Message { from: UserId, kind: &'static str },
}

/// Shared relay, ledger and scratch directory.
pub struct Mesh {
    pub relay: Arc<MemoryRelay>,
    pub ledger: SimLedger,
    dir: tempfile::TempDir,
}

impl Mesh {
    pub fn new() -> Self {
        Self {
            relay: Arc::new(MemoryRelay::new()),
            ledger: SimLedger::new(),
            dir: tempfile::tempdir().expect("create temp dir"),
        }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// A node with a fresh identity and in-memory database.
    pub fn node(&self, nick: &str) -> Node {
        let identity = LocalIdentity::generate(nick);
        let me = identity.id();
        let db = Arc::new(Mutex::new(rvmesh_db::open_memory().expect("open db")));
        let events = EventBus::new(1024);
        let network = Arc::new(self.ledger.node(me));
        let kx = Arc::new(KxEngine::new(
            db.clone(),
            identity,
            self.relay.clone(),
            events.clone(),
        ));
        let payments = Arc::new(PaymentPolicy::new(
            db.clone(),
            network.clone(),
            events.clone(),
            rvmesh_payments::DEFAULT_MAX_ATTEMPTS,
        ));
        let downloads = self.dir.path().join(nick).join("downloads");
        let transfers = TransferEngine::new(
            db.clone(),
            kx.clone(),
            payments.clone(),
            events.clone(),
            ChunkStore::new(downloads.clone()),
        );
        Node {
            db,
            events,
            network,
            kx,
            payments,
            transfers,
            downloads,
        }
    }

    /// Write `content` to a file in the scratch directory.
    pub fn write_file(&self, name: &str, content: &[u8]) -> PathBuf {
        let path = self.dir.path().join(name);
        std::fs::write(&path, content).expect("write file");
        path
    }

    /// Deliver every stored blob to every node until the relay is empty.
    pub async fn pump(&self, nodes: &[&Node]) -> Vec<(usize, Delivered)> {
        let mut seen = Vec::new();
        loop {
            let rvs = self.relay.occupied();
            if rvs.is_empty() {
                return seen;
            }
            for rv in rvs {
                for blob in self.relay.drain(&rv) {
                    for (i, node) in nodes.iter().enumerate() {
                        if let Some(delivered) = deliver(node, &rv, &blob).await {
                            seen.push((i, delivered));
                        }
                    }
                }
            }
        }
    }

    /// Run an open handshake from `a` to `b` to completion.
    pub async fn connect(&self, a: &Node, b: &Node) {
        let invite = a.kx.create_invite(InviteMode::Open).await.expect("invite");
        b.kx.accept_invite(&invite.blob).await.expect("accept");
        self.pump(&[a, b]).await;
    }
}

impl Default for Mesh {
    fn default() -> Self {
        Self::new()
    }
}

async fn deliver(node: &Node, rv: &[u8; 32], blob: &[u8]) -> Option<Delivered> {
    let inbound = match node.kx.dispatch(rv, blob).await {
        Ok(inbound) => inbound,
        Err(e) => {
            assert!(!e.is_fatal(), "fatal dispatch error: {e}");
            return None;
        }
    };
    match inbound {
        Inbound::Completed(peer) => Some(Delivered::Completed(peer.id)),
        Inbound::ResetAccepted(peer) => Some(Delivered::ResetAccepted(peer.id)),
        Inbound::Ignored => None,
        Inbound::Message { from, msg } => {
            let kind = msg.kind();
            route(node, &from, msg).await;
            Some(Delivered::Message {
                from: from.id,
                kind,
            })
        }
    }
}

async fn route(node: &Node, from: &rvmesh_types::identity::PublicIdentity, msg: PeerMsg) {
    match node.kx.handle_mediation(from, &msg).await {
        Ok(true) => return,
        Ok(false) => {}
        Err(e) => {
            assert!(!e.is_fatal(), "fatal mediation error: {e}");
            return;
        }
    }
    if let PeerMsg::TipNotice {
        amount_milli_atoms,
        tag,
    } = msg
    {
        rvmesh_payments::tip_received(&node.events, &from.id, amount_milli_atoms, tag);
        return;
    }
    if let Err(e) = node.transfers.handle_message(&from.id, msg).await {
        assert!(!e.is_fatal(), "fatal transfer error: {e}");
    }
}

/// Drain events buffered on `rx`.
pub fn drain_events(rx: &mut tokio::sync::broadcast::Receiver<EventEnvelope>) -> Vec<ClientEvent> {
    let mut out = Vec::new();
    while let Ok(env) = rx.try_recv() {
        out.push(env.event);
    }
    out
}
