//! Integration test: paid chunked download between two peers.
//!
//! Alice shares a four-chunk file; Bob downloads it over their ratchet,
//! paying for each chunk on the simulated ledger. Exercises out-of-order
//! completion, exhausted payments, expired invoices and resuming with a
//! fresh engine over the same database.

use tokio_util::sync::CancellationToken;

use rvmesh_integration_tests::{drain_events, Mesh, Node};
use rvmesh_payments::PaymentError;
use rvmesh_transfer::chunker::CHUNK_SIZE;
use rvmesh_transfer::{ChunkStore, TransferEngine, TransferError};
use rvmesh_types::events::ClientEvent;
use rvmesh_types::payment::SubjectTag;
use rvmesh_types::transfer::{ChunkState, Direction, FileMetadata};

const PRICE: u64 = 25;

struct Setup {
    mesh: Mesh,
    alice: Node,
    bob: Node,
    meta: FileMetadata,
    content: Vec<u8>,
}

/// Connected peers, with Alice sharing a file that spans four chunks.
async fn setup() -> Setup {
    let mesh = Mesh::new();
    let alice = mesh.node("alice");
    let bob = mesh.node("bob");
    mesh.connect(&alice, &bob).await;

    let content: Vec<u8> = (0..3 * CHUNK_SIZE + 100).map(|i| (i % 251) as u8).collect();
    let path = mesh.write_file("album.flac", &content);
    let meta = alice.transfers.share_file(&path, PRICE).await.expect("share");
    assert_eq!(meta.chunk_count(), 4);
    Setup {
        mesh,
        alice,
        bob,
        meta,
        content,
    }
}

impl Setup {
    async fn pump(&self) {
        self.mesh.pump(&[&self.alice, &self.bob]).await;
    }

    async fn chunk(&self, index: u32) -> Option<ChunkState> {
        self.bob
            .transfers
            .chunk_state(&self.alice.id(), &self.meta.file_id, Direction::Download, index)
            .await
            .expect("chunk state")
    }

    /// Pay for, request and receive one chunk.
    async fn fetch(&self, index: u32) {
        let cancel = CancellationToken::new();
        let state = self
            .bob
            .transfers
            .pay_chunk(&self.alice.id(), &self.meta.file_id, index, &cancel)
            .await
            .expect("pay");
        assert_eq!(state, ChunkState::Paid);
        self.bob
            .transfers
            .request_chunk(&self.alice.id(), &self.meta.file_id, index)
            .await
            .expect("request");
        self.pump().await;
        assert_eq!(self.chunk(index).await, Some(ChunkState::Downloaded));
    }
}

#[tokio::test]
async fn test_out_of_order_download_completes() {
    let s = setup().await;
    let alice_id = s.alice.id();
    let fid = s.meta.file_id;
    let mut events = s.bob.events.subscribe();

    s.bob
        .transfers
        .begin_download(&alice_id, s.meta.clone())
        .await
        .expect("begin");
    s.pump().await;
    let status = s.bob.transfers.status(&alice_id, &fid, Direction::Download).await.expect("status");
    assert_eq!(status.by_state.get("has_invoice"), Some(&4));
    assert_eq!(s.mesh.ledger.issued(), 4);

    for index in [3, 1, 0, 2] {
        s.fetch(index).await;
    }

    let status = s.bob.transfers.status(&alice_id, &fid, Direction::Download).await.expect("status");
    assert_eq!((status.completed, status.total), (4, 4));
    let path = status.completed_path.expect("assembled");
    assert_eq!(std::fs::read(&path).expect("read"), s.content);
    assert!(path.starts_with(&s.bob.downloads.to_string_lossy().to_string()));

    let upload = s
        .alice
        .transfers
        .status(&s.bob.id(), &fid, Direction::Upload)
        .await
        .expect("upload status");
    assert_eq!(upload.by_state.get("uploaded"), Some(&4));
    assert_eq!(s.bob.network.pay_calls(), 4);

    let completed = drain_events(&mut events)
        .into_iter()
        .filter(|e| matches!(e, ClientEvent::TransferCompleted { .. }))
        .count();
    assert_eq!(completed, 1);
}

#[tokio::test]
async fn test_third_attempt_reuses_invoice() {
    let s = setup().await;
    let alice_id = s.alice.id();
    let fid = s.meta.file_id;
    s.bob.transfers.begin_download(&alice_id, s.meta.clone()).await.expect("begin");
    s.pump().await;
    s.bob.network.fail_next_payments(2, "temporary channel failure");

    let cancel = CancellationToken::new();
    for _ in 0..2 {
        assert!(matches!(
            s.bob.transfers.pay_chunk(&alice_id, &fid, 0, &cancel).await,
            Err(TransferError::Payment(PaymentError::PaymentFailed(_)))
        ));
        assert_eq!(s.chunk(0).await, Some(ChunkState::HasInvoice));
    }
    s.fetch(0).await;

    let attempt = s
        .bob
        .payments
        .status(&SubjectTag::chunk(&fid, 0))
        .await
        .expect("status")
        .expect("attempt");
    assert_eq!(attempt.attempts, 3);
    assert!(attempt.completed_at.is_some());
    assert_eq!(attempt.prior_invoices.len(), 1);
    assert_eq!(s.mesh.ledger.issued(), 4);
    assert_eq!(s.bob.network.pay_calls(), 3);
}

#[tokio::test]
async fn test_exhausted_chunk_fails_alone_and_retries() {
    let s = setup().await;
    let alice_id = s.alice.id();
    let fid = s.meta.file_id;
    let mut events = s.bob.events.subscribe();
    s.bob.transfers.begin_download(&alice_id, s.meta.clone()).await.expect("begin");
    s.pump().await;
    s.bob.network.fail_next_payments(3, "no route");

    let cancel = CancellationToken::new();
    let mut last = None;
    for _ in 0..3 {
        last = Some(s.bob.transfers.pay_chunk(&alice_id, &fid, 2, &cancel).await);
    }
    assert!(matches!(
        last,
        Some(Err(TransferError::Payment(PaymentError::RetriesExhausted { .. })))
    ));
    assert_eq!(s.chunk(2).await, Some(ChunkState::Failed));
    assert!(drain_events(&mut events)
        .iter()
        .any(|e| matches!(e, ClientEvent::PaymentExhausted { .. })));

    // A further pay on a failed chunk touches neither state nor network.
    let calls = s.bob.network.pay_calls();
    assert!(s.bob.transfers.pay_chunk(&alice_id, &fid, 2, &cancel).await.is_err());
    assert_eq!(s.bob.network.pay_calls(), calls);

    for index in [0, 1, 3] {
        s.fetch(index).await;
    }
    let status = s.bob.transfers.status(&alice_id, &fid, Direction::Download).await.expect("status");
    assert_eq!(status.completed, 3);
    assert!(status.completed_path.is_none());

    s.bob.transfers.retry_chunk(&alice_id, &fid, 2).await.expect("retry");
    assert_eq!(s.chunk(2).await, Some(ChunkState::HasInvoice));
    s.fetch(2).await;
    let status = s.bob.transfers.status(&alice_id, &fid, Direction::Download).await.expect("status");
    assert_eq!(status.completed_path.map(|p| std::fs::read(p).expect("read")), Some(s.content));
}

#[tokio::test]
async fn test_expired_invoice_is_replaced() {
    let s = setup().await;
    let alice_id = s.alice.id();
    let fid = s.meta.file_id;
    s.bob.transfers.begin_download(&alice_id, s.meta.clone()).await.expect("begin");
    s.pump().await;

    let stale = s
        .bob
        .transfers
        .chunk_invoice(&alice_id, &fid, Direction::Download, 1)
        .await
        .expect("invoice")
        .expect("offered");
    s.mesh.ledger.expire(&stale.payment_hash);
    let issued = s.mesh.ledger.issued();

    let cancel = CancellationToken::new();
    assert!(matches!(
        s.bob.transfers.pay_chunk(&alice_id, &fid, 1, &cancel).await,
        Err(TransferError::Payment(PaymentError::InvoiceExpired(_)))
    ));
    assert_eq!(s.chunk(1).await, Some(ChunkState::HasInvoice));
    assert_eq!(s.bob.network.pay_calls(), 0);

    // The re-sent request yields a fresh invoice from Alice.
    s.pump().await;
    assert_eq!(s.mesh.ledger.issued(), issued + 1);
    let fresh = s
        .bob
        .transfers
        .chunk_invoice(&alice_id, &fid, Direction::Download, 1)
        .await
        .expect("invoice")
        .expect("offered");
    assert_ne!(fresh.payment_hash, stale.payment_hash);

    s.fetch(1).await;
    let attempt = s
        .bob
        .payments
        .status(&SubjectTag::chunk(&fid, 1))
        .await
        .expect("status")
        .expect("attempt");
    assert_eq!(attempt.prior_invoices.len(), 2);
    assert_eq!(attempt.current_invoice.map(|i| i.payment_hash), Some(fresh.payment_hash));
}

#[tokio::test]
async fn test_download_resumes_after_restart() {
    let s = setup().await;
    let alice_id = s.alice.id();
    let fid = s.meta.file_id;
    s.bob.transfers.begin_download(&alice_id, s.meta.clone()).await.expect("begin");
    s.pump().await;
    s.fetch(0).await;
    s.fetch(3).await;

    // A new engine over the same database and download directory.
    let restarted = TransferEngine::new(
        s.bob.db.clone(),
        s.bob.kx.clone(),
        s.bob.payments.clone(),
        s.bob.events.clone(),
        ChunkStore::new(s.bob.downloads.clone()),
    );
    let status = restarted
        .begin_download(&alice_id, s.meta.clone())
        .await
        .expect("resume");
    assert_eq!(status.completed, 2);
    assert_eq!(status.by_state.get("has_invoice"), Some(&2));
    // Nothing needed re-requesting.
    assert!(s.mesh.relay.occupied().is_empty());

    let cancel = CancellationToken::new();
    for index in [1, 2] {
        assert_eq!(
            restarted.pay_chunk(&alice_id, &fid, index, &cancel).await.expect("pay"),
            ChunkState::Paid
        );
        restarted.request_chunk(&alice_id, &fid, index).await.expect("request");
    }
    s.pump().await;
    let status = restarted.status(&alice_id, &fid, Direction::Download).await.expect("status");
    assert_eq!((status.completed, status.total), (4, 4));
    assert_eq!(s.bob.network.pay_calls(), 4);
}
