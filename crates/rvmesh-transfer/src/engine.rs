//! Download and upload state machines.
//!
//! ```text
//! downloader                         uploader
//!   begin_download --GetChunk------->  on_chunk_requested (SentInvoice)
//!   on_invoice_offered <--ChunkInvoice--
//!   pay_chunk (PayingInvoice -> Paid)
//!   request_chunk --ChunkPaid------->  on_chunk_paid (Paid)
//!   on_chunk_delivered <--ChunkData---  on_chunk_served (Uploaded)
//! ```
//!
//! Every transition is persisted under the record's key lock before any
//! message is sent or event emitted. Network waits happen with the lock
//! released.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use rusqlite::Connection;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use rvmesh_db::queries::{shared_files, transfers};
use rvmesh_db::KeyedLocks;
use rvmesh_payments::{InvoiceSource, PaymentError, PaymentPolicy};
use rvmesh_transport::{PaymentNetwork, PeerMessenger};
use rvmesh_types::events::{ClientEvent, EventBus};
use rvmesh_types::payment::{Invoice, SubjectTag};
use rvmesh_types::transfer::{ChunkState, Direction, FileMetadata};
use rvmesh_types::wire::PeerMsg;
use rvmesh_types::{short_hex, unix_now, FileId, UserId};

use crate::chunker;
use crate::record::{ChunkTransferRecord, TransferStatus};
use crate::store::{read_shared_chunk, ChunkStore};
use crate::{Result, TransferError};

type TransferKey = (UserId, FileId, Direction);

pub struct TransferEngine<M, P> {
    db: Arc<Mutex<Connection>>,
    messenger: Arc<M>,
    payments: Arc<PaymentPolicy<P>>,
    events: EventBus,
    store: ChunkStore,
    locks: KeyedLocks<TransferKey>,
}

impl<M: PeerMessenger, P: PaymentNetwork> TransferEngine<M, P> {
    pub fn new(
        db: Arc<Mutex<Connection>>,
        messenger: Arc<M>,
        payments: Arc<PaymentPolicy<P>>,
        events: EventBus,
        store: ChunkStore,
    ) -> Self {
        Self {
            db,
            messenger,
            payments,
            events,
            store,
            locks: KeyedLocks::new(),
        }
    }

    /// Route a transfer message from `from`. Returns `false` for messages
    /// that are not part of the transfer protocol.
    pub async fn handle_message(&self, from: &UserId, msg: PeerMsg) -> Result<bool> {
        match msg {
            PeerMsg::GetChunk { file_id, index } => {
                self.on_chunk_requested(from, &file_id, index).await?;
            }
            PeerMsg::ChunkInvoice {
                file_id,
                index,
                invoice,
            } => {
                self.on_invoice_offered(from, &file_id, index, invoice)
                    .await?;
            }
            PeerMsg::ChunkPaid {
                file_id,
                index,
                payment_hash,
            } => {
                self.on_chunk_paid(from, &file_id, index, &payment_hash)
                    .await?;
            }
            PeerMsg::ChunkData {
                file_id,
                index,
                hash,
                data,
            } => {
                self.on_chunk_delivered(from, &file_id, index, &data, &hash)
                    .await?;
            }
            _ => return Ok(false),
        }
        Ok(true)
    }

    // -----------------------------------------------------------------------
    // Download
    // -----------------------------------------------------------------------

    /// Start or resume downloading `metadata` from `peer`.
    ///
    /// Chunks without an invoice are requested; chunks interrupted while
    /// paying are reconciled against their payment record.
    pub async fn begin_download(&self, peer: &UserId, metadata: FileMetadata) -> Result<TransferStatus> {
        chunker::validate(&metadata)?;
        let file_id = metadata.file_id;
        let key = (*peer, file_id, Direction::Download);

        let (record, resumed) = {
            let _guard = self.locks.lock(&key).await;
            let (mut record, resumed) = match self.load(&key).await? {
                Some(existing) => {
                    if existing.metadata != metadata {
                        warn!(file = %short_hex(&file_id), "metadata differs from existing transfer; keeping original");
                    }
                    (existing, true)
                }
                None => (
                    ChunkTransferRecord::new(*peer, Direction::Download, metadata, unix_now()),
                    false,
                ),
            };
            if resumed {
                self.reconcile_payments(&mut record).await?;
            }
            self.save(&record).await?;
            if resumed {
                self.assemble_if_complete(&mut record).await?;
            }
            (record, resumed)
        };

        let mut requested = 0;
        for (index, slot) in record.chunks.iter().enumerate() {
            let index = index as u32;
            match (slot.state, &slot.invoice) {
                (None, _) => {
                    self.messenger
                        .send(peer, PeerMsg::GetChunk { file_id, index })
                        .await?;
                    requested += 1;
                }
                (Some(ChunkState::RequestedChunk), Some(invoice)) => {
                    self.messenger
                        .send(
                            peer,
                            PeerMsg::ChunkPaid {
                                file_id,
                                index,
                                payment_hash: invoice.payment_hash.clone(),
                            },
                        )
                        .await?;
                }
                _ => {}
            }
        }

        info!(
            peer = %short_hex(peer),
            file = %short_hex(&file_id),
            chunks = record.chunks.len(),
            requested,
            resumed,
            "download started"
        );
        Ok(record.status())
    }

    /// Settle chunks left in `PayingInvoice` by an interrupted run.
    async fn reconcile_payments(&self, record: &mut ChunkTransferRecord) -> Result<()> {
        let now = unix_now();
        for index in 0..record.chunks.len() as u32 {
            if record.state(index)? != Some(ChunkState::PayingInvoice) {
                continue;
            }
            let subject = SubjectTag::chunk(&record.metadata.file_id, index);
            let paid = self
                .payments
                .status(&subject)
                .await?
                .is_some_and(|a| a.is_completed());
            if paid {
                record.advance(index, ChunkState::Paid, now)?;
            } else {
                record.reset_to_invoice(index, None, now)?;
            }
            debug!(index, paid, "reconciled interrupted payment");
        }
        Ok(())
    }

    /// Record an invoice offered by the uploader for chunk `index`.
    ///
    /// Returns `true` when the chunk is now payable. A failed chunk keeps
    /// the new invoice for its next explicit retry.
    pub async fn on_invoice_offered(
        &self,
        peer: &UserId,
        file_id: &FileId,
        index: u32,
        invoice: Invoice,
    ) -> Result<bool> {
        let key = (*peer, *file_id, Direction::Download);
        let _guard = self.locks.lock(&key).await;
        let mut record = self.require(&key).await?;

        let expected = record.metadata.chunk_price_milli_atoms;
        if invoice.amount_milli_atoms != expected {
            return Err(TransferError::PriceMismatch {
                index,
                expected,
                got: invoice.amount_milli_atoms,
            });
        }
        let slot = record.slot(index)?;
        let now = unix_now();
        match slot.state {
            None => {
                record.advance(index, ChunkState::HasInvoice, now)?;
                record.set_invoice(index, invoice, now)?;
            }
            Some(ChunkState::HasInvoice) => {
                if slot.invoice.as_ref().map(|i| &i.payment_hash) == Some(&invoice.payment_hash) {
                    return Ok(false);
                }
                record.reset_to_invoice(index, Some(invoice), now)?;
                debug!(index, "chunk invoice replaced");
            }
            Some(ChunkState::Failed) => {
                if slot.invoice.as_ref().map(|i| &i.payment_hash) != Some(&invoice.payment_hash) {
                    record.set_invoice(index, invoice, now)?;
                    self.save(&record).await?;
                    debug!(index, "fresh invoice kept for failed chunk");
                }
                return Ok(false);
            }
            state => {
                debug!(index, ?state, "invoice offered for chunk past HasInvoice; ignored");
                return Ok(false);
            }
        }
        self.save(&record).await?;
        self.emit_state(&record, index, ChunkState::HasInvoice);
        Ok(true)
    }

    /// Pay for chunk `index` through the payment policy.
    ///
    /// A failed payment puts the chunk back at `HasInvoice`; exhausted
    /// attempts mark it `Failed`.
    pub async fn pay_chunk(
        &self,
        peer: &UserId,
        file_id: &FileId,
        index: u32,
        cancel: &CancellationToken,
    ) -> Result<ChunkState> {
        let key = (*peer, *file_id, Direction::Download);
        let subject = SubjectTag::chunk(file_id, index);

        let (invoice, price) = {
            let _guard = self.locks.lock(&key).await;
            let mut record = self.require(&key).await?;
            match record.state(index)? {
                Some(ChunkState::HasInvoice) => {}
                Some(
                    s @ (ChunkState::Paid | ChunkState::RequestedChunk | ChunkState::Downloaded),
                ) => return Ok(s),
                from => {
                    return Err(TransferError::InvalidTransition {
                        index,
                        from,
                        to: ChunkState::PayingInvoice,
                    })
                }
            }
            let invoice = record.slot(index)?.invoice.clone().ok_or(
                TransferError::InvalidTransition {
                    index,
                    from: Some(ChunkState::HasInvoice),
                    to: ChunkState::PayingInvoice,
                },
            )?;
            record.advance(index, ChunkState::PayingInvoice, unix_now())?;
            self.save(&record).await?;
            self.emit_state(&record, index, ChunkState::PayingInvoice);
            (invoice, record.metadata.chunk_price_milli_atoms)
        };

        let outcome = match self.payments.register_invoice(&subject, price, invoice).await {
            Ok(_) => {
                self.payments
                    .attempt(&subject, price, InvoiceSource::Offered, cancel)
                    .await
            }
            Err(e) => Err(e),
        };

        let _guard = self.locks.lock(&key).await;
        let mut record = self.require(&key).await?;
        let now = unix_now();
        match outcome {
            Ok(_) => {
                if record.state(index)? == Some(ChunkState::HasInvoice) {
                    record.advance(index, ChunkState::PayingInvoice, now)?;
                }
                record.advance(index, ChunkState::Paid, now)?;
                self.save(&record).await?;
                self.emit_state(&record, index, ChunkState::Paid);
                info!(file = %short_hex(file_id), index, "chunk paid");
                Ok(ChunkState::Paid)
            }
            Err(e @ PaymentError::RetriesExhausted { .. }) => {
                if record.state(index)? == Some(ChunkState::PayingInvoice) {
                    record.advance(index, ChunkState::Failed, now)?;
                    self.save(&record).await?;
                    self.emit_state(&record, index, ChunkState::Failed);
                }
                warn!(file = %short_hex(file_id), index, error = %e, "chunk payment exhausted");
                Err(e.into())
            }
            Err(e) => {
                if record.state(index)? == Some(ChunkState::PayingInvoice) {
                    record.reset_to_invoice(index, None, now)?;
                    self.save(&record).await?;
                    self.emit_state(&record, index, ChunkState::HasInvoice);
                }
                drop(_guard);
                if matches!(e, PaymentError::InvoiceExpired(_)) {
                    debug!(index, "invoice expired; asking for a new one");
                    self.messenger
                        .send(
                            peer,
                            PeerMsg::GetChunk {
                                file_id: *file_id,
                                index,
                            },
                        )
                        .await?;
                }
                match e {
                    PaymentError::Cancelled => Err(TransferError::Cancelled),
                    other => Err(other.into()),
                }
            }
        }
    }

    /// Ask the uploader for a paid chunk. Repeating the call re-sends the
    /// request.
    pub async fn request_chunk(&self, peer: &UserId, file_id: &FileId, index: u32) -> Result<ChunkState> {
        let key = (*peer, *file_id, Direction::Download);
        let payment_hash = {
            let _guard = self.locks.lock(&key).await;
            let mut record = self.require(&key).await?;
            match record.state(index)? {
                Some(ChunkState::Paid) => {
                    record.advance(index, ChunkState::RequestedChunk, unix_now())?;
                    self.save(&record).await?;
                    self.emit_state(&record, index, ChunkState::RequestedChunk);
                }
                Some(ChunkState::RequestedChunk) => {
                    debug!(index, "re-sending chunk request");
                }
                Some(ChunkState::Downloaded) => return Ok(ChunkState::Downloaded),
                from => {
                    return Err(TransferError::InvalidTransition {
                        index,
                        from,
                        to: ChunkState::RequestedChunk,
                    })
                }
            }
            record
                .slot(index)?
                .invoice
                .as_ref()
                .map(|i| i.payment_hash.clone())
                .unwrap_or_default()
        };

        self.messenger
            .send(
                peer,
                PeerMsg::ChunkPaid {
                    file_id: *file_id,
                    index,
                    payment_hash,
                },
            )
            .await?;
        Ok(ChunkState::RequestedChunk)
    }

    /// Verify and store delivered chunk content.
    ///
    /// Returns `(completed, total)`. Content that does not match the
    /// manifest is dropped and the chunk stays `RequestedChunk`.
    pub async fn on_chunk_delivered(
        &self,
        peer: &UserId,
        file_id: &FileId,
        index: u32,
        data: &[u8],
        hash: &[u8; 32],
    ) -> Result<(usize, usize)> {
        let key = (*peer, *file_id, Direction::Download);
        let _guard = self.locks.lock(&key).await;
        let mut record = self.require(&key).await?;
        let total = record.chunks.len();

        match record.state(index)? {
            Some(ChunkState::RequestedChunk) => {}
            Some(ChunkState::Downloaded) => {
                debug!(index, "duplicate chunk delivery");
                self.assemble_if_complete(&mut record).await?;
                return Ok((record.completed_count(), total));
            }
            from => {
                return Err(TransferError::InvalidTransition {
                    index,
                    from,
                    to: ChunkState::Downloaded,
                })
            }
        }

        let expected = record.metadata.manifest[index as usize];
        if *hash != expected || !chunker::verify_chunk(&record.metadata, index, data) {
            warn!(file = %short_hex(file_id), index, "chunk content does not match manifest");
            self.events.emit(ClientEvent::ContentMismatch {
                file_id: hex::encode(file_id),
                chunk: index,
            });
            return Err(TransferError::ContentMismatch {
                file_id: hex::encode(file_id),
                index,
            });
        }

        self.store.write_chunk(file_id, index, data)?;
        record.advance(index, ChunkState::Downloaded, unix_now())?;
        self.save(&record).await?;
        self.emit_state(&record, index, ChunkState::Downloaded);

        let completed = record.completed_count();
        debug!(file = %short_hex(file_id), index, completed, total, "chunk downloaded");
        self.assemble_if_complete(&mut record).await?;
        Ok((completed, total))
    }

    /// Put a failed chunk back at `HasInvoice` and start a new payment
    /// cycle for it.
    pub async fn retry_chunk(&self, peer: &UserId, file_id: &FileId, index: u32) -> Result<()> {
        let key = (*peer, *file_id, Direction::Download);
        {
            let _guard = self.locks.lock(&key).await;
            let mut record = self.require(&key).await?;
            if record.state(index)? != Some(ChunkState::Failed) {
                return Ok(());
            }
            record.reset_to_invoice(index, None, unix_now())?;
            self.save(&record).await?;
            self.emit_state(&record, index, ChunkState::HasInvoice);
        }
        match self
            .payments
            .reset_for_retry(&SubjectTag::chunk(file_id, index))
            .await
        {
            Ok(_) | Err(PaymentError::NotFound(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    // -----------------------------------------------------------------------
    // Upload
    // -----------------------------------------------------------------------

    /// Offer a local file for download.
    pub async fn share_file(&self, path: &Path, chunk_price_milli_atoms: u64) -> Result<FileMetadata> {
        let path = std::fs::canonicalize(path)?;
        let meta = chunker::describe_file(&path, chunk_price_milli_atoms)?;
        {
            let conn = self.db.lock().await;
            shared_files::upsert(
                &conn,
                &meta.file_id,
                &path.to_string_lossy(),
                &meta,
                unix_now(),
            )?;
        }
        info!(
            file = %short_hex(&meta.file_id),
            name = %meta.filename,
            chunks = meta.chunk_count(),
            price = chunk_price_milli_atoms,
            "file shared"
        );
        Ok(meta)
    }

    pub async fn list_shared(&self) -> Result<Vec<FileMetadata>> {
        let conn = self.db.lock().await;
        Ok(shared_files::list(&conn)?)
    }

    async fn shared(&self, file_id: &FileId) -> Result<(PathBuf, FileMetadata)> {
        let conn = self.db.lock().await;
        let (path, meta) = shared_files::get::<FileMetadata>(&conn, file_id)?
            .ok_or_else(|| TransferError::NotShared(hex::encode(file_id)))?;
        Ok((PathBuf::from(path), meta))
    }

    /// Answer a chunk request with an invoice.
    ///
    /// A repeated request gets the same invoice until it expires.
    pub async fn on_chunk_requested(&self, peer: &UserId, file_id: &FileId, index: u32) -> Result<()> {
        let (_, meta) = self.shared(file_id).await?;
        let key = (*peer, *file_id, Direction::Upload);
        let price = meta.chunk_price_milli_atoms;

        let current = {
            let _guard = self.locks.lock(&key).await;
            let record = match self.load(&key).await? {
                Some(r) => r,
                None => ChunkTransferRecord::new(*peer, Direction::Upload, meta, unix_now()),
            };
            let slot = record.slot(index)?;
            match slot.state {
                None => None,
                Some(ChunkState::SentInvoice) => slot.invoice.clone(),
                state => {
                    debug!(index, ?state, "chunk request after payment; ignored");
                    return Ok(());
                }
            }
        };

        let network = self.payments.network();
        let invoice = match current {
            Some(invoice) if !network.invoice_expired(&invoice).await => invoice,
            _ => {
                let subject = SubjectTag::chunk(file_id, index);
                let invoice = network.create_invoice(price, subject.to_string()).await?;

                let _guard = self.locks.lock(&key).await;
                let mut record = match self.load(&key).await? {
                    Some(r) => r,
                    None => {
                        let (_, meta) = self.shared(file_id).await?;
                        ChunkTransferRecord::new(*peer, Direction::Upload, meta, unix_now())
                    }
                };
                let now = unix_now();
                match record.state(index)? {
                    None => {
                        record.advance(index, ChunkState::SentInvoice, now)?;
                    }
                    Some(ChunkState::SentInvoice) => {}
                    _ => return Ok(()),
                }
                record.set_invoice(index, invoice.clone(), now)?;
                self.save(&record).await?;
                self.emit_state(&record, index, ChunkState::SentInvoice);
                invoice
            }
        };

        self.messenger
            .send(
                peer,
                PeerMsg::ChunkInvoice {
                    file_id: *file_id,
                    index,
                    invoice,
                },
            )
            .await?;
        Ok(())
    }

    /// Verify payment for chunk `index` and serve its content.
    pub async fn on_chunk_paid(
        &self,
        peer: &UserId,
        file_id: &FileId,
        index: u32,
        payment_hash: &str,
    ) -> Result<()> {
        let (path, meta) = self.shared(file_id).await?;
        let key = (*peer, *file_id, Direction::Upload);

        let unpaid = {
            let _guard = self.locks.lock(&key).await;
            let record = self.require(&key).await?;
            let slot = record.slot(index)?;
            match slot.state {
                Some(ChunkState::SentInvoice) => match &slot.invoice {
                    Some(invoice) if invoice.payment_hash == payment_hash => Some(invoice.clone()),
                    _ => return Err(TransferError::NotSettled(index)),
                },
                Some(ChunkState::Paid | ChunkState::Uploaded) => None,
                from => {
                    return Err(TransferError::InvalidTransition {
                        index,
                        from,
                        to: ChunkState::Paid,
                    })
                }
            }
        };

        if let Some(invoice) = unpaid {
            if !self.payments.network().invoice_settled(&invoice).await {
                warn!(peer = %short_hex(peer), index, "chunk marked paid but invoice not settled");
                return Err(TransferError::NotSettled(index));
            }
            let _guard = self.locks.lock(&key).await;
            let mut record = self.require(&key).await?;
            if record.advance(index, ChunkState::Paid, unix_now())? {
                self.save(&record).await?;
                self.emit_state(&record, index, ChunkState::Paid);
            }
        }

        let data = read_shared_chunk(&path, &meta, index)?;
        if !chunker::verify_chunk(&meta, index, &data) {
            warn!(file = %short_hex(file_id), index, "shared file changed on disk");
            return Err(TransferError::ContentMismatch {
                file_id: hex::encode(file_id),
                index,
            });
        }
        self.messenger
            .send(
                peer,
                PeerMsg::ChunkData {
                    file_id: *file_id,
                    index,
                    hash: meta.manifest[index as usize],
                    data,
                },
            )
            .await?;
        self.on_chunk_served(peer, file_id, index).await?;
        Ok(())
    }

    /// Mark chunk `index` as delivered to the downloader.
    pub async fn on_chunk_served(&self, peer: &UserId, file_id: &FileId, index: u32) -> Result<bool> {
        let key = (*peer, *file_id, Direction::Upload);
        let _guard = self.locks.lock(&key).await;
        let mut record = self.require(&key).await?;
        if !record.advance(index, ChunkState::Uploaded, unix_now())? {
            return Ok(false);
        }
        self.save(&record).await?;
        self.emit_state(&record, index, ChunkState::Uploaded);
        if record.is_complete() {
            let (path, _) = self.shared(file_id).await?;
            self.finish(&mut record, &path).await?;
        }
        Ok(true)
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub async fn status(&self, peer: &UserId, file_id: &FileId, direction: Direction) -> Result<TransferStatus> {
        Ok(self.require(&(*peer, *file_id, direction)).await?.status())
    }

    pub async fn chunk_state(
        &self,
        peer: &UserId,
        file_id: &FileId,
        direction: Direction,
        index: u32,
    ) -> Result<Option<ChunkState>> {
        self.require(&(*peer, *file_id, direction)).await?.state(index)
    }

    /// The invoice currently held for chunk `index`.
    pub async fn chunk_invoice(
        &self,
        peer: &UserId,
        file_id: &FileId,
        direction: Direction,
        index: u32,
    ) -> Result<Option<Invoice>> {
        let record = self.require(&(*peer, *file_id, direction)).await?;
        Ok(record.slot(index)?.invoice.clone())
    }

    pub async fn list(&self, direction: Direction) -> Result<Vec<TransferStatus>> {
        let conn = self.db.lock().await;
        let records: Vec<ChunkTransferRecord> = transfers::list(&conn, direction.as_str())?;
        Ok(records.iter().map(ChunkTransferRecord::status).collect())
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    /// Assemble a download whose chunks are all stored but which has no
    /// output file yet. A failed assembly is repeated on the next
    /// delivery or resume.
    async fn assemble_if_complete(&self, record: &mut ChunkTransferRecord) -> Result<bool> {
        if record.direction != Direction::Download
            || record.completed_path.is_some()
            || !record.is_complete()
        {
            return Ok(false);
        }
        let path = self.store.assemble(&record.metadata)?;
        self.finish(record, &path).await?;
        Ok(true)
    }

    async fn finish(&self, record: &mut ChunkTransferRecord, path: &Path) -> Result<()> {
        let shown = path.to_string_lossy().to_string();
        record.completed_path = Some(shown.clone());
        record.completed_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string());
        self.save(record).await?;
        info!(
            file = %short_hex(&record.metadata.file_id),
            direction = record.direction.as_str(),
            path = %shown,
            "transfer completed"
        );
        self.events.emit(ClientEvent::TransferCompleted {
            file_id: hex::encode(record.metadata.file_id),
            path: shown,
        });
        Ok(())
    }

    async fn load(&self, key: &TransferKey) -> Result<Option<ChunkTransferRecord>> {
        let conn = self.db.lock().await;
        Ok(transfers::get(&conn, &key.0, &key.1, key.2.as_str())?)
    }

    async fn require(&self, key: &TransferKey) -> Result<ChunkTransferRecord> {
        self.load(key)
            .await?
            .ok_or_else(|| TransferError::UnknownTransfer {
                peer: short_hex(&key.0),
                file_id: short_hex(&key.1),
                direction: key.2,
            })
    }

    async fn save(&self, record: &ChunkTransferRecord) -> Result<()> {
        let conn = self.db.lock().await;
        transfers::upsert(
            &conn,
            &record.peer,
            &record.metadata.file_id,
            record.direction.as_str(),
            record,
            unix_now(),
        )?;
        Ok(())
    }

    fn emit_state(&self, record: &ChunkTransferRecord, index: u32, state: ChunkState) {
        self.events.emit(ClientEvent::ChunkStateChanged {
            file_id: hex::encode(record.metadata.file_id),
            chunk: index,
            state,
        });
    }
}
