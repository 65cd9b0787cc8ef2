//! Transfer records.
//!
//! One record per (peer, file, direction). Each chunk index owns a single
//! [`ChunkSlot`] holding its state, invoice and timestamp together.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_with::serde_as;

use rvmesh_types::payment::Invoice;
use rvmesh_types::transfer::{ChunkState, Direction, FileMetadata, Transition};
use rvmesh_types::UserId;

use crate::{Result, TransferError};

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkSlot {
    pub state: Option<ChunkState>,
    pub invoice: Option<Invoice>,
    pub last_updated: u64,
}

#[serde_as]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkTransferRecord {
    #[serde_as(as = "serde_with::hex::Hex")]
    pub peer: UserId,
    pub direction: Direction,
    pub metadata: FileMetadata,
    pub chunks: Vec<ChunkSlot>,
    pub created_at: u64,
    pub completed_path: Option<String>,
    pub completed_name: Option<String>,
}

/// Progress summary of one transfer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct TransferStatus {
    pub file_id: String,
    pub peer: String,
    pub direction: Direction,
    pub completed: usize,
    pub total: usize,
    /// Chunk count per state name; chunks with no state are `"none"`.
    pub by_state: BTreeMap<String, usize>,
    pub completed_path: Option<String>,
}

impl ChunkTransferRecord {
    pub fn new(peer: UserId, direction: Direction, metadata: FileMetadata, now: u64) -> Self {
        let chunks = vec![ChunkSlot::default(); metadata.chunk_count()];
        Self {
            peer,
            direction,
            metadata,
            chunks,
            created_at: now,
            completed_path: None,
            completed_name: None,
        }
    }

    pub fn slot(&self, index: u32) -> Result<&ChunkSlot> {
        self.chunks
            .get(index as usize)
            .ok_or(TransferError::ChunkOutOfRange {
                index,
                count: self.chunks.len(),
            })
    }

    fn slot_mut(&mut self, index: u32) -> Result<&mut ChunkSlot> {
        let count = self.chunks.len();
        self.chunks
            .get_mut(index as usize)
            .ok_or(TransferError::ChunkOutOfRange { index, count })
    }

    pub fn state(&self, index: u32) -> Result<Option<ChunkState>> {
        Ok(self.slot(index)?.state)
    }

    /// Advance chunk `index` to `to`.
    ///
    /// Returns `false` for a replay of a transition already applied.
    pub fn advance(&mut self, index: u32, to: ChunkState, now: u64) -> Result<bool> {
        let direction = self.direction;
        let slot = self.slot_mut(index)?;
        match ChunkState::check_transition(direction, slot.state, to) {
            Transition::Apply => {
                slot.state = Some(to);
                slot.last_updated = now;
                Ok(true)
            }
            Transition::NoOp => Ok(false),
            Transition::Invalid => Err(TransferError::InvalidTransition {
                index,
                from: slot.state,
                to,
            }),
        }
    }

    /// Put a download chunk back at `HasInvoice`, optionally with a new
    /// invoice. Only legal before the chunk is paid.
    pub fn reset_to_invoice(&mut self, index: u32, invoice: Option<Invoice>, now: u64) -> Result<()> {
        let slot = self.slot_mut(index)?;
        if !ChunkState::can_reset_to_invoice(slot.state) {
            return Err(TransferError::InvalidTransition {
                index,
                from: slot.state,
                to: ChunkState::HasInvoice,
            });
        }
        if let Some(invoice) = invoice {
            slot.invoice = Some(invoice);
        }
        slot.state = Some(ChunkState::HasInvoice);
        slot.last_updated = now;
        Ok(())
    }

    /// Replace the held invoice without changing the chunk's state.
    pub fn set_invoice(&mut self, index: u32, invoice: Invoice, now: u64) -> Result<()> {
        let slot = self.slot_mut(index)?;
        slot.invoice = Some(invoice);
        slot.last_updated = now;
        Ok(())
    }

    pub fn completed_count(&self) -> usize {
        let terminal = self.direction.terminal_state();
        self.chunks
            .iter()
            .filter(|c| c.state == Some(terminal))
            .count()
    }

    pub fn is_complete(&self) -> bool {
        self.completed_count() == self.chunks.len()
    }

    pub fn status(&self) -> TransferStatus {
        let mut by_state = BTreeMap::new();
        for slot in &self.chunks {
            let name = slot.state.map(|s| s.as_str()).unwrap_or("none");
            *by_state.entry(name.to_string()).or_insert(0) += 1;
        }
        TransferStatus {
            file_id: hex::encode(self.metadata.file_id),
            peer: hex::encode(self.peer),
            direction: self.direction,
            completed: self.completed_count(),
            total: self.chunks.len(),
            by_state,
            completed_path: self.completed_path.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(chunks: usize) -> FileMetadata {
        FileMetadata {
            file_id: [1u8; 32],
            filename: "f.bin".into(),
            size: chunks as u64 * 4,
            chunk_size: 4,
            chunk_price_milli_atoms: 10,
            manifest: vec![[0u8; 32]; chunks],
        }
    }

    #[test]
    fn test_download_pipeline_and_replay() {
        let mut rec = ChunkTransferRecord::new([2u8; 32], Direction::Download, meta(2), 1);
        assert!(rec.advance(0, ChunkState::HasInvoice, 2).expect("has invoice"));
        assert!(!rec.advance(0, ChunkState::HasInvoice, 3).expect("replay"));
        assert!(matches!(
            rec.advance(0, ChunkState::Paid, 4),
            Err(TransferError::InvalidTransition { .. })
        ));
        for s in [
            ChunkState::PayingInvoice,
            ChunkState::Paid,
            ChunkState::RequestedChunk,
            ChunkState::Downloaded,
        ] {
            assert!(rec.advance(0, s, 5).expect("advance"));
        }
        assert_eq!(rec.completed_count(), 1);
        assert!(!rec.is_complete());
        assert_eq!(rec.status().by_state.get("none"), Some(&1));
    }

    #[test]
    fn test_reset_to_invoice_only_before_paid() {
        let mut rec = ChunkTransferRecord::new([2u8; 32], Direction::Download, meta(1), 1);
        rec.advance(0, ChunkState::HasInvoice, 2).expect("advance");
        rec.advance(0, ChunkState::PayingInvoice, 3).expect("advance");
        rec.reset_to_invoice(0, None, 4).expect("reset from paying");
        rec.advance(0, ChunkState::PayingInvoice, 5).expect("advance");
        rec.advance(0, ChunkState::Paid, 6).expect("advance");
        assert!(rec.reset_to_invoice(0, None, 7).is_err());
    }

    #[test]
    fn test_out_of_range() {
        let mut rec = ChunkTransferRecord::new([2u8; 32], Direction::Upload, meta(1), 1);
        assert!(matches!(
            rec.advance(5, ChunkState::SentInvoice, 2),
            Err(TransferError::ChunkOutOfRange { index: 5, count: 1 })
        ));
    }
}
