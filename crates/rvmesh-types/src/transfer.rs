//! Chunk transfer directions, per-chunk states and file metadata.
//!
//! ## Chunk pipelines
//!
//! Each chunk advances independently through its direction's pipeline:
//!
//! - Download: `HasInvoice -> PayingInvoice -> Paid -> RequestedChunk -> Downloaded`
//! - Upload: `SentInvoice -> Paid -> Uploaded`
//!
//! `Failed` sits outside both pipelines and marks a chunk whose payment
//! attempts were exhausted.

use serde::{Deserialize, Serialize};
use serde_with::serde_as;

use crate::{ChunkHash, FileId};

/// Direction of a file transfer, from the local client's point of view.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, ts_rs::TS)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Upload,
    Download,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Upload => "upload",
            Direction::Download => "download",
        }
    }

    /// Ordered pipeline of states for this direction.
    pub fn pipeline(&self) -> &'static [ChunkState] {
        match self {
            Direction::Download => &DOWNLOAD_PIPELINE,
            Direction::Upload => &UPLOAD_PIPELINE,
        }
    }

    /// Terminal (successful) state for this direction.
    pub fn terminal_state(&self) -> ChunkState {
        match self {
            Direction::Download => ChunkState::Downloaded,
            Direction::Upload => ChunkState::Uploaded,
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "upload" => Some(Direction::Upload),
            "download" => Some(Direction::Download),
            _ => None,
        }
    }
}

const DOWNLOAD_PIPELINE: [ChunkState; 5] = [
    ChunkState::HasInvoice,
    ChunkState::PayingInvoice,
    ChunkState::Paid,
    ChunkState::RequestedChunk,
    ChunkState::Downloaded,
];

const UPLOAD_PIPELINE: [ChunkState; 3] = [
    ChunkState::SentInvoice,
    ChunkState::Paid,
    ChunkState::Uploaded,
];

/// State of a single chunk.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, ts_rs::TS)]
#[serde(rename_all = "snake_case")]
pub enum ChunkState {
    HasInvoice,
    PayingInvoice,
    SentInvoice,
    RequestedChunk,
    Paid,
    Uploaded,
    Downloaded,
    /// Payment attempts exhausted. Not part of either pipeline.
    Failed,
}

/// Outcome of checking a requested state change against the pipeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transition {
    /// The change is the next step of the pipeline.
    Apply,
    /// The change was already applied (duplicate delivery); nothing to do.
    NoOp,
    /// The change would skip a stage or is foreign to the direction.
    Invalid,
}

impl ChunkState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChunkState::HasInvoice => "has_invoice",
            ChunkState::PayingInvoice => "paying_invoice",
            ChunkState::SentInvoice => "sent_invoice",
            ChunkState::RequestedChunk => "requested_chunk",
            ChunkState::Paid => "paid",
            ChunkState::Uploaded => "uploaded",
            ChunkState::Downloaded => "downloaded",
            ChunkState::Failed => "failed",
        }
    }

    /// Check a forward transition `from -> to` for the given direction.
    ///
    /// `from == None` means the chunk has no state yet. Moving to a state at
    /// or behind the current one is a replay and reported as `NoOp`.
    pub fn check_transition(
        direction: Direction,
        from: Option<ChunkState>,
        to: ChunkState,
    ) -> Transition {
        let pipeline = direction.pipeline();
        let first = pipeline[0];

        if to == ChunkState::Failed || from == Some(ChunkState::Failed) {
            if direction != Direction::Download {
                return Transition::Invalid;
            }
            return match (from, to) {
                (Some(ChunkState::PayingInvoice), ChunkState::Failed) => Transition::Apply,
                (Some(ChunkState::Failed), ChunkState::Failed) => Transition::NoOp,
                (Some(ChunkState::Failed), t) if t == first => Transition::Apply,
                _ => Transition::Invalid,
            };
        }

        let Some(to_pos) = pipeline.iter().position(|s| *s == to) else {
            return Transition::Invalid;
        };

        match from {
            None => {
                if to == first {
                    Transition::Apply
                } else {
                    Transition::Invalid
                }
            }
            Some(current) => {
                let Some(from_pos) = pipeline.iter().position(|s| *s == current) else {
                    return Transition::Invalid;
                };
                if to_pos == from_pos + 1 {
                    Transition::Apply
                } else if to_pos <= from_pos {
                    Transition::NoOp
                } else {
                    Transition::Invalid
                }
            }
        }
    }

    /// Whether a download chunk in this state may be put back at
    /// `HasInvoice` (invoice expiry, failed payment, explicit retry).
    pub fn can_reset_to_invoice(from: Option<ChunkState>) -> bool {
        matches!(
            from,
            None | Some(ChunkState::HasInvoice)
                | Some(ChunkState::PayingInvoice)
                | Some(ChunkState::Failed)
        )
    }
}

impl std::fmt::Display for ChunkState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Metadata describing a shared file.
///
/// The manifest is the ordered list of chunk content hashes and is
/// immutable once the metadata is created.
#[serde_as]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadata {
    #[serde_as(as = "serde_with::hex::Hex")]
    pub file_id: FileId,
    pub filename: String,
    pub size: u64,
    pub chunk_size: u64,
    /// Price of a single chunk in milli-atoms.
    pub chunk_price_milli_atoms: u64,
    #[serde_as(as = "Vec<serde_with::hex::Hex>")]
    pub manifest: Vec<ChunkHash>,
}

impl FileMetadata {
    /// Number of chunks in the manifest.
    pub fn chunk_count(&self) -> usize {
        self.manifest.len()
    }

    /// Total cost of downloading the whole file.
    pub fn total_cost_milli_atoms(&self) -> u64 {
        self.chunk_price_milli_atoms
            .saturating_mul(self.manifest.len() as u64)
    }

    /// Bytes hashed to derive the file id.
    ///
    /// Format: `LE32(len(filename)) || filename || LE64(size) || LE64(chunk_size)
    /// || LE64(price) || manifest...`
    pub fn id_preimage(&self) -> Vec<u8> {
        let name = self.filename.as_bytes();
        let mut out = Vec::with_capacity(4 + name.len() + 24 + self.manifest.len() * 32);
        out.extend_from_slice(&(name.len() as u32).to_le_bytes());
        out.extend_from_slice(name);
        out.extend_from_slice(&self.size.to_le_bytes());
        out.extend_from_slice(&self.chunk_size.to_le_bytes());
        out.extend_from_slice(&self.chunk_price_milli_atoms.to_le_bytes());
        for hash in &self.manifest {
            out.extend_from_slice(hash);
        }
        out
    }

    /// Whether `file_id` matches the metadata under the given hash function.
    pub fn id_matches(&self, hash: impl Fn(&[u8]) -> [u8; 32]) -> bool {
        hash(&self.id_preimage()) == self.file_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [ChunkState; 8] = [
        ChunkState::HasInvoice,
        ChunkState::PayingInvoice,
        ChunkState::SentInvoice,
        ChunkState::RequestedChunk,
        ChunkState::Paid,
        ChunkState::Uploaded,
        ChunkState::Downloaded,
        ChunkState::Failed,
    ];

    /// Every transition that is not `Invalid`, written out by hand.
    fn table() -> Vec<(Direction, Option<ChunkState>, ChunkState, Transition)> {
        use ChunkState::*;
        use Direction::{Download as D, Upload as U};
        use Transition::{Apply, NoOp};
        vec![
            // Download pipeline.
            (D, None, HasInvoice, Apply),
            (D, Some(HasInvoice), HasInvoice, NoOp),
            (D, Some(HasInvoice), PayingInvoice, Apply),
            (D, Some(PayingInvoice), HasInvoice, NoOp),
            (D, Some(PayingInvoice), PayingInvoice, NoOp),
            (D, Some(PayingInvoice), Paid, Apply),
            (D, Some(PayingInvoice), Failed, Apply),
            (D, Some(Paid), HasInvoice, NoOp),
            (D, Some(Paid), PayingInvoice, NoOp),
            (D, Some(Paid), Paid, NoOp),
            (D, Some(Paid), RequestedChunk, Apply),
            (D, Some(RequestedChunk), HasInvoice, NoOp),
            (D, Some(RequestedChunk), PayingInvoice, NoOp),
            (D, Some(RequestedChunk), Paid, NoOp),
            (D, Some(RequestedChunk), RequestedChunk, NoOp),
            (D, Some(RequestedChunk), Downloaded, Apply),
            (D, Some(Downloaded), HasInvoice, NoOp),
            (D, Some(Downloaded), PayingInvoice, NoOp),
            (D, Some(Downloaded), Paid, NoOp),
            (D, Some(Downloaded), RequestedChunk, NoOp),
            (D, Some(Downloaded), Downloaded, NoOp),
            (D, Some(Failed), HasInvoice, Apply),
            (D, Some(Failed), Failed, NoOp),
            // Upload pipeline.
            (U, None, SentInvoice, Apply),
            (U, Some(SentInvoice), SentInvoice, NoOp),
            (U, Some(SentInvoice), Paid, Apply),
            (U, Some(Paid), SentInvoice, NoOp),
            (U, Some(Paid), Paid, NoOp),
            (U, Some(Paid), Uploaded, Apply),
            (U, Some(Uploaded), SentInvoice, NoOp),
            (U, Some(Uploaded), Paid, NoOp),
            (U, Some(Uploaded), Uploaded, NoOp),
        ]
    }

    #[test]
    fn test_exhaustive_transition_table() {
        let table = table();
        let mut checked = 0;
        for direction in [Direction::Download, Direction::Upload] {
            let froms = std::iter::once(None).chain(ALL.iter().copied().map(Some));
            for from in froms {
                for to in ALL {
                    let expected = table
                        .iter()
                        .find(|(d, f, t, _)| *d == direction && *f == from && *t == to)
                        .map_or(Transition::Invalid, |row| row.3);
                    assert_eq!(
                        ChunkState::check_transition(direction, from, to),
                        expected,
                        "{direction:?}: {from:?} -> {to:?}"
                    );
                    checked += 1;
                }
            }
        }
        assert_eq!(checked, 2 * 9 * 8);
    }

    #[test]
    fn test_download_happy_path_has_no_skips() {
        let path = Direction::Download.pipeline();
        let mut current = None;
        for state in path {
            assert_eq!(
                ChunkState::check_transition(Direction::Download, current, *state),
                Transition::Apply
            );
            current = Some(*state);
        }
        assert_eq!(current, Some(ChunkState::Downloaded));
    }

    #[test]
    fn test_download_skip_rejected() {
        assert_eq!(
            ChunkState::check_transition(
                Direction::Download,
                Some(ChunkState::HasInvoice),
                ChunkState::Paid
            ),
            Transition::Invalid
        );
        assert_eq!(
            ChunkState::check_transition(
                Direction::Download,
                Some(ChunkState::Paid),
                ChunkState::Downloaded
            ),
            Transition::Invalid
        );
    }

    #[test]
    fn test_replay_is_noop() {
        assert_eq!(
            ChunkState::check_transition(
                Direction::Download,
                Some(ChunkState::Downloaded),
                ChunkState::Downloaded
            ),
            Transition::NoOp
        );
        assert_eq!(
            ChunkState::check_transition(
                Direction::Upload,
                Some(ChunkState::Uploaded),
                ChunkState::Paid
            ),
            Transition::NoOp
        );
    }

    #[test]
    fn test_upload_rejects_download_states() {
        assert_eq!(
            ChunkState::check_transition(Direction::Upload, None, ChunkState::HasInvoice),
            Transition::Invalid
        );
        assert_eq!(
            ChunkState::check_transition(
                Direction::Upload,
                Some(ChunkState::Paid),
                ChunkState::Downloaded
            ),
            Transition::Invalid
        );
    }

    #[test]
    fn test_reset_to_invoice() {
        assert!(ChunkState::can_reset_to_invoice(Some(ChunkState::PayingInvoice)));
        assert!(ChunkState::can_reset_to_invoice(Some(ChunkState::Failed)));
        assert!(!ChunkState::can_reset_to_invoice(Some(ChunkState::Paid)));
        assert!(!ChunkState::can_reset_to_invoice(Some(ChunkState::Downloaded)));
    }

    #[test]
    fn test_metadata_cost_and_preimage() {
        let meta = FileMetadata {
            file_id: [0u8; 32],
            filename: "a.bin".to_string(),
            size: 10,
            chunk_size: 4,
            chunk_price_milli_atoms: 1500,
            manifest: vec![[1u8; 32], [2u8; 32], [3u8; 32]],
        };
        assert_eq!(meta.chunk_count(), 3);
        assert_eq!(meta.total_cost_milli_atoms(), 4500);
        assert_eq!(meta.id_preimage().len(), 4 + 5 + 24 + 96);
    }
}
