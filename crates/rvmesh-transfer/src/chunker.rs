//! 1 MiB chunk splitting and manifest construction.
//!
//! A file's manifest is the ordered list of BLAKE3 hashes of its chunks.
//! The file id commits to the name, size, chunk size, price and manifest.

use std::path::Path;

use rvmesh_crypto::blake3;
use rvmesh_types::transfer::FileMetadata;
use rvmesh_types::ChunkHash;

use crate::{Result, TransferError};

/// Chunk size: 1 MiB.
pub const CHUNK_SIZE: usize = 1024 * 1024;

/// Largest chunk size accepted in a peer's metadata.
pub const MAX_CHUNK_SIZE: u64 = 4 * CHUNK_SIZE as u64;

/// Build metadata for `data` with the given chunk size.
pub fn describe(filename: &str, data: &[u8], chunk_size: usize, price: u64) -> Result<FileMetadata> {
    if data.is_empty() {
        return Err(TransferError::InvalidMetadata("file is empty".into()));
    }
    if chunk_size == 0 || chunk_size as u64 > MAX_CHUNK_SIZE {
        return Err(TransferError::InvalidMetadata(format!("chunk size {chunk_size} out of range")));
    }
    let manifest: Vec<ChunkHash> = data.chunks(chunk_size).map(blake3::hash).collect();
    let mut meta = FileMetadata {
        file_id: [0u8; 32],
        filename: filename.to_string(),
        size: data.len() as u64,
        chunk_size: chunk_size as u64,
        chunk_price_milli_atoms: price,
        manifest,
    };
    meta.file_id = blake3::file_id(&meta.id_preimage());
    Ok(meta)
}

/// Read and describe a file on disk using [`CHUNK_SIZE`] chunks.
pub fn describe_file(path: &Path, price: u64) -> Result<FileMetadata> {
    let data = std::fs::read(path)?;
    let filename = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| TransferError::InvalidMetadata("path has no file name".into()))?;
    describe(filename, &data, CHUNK_SIZE, price)
}

/// Check that metadata is internally consistent.
///
/// The chunk size is bounded, so `size` is bounded by the manifest length.
pub fn validate(meta: &FileMetadata) -> Result<()> {
    if meta.manifest.is_empty() || meta.size == 0 {
        return Err(TransferError::InvalidMetadata("empty manifest".into()));
    }
    if meta.chunk_size == 0 || meta.chunk_size > MAX_CHUNK_SIZE {
        return Err(TransferError::InvalidMetadata(format!(
            "chunk size {} out of range",
            meta.chunk_size
        )));
    }
    let expected = meta.size.div_ceil(meta.chunk_size);
    if expected != meta.manifest.len() as u64 {
        return Err(TransferError::InvalidMetadata(format!(
            "{} chunks listed, size implies {expected}",
            meta.manifest.len()
        )));
    }
    if !meta.id_matches(blake3::file_id) {
        return Err(TransferError::InvalidMetadata("file id does not match".into()));
    }
    Ok(())
}

/// Whether `data` is the content of chunk `index`.
///
/// Every chunk but the last must be exactly `chunk_size` bytes.
pub fn verify_chunk(meta: &FileMetadata, index: u32, data: &[u8]) -> bool {
    let Some((_, len)) = chunk_range(meta, index) else {
        return false;
    };
    data.len() as u64 == len && blake3::hash(data) == meta.manifest[index as usize]
}

/// Byte range of chunk `index` within the file.
pub fn chunk_range(meta: &FileMetadata, index: u32) -> Option<(u64, u64)> {
    if index as usize >= meta.manifest.len() {
        return None;
    }
    let start = (index as u64).saturating_mul(meta.chunk_size);
    let end = start.saturating_add(meta.chunk_size).min(meta.size);
    Some((start, end.saturating_sub(start)))
}
