//! On-disk chunk storage.
//!
//! Downloaded chunks live at `<root>/.partial/<file_id>/<index>` until
//! every chunk is present. Assembly streams them into
//! `<root>/.partial/<file_id>.assembling`, renames that to
//! `<root>/<filename>` and removes the partial directory.

use std::fs::File;
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use rvmesh_types::transfer::FileMetadata;
use rvmesh_types::FileId;

use crate::chunker;
use crate::{Result, TransferError};

#[derive(Clone, Debug)]
pub struct ChunkStore {
    root: PathBuf,
}

impl ChunkStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn partial_dir(&self, file_id: &FileId) -> PathBuf {
        self.root.join(".partial").join(hex::encode(file_id))
    }

    fn staging_path(&self, file_id: &FileId) -> PathBuf {
        self.root
            .join(".partial")
            .join(format!("{}.assembling", hex::encode(file_id)))
    }

    /// Persist a verified chunk.
    pub fn write_chunk(&self, file_id: &FileId, index: u32, data: &[u8]) -> Result<()> {
        let dir = self.partial_dir(file_id);
        std::fs::create_dir_all(&dir)?;
        let tmp = dir.join(format!("{index}.tmp"));
        std::fs::write(&tmp, data)?;
        std::fs::rename(&tmp, dir.join(index.to_string()))?;
        debug!(index, bytes = data.len(), "chunk stored");
        Ok(())
    }

    pub fn has_chunk(&self, file_id: &FileId, index: u32) -> bool {
        self.partial_dir(file_id).join(index.to_string()).is_file()
    }

    /// Concatenate every chunk into the final file and return its path.
    ///
    /// Chunks are re-verified against the manifest while assembling. On
    /// failure the partial chunks are left in place so assembly can be
    /// repeated.
    pub fn assemble(&self, meta: &FileMetadata) -> Result<PathBuf> {
        let dir = self.partial_dir(&meta.file_id);
        let staging = self.staging_path(&meta.file_id);
        let mut out = BufWriter::new(File::create(&staging)?);
        let mut written = 0u64;
        for index in 0..meta.chunk_count() as u32 {
            let data = std::fs::read(dir.join(index.to_string()))?;
            if !chunker::verify_chunk(meta, index, &data) {
                drop(out);
                let _ = std::fs::remove_file(&staging);
                return Err(TransferError::ContentMismatch {
                    file_id: hex::encode(meta.file_id),
                    index,
                });
            }
            out.write_all(&data)?;
            written += data.len() as u64;
        }
        out.flush()?;
        drop(out);

        let path = self.unique_path(&meta.filename);
        std::fs::rename(&staging, &path)?;
        std::fs::remove_dir_all(&dir)?;
        info!(path = %path.display(), bytes = written, "file assembled");
        Ok(path)
    }

    /// Pick `<root>/<name>`, adding a numeric suffix if it already exists.
    fn unique_path(&self, filename: &str) -> PathBuf {
        let name = sanitize(filename);
        let candidate = self.root.join(&name);
        if is_free(&candidate) {
            return candidate;
        }
        let (stem, ext) = match name.rsplit_once('.') {
            Some((s, e)) if !s.is_empty() => (s.to_string(), format!(".{e}")),
            _ => (name.clone(), String::new()),
        };
        let mut n = 1u32;
        loop {
            let candidate = self.root.join(format!("{stem} ({n}){ext}"));
            if is_free(&candidate) {
                return candidate;
            }
            n += 1;
        }
    }
}

/// Nothing, not even a dangling symlink, exists at `path`.
fn is_free(path: &Path) -> bool {
    std::fs::symlink_metadata(path).is_err()
}

/// Read chunk `index` of a shared file from its original location.
pub fn read_shared_chunk(path: &Path, meta: &FileMetadata, index: u32) -> Result<Vec<u8>> {
    let (offset, len) = chunker::chunk_range(meta, index).ok_or(TransferError::ChunkOutOfRange {
        index,
        count: meta.chunk_count(),
    })?;
    let unavailable = |source: std::io::Error| TransferError::SourceUnavailable {
        path: path.display().to_string(),
        source,
    };
    let mut file = File::open(path).map_err(unavailable)?;
    file.seek(SeekFrom::Start(offset)).map_err(unavailable)?;
    let mut buf = vec![0u8; len as usize];
    file.read_exact(&mut buf).map_err(unavailable)?;
    Ok(buf)
}

/// Strip directory components and reserved names from a peer-supplied
/// filename.
fn sanitize(filename: &str) -> String {
    let base = filename
        .rsplit(|c| c == '/' || c == '\\')
        .next()
        .unwrap_or_default()
        .trim();
    match base {
        "" | "." | ".." => "download".to_string(),
        name => name.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assemble_out_of_order_and_no_clobber() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ChunkStore::new(dir.path());
        let data = b"abcdefghij".to_vec();
        let meta = chunker::describe("notes.txt", &data, 4, 1).expect("describe");

        std::fs::write(dir.path().join("notes.txt"), b"existing").expect("seed");
        for index in [2u32, 0, 1] {
            let (off, len) = chunker::chunk_range(&meta, index).expect("range");
            store
                .write_chunk(&meta.file_id, index, &data[off as usize..(off + len) as usize])
                .expect("write");
        }
        assert!(store.has_chunk(&meta.file_id, 1));

        let path = store.assemble(&meta).expect("assemble");
        assert_eq!(path.file_name().and_then(|n| n.to_str()), Some("notes (1).txt"));
        assert_eq!(std::fs::read(&path).expect("read"), data);
        assert!(!store.has_chunk(&meta.file_id, 1));
    }

    #[test]
    fn test_failed_assembly_can_be_repeated() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ChunkStore::new(dir.path());
        let data = b"abcdefghij".to_vec();
        let meta = chunker::describe("notes.txt", &data, 4, 1).expect("describe");
        for index in 0..3u32 {
            let (off, len) = chunker::chunk_range(&meta, index).expect("range");
            store
                .write_chunk(&meta.file_id, index, &data[off as usize..(off + len) as usize])
                .expect("write");
        }

        // Something occupies the staging path.
        let staging = store.staging_path(&meta.file_id);
        std::fs::create_dir_all(&staging).expect("block staging");
        assert!(matches!(store.assemble(&meta), Err(TransferError::Io(_))));
        assert!(store.has_chunk(&meta.file_id, 2));

        std::fs::remove_dir(&staging).expect("unblock");
        let path = store.assemble(&meta).expect("assemble");
        assert_eq!(std::fs::read(&path).expect("read"), data);
    }

    #[cfg(unix)]
    #[test]
    fn test_dangling_symlink_not_clobbered() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ChunkStore::new(dir.path());
        std::os::unix::fs::symlink(dir.path().join("nowhere"), dir.path().join("a.txt"))
            .expect("symlink");
        assert_eq!(store.unique_path("a.txt"), dir.path().join("a (1).txt"));
    }

    #[test]
    fn test_read_shared_chunk() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("src.bin");
        std::fs::write(&path, b"0123456789").expect("write");
        let meta = chunker::describe("src.bin", b"0123456789", 4, 1).expect("describe");
        assert_eq!(read_shared_chunk(&path, &meta, 2).expect("read"), b"89");
        assert!(read_shared_chunk(&path, &meta, 3).is_err());

        std::fs::remove_file(&path).expect("remove");
        let err = read_shared_chunk(&path, &meta, 0).expect_err("missing source");
        assert!(matches!(err, TransferError::SourceUnavailable { .. }));
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_sanitize_strips_paths() {
        assert_eq!(sanitize("../../etc/passwd"), "passwd");
        assert_eq!(sanitize("a\\b.txt"), "b.txt");
        assert_eq!(sanitize(".."), "download");
    }
}
