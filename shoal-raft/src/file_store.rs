//! File-backed term/vote store.
//!
//! The record is tiny, so every write replaces the whole file:
//!
//! ```text
//! write:  encode → <path>.tmp → fsync → rename over <path> → fsync dir
//! open:   <path> exists? verify magic + CRC → cached state
//! ```
//!
//! File format:
//!
//! ```text
//! [magic: 4][version: 4][PersistentState: 9 or 17][crc32: 4]
//! ```

use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use bytes::{Buf, BufMut, BytesMut};
use shoal_core::{NodeId, TermId};
use tracing::{debug, info};

use crate::storage::{PersistentState, StorageError, StorageResult, TermStore};

/// Magic bytes for the term file format ("TERM").
const TERM_FILE_MAGIC: u32 = 0x5445_524D;

/// Current version of the term file format.
const TERM_FILE_VERSION: u32 = 1;

/// Durable term/vote store backed by a single file.
#[derive(Debug)]
pub struct FileTermStore {
    path: PathBuf,
    state: PersistentState,
}

impl FileTermStore {
    /// Opens the store at `path`, loading the existing record if present.
    ///
    /// A missing file is a fresh start (term 0, no vote).
    ///
    /// # Errors
    /// Returns `Io` if the file cannot be read, `Corruption` if it fails validation.
    pub fn open(path: impl Into<PathBuf>) -> StorageResult<Self> {
        let path = path.into();
        let state = match fs::read(&path) {
            Ok(data) => {
                let state = decode_file(&data)?;
                info!(
                    path = %path.display(),
                    term = state.current_term.get(),
                    voted_for = ?state.voted_for,
                    "Loaded term state"
                );
                state
            }
            Err(err) if err.kind() == ErrorKind::NotFound => PersistentState::default(),
            Err(err) => return Err(StorageError::io("read term file", &err)),
        };

        Ok(Self { path, state })
    }

    /// Returns the path of the backing file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Persists `next` and only then updates the cache.
    fn persist(&mut self, next: PersistentState) -> StorageResult<()> {
        if next == self.state {
            return Ok(());
        }

        let data = encode_file(&next);
        let tmp = self.path.with_extension("tmp");

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp)
            .map_err(|e| StorageError::io("open term file", &e))?;
        file.write_all(&data)
            .map_err(|e| StorageError::io("write term file", &e))?;
        file.sync_all()
            .map_err(|e| StorageError::io("sync term file", &e))?;
        drop(file);

        fs::rename(&tmp, &self.path).map_err(|e| StorageError::io("rename term file", &e))?;
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            File::open(dir)
                .and_then(|d| d.sync_all())
                .map_err(|e| StorageError::io("sync term dir", &e))?;
        }

        debug!(
            term = next.current_term.get(),
            voted_for = ?next.voted_for,
            "Persisted term state"
        );
        self.state = next;
        Ok(())
    }
}

impl TermStore for FileTermStore {
    fn current_term(&self) -> TermId {
        self.state.current_term
    }

    fn voted_for(&self) -> Option<NodeId> {
        self.state.voted_for
    }

    fn set_current_term(&mut self, term: TermId) -> StorageResult<()> {
        let voted_for = if term == self.state.current_term {
            self.state.voted_for
        } else {
            None
        };
        self.persist(PersistentState::with_values(term, voted_for))
    }

    fn set_voted_for(&mut self, candidate: Option<NodeId>) -> StorageResult<()> {
        self.persist(PersistentState::with_values(self.state.current_term, candidate))
    }

    fn set_term_and_vote(&mut self, term: TermId, candidate: Option<NodeId>) -> StorageResult<()> {
        self.persist(PersistentState::with_values(term, candidate))
    }
}

fn encode_file(state: &PersistentState) -> BytesMut {
    let mut buf = BytesMut::with_capacity(4 + 4 + PersistentState::ENCODED_SIZE_MAX + 4);
    buf.put_u32(TERM_FILE_MAGIC);
    buf.put_u32(TERM_FILE_VERSION);
    state.encode(&mut buf);
    let checksum = crc32fast::hash(&buf);
    buf.put_u32(checksum);
    buf
}

fn decode_file(data: &[u8]) -> StorageResult<PersistentState> {
    let min_size = 4 + 4 + 9 + 4;
    if data.len() < min_size {
        return Err(StorageError::Corruption {
            message: format!("term file too short: {} bytes, minimum {min_size}", data.len()),
        });
    }

    let (payload, mut trailer) = data.split_at(data.len() - 4);
    let stored = trailer.get_u32();
    let computed = crc32fast::hash(payload);
    if stored != computed {
        return Err(StorageError::Corruption {
            message: format!("term file checksum mismatch: expected {stored:#x}, got {computed:#x}"),
        });
    }

    let mut buf = payload;
    let magic = buf.get_u32();
    if magic != TERM_FILE_MAGIC {
        return Err(StorageError::Corruption {
            message: format!("bad term file magic {magic:#x}"),
        });
    }
    let version = buf.get_u32();
    if version != TERM_FILE_VERSION {
        return Err(StorageError::Corruption {
            message: format!("unsupported term file version {version}"),
        });
    }

    let state = PersistentState::decode(&mut buf).ok_or_else(|| StorageError::Corruption {
        message: "truncated term record".to_string(),
    })?;
    if buf.has_remaining() {
        return Err(StorageError::Corruption {
            message: format!("{} trailing bytes in term file", buf.remaining()),
        });
    }
    Ok(state)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_store_starts_at_term_zero() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileTermStore::open(dir.path().join("term")).unwrap();

        assert_eq!(store.current_term(), TermId::new(0));
        assert!(store.voted_for().is_none());
    }

    #[test]
    fn test_state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("term");

        {
            let mut store = FileTermStore::open(&path).unwrap();
            store.set_current_term(TermId::new(3)).unwrap();
            store.set_voted_for(Some(NodeId::new(2))).unwrap();
        }

        let store = FileTermStore::open(&path).unwrap();
        assert_eq!(store.current_term(), TermId::new(3));
        assert_eq!(store.voted_for(), Some(NodeId::new(2)));
    }

    #[test]
    fn test_new_term_clears_vote_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("term");

        let mut store = FileTermStore::open(&path).unwrap();
        store.set_term_and_vote(TermId::new(1), Some(NodeId::new(1))).unwrap();
        store.set_current_term(TermId::new(2)).unwrap();
        drop(store);

        let store = FileTermStore::open(&path).unwrap();
        assert_eq!(store.current_term(), TermId::new(2));
        assert!(store.voted_for().is_none());
    }

    #[test]
    fn test_corrupted_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("term");

        let mut store = FileTermStore::open(&path).unwrap();
        store.set_term_and_vote(TermId::new(9), Some(NodeId::new(4))).unwrap();
        drop(store);

        let mut data = fs::read(&path).unwrap();
        data[10] ^= 0xFF;
        fs::write(&path, &data).unwrap();

        let result = FileTermStore::open(&path);
        assert!(matches!(result, Err(StorageError::Corruption { .. })));
    }

    #[test]
    fn test_truncated_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("term");
        fs::write(&path, [0u8; 6]).unwrap();

        assert!(matches!(
            FileTermStore::open(&path),
            Err(StorageError::Corruption { .. })
        ));
    }
}
