//! Replicated log entries and the log collaborator.
//!
//! The state machine never touches disk itself. It reads and writes the log
//! through [`LogStore`], which the hosting process backs with whatever storage
//! engine it uses. [`MemoryLog`] is the in-memory implementation used by tests
//! and simulation.
//!
//! # Snapshot boundary
//!
//! A log may have been compacted: every entry up to and including
//! `snapshot_index` has been folded into a snapshot owned by the application
//! layer and is no longer readable. The boundary still answers `term_at`
//! so that consistency checks against `prev_log_index == snapshot_index` work.

use bytes::Bytes;
use shoal_core::{LogIndex, TermId};

use crate::storage::{StorageError, StorageResult};

/// A single entry in the replicated log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    /// The term in which the leader created this entry.
    pub term: TermId,
    /// The log index of this entry.
    pub index: LogIndex,
    /// Opaque command payload for the application layer.
    pub data: Bytes,
}

impl LogEntry {
    /// Creates a new log entry.
    #[must_use]
    pub const fn new(term: TermId, index: LogIndex, data: Bytes) -> Self {
        Self { term, index, data }
    }
}

/// The log collaborator.
///
/// Invariants every implementation upholds:
/// - indices are contiguous, starting at `snapshot_index + 1`
/// - `last_applied <= commit_index <= last_index`
/// - a successful `append` or `truncate_from` is durable before it returns
pub trait LogStore {
    /// Appends entries to the end of the log.
    ///
    /// The first entry's index must be `last_index + 1` and the batch must be contiguous.
    ///
    /// # Errors
    /// Returns `Corruption` for a non-contiguous batch, or `Io` if the write failed.
    fn append(&mut self, entries: &[LogEntry]) -> StorageResult<()>;

    /// Returns the entry at `index`, or `None` if it is compacted or beyond the end.
    fn entry_at(&self, index: LogIndex) -> Option<LogEntry>;

    /// Returns the term at `index`.
    ///
    /// Index 0 has term 0, the snapshot boundary has `snapshot_term`.
    /// Returns `None` for compacted indices before the boundary and for
    /// indices beyond the end of the log.
    fn term_at(&self, index: LogIndex) -> Option<TermId>;

    /// Returns up to `max` entries starting at `start`.
    ///
    /// # Errors
    /// Returns `Compacted` if `start` is at or before the snapshot boundary.
    fn entries_from(&self, start: LogIndex, max: usize) -> StorageResult<Vec<LogEntry>>;

    /// Index of the last entry, or the snapshot boundary if the log is empty.
    fn last_index(&self) -> LogIndex;

    /// Term of the last entry, or the snapshot term if the log is empty.
    fn last_term(&self) -> TermId;

    /// Removes the entry at `index` and everything after it.
    ///
    /// # Errors
    /// Returns `Compacted` if `index` is at or before the snapshot boundary.
    fn truncate_from(&mut self, index: LogIndex) -> StorageResult<()>;

    /// Last index folded into a snapshot (0 if never compacted).
    fn snapshot_index(&self) -> LogIndex;

    /// Term of the entry at `snapshot_index`.
    fn snapshot_term(&self) -> TermId;

    /// Discards every entry up to and including `index`, moving the snapshot boundary.
    ///
    /// # Errors
    /// Returns an error if `index` has not been applied yet or is beyond the log.
    fn compact_through(&mut self, index: LogIndex) -> StorageResult<()>;

    /// Highest index known to be replicated on a majority.
    fn commit_index(&self) -> LogIndex;

    /// Records a new commit index.
    fn set_commit_index(&mut self, index: LogIndex);

    /// Highest index delivered to the application layer.
    fn last_applied(&self) -> LogIndex;

    /// Records a new last-applied index.
    fn set_last_applied(&mut self, index: LogIndex);

    /// Returns true if a log ending at (`other_term`, `other_index`) is at least
    /// as up-to-date as this one.
    ///
    /// Terms are compared first, then lengths.
    fn is_up_to_date(&self, other_term: TermId, other_index: LogIndex) -> bool {
        let my_term = self.last_term();
        other_term > my_term || (other_term == my_term && other_index >= self.last_index())
    }
}

/// In-memory log.
#[derive(Debug, Clone, Default)]
pub struct MemoryLog {
    /// Entries after the snapshot boundary; `entries[0]` has index `snapshot_index + 1`.
    entries: Vec<LogEntry>,
    snapshot_index: LogIndex,
    snapshot_term: TermId,
    commit_index: LogIndex,
    last_applied: LogIndex,
}

impl MemoryLog {
    /// Creates a new empty log.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
            snapshot_index: LogIndex::new(0),
            snapshot_term: TermId::new(0),
            commit_index: LogIndex::new(0),
            last_applied: LogIndex::new(0),
        }
    }

    /// Returns true if the log holds no entries after the snapshot boundary.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of entries held after the snapshot boundary.
    #[must_use]
    pub fn len(&self) -> u64 {
        // Safe cast: entries.len() is bounded by memory, which always fits in u64.
        #[allow(clippy::cast_possible_truncation)]
        let len = self.entries.len() as u64;
        len
    }

    /// Returns the terms of all retained entries in index order.
    #[must_use]
    pub fn terms(&self) -> Vec<TermId> {
        self.entries.iter().map(|e| e.term).collect()
    }

    /// Offset into `entries` for a retained index.
    fn offset(&self, index: LogIndex) -> Option<usize> {
        if index <= self.snapshot_index || index > self.last_index() {
            return None;
        }
        // Safe cast: the difference is bounded by entries.len().
        #[allow(clippy::cast_possible_truncation)]
        let offset = (index.get() - self.snapshot_index.get() - 1) as usize;
        Some(offset)
    }
}

impl LogStore for MemoryLog {
    fn append(&mut self, entries: &[LogEntry]) -> StorageResult<()> {
        let mut expected = self.last_index().next();
        for entry in entries {
            if entry.index != expected {
                return Err(StorageError::Corruption {
                    message: format!(
                        "non-sequential entry: expected {}, got {}",
                        expected.get(),
                        entry.index.get()
                    ),
                });
            }
            expected = expected.next();
        }

        self.entries.extend_from_slice(entries);
        Ok(())
    }

    fn entry_at(&self, index: LogIndex) -> Option<LogEntry> {
        self.offset(index).map(|offset| self.entries[offset].clone())
    }

    fn term_at(&self, index: LogIndex) -> Option<TermId> {
        if index.get() == 0 {
            return Some(TermId::new(0));
        }
        if index == self.snapshot_index {
            return Some(self.snapshot_term);
        }
        self.offset(index).map(|offset| self.entries[offset].term)
    }

    fn entries_from(&self, start: LogIndex, max: usize) -> StorageResult<Vec<LogEntry>> {
        if start <= self.snapshot_index {
            return Err(StorageError::Compacted {
                index: start,
                snapshot_index: self.snapshot_index,
            });
        }
        let Some(offset) = self.offset(start) else {
            return Ok(Vec::new());
        };
        let end = self.entries.len().min(offset.saturating_add(max));
        Ok(self.entries[offset..end].to_vec())
    }

    fn last_index(&self) -> LogIndex {
        // Safe cast: entries.len() always fits in u64.
        #[allow(clippy::cast_possible_truncation)]
        let len = self.entries.len() as u64;
        LogIndex::new(self.snapshot_index.get() + len)
    }

    fn last_term(&self) -> TermId {
        self.entries.last().map_or(self.snapshot_term, |e| e.term)
    }

    fn truncate_from(&mut self, index: LogIndex) -> StorageResult<()> {
        if index <= self.snapshot_index {
            return Err(StorageError::Compacted {
                index,
                snapshot_index: self.snapshot_index,
            });
        }
        if let Some(offset) = self.offset(index) {
            self.entries.truncate(offset);
        }

        // Postcondition: nothing at or after `index` remains.
        debug_assert!(self.last_index() < index);
        Ok(())
    }

    fn snapshot_index(&self) -> LogIndex {
        self.snapshot_index
    }

    fn snapshot_term(&self) -> TermId {
        self.snapshot_term
    }

    fn compact_through(&mut self, index: LogIndex) -> StorageResult<()> {
        if index <= self.snapshot_index {
            return Ok(());
        }
        if index > self.last_applied {
            return Err(StorageError::Corruption {
                message: format!(
                    "cannot compact through {} beyond last applied {}",
                    index.get(),
                    self.last_applied.get()
                ),
            });
        }
        let Some(offset) = self.offset(index) else {
            return Err(StorageError::NotFound { index });
        };

        self.snapshot_term = self.entries[offset].term;
        self.snapshot_index = index;
        self.entries.drain(..=offset);
        Ok(())
    }

    fn commit_index(&self) -> LogIndex {
        self.commit_index
    }

    fn set_commit_index(&mut self, index: LogIndex) {
        debug_assert!(index >= self.commit_index, "commit index must not decrease");
        debug_assert!(index <= self.last_index());
        self.commit_index = index;
    }

    fn last_applied(&self) -> LogIndex {
        self.last_applied
    }

    fn set_last_applied(&mut self, index: LogIndex) {
        debug_assert!(index <= self.commit_index);
        self.last_applied = index;
    }
}
