//! Durable term/vote storage.
//!
//! The persistent state every Raft node keeps besides its log:
//!
//! - **currentTerm**: the latest term the node has seen
//! - **votedFor**: the candidate that received this node's vote in `currentTerm`
//!
//! # Durability
//!
//! Every setter on [`TermStore`] must be durable before it returns. The state
//! machine only emits a reply that depends on a term or vote change after the
//! corresponding setter returned `Ok`, so a crash can never make a node vote
//! twice in one term.

use bytes::{Buf, BufMut, BytesMut};
use shoal_core::{LogIndex, NodeId, TermId};
use thiserror::Error;

/// Storage result type.
pub type StorageResult<T> = Result<T, StorageError>;

/// Storage error types.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    /// I/O error during storage operation.
    #[error("storage I/O error during {operation}: {message}")]
    Io {
        /// The operation that failed.
        operation: &'static str,
        /// Error description.
        message: String,
    },
    /// Data corruption detected.
    #[error("storage corruption: {message}")]
    Corruption {
        /// Description of the corruption.
        message: String,
    },
    /// Entry not found in storage.
    #[error("entry not found at index {}", .index.get())]
    NotFound {
        /// The index that was not found.
        index: LogIndex,
    },
    /// The entry lies at or before the snapshot boundary and has been trimmed.
    #[error("entry at index {} is compacted (snapshot index {})", .index.get(), .snapshot_index.get())]
    Compacted {
        /// The requested index.
        index: LogIndex,
        /// The current snapshot boundary.
        snapshot_index: LogIndex,
    },
}

impl StorageError {
    /// Wraps an I/O error with the operation that produced it.
    #[must_use]
    pub fn io(operation: &'static str, err: &std::io::Error) -> Self {
        Self::Io {
            operation,
            message: err.to_string(),
        }
    }
}

/// Persistent term/vote record that must survive crashes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PersistentState {
    /// Latest term the node has seen (initialized to 0, increases monotonically).
    pub current_term: TermId,
    /// Candidate that received the vote in `current_term`, if any.
    pub voted_for: Option<NodeId>,
}

impl PersistentState {
    /// Encoded size with a vote present.
    pub const ENCODED_SIZE_MAX: usize = 8 + 1 + 8;

    /// Creates a persistent state with the given values.
    #[must_use]
    pub const fn with_values(current_term: TermId, voted_for: Option<NodeId>) -> Self {
        Self {
            current_term,
            voted_for,
        }
    }

    /// Encodes the persistent state.
    ///
    /// Format: term (8 bytes) + `voted_for` present (1 byte) + `voted_for` (8 bytes if present).
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u64_le(self.current_term.get());
        match self.voted_for {
            Some(node_id) => {
                buf.put_u8(1);
                buf.put_u64_le(node_id.get());
            }
            None => buf.put_u8(0),
        }
    }

    /// Decodes persistent state from bytes.
    ///
    /// Returns `None` if the buffer is truncated or the vote flag is invalid.
    pub fn decode(buf: &mut impl Buf) -> Option<Self> {
        if buf.remaining() < 9 {
            return None;
        }

        let current_term = TermId::new(buf.get_u64_le());
        let voted_for = match buf.get_u8() {
            0 => None,
            1 => {
                if buf.remaining() < 8 {
                    return None;
                }
                Some(NodeId::new(buf.get_u64_le()))
            }
            _ => return None,
        };

        Some(Self {
            current_term,
            voted_for,
        })
    }
}

/// The term/vote collaborator.
///
/// Implementations must guarantee durability: data survives a crash once a
/// setter returns `Ok`. Readers are infallible because implementations serve
/// them from a cache that is only updated after a successful write.
pub trait TermStore {
    /// Returns the current term.
    fn current_term(&self) -> TermId;

    /// Returns the candidate voted for in the current term.
    fn voted_for(&self) -> Option<NodeId>;

    /// Sets the current term.
    ///
    /// Moving to a different term clears `voted_for`: a vote is only ever
    /// recorded for the term it was cast in.
    ///
    /// # Errors
    /// Returns an error if the write could not be made durable.
    fn set_current_term(&mut self, term: TermId) -> StorageResult<()>;

    /// Records the vote for the current term.
    ///
    /// # Errors
    /// Returns an error if the write could not be made durable.
    fn set_voted_for(&mut self, candidate: Option<NodeId>) -> StorageResult<()>;

    /// Sets term and vote together.
    ///
    /// The default performs two writes; stores that can write both atomically
    /// should override it.
    ///
    /// # Errors
    /// Returns an error if either write could not be made durable.
    fn set_term_and_vote(&mut self, term: TermId, candidate: Option<NodeId>) -> StorageResult<()> {
        self.set_current_term(term)?;
        self.set_voted_for(candidate)
    }

    /// Returns both values as one record.
    fn state(&self) -> PersistentState {
        PersistentState::with_values(self.current_term(), self.voted_for())
    }
}

/// In-memory term store for tests and simulation.
///
/// Not durable across process restarts; simulation keeps the value alive
/// across simulated crashes instead.
#[derive(Debug, Clone, Default)]
pub struct MemoryTermStore {
    state: PersistentState,
    writes: u64,
}

impl MemoryTermStore {
    /// Creates an empty store (term 0, no vote).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store that starts from the given record.
    #[must_use]
    pub const fn with_state(state: PersistentState) -> Self {
        Self { state, writes: 0 }
    }

    /// Number of successful writes, for asserting write-before-reply ordering in tests.
    #[must_use]
    pub const fn writes(&self) -> u64 {
        self.writes
    }
}

impl TermStore for MemoryTermStore {
    fn current_term(&self) -> TermId {
        self.state.current_term
    }

    fn voted_for(&self) -> Option<NodeId> {
        self.state.voted_for
    }

    fn set_current_term(&mut self, term: TermId) -> StorageResult<()> {
        if term != self.state.current_term {
            self.state.voted_for = None;
        }
        self.state.current_term = term;
        self.writes += 1;
        Ok(())
    }

    fn set_voted_for(&mut self, candidate: Option<NodeId>) -> StorageResult<()> {
        self.state.voted_for = candidate;
        self.writes += 1;
        Ok(())
    }

    fn set_term_and_vote(&mut self, term: TermId, candidate: Option<NodeId>) -> StorageResult<()> {
        self.state = PersistentState::with_values(term, candidate);
        self.writes += 1;
        Ok(())
    }
}

impl<S: TermStore + ?Sized> TermStore for Box<S> {
    fn current_term(&self) -> TermId {
        (**self).current_term()
    }

    fn voted_for(&self) -> Option<NodeId> {
        (**self).voted_for()
    }

    fn set_current_term(&mut self, term: TermId) -> StorageResult<()> {
        (**self).set_current_term(term)
    }

    fn set_voted_for(&mut self, candidate: Option<NodeId>) -> StorageResult<()> {
        (**self).set_voted_for(candidate)
    }

    fn set_term_and_vote(&mut self, term: TermId, candidate: Option<NodeId>) -> StorageResult<()> {
        (**self).set_term_and_vote(term, candidate)
    }
}
