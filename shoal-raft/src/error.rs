//! Errors surfaced by the state machine.
//!
//! Protocol-level refusals (stale terms, log mismatches, denied votes) are not
//! errors: they are ordinary replies. What remains is configuration mistakes,
//! misuse by the caller, and persistence failures.

use shoal_core::{LogIndex, NodeId};
use thiserror::Error;

use crate::storage::StorageError;

/// Result type for state machine operations.
pub type RaftResult<T> = Result<T, RaftError>;

/// Errors from the Raft state machine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RaftError {
    /// The configuration failed validation.
    #[error("invalid configuration: {0}")]
    Config(#[from] shoal_core::Error),

    /// A durable write failed. The node must not act on the un-persisted change.
    #[error("persistence failure: {0}")]
    Storage(#[from] StorageError),

    /// The operation requires leadership.
    #[error("not leader (leader hint: {leader_hint:?})")]
    NotLeader {
        /// The leader this node last heard from, if any.
        leader_hint: Option<NodeId>,
    },

    /// Compaction was requested past what the application has applied.
    #[error("cannot compact through {} beyond last applied {}", .index.get(), .last_applied.get())]
    CompactBeyondApplied {
        /// The requested compaction point.
        index: LogIndex,
        /// The current last-applied index.
        last_applied: LogIndex,
    },
}

impl RaftError {
    /// Returns true for persistence failures, which end the node's participation.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Storage(_))
    }
}
