//! Per-node context shared by every behavior.
//!
//! Everything that must survive a role change lives here: identity, the fixed
//! peer list, the term/vote store, the log and the timeout RNG. Role-local
//! state lives in [`crate::Behavior`] and is dropped on every transition.

use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use shoal_core::{NodeId, TermId};

use crate::config::RaftConfig;
use crate::log::LogStore;
use crate::quorum::majority;
use crate::storage::{StorageResult, TermStore};

/// Aggregated per-node state handed to every behavior.
#[derive(Debug)]
pub struct RaftContext<L, T> {
    node_id: NodeId,
    peers: Vec<NodeId>,
    log: L,
    terms: T,
    rng: StdRng,
    election_timeout_min: Duration,
    election_timeout_max: Duration,
    heartbeat_interval: Duration,
    max_entries_per_append: usize,
}

impl<L: LogStore, T: TermStore> RaftContext<L, T> {
    /// Creates a context from a validated configuration and its collaborators.
    #[must_use]
    pub fn new(config: &RaftConfig, log: L, terms: T) -> Self {
        Self {
            node_id: config.node_id,
            peers: config.peers.clone(),
            log,
            terms,
            rng: StdRng::seed_from_u64(config.random_seed),
            election_timeout_min: config.election_timeout_min,
            election_timeout_max: config.election_timeout_max,
            heartbeat_interval: config.heartbeat_interval,
            max_entries_per_append: config.max_entries_per_append,
        }
    }

    /// This node's ID.
    #[must_use]
    pub const fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Voting peers, excluding this node, in ascending order.
    #[must_use]
    pub fn peers(&self) -> &[NodeId] {
        &self.peers
    }

    /// Returns true if `id` is one of this node's peers.
    #[must_use]
    pub fn is_peer(&self, id: NodeId) -> bool {
        self.peers.binary_search(&id).is_ok()
    }

    /// Number of voting members, self included.
    #[must_use]
    pub fn cluster_size(&self) -> usize {
        self.peers.len() + 1
    }

    /// Votes or acknowledgements needed to decide anything.
    #[must_use]
    pub fn quorum(&self) -> usize {
        majority(self.cluster_size())
    }

    /// Current term from the term store.
    #[must_use]
    pub fn current_term(&self) -> TermId {
        self.terms.current_term()
    }

    /// Vote cast in the current term.
    #[must_use]
    pub fn voted_for(&self) -> Option<NodeId> {
        self.terms.voted_for()
    }

    /// The log collaborator.
    #[must_use]
    pub const fn log(&self) -> &L {
        &self.log
    }

    /// Mutable access to the log collaborator.
    pub fn log_mut(&mut self) -> &mut L {
        &mut self.log
    }

    /// The term/vote collaborator.
    #[must_use]
    pub const fn terms(&self) -> &T {
        &self.terms
    }

    #[cfg(test)]
    pub(crate) fn terms_mut(&mut self) -> &mut T {
        &mut self.terms
    }

    /// Leader heartbeat interval.
    #[must_use]
    pub const fn heartbeat_interval(&self) -> Duration {
        self.heartbeat_interval
    }

    /// Maximum entries per `AppendEntries`.
    #[must_use]
    pub const fn max_entries_per_append(&self) -> usize {
        self.max_entries_per_append
    }

    /// Rolls a fresh election timeout in `[min, max]`.
    pub fn random_election_timeout(&mut self) -> Duration {
        if self.election_timeout_min >= self.election_timeout_max {
            return self.election_timeout_min;
        }
        self.rng
            .gen_range(self.election_timeout_min..=self.election_timeout_max)
    }

    /// Moves to a newer term, clearing the vote. Durable on return.
    pub(crate) fn advance_term(&mut self, term: TermId) -> StorageResult<()> {
        // Precondition: terms only move forward.
        debug_assert!(term > self.terms.current_term());
        self.terms.set_current_term(term)
    }

    /// Records a vote for `candidate` in the current term. Durable on return.
    pub(crate) fn record_vote(&mut self, candidate: NodeId) -> StorageResult<()> {
        // Precondition: at most one vote per term.
        debug_assert!(self
            .terms
            .voted_for()
            .map_or(true, |existing| existing == candidate));
        self.terms.set_voted_for(Some(candidate))
    }

    /// Increments the term and votes for self in one durable write.
    pub(crate) fn start_election_term(&mut self) -> StorageResult<TermId> {
        let term = self.terms.current_term().next();
        self.terms.set_term_and_vote(term, Some(self.node_id))?;
        Ok(term)
    }

    /// Consumes the context, returning the collaborators.
    pub fn into_parts(self) -> (L, T) {
        (self.log, self.terms)
    }
}
