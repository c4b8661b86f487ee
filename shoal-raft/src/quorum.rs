//! Majority arithmetic and tallies.
//!
//! Candidate vote counting and leader commit advancement use the same
//! majority rule over the full membership, self included.

use std::collections::BTreeSet;

use shoal_core::{LogIndex, NodeId};

/// Strict majority of a cluster of `cluster_size` voting members.
///
/// A single-node cluster has a majority of one, satisfied by itself.
#[must_use]
pub const fn majority(cluster_size: usize) -> usize {
    cluster_size / 2 + 1
}

/// Votes granted to a candidate in one election.
///
/// The candidate's own vote is counted from the start. Recording the same
/// voter twice has no effect.
#[derive(Debug, Clone)]
pub struct VoteTally {
    granted: BTreeSet<NodeId>,
    cluster_size: usize,
}

impl VoteTally {
    /// Starts a tally holding only the candidate's self-vote.
    #[must_use]
    pub fn new(candidate: NodeId, cluster_size: usize) -> Self {
        debug_assert!(cluster_size >= 1);
        let mut granted = BTreeSet::new();
        granted.insert(candidate);
        Self {
            granted,
            cluster_size,
        }
    }

    /// Records a granted vote. Returns true if the voter was not counted before.
    pub fn record(&mut self, voter: NodeId) -> bool {
        self.granted.insert(voter)
    }

    /// Number of distinct granted votes, self included.
    #[must_use]
    pub fn granted(&self) -> usize {
        self.granted.len()
    }

    /// Returns true once a strict majority has been granted.
    #[must_use]
    pub fn has_majority(&self) -> bool {
        self.granted.len() >= majority(self.cluster_size)
    }

    /// Returns true if `voter` has granted its vote.
    #[must_use]
    pub fn contains(&self, voter: NodeId) -> bool {
        self.granted.contains(&voter)
    }
}

/// Highest index acknowledged by a majority.
///
/// `acknowledged` holds one entry per member, the leader's own last index included.
#[must_use]
pub fn majority_index(acknowledged: &[LogIndex]) -> LogIndex {
    if acknowledged.is_empty() {
        return LogIndex::new(0);
    }
    let mut sorted = acknowledged.to_vec();
    sorted.sort_unstable_by(|a, b| b.cmp(a));
    sorted[majority(sorted.len()) - 1]
}
