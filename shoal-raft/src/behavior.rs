//! The three Raft roles and their role-local state.
//!
//! Exactly one [`Behavior`] is active per node. Replacing it drops the
//! previous role's state, so a candidate's tally or a leader's per-peer
//! progress can never leak into the next role.

use std::collections::BTreeMap;

use shoal_core::{LogIndex, NodeId};

use crate::quorum::VoteTally;

/// Raft role, without role-local state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Role {
    /// Passive; answers RPCs and waits for a leader.
    #[default]
    Follower,
    /// Seeking votes for the current term.
    Candidate,
    /// Replicating the log and sending heartbeats.
    Leader,
}

impl Role {
    /// Lowercase name for logging.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Follower => "follower",
            Self::Candidate => "candidate",
            Self::Leader => "leader",
        }
    }
}

/// The active role together with its local state.
#[derive(Debug, Clone)]
pub enum Behavior {
    /// Follower role.
    Follower(FollowerState),
    /// Candidate role.
    Candidate(CandidateState),
    /// Leader role.
    Leader(LeaderState),
}

impl Behavior {
    /// The role tag.
    #[must_use]
    pub const fn role(&self) -> Role {
        match self {
            Self::Follower(_) => Role::Follower,
            Self::Candidate(_) => Role::Candidate,
            Self::Leader(_) => Role::Leader,
        }
    }
}

/// Follower-local state. Informational only.
#[derive(Debug, Clone, Default)]
pub struct FollowerState {
    pub(crate) leader_id: Option<NodeId>,
}

impl FollowerState {
    /// Creates follower state with a known or unknown leader.
    #[must_use]
    pub const fn new(leader_id: Option<NodeId>) -> Self {
        Self { leader_id }
    }

    /// The leader last heard from in the current term.
    #[must_use]
    pub const fn leader_id(&self) -> Option<NodeId> {
        self.leader_id
    }
}

/// Candidate-local state.
#[derive(Debug, Clone)]
pub struct CandidateState {
    pub(crate) votes: VoteTally,
}

impl CandidateState {
    /// Creates candidate state with the given tally.
    #[must_use]
    pub const fn new(votes: VoteTally) -> Self {
        Self { votes }
    }

    /// Votes granted so far.
    #[must_use]
    pub const fn votes(&self) -> &VoteTally {
        &self.votes
    }
}

/// Replication progress of one peer, as seen by the leader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerProgress {
    /// Next index to send.
    pub next_index: LogIndex,
    /// Highest index the peer acknowledged.
    pub match_index: LogIndex,
}

/// Leader-local state.
#[derive(Debug, Clone)]
pub struct LeaderState {
    pub(crate) progress: BTreeMap<NodeId, PeerProgress>,
}

impl LeaderState {
    /// Initializes progress for every peer: nothing acknowledged, send from the end of the log.
    #[must_use]
    pub fn new(peers: &[NodeId], last_index: LogIndex) -> Self {
        let next_index = last_index.next();
        let progress = peers
            .iter()
            .map(|&peer| {
                (
                    peer,
                    PeerProgress {
                        next_index,
                        match_index: LogIndex::new(0),
                    },
                )
            })
            .collect();
        Self { progress }
    }

    /// Progress of `peer`.
    #[must_use]
    pub fn progress(&self, peer: NodeId) -> Option<PeerProgress> {
        self.progress.get(&peer).copied()
    }

    /// Acknowledged index of every peer plus the leader's own last index.
    #[must_use]
    pub fn acknowledged(&self, own_last_index: LogIndex) -> Vec<LogIndex> {
        self.progress
            .values()
            .map(|p| p.match_index)
            .chain(std::iter::once(own_last_index))
            .collect()
    }
}
