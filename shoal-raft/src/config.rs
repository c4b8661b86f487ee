//! Raft configuration for one shard member.

use std::collections::BTreeSet;
use std::time::Duration;

use shoal_core::{Error, Limits, NodeId, Result};

use crate::peers::PeerResolver;

/// Configuration for a Raft node in one shard.
#[derive(Debug, Clone)]
pub struct RaftConfig {
    /// This node's ID.
    pub node_id: NodeId,

    /// Voting peers, excluding this node. Fixed for the node's lifetime.
    pub peers: Vec<NodeId>,

    /// Lower bound of the randomized election timeout.
    pub election_timeout_min: Duration,

    /// Upper bound of the randomized election timeout.
    pub election_timeout_max: Duration,

    /// Leader heartbeat interval.
    pub heartbeat_interval: Duration,

    /// Maximum number of entries per `AppendEntries`.
    pub max_entries_per_append: usize,

    /// Seed for election timeout randomization.
    pub random_seed: u64,

    /// Upper bound on the cluster size, self included.
    pub max_cluster_size: usize,
}

impl RaftConfig {
    /// Creates a configuration with default timing from [`Limits`].
    ///
    /// `peers` is deduplicated and sorted. The seed defaults to the node id so
    /// that nodes in one cluster do not roll identical timeouts.
    #[must_use]
    pub fn new(node_id: NodeId, peers: impl IntoIterator<Item = NodeId>) -> Self {
        let limits = Limits::new();
        let peers: BTreeSet<NodeId> = peers.into_iter().collect();

        Self {
            node_id,
            peers: peers.into_iter().collect(),
            election_timeout_min: limits.election_timeout_min,
            election_timeout_max: limits.election_timeout_max,
            heartbeat_interval: limits.heartbeat_interval,
            max_entries_per_append: limits.max_entries_per_append as usize,
            random_seed: node_id.get(),
            max_cluster_size: limits.max_cluster_size as usize,
        }
    }

    /// Creates a configuration whose peers come from a resolver.
    #[must_use]
    pub fn from_resolver(node_id: NodeId, resolver: &impl PeerResolver) -> Self {
        Self::new(node_id, resolver.peer_ids())
    }

    /// Sets the election timeout range.
    #[must_use]
    pub fn with_election_timeout(mut self, min: Duration, max: Duration) -> Self {
        self.election_timeout_min = min;
        self.election_timeout_max = max;
        self
    }

    /// Sets the heartbeat interval.
    #[must_use]
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Sets the maximum batch size per `AppendEntries`.
    #[must_use]
    pub fn with_max_entries_per_append(mut self, max: usize) -> Self {
        self.max_entries_per_append = max;
        self
    }

    /// Sets the randomization seed.
    #[must_use]
    pub fn with_random_seed(mut self, seed: u64) -> Self {
        self.random_seed = seed;
        self
    }

    /// Number of voting members, self included.
    #[must_use]
    pub fn cluster_size(&self) -> usize {
        self.peers.len() + 1
    }

    /// Validates the configuration.
    ///
    /// # Errors
    /// Returns an error if this node appears among its peers, the cluster is
    /// too large, or the timing bounds are inconsistent.
    pub fn validate(&self) -> Result<()> {
        if self.peers.contains(&self.node_id) {
            return Err(Error::InvalidArgument {
                name: "peers",
                reason: "must not contain this node",
            });
        }
        if self.cluster_size() > self.max_cluster_size {
            return Err(Error::LimitExceeded {
                limit: "cluster_size",
                max: self.max_cluster_size as u64,
                actual: self.cluster_size() as u64,
            });
        }
        if self.election_timeout_min > self.election_timeout_max {
            return Err(Error::InvalidArgument {
                name: "election_timeout_min",
                reason: "must be <= election_timeout_max",
            });
        }
        if self.heartbeat_interval >= self.election_timeout_min {
            return Err(Error::InvalidArgument {
                name: "heartbeat_interval",
                reason: "must be < election_timeout_min",
            });
        }
        if self.max_entries_per_append == 0 {
            return Err(Error::InvalidArgument {
                name: "max_entries_per_append",
                reason: "must be positive",
            });
        }
        Ok(())
    }
}
