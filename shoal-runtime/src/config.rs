//! Runtime configuration.
//!
//! Configuration for hosting Raft shards on one node.

use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use shoal_core::{Limits, NodeId};
use shoal_raft::{RaftConfig, StaticPeers};
use thiserror::Error;

/// Configuration for a node hosting Raft shards.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// This node's unique identifier.
    pub node_id: NodeId,
    /// Other members of the cluster.
    pub peers: Vec<PeerConfig>,
    /// Directory for durable term/vote files. `None` keeps them in memory.
    pub data_dir: Option<PathBuf>,
    /// Timing configuration.
    pub timing: TimingConfig,
    /// Capacity of each shard's inbound and command queues.
    pub queue_capacity: usize,
}

impl NodeConfig {
    /// Creates a configuration with no peers and default timing.
    #[must_use]
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            peers: Vec::new(),
            data_dir: None,
            timing: TimingConfig::default(),
            queue_capacity: 1024,
        }
    }

    /// Sets the peer list.
    #[must_use]
    pub fn with_peers(mut self, peers: Vec<PeerConfig>) -> Self {
        self.peers = peers;
        self
    }

    /// Sets the data directory.
    #[must_use]
    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = Some(dir.into());
        self
    }

    /// Sets the timing configuration.
    #[must_use]
    pub fn with_timing(mut self, timing: TimingConfig) -> Self {
        self.timing = timing;
        self
    }

    /// Returns all cluster node IDs including self, sorted.
    #[must_use]
    pub fn cluster_nodes(&self) -> Vec<NodeId> {
        let mut nodes: Vec<NodeId> = self.peers.iter().map(|p| p.node_id).collect();
        nodes.push(self.node_id);
        nodes.sort_unstable();
        nodes
    }

    /// Resolver over the configured peers.
    #[must_use]
    pub fn peer_resolver(&self) -> StaticPeers {
        let local = self
            .peers
            .iter()
            .filter(|p| p.addr.is_none())
            .map(|p| p.node_id);
        self.peers
            .iter()
            .filter_map(|p| p.addr.map(|addr| (p.node_id, addr)))
            .fold(StaticPeers::from_ids(local), |peers, (id, addr)| {
                peers.with_peer(id, addr)
            })
    }

    /// Builds the Raft configuration for one shard hosted by this node.
    #[must_use]
    pub fn raft_config(&self, seed: u64) -> RaftConfig {
        RaftConfig::from_resolver(self.node_id, &self.peer_resolver())
            .with_election_timeout(
                self.timing.election_timeout_min,
                self.timing.election_timeout_max,
            )
            .with_heartbeat_interval(self.timing.heartbeat_interval)
            .with_random_seed(seed)
    }

    /// Validates the configuration.
    ///
    /// # Errors
    /// Returns an error if timing is inconsistent, a peer is listed twice or
    /// is this node, or the cluster exceeds the size limit.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.timing.validate()?;

        let mut seen = BTreeSet::new();
        for peer in &self.peers {
            if peer.node_id == self.node_id {
                return Err(ConfigError::InvalidPeer {
                    message: format!("{} is this node", peer.node_id),
                });
            }
            if !seen.insert(peer.node_id) {
                return Err(ConfigError::InvalidPeer {
                    message: format!("{} listed twice", peer.node_id),
                });
            }
        }

        let max = Limits::new().max_cluster_size as usize;
        if self.peers.len() + 1 > max {
            return Err(ConfigError::InvalidPeer {
                message: format!("cluster of {} exceeds maximum {max}", self.peers.len() + 1),
            });
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::InvalidQueue);
        }
        Ok(())
    }
}

/// Configuration for a peer node.
#[derive(Debug, Clone)]
pub struct PeerConfig {
    /// Peer's node ID.
    pub node_id: NodeId,
    /// Peer's address, when it is reachable over the network.
    pub addr: Option<SocketAddr>,
}

impl PeerConfig {
    /// Creates a peer reachable at `addr`.
    #[must_use]
    pub const fn new(node_id: NodeId, addr: SocketAddr) -> Self {
        Self {
            node_id,
            addr: Some(addr),
        }
    }

    /// Creates an in-process peer with no address.
    #[must_use]
    pub const fn local(node_id: NodeId) -> Self {
        Self {
            node_id,
            addr: None,
        }
    }
}

/// Timing configuration for Raft.
#[derive(Debug, Clone)]
pub struct TimingConfig {
    /// Minimum election timeout.
    pub election_timeout_min: Duration,
    /// Maximum election timeout.
    pub election_timeout_max: Duration,
    /// Heartbeat interval.
    pub heartbeat_interval: Duration,
    /// How long a handle waits for its driver to answer.
    pub request_timeout: Duration,
}

impl Default for TimingConfig {
    fn default() -> Self {
        let limits = Limits::new();
        Self {
            election_timeout_min: limits.election_timeout_min,
            election_timeout_max: limits.election_timeout_max,
            heartbeat_interval: limits.heartbeat_interval,
            request_timeout: Duration::from_secs(5),
        }
    }
}

impl TimingConfig {
    /// Creates timing suitable for testing (faster timeouts).
    #[must_use]
    pub const fn fast_for_testing() -> Self {
        Self {
            election_timeout_min: Duration::from_millis(50),
            election_timeout_max: Duration::from_millis(100),
            heartbeat_interval: Duration::from_millis(15),
            request_timeout: Duration::from_secs(1),
        }
    }

    /// Validates the timing configuration.
    ///
    /// # Errors
    /// Returns an error if the configuration is invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.election_timeout_max < self.election_timeout_min {
            return Err(ConfigError::InvalidTiming {
                message: "election_timeout_max must be >= election_timeout_min".to_string(),
            });
        }
        if self.election_timeout_min <= self.heartbeat_interval {
            return Err(ConfigError::InvalidTiming {
                message: "election_timeout_min must be > heartbeat_interval".to_string(),
            });
        }
        Ok(())
    }
}

/// Configuration errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// Invalid timing configuration.
    #[error("invalid timing: {message}")]
    InvalidTiming {
        /// Error description.
        message: String,
    },
    /// Invalid peer configuration.
    #[error("invalid peer: {message}")]
    InvalidPeer {
        /// Error description.
        message: String,
    },
    /// Queue capacity must be positive.
    #[error("queue capacity must be positive")]
    InvalidQueue,
}
