//! Peer identity resolution.
//!
//! The consensus core only ever deals in opaque [`NodeId`]s. Turning an id
//! into something a transport can reach is the resolver's job.

use std::collections::{BTreeMap, BTreeSet};
use std::net::SocketAddr;

use shoal_core::NodeId;

/// Supplies the fixed peer set of a shard and resolves peer addresses.
pub trait PeerResolver {
    /// Returns every voting peer, excluding this node.
    fn peer_ids(&self) -> BTreeSet<NodeId>;

    /// Returns the network address of `peer`, if known.
    fn address_of(&self, peer: NodeId) -> Option<SocketAddr>;
}

/// Resolver over a static, configuration-supplied peer table.
#[derive(Debug, Clone, Default)]
pub struct StaticPeers {
    peers: BTreeMap<NodeId, Option<SocketAddr>>,
}

impl StaticPeers {
    /// Creates a table of peers with no known addresses (in-process clusters).
    #[must_use]
    pub fn from_ids(ids: impl IntoIterator<Item = NodeId>) -> Self {
        Self {
            peers: ids.into_iter().map(|id| (id, None)).collect(),
        }
    }

    /// Adds a peer with its address.
    #[must_use]
    pub fn with_peer(mut self, id: NodeId, addr: SocketAddr) -> Self {
        self.peers.insert(id, Some(addr));
        self
    }

    /// Number of peers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// Returns true if there are no peers.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

impl PeerResolver for StaticPeers {
    fn peer_ids(&self) -> BTreeSet<NodeId> {
        self.peers.keys().copied().collect()
    }

    fn address_of(&self, peer: NodeId) -> Option<SocketAddr> {
        self.peers.get(&peer).copied().flatten()
    }
}
