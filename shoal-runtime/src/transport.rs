//! Peer transport for shard messages.
//!
//! The [`Transport`] trait is the seam between shard drivers and the network.
//! [`LocalNetwork`] is an in-process implementation: every hosted shard
//! registers a mailbox, and [`LocalTransport`] handles route
//! [`ShardMessage`]s into the destination's mailbox. It can isolate nodes to
//! simulate partitions.
//!
//! Delivery is best effort. A full or missing mailbox drops the message and
//! Raft retransmission takes care of the rest.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use shoal_core::{NodeId, ShardId};
use shoal_raft::{Message, ShardMessage};
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info};

/// Transport errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// No mailbox is registered for the destination.
    #[error("unknown destination: {node} {shard}")]
    UnknownDestination {
        /// Destination node.
        node: NodeId,
        /// Destination shard.
        shard: ShardId,
    },

    /// The destination's mailbox is full.
    #[error("mailbox full for {0}")]
    QueueFull(NodeId),

    /// The destination is cut off from the sender.
    #[error("{from} cannot reach {to}")]
    Partitioned {
        /// Sender.
        from: NodeId,
        /// Destination.
        to: NodeId,
    },

    /// The destination's driver has stopped.
    #[error("transport is shutdown")]
    Shutdown,
}

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

/// Sends shard messages to other nodes.
///
/// Implementations must be cheap to clone and safe to share across tasks.
#[async_trait]
pub trait Transport: Send + Sync + Clone + 'static {
    /// Sends `message` to node `to`.
    ///
    /// # Errors
    /// Returns an error if the message could not be handed off. The message is lost.
    async fn send(&self, to: NodeId, message: ShardMessage) -> TransportResult<()>;

    /// Returns the node ID of this transport.
    fn node_id(&self) -> NodeId;
}

#[derive(Debug, Default)]
struct NetworkState {
    mailboxes: HashMap<(NodeId, ShardId), mpsc::Sender<Message>>,
    isolated: HashSet<NodeId>,
}

/// In-process network connecting every shard driver in one process.
#[derive(Debug, Clone, Default)]
pub struct LocalNetwork {
    state: Arc<RwLock<NetworkState>>,
}

impl LocalNetwork {
    /// Creates an empty network.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a transport endpoint for `node_id`.
    #[must_use]
    pub fn transport(&self, node_id: NodeId) -> LocalTransport {
        LocalTransport {
            node_id,
            network: self.clone(),
        }
    }

    /// Registers the inbound mailbox of one hosted shard.
    pub async fn register(&self, node: NodeId, shard: ShardId, mailbox: mpsc::Sender<Message>) {
        self.state.write().await.mailboxes.insert((node, shard), mailbox);
        debug!(node = %node, shard = %shard, "Registered mailbox");
    }

    /// Removes the inbound mailbox of one hosted shard.
    pub async fn unregister(&self, node: NodeId, shard: ShardId) {
        self.state.write().await.mailboxes.remove(&(node, shard));
    }

    /// Cuts `node` off from every other node, in both directions.
    pub async fn isolate(&self, node: NodeId) {
        self.state.write().await.isolated.insert(node);
        info!(node = %node, "Node isolated");
    }

    /// Reconnects a previously isolated node.
    pub async fn heal(&self, node: NodeId) {
        self.state.write().await.isolated.remove(&node);
        info!(node = %node, "Node reconnected");
    }

    /// Returns true if `node` is currently isolated.
    pub async fn is_isolated(&self, node: NodeId) -> bool {
        self.state.read().await.isolated.contains(&node)
    }

    #[allow(clippy::significant_drop_tightening)]
    async fn route(&self, from: NodeId, to: NodeId, message: ShardMessage) -> TransportResult<()> {
        let state = self.state.read().await;
        if state.isolated.contains(&from) || state.isolated.contains(&to) {
            return Err(TransportError::Partitioned { from, to });
        }

        let shard = message.shard_id;
        let mailbox = state
            .mailboxes
            .get(&(to, shard))
            .ok_or(TransportError::UnknownDestination { node: to, shard })?;

        mailbox.try_send(message.message).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => TransportError::QueueFull(to),
            mpsc::error::TrySendError::Closed(_) => TransportError::Shutdown,
        })
    }
}

/// One node's endpoint on a [`LocalNetwork`].
#[derive(Debug, Clone)]
pub struct LocalTransport {
    node_id: NodeId,
    network: LocalNetwork,
}

impl LocalTransport {
    /// The network this endpoint belongs to.
    #[must_use]
    pub const fn network(&self) -> &LocalNetwork {
        &self.network
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn send(&self, to: NodeId, message: ShardMessage) -> TransportResult<()> {
        // Precondition: can't send to self.
        debug_assert!(to != self.node_id, "cannot send message to self");
        self.network.route(self.node_id, to, message).await
    }

    fn node_id(&self) -> NodeId {
        self.node_id
    }
}

#[cfg(test)]
mod tests {
    use shoal_core::{LogIndex, TermId};
    use shoal_raft::RequestVote;

    use super::*;

    fn vote(from: u64, to: u64) -> Message {
        Message::RequestVote(RequestVote::new(
            TermId::new(1),
            NodeId::new(from),
            NodeId::new(to),
            LogIndex::new(0),
            TermId::new(0),
        ))
    }

    #[tokio::test]
    async fn test_local_delivery() {
        let network = LocalNetwork::new();
        let (tx, mut rx) = mpsc::channel(4);
        network.register(NodeId::new(2), ShardId::new(1), tx).await;

        let transport = network.transport(NodeId::new(1));
        transport
            .send(NodeId::new(2), ShardMessage::new(ShardId::new(1), vote(1, 2)))
            .await
            .unwrap();

        assert_eq!(rx.recv().await.unwrap(), vote(1, 2));
    }

    #[tokio::test]
    async fn test_unknown_destination() {
        let network = LocalNetwork::new();
        let transport = network.transport(NodeId::new(1));

        let result = transport
            .send(NodeId::new(2), ShardMessage::new(ShardId::new(1), vote(1, 2)))
            .await;
        assert!(matches!(result, Err(TransportError::UnknownDestination { .. })));
    }

    #[tokio::test]
    async fn test_isolation_blocks_both_directions() {
        let network = LocalNetwork::new();
        let (tx2, _rx2) = mpsc::channel(4);
        let (tx1, _rx1) = mpsc::channel(4);
        network.register(NodeId::new(2), ShardId::new(1), tx2).await;
        network.register(NodeId::new(1), ShardId::new(1), tx1).await;
        network.isolate(NodeId::new(2)).await;

        let to_isolated = network
            .transport(NodeId::new(1))
            .send(NodeId::new(2), ShardMessage::new(ShardId::new(1), vote(1, 2)))
            .await;
        let from_isolated = network
            .transport(NodeId::new(2))
            .send(NodeId::new(1), ShardMessage::new(ShardId::new(1), vote(2, 1)))
            .await;
        assert!(matches!(to_isolated, Err(TransportError::Partitioned { .. })));
        assert!(matches!(from_isolated, Err(TransportError::Partitioned { .. })));

        network.heal(NodeId::new(2)).await;
        assert!(!network.is_isolated(NodeId::new(2)).await);
        network
            .transport(NodeId::new(1))
            .send(NodeId::new(2), ShardMessage::new(ShardId::new(1), vote(1, 2)))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_full_mailbox() {
        let network = LocalNetwork::new();
        let (tx, _rx) = mpsc::channel(1);
        network.register(NodeId::new(2), ShardId::new(1), tx).await;
        let transport = network.transport(NodeId::new(1));

        let msg = ShardMessage::new(ShardId::new(1), vote(1, 2));
        transport.send(NodeId::new(2), msg.clone()).await.unwrap();
        assert_eq!(
            transport.send(NodeId::new(2), msg).await,
            Err(TransportError::QueueFull(NodeId::new(2)))
        );
    }
}
