//! Callbacks the host receives from a shard.
//!
//! A [`RaftListener`] sees leadership changes and committed entries in the
//! order the state machine produced them. Calls are made from the shard's
//! driver task and must not block.

use shoal_core::{LogIndex, NodeId, ShardId, TermId};
use shoal_raft::LogEntry;
use tokio::sync::mpsc;

/// Observer of one or more shards.
pub trait RaftListener: Send + 'static {
    /// This node became leader of `shard` in `term`.
    fn on_became_leader(&mut self, shard: ShardId, term: TermId);

    /// This node became a follower of `shard`, optionally of a known leader.
    fn on_became_follower(&mut self, shard: ShardId, term: TermId, leader: Option<NodeId>);

    /// The commit index of `shard` advanced to `index`.
    fn on_commit_index_advanced(&mut self, shard: ShardId, index: LogIndex);

    /// A committed entry of `shard`, delivered exactly once and in index order.
    fn apply(&mut self, shard: ShardId, entry: &LogEntry);

    /// A peer of `shard` lags behind the local snapshot.
    fn on_snapshot_required(&mut self, _shard: ShardId, _peer: NodeId, _snapshot_index: LogIndex) {}
}

/// Listener that ignores everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopListener;

impl RaftListener for NoopListener {
    fn on_became_leader(&mut self, _shard: ShardId, _term: TermId) {}

    fn on_became_follower(&mut self, _shard: ShardId, _term: TermId, _leader: Option<NodeId>) {}

    fn on_commit_index_advanced(&mut self, _shard: ShardId, _index: LogIndex) {}

    fn apply(&mut self, _shard: ShardId, _entry: &LogEntry) {}
}

/// Listener callbacks as values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerEvent {
    /// See [`RaftListener::on_became_leader`].
    BecameLeader {
        /// Reporting node.
        node: NodeId,
        /// Shard.
        shard: ShardId,
        /// Term.
        term: TermId,
    },
    /// See [`RaftListener::on_became_follower`].
    BecameFollower {
        /// Reporting node.
        node: NodeId,
        /// Shard.
        shard: ShardId,
        /// Term.
        term: TermId,
        /// Known leader.
        leader: Option<NodeId>,
    },
    /// See [`RaftListener::on_commit_index_advanced`].
    CommitIndexAdvanced {
        /// Reporting node.
        node: NodeId,
        /// Shard.
        shard: ShardId,
        /// New commit index.
        index: LogIndex,
    },
    /// See [`RaftListener::apply`].
    Applied {
        /// Reporting node.
        node: NodeId,
        /// Shard.
        shard: ShardId,
        /// The entry.
        entry: LogEntry,
    },
}

/// Listener that forwards every callback into a channel.
#[derive(Debug, Clone)]
pub struct ChannelListener {
    node: NodeId,
    events: mpsc::UnboundedSender<ListenerEvent>,
}

impl ChannelListener {
    /// Creates a listener for `node` and the receiving end of its events.
    #[must_use]
    pub fn new(node: NodeId) -> (Self, mpsc::UnboundedReceiver<ListenerEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        (Self { node, events }, rx)
    }

    /// Creates a listener for `node` that feeds an existing channel.
    #[must_use]
    pub const fn with_sender(node: NodeId, events: mpsc::UnboundedSender<ListenerEvent>) -> Self {
        Self { node, events }
    }

    fn emit(&self, event: ListenerEvent) {
        // The receiver going away just means nobody is watching any more.
        let _ = self.events.send(event);
    }
}

impl RaftListener for ChannelListener {
    fn on_became_leader(&mut self, shard: ShardId, term: TermId) {
        self.emit(ListenerEvent::BecameLeader {
            node: self.node,
            shard,
            term,
        });
    }

    fn on_became_follower(&mut self, shard: ShardId, term: TermId, leader: Option<NodeId>) {
        self.emit(ListenerEvent::BecameFollower {
            node: self.node,
            shard,
            term,
            leader,
        });
    }

    fn on_commit_index_advanced(&mut self, shard: ShardId, index: LogIndex) {
        self.emit(ListenerEvent::CommitIndexAdvanced {
            node: self.node,
            shard,
            index,
        });
    }

    fn apply(&mut self, shard: ShardId, entry: &LogEntry) {
        self.emit(ListenerEvent::Applied {
            node: self.node,
            shard,
            entry: entry.clone(),
        });
    }
}
