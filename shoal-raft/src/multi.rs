//! Multi-shard engine: many independent Raft groups on one node.
//!
//! Each shard is a separate [`RaftNode`] with its own term, vote and log.
//! The engine routes events to shards and batches outbound messages by
//! destination node, so a host with thousands of shards sends one envelope
//! per peer instead of one per shard.
//!
//! # Example
//!
//! ```ignore
//! let mut engine = MultiRaft::new(NodeId::new(1));
//! engine.create_shard(ShardId::new(7), &members, MemoryLog::new(), MemoryTermStore::new())?;
//!
//! loop {
//!     for envelope in incoming {
//!         let outputs = engine.handle_messages(envelope.messages)?;
//!         process(outputs);
//!     }
//! }
//! ```

use std::collections::{BTreeMap, HashMap};

use bytes::Bytes;
use shoal_core::{LogIndex, NodeId, ShardId, TermId};
use thiserror::Error;
use tracing::{debug, info};

use crate::behavior::Role;
use crate::config::RaftConfig;
use crate::error::RaftError;
use crate::log::LogStore;
use crate::message::{Event, Message};
use crate::node::{RaftNode, RaftOutput};
use crate::storage::TermStore;

/// Maximum number of shards per engine.
pub const SHARDS_PER_NODE_MAX: usize = 10_000;

/// Maximum number of messages batched together for one destination.
pub const MESSAGE_BATCH_SIZE_MAX: usize = 100;

/// A message destined for a specific shard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardMessage {
    /// The target shard.
    pub shard_id: ShardId,
    /// The Raft message.
    pub message: Message,
}

impl ShardMessage {
    /// Creates a new shard message.
    #[must_use]
    pub const fn new(shard_id: ShardId, message: Message) -> Self {
        Self { shard_id, message }
    }
}

/// Output from the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MultiRaftOutput {
    /// Messages for one destination node, possibly spanning shards.
    SendMessages {
        /// Destination node.
        to: NodeId,
        /// Batched messages.
        messages: Vec<ShardMessage>,
    },
    /// Any non-send output of one shard (timers, transitions, commits).
    Shard {
        /// The shard that produced it.
        shard_id: ShardId,
        /// The output.
        output: RaftOutput,
    },
}

/// Snapshot of one shard's Raft state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardStatus {
    /// The shard.
    pub shard_id: ShardId,
    /// Current role.
    pub role: Role,
    /// Current term.
    pub current_term: TermId,
    /// Known leader.
    pub leader_id: Option<NodeId>,
    /// Commit index.
    pub commit_index: LogIndex,
    /// Last applied index.
    pub last_applied: LogIndex,
}

impl ShardStatus {
    /// Reads the status of `node`.
    #[must_use]
    pub fn of<L: LogStore, T: TermStore>(shard_id: ShardId, node: &RaftNode<L, T>) -> Self {
        Self {
            shard_id,
            role: node.role(),
            current_term: node.current_term(),
            leader_id: node.leader_id(),
            commit_index: node.commit_index(),
            last_applied: node.last_applied(),
        }
    }
}

/// Errors from engine operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MultiRaftError {
    /// The shard already exists.
    #[error("shard {0} already exists")]
    ShardExists(ShardId),
    /// The shard is not hosted here.
    #[error("shard {0} not found")]
    ShardNotFound(ShardId),
    /// The engine is full.
    #[error("too many shards: {count} (max {max})")]
    TooManyShards {
        /// Current count.
        count: usize,
        /// Maximum allowed.
        max: usize,
    },
    /// The member list does not include this node.
    #[error("node {node_id} is not a member of shard {shard_id}")]
    NodeNotInMembers {
        /// This node's ID.
        node_id: NodeId,
        /// The shard.
        shard_id: ShardId,
    },
    /// The shard's state machine failed.
    #[error("shard {shard_id}: {source}")]
    Raft {
        /// The shard.
        shard_id: ShardId,
        /// The underlying error.
        source: RaftError,
    },
}

/// Multi-shard Raft engine.
#[derive(Debug)]
pub struct MultiRaft<L, T> {
    node_id: NodeId,
    shards: BTreeMap<ShardId, RaftNode<L, T>>,
    outbound_batches: HashMap<NodeId, Vec<ShardMessage>>,
}

impl<L: LogStore, T: TermStore> MultiRaft<L, T> {
    /// Creates an empty engine for `node_id`.
    #[must_use]
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            shards: BTreeMap::new(),
            outbound_batches: HashMap::new(),
        }
    }

    /// This node's ID.
    #[must_use]
    pub const fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Number of hosted shards.
    #[must_use]
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Returns true if `shard_id` is hosted here.
    #[must_use]
    pub fn has_shard(&self, shard_id: ShardId) -> bool {
        self.shards.contains_key(&shard_id)
    }

    /// IDs of all hosted shards.
    #[must_use]
    pub fn shard_ids(&self) -> Vec<ShardId> {
        self.shards.keys().copied().collect()
    }

    /// Status of one shard.
    #[must_use]
    pub fn shard_state(&self, shard_id: ShardId) -> Option<ShardStatus> {
        self.shards
            .get(&shard_id)
            .map(|node| ShardStatus::of(shard_id, node))
    }

    /// Shards this node currently leads.
    #[must_use]
    pub fn leader_shards(&self) -> Vec<ShardId> {
        self.shards
            .iter()
            .filter(|(_, node)| node.is_leader())
            .map(|(id, _)| *id)
            .collect()
    }

    /// Direct access to one shard's node.
    #[must_use]
    pub fn shard(&self, shard_id: ShardId) -> Option<&RaftNode<L, T>> {
        self.shards.get(&shard_id)
    }

    /// Hosts a new shard. `members` lists every voter, this node included.
    ///
    /// Returns the shard's start-up outputs (its first election timer).
    ///
    /// # Errors
    /// Returns an error if the shard exists, the engine is full, this node is
    /// not a member, or the resulting configuration is invalid.
    pub fn create_shard(
        &mut self,
        shard_id: ShardId,
        members: &[NodeId],
        log: L,
        terms: T,
    ) -> Result<Vec<MultiRaftOutput>, MultiRaftError> {
        // Precondition: shard doesn't exist.
        if self.shards.contains_key(&shard_id) {
            return Err(MultiRaftError::ShardExists(shard_id));
        }
        // Precondition: under limit.
        if self.shards.len() >= SHARDS_PER_NODE_MAX {
            return Err(MultiRaftError::TooManyShards {
                count: self.shards.len(),
                max: SHARDS_PER_NODE_MAX,
            });
        }
        // Precondition: this node is a member.
        if !members.contains(&self.node_id) {
            return Err(MultiRaftError::NodeNotInMembers {
                node_id: self.node_id,
                shard_id,
            });
        }

        let peers = members.iter().copied().filter(|&id| id != self.node_id);
        // Mix the shard in so co-located shards do not time out in lockstep.
        let config = RaftConfig::new(self.node_id, peers)
            .with_random_seed(self.node_id.get() ^ shard_id.get().rotate_left(32));
        let mut node = RaftNode::new(&config, log, terms)
            .map_err(|source| MultiRaftError::Raft { shard_id, source })?;

        let outputs = node.start();
        self.shards.insert(shard_id, node);
        info!(node = %self.node_id, shard = %shard_id, members = members.len(), "Created shard");

        // Postcondition: shard now exists.
        debug_assert!(self.shards.contains_key(&shard_id));
        Ok(self.process_outputs(shard_id, outputs))
    }

    /// Stops hosting a shard, returning its node so stores can be reclaimed.
    ///
    /// # Errors
    /// Returns `ShardNotFound` if the shard is not hosted here.
    pub fn remove_shard(&mut self, shard_id: ShardId) -> Result<RaftNode<L, T>, MultiRaftError> {
        let node = self
            .shards
            .remove(&shard_id)
            .ok_or(MultiRaftError::ShardNotFound(shard_id))?;

        for messages in self.outbound_batches.values_mut() {
            messages.retain(|m| m.shard_id != shard_id);
        }
        info!(node = %self.node_id, shard = %shard_id, "Removed shard");
        Ok(node)
    }

    /// Delivers one event to one shard.
    ///
    /// # Errors
    /// Returns `ShardNotFound`, or `Raft` if the shard's handler failed.
    pub fn handle(
        &mut self,
        shard_id: ShardId,
        event: Event,
    ) -> Result<Vec<MultiRaftOutput>, MultiRaftError> {
        let node = self
            .shards
            .get_mut(&shard_id)
            .ok_or(MultiRaftError::ShardNotFound(shard_id))?;
        let outputs = node
            .handle(event)
            .map_err(|source| MultiRaftError::Raft { shard_id, source })?;
        Ok(self.process_outputs(shard_id, outputs))
    }

    /// Delivers a batch of inbound messages and flushes outbound batches.
    ///
    /// Messages for shards not hosted here are dropped.
    ///
    /// # Errors
    /// Returns `Raft` on the first shard whose handler failed.
    pub fn handle_messages(
        &mut self,
        messages: Vec<ShardMessage>,
    ) -> Result<Vec<MultiRaftOutput>, MultiRaftError> {
        let mut all_outputs = Vec::new();
        for ShardMessage { shard_id, message } in messages {
            if !self.shards.contains_key(&shard_id) {
                debug!(node = %self.node_id, shard = %shard_id, "Dropping message for unknown shard");
                continue;
            }
            all_outputs.extend(self.handle(shard_id, Event::Message(message))?);
        }
        all_outputs.extend(self.flush());
        Ok(all_outputs)
    }

    /// Proposes `data` to a shard this node leads.
    ///
    /// # Errors
    /// Returns `ShardNotFound`, or `Raft` wrapping `NotLeader` or a storage failure.
    pub fn propose(
        &mut self,
        shard_id: ShardId,
        data: Bytes,
    ) -> Result<(LogIndex, Vec<MultiRaftOutput>), MultiRaftError> {
        let node = self
            .shards
            .get_mut(&shard_id)
            .ok_or(MultiRaftError::ShardNotFound(shard_id))?;
        let (index, outputs) = node
            .propose(data)
            .map_err(|source| MultiRaftError::Raft { shard_id, source })?;
        Ok((index, self.process_outputs(shard_id, outputs)))
    }

    /// Compacts one shard's log through `index`.
    ///
    /// # Errors
    /// Returns `ShardNotFound`, or `Raft` if the index is not yet applied.
    pub fn compact(&mut self, shard_id: ShardId, index: LogIndex) -> Result<(), MultiRaftError> {
        let node = self
            .shards
            .get_mut(&shard_id)
            .ok_or(MultiRaftError::ShardNotFound(shard_id))?;
        node.compact_log(index)
            .map_err(|source| MultiRaftError::Raft { shard_id, source })
    }

    /// Flushes all pending outbound batches.
    pub fn flush(&mut self) -> Vec<MultiRaftOutput> {
        let mut outputs = Vec::new();
        let mut destinations: Vec<NodeId> = self.outbound_batches.keys().copied().collect();
        destinations.sort_unstable();
        for to in destinations {
            if let Some(messages) = self.outbound_batches.remove(&to) {
                if !messages.is_empty() {
                    outputs.push(MultiRaftOutput::SendMessages { to, messages });
                }
            }
        }
        outputs
    }

    fn process_outputs(
        &mut self,
        shard_id: ShardId,
        outputs: Vec<RaftOutput>,
    ) -> Vec<MultiRaftOutput> {
        let mut result = Vec::with_capacity(outputs.len());
        for output in outputs {
            match output {
                RaftOutput::Send(message) => {
                    let to = message.to();
                    let batch = self.outbound_batches.entry(to).or_default();
                    batch.push(ShardMessage::new(shard_id, message));

                    if batch.len() >= MESSAGE_BATCH_SIZE_MAX {
                        let messages = std::mem::take(batch);
                        result.push(MultiRaftOutput::SendMessages { to, messages });
                    }
                }
                output => result.push(MultiRaftOutput::Shard { shard_id, output }),
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::MemoryLog;
    use crate::storage::MemoryTermStore;

    type Engine = MultiRaft<MemoryLog, MemoryTermStore>;

    fn members() -> Vec<NodeId> {
        vec![NodeId::new(1), NodeId::new(2), NodeId::new(3)]
    }

    fn engine_with(shards: &[u64]) -> Engine {
        let mut engine = Engine::new(NodeId::new(1));
        for &id in shards {
            engine
                .create_shard(
                    ShardId::new(id),
                    &members(),
                    MemoryLog::new(),
                    MemoryTermStore::new(),
                )
                .unwrap();
        }
        engine
    }

    #[test]
    fn test_create_and_remove_shard() {
        let mut engine = engine_with(&[1, 2]);

        assert_eq!(engine.shard_count(), 2);
        assert!(matches!(
            engine.create_shard(ShardId::new(1), &members(), MemoryLog::new(), MemoryTermStore::new()),
            Err(MultiRaftError::ShardExists(_))
        ));

        engine.remove_shard(ShardId::new(1)).unwrap();
        assert!(!engine.has_shard(ShardId::new(1)));
        assert!(matches!(
            engine.remove_shard(ShardId::new(1)),
            Err(MultiRaftError::ShardNotFound(_))
        ));
    }

    #[test]
    fn test_create_arms_election_timer() {
        let mut engine = Engine::new(NodeId::new(1));
        let outputs = engine
            .create_shard(ShardId::new(9), &members(), MemoryLog::new(), MemoryTermStore::new())
            .unwrap();

        assert!(matches!(
            outputs[..],
            [MultiRaftOutput::Shard {
                output: RaftOutput::ResetElectionTimer { .. },
                ..
            }]
        ));
    }

    #[test]
    fn test_member_list_must_include_self() {
        let mut engine = Engine::new(NodeId::new(9));
        assert!(matches!(
            engine.create_shard(ShardId::new(1), &members(), MemoryLog::new(), MemoryTermStore::new()),
            Err(MultiRaftError::NodeNotInMembers { .. })
        ));
    }

    #[test]
    fn test_messages_batched_by_destination() {
        let mut engine = engine_with(&[1, 2]);
        engine.handle(ShardId::new(1), Event::ElectionTimeout).unwrap();
        engine.handle(ShardId::new(2), Event::ElectionTimeout).unwrap();

        let outputs = engine.flush();
        assert_eq!(outputs.len(), 2);
        for output in outputs {
            let MultiRaftOutput::SendMessages { messages, .. } = output else {
                panic!("expected a batch");
            };
            let shards: Vec<_> = messages.iter().map(|m| m.shard_id).collect();
            assert_eq!(shards, vec![ShardId::new(1), ShardId::new(2)]);
        }
    }

    #[test]
    fn test_shards_elect_independently() {
        let mut engine = engine_with(&[1, 2]);
        engine.handle(ShardId::new(1), Event::ElectionTimeout).unwrap();
        engine.flush();

        let reply = Message::RequestVoteReply(crate::message::RequestVoteReply::new(
            TermId::new(1),
            NodeId::new(2),
            NodeId::new(1),
            true,
        ));
        engine
            .handle_messages(vec![ShardMessage::new(ShardId::new(1), reply)])
            .unwrap();

        assert_eq!(engine.leader_shards(), vec![ShardId::new(1)]);
        let other = engine.shard_state(ShardId::new(2)).unwrap();
        assert_eq!(other.role, Role::Follower);
        assert_eq!(other.current_term, TermId::new(0));
    }

    #[test]
    fn test_propose_on_follower_shard() {
        let mut engine = engine_with(&[1]);
        let result = engine.propose(ShardId::new(1), Bytes::from("x"));

        assert!(matches!(
            result,
            Err(MultiRaftError::Raft {
                source: RaftError::NotLeader { .. },
                ..
            })
        ));
        assert!(matches!(
            engine.propose(ShardId::new(5), Bytes::from("x")),
            Err(MultiRaftError::ShardNotFound(_))
        ));
    }

    #[test]
    fn test_unknown_shard_messages_dropped() {
        let mut engine = engine_with(&[1]);
        let reply = Message::RequestVoteReply(crate::message::RequestVoteReply::new(
            TermId::new(1),
            NodeId::new(2),
            NodeId::new(1),
            true,
        ));

        let outputs = engine
            .handle_messages(vec![ShardMessage::new(ShardId::new(42), reply)])
            .unwrap();
        assert!(outputs.is_empty());
    }
}
