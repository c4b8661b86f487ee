//! The per-shard Raft state machine.
//!
//! A [`RaftNode`] is a pure handler: it owns its context and the active
//! [`Behavior`], consumes one [`Event`] at a time and returns the
//! [`RaftOutput`]s the host must carry out. It never blocks, sleeps or
//! touches the network.
//!
//! Every durable write a handler performs has completed by the time it
//! returns, so any reply contained in the outputs reflects persisted state.
//! If a write fails the handler returns [`RaftError::Storage`] and the host
//! must not act on anything from that call.
//!
//! Handlers are split by role:
//!
//! - `follower.rs`: vote granting, `AppendEntries` receipt, stepping down
//! - `candidate.rs`: starting elections, counting votes
//! - `leader.rs`: winning, replication, commit advancement, proposals

use std::time::Duration;

use bytes::Bytes;
use shoal_core::{LogIndex, NodeId, TermId};
use tracing::{debug, info, warn};

use crate::behavior::{Behavior, FollowerState, PeerProgress, Role};
use crate::config::RaftConfig;
use crate::context::RaftContext;
use crate::error::{RaftError, RaftResult};
use crate::log::{LogEntry, LogStore};
use crate::message::{Event, Message};
use crate::storage::TermStore;

/// Instructions returned by the state machine for the host to execute, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RaftOutput {
    /// Send a message to a peer.
    Send(Message),
    /// (Re)arm the election timer with a freshly randomized duration.
    ResetElectionTimer {
        /// Time until `ElectionTimeout` fires.
        timeout: Duration,
    },
    /// Stop the election timer.
    CancelElectionTimer,
    /// (Re)arm the heartbeat timer.
    ResetHeartbeatTimer {
        /// Time until `SendHeartbeat` fires.
        interval: Duration,
    },
    /// Stop the heartbeat timer.
    CancelHeartbeatTimer,
    /// This node won an election.
    BecameLeader {
        /// The term it leads.
        term: TermId,
    },
    /// This node stepped down or abandoned candidacy.
    BecameFollower {
        /// Term at the time of the transition.
        term: TermId,
        /// Leader, if the transition was caused by one.
        leader: Option<NodeId>,
    },
    /// The commit index moved forward.
    CommitIndexAdvanced {
        /// The new commit index.
        index: LogIndex,
    },
    /// A committed entry, to be applied to the state machine in order.
    Apply(LogEntry),
    /// A peer needs entries that were compacted away; ship it a snapshot.
    SnapshotRequired {
        /// The lagging peer.
        peer: NodeId,
        /// Index covered by the local snapshot.
        snapshot_index: LogIndex,
    },
}

/// A Raft member of one shard.
#[derive(Debug)]
pub struct RaftNode<L, T> {
    pub(crate) ctx: RaftContext<L, T>,
    pub(crate) behavior: Behavior,
}

impl<L: LogStore, T: TermStore> RaftNode<L, T> {
    /// Creates a node in the Follower role from its persisted collaborators.
    ///
    /// # Errors
    /// Returns `Config` if the configuration fails validation.
    pub fn new(config: &RaftConfig, log: L, terms: T) -> RaftResult<Self> {
        config.validate()?;
        let ctx = RaftContext::new(config, log, terms);
        info!(
            node = %ctx.node_id(),
            peers = ctx.peers().len(),
            term = ctx.current_term().get(),
            last_index = ctx.log().last_index().get(),
            "Raft node created"
        );
        Ok(Self {
            ctx,
            behavior: Behavior::Follower(FollowerState::default()),
        })
    }

    /// Arms the initial election timer. Call once after construction.
    #[must_use]
    pub fn start(&mut self) -> Vec<RaftOutput> {
        debug_assert_eq!(self.role(), Role::Follower);
        vec![RaftOutput::ResetElectionTimer {
            timeout: self.ctx.random_election_timeout(),
        }]
    }

    // ----------------------------------------------------------------------
    // Accessors
    // ----------------------------------------------------------------------

    /// This node's ID.
    #[must_use]
    pub const fn node_id(&self) -> NodeId {
        self.ctx.node_id()
    }

    /// Current role.
    #[must_use]
    pub const fn role(&self) -> Role {
        self.behavior.role()
    }

    /// The active behavior with its role-local state.
    #[must_use]
    pub const fn behavior(&self) -> &Behavior {
        &self.behavior
    }

    /// Returns true if this node is the leader.
    #[must_use]
    pub const fn is_leader(&self) -> bool {
        matches!(self.behavior, Behavior::Leader(_))
    }

    /// Current term.
    #[must_use]
    pub fn current_term(&self) -> TermId {
        self.ctx.current_term()
    }

    /// Vote cast in the current term.
    #[must_use]
    pub fn voted_for(&self) -> Option<NodeId> {
        self.ctx.voted_for()
    }

    /// The leader as far as this node knows.
    #[must_use]
    pub const fn leader_id(&self) -> Option<NodeId> {
        match &self.behavior {
            Behavior::Follower(state) => state.leader_id,
            Behavior::Candidate(_) => None,
            Behavior::Leader(_) => Some(self.ctx.node_id()),
        }
    }

    /// Commit index.
    #[must_use]
    pub fn commit_index(&self) -> LogIndex {
        self.ctx.log().commit_index()
    }

    /// Index of the last entry handed out through [`RaftOutput::Apply`].
    #[must_use]
    pub fn last_applied(&self) -> LogIndex {
        self.ctx.log().last_applied()
    }

    /// Replication progress for `peer`, while leader.
    #[must_use]
    pub fn peer_progress(&self, peer: NodeId) -> Option<PeerProgress> {
        match &self.behavior {
            Behavior::Leader(state) => state.progress(peer),
            _ => None,
        }
    }

    /// The shared context.
    #[must_use]
    pub const fn context(&self) -> &RaftContext<L, T> {
        &self.ctx
    }

    /// The log collaborator.
    #[must_use]
    pub const fn log(&self) -> &L {
        self.ctx.log()
    }

    /// The term/vote collaborator.
    #[must_use]
    pub const fn terms(&self) -> &T {
        self.ctx.terms()
    }

    /// Consumes the node, returning its collaborators. Role state is lost,
    /// exactly as on a crash.
    pub fn into_parts(self) -> (L, T) {
        self.ctx.into_parts()
    }

    // ----------------------------------------------------------------------
    // Event dispatch
    // ----------------------------------------------------------------------

    /// Handles one event.
    ///
    /// # Errors
    /// Returns `Storage` if a durable write failed; no outputs are produced.
    pub fn handle(&mut self, event: Event) -> RaftResult<Vec<RaftOutput>> {
        match event {
            Event::Message(message) => self.handle_message(message),
            Event::ElectionTimeout => self.handle_election_timeout(),
            Event::SendHeartbeat => self.handle_heartbeat_timeout(),
        }
    }

    /// Handles a message from a peer.
    ///
    /// Any message carrying a newer term first moves this node to that term
    /// (clearing its vote) and into the Follower role, then is processed there.
    ///
    /// # Errors
    /// Returns `Storage` if a durable write failed.
    pub fn handle_message(&mut self, message: Message) -> RaftResult<Vec<RaftOutput>> {
        let mut outputs = Vec::new();
        let node = self.ctx.node_id();
        let from = message.from();

        if message.to() != node || !self.ctx.is_peer(from) {
            warn!(
                node = %node,
                from = %from,
                to = %message.to(),
                kind = message.kind(),
                "Dropping message not meant for this node"
            );
            return Ok(outputs);
        }

        let prev_term = self.ctx.current_term();
        if message.term() > prev_term {
            self.observe_higher_term(message.term(), from, &mut outputs)?;
        }

        match message {
            Message::RequestVote(req) => self.handle_request_vote(&req, &mut outputs)?,
            Message::RequestVoteReply(reply) => self.handle_request_vote_reply(&reply, &mut outputs)?,
            Message::AppendEntries(req) => self.handle_append_entries(req, &mut outputs)?,
            Message::AppendEntriesReply(reply) => {
                self.handle_append_entries_reply(&reply, &mut outputs)?;
            }
        }

        // Postcondition: terms never go backwards.
        debug_assert!(self.ctx.current_term() >= prev_term);
        Ok(outputs)
    }

    /// Handles expiry of the election timer.
    ///
    /// Followers and candidates start a new election; leaders ignore it.
    ///
    /// # Errors
    /// Returns `Storage` if the new term or self-vote could not be persisted.
    pub fn handle_election_timeout(&mut self) -> RaftResult<Vec<RaftOutput>> {
        let mut outputs = Vec::new();
        if self.is_leader() {
            debug!(node = %self.ctx.node_id(), "Ignoring election timeout as leader");
            return Ok(outputs);
        }
        self.become_candidate(&mut outputs)?;
        Ok(outputs)
    }

    /// Starts an election immediately, as if the election timer had fired.
    ///
    /// # Errors
    /// Returns `Storage` if the new term or self-vote could not be persisted.
    pub fn campaign(&mut self) -> RaftResult<Vec<RaftOutput>> {
        self.handle_election_timeout()
    }

    /// Discards log entries through `index`, which must already be applied.
    ///
    /// # Errors
    /// Returns `CompactBeyondApplied` if `index` has not been applied yet, or
    /// `Storage` if the log rejects the compaction.
    pub fn compact_log(&mut self, index: LogIndex) -> RaftResult<()> {
        let last_applied = self.ctx.log().last_applied();
        if index > last_applied {
            return Err(RaftError::CompactBeyondApplied {
                index,
                last_applied,
            });
        }
        if index <= self.ctx.log().snapshot_index() {
            return Ok(());
        }
        self.ctx.log_mut().compact_through(index)?;
        info!(
            node = %self.ctx.node_id(),
            snapshot_index = index.get(),
            "Compacted log"
        );
        Ok(())
    }

    /// Builds an entry for `data` at the next free index in the current term.
    pub(crate) fn next_entry(&self, data: Bytes) -> LogEntry {
        LogEntry::new(
            self.ctx.current_term(),
            self.ctx.log().last_index().next(),
            data,
        )
    }

    // ----------------------------------------------------------------------
    // Shared transition helpers
    // ----------------------------------------------------------------------

    /// Adopts a newer term seen in a message from `from`.
    fn observe_higher_term(
        &mut self,
        term: TermId,
        from: NodeId,
        outputs: &mut Vec<RaftOutput>,
    ) -> RaftResult<()> {
        info!(
            node = %self.ctx.node_id(),
            from = %from,
            old_term = self.ctx.current_term().get(),
            new_term = term.get(),
            role = self.role().as_str(),
            "Observed higher term"
        );
        self.ctx.advance_term(term)?;

        match &mut self.behavior {
            Behavior::Follower(state) => state.leader_id = None,
            Behavior::Candidate(_) | Behavior::Leader(_) => self.become_follower(None, outputs),
        }

        // Postcondition: adopted the term, no vote in it yet, following.
        debug_assert_eq!(self.ctx.current_term(), term);
        debug_assert!(self.ctx.voted_for().is_none());
        debug_assert_eq!(self.role(), Role::Follower);
        Ok(())
    }

    /// Emits the outputs owed when leaving the active role.
    pub(crate) fn exit_role(&self, outputs: &mut Vec<RaftOutput>) {
        if self.is_leader() {
            outputs.push(RaftOutput::CancelHeartbeatTimer);
        }
    }

    /// Moves the commit index forward to `index` and hands out newly committed entries.
    pub(crate) fn advance_commit(&mut self, index: LogIndex, outputs: &mut Vec<RaftOutput>) {
        let previous = self.ctx.log().commit_index();
        if index <= previous {
            return;
        }
        // Precondition: only entries this node holds can be committed.
        debug_assert!(index <= self.ctx.log().last_index());

        self.ctx.log_mut().set_commit_index(index);
        debug!(
            node = %self.ctx.node_id(),
            from = previous.get(),
            to = index.get(),
            "Commit index advanced"
        );
        outputs.push(RaftOutput::CommitIndexAdvanced { index });
        self.apply_committed(outputs);
    }

    fn apply_committed(&mut self, outputs: &mut Vec<RaftOutput>) {
        let commit = self.ctx.log().commit_index();
        let mut applied = self.ctx.log().last_applied();
        while applied < commit {
            applied = applied.next();
            match self.ctx.log().entry_at(applied) {
                Some(entry) => outputs.push(RaftOutput::Apply(entry)),
                None => warn!(
                    node = %self.ctx.node_id(),
                    index = applied.get(),
                    "Committed entry missing from log; skipping apply"
                ),
            }
        }
        self.ctx.log_mut().set_last_applied(applied);
    }
}
