//! Leader behavior: replication, commit advancement and proposals.
//!
//! Sends are pipelined: after shipping entries to a peer its `next_index`
//! moves past them without waiting for the reply. A rejection pulls it back,
//! and every heartbeat rewinds peers that still lag to their last
//! acknowledged index, so lost messages are retransmitted.

use bytes::Bytes;
use shoal_core::{LogIndex, NodeId};
use tracing::{debug, info, warn};

use crate::behavior::{Behavior, LeaderState, Role};
use crate::error::{RaftError, RaftResult};
use crate::log::LogStore;
use crate::message::{AppendEntries, AppendEntriesReply, Message};
use crate::node::{RaftNode, RaftOutput};
use crate::quorum::majority_index;
use crate::storage::{StorageError, TermStore};

impl<L: LogStore, T: TermStore> RaftNode<L, T> {
    /// Takes leadership of the current term.
    pub(crate) fn become_leader(&mut self, outputs: &mut Vec<RaftOutput>) -> RaftResult<()> {
        // Precondition: only a candidate holding a majority can win.
        debug_assert!(matches!(
            &self.behavior,
            Behavior::Candidate(state) if state.votes.has_majority()
        ));

        self.exit_role(outputs);
        let last_index = self.ctx.log().last_index();
        self.behavior = Behavior::Leader(LeaderState::new(self.ctx.peers(), last_index));

        let term = self.ctx.current_term();
        info!(
            node = %self.ctx.node_id(),
            term = term.get(),
            last_index = last_index.get(),
            "Became leader"
        );

        outputs.push(RaftOutput::CancelElectionTimer);
        outputs.push(RaftOutput::BecameLeader { term });
        outputs.push(RaftOutput::ResetHeartbeatTimer {
            interval: self.ctx.heartbeat_interval(),
        });

        // Announce leadership right away rather than after the first interval.
        for peer in self.ctx.peers().to_vec() {
            self.send_append_entries(peer, outputs)?;
        }
        self.try_advance_commit(outputs);
        Ok(())
    }

    /// Handles expiry of the heartbeat timer.
    ///
    /// # Errors
    /// Returns `Storage` if entries could not be read from the log.
    pub fn handle_heartbeat_timeout(&mut self) -> RaftResult<Vec<RaftOutput>> {
        let mut outputs = Vec::new();
        let last_index = self.ctx.log().last_index();
        let role = self.role();

        let Behavior::Leader(state) = &mut self.behavior else {
            warn!(
                node = %self.ctx.node_id(),
                role = role.as_str(),
                "Heartbeat timer fired outside leadership"
            );
            return Ok(outputs);
        };

        // Retransmit anything still unacknowledged.
        for progress in state.progress.values_mut() {
            if progress.match_index < last_index {
                progress.next_index = progress.match_index.next();
            }
        }

        for peer in self.ctx.peers().to_vec() {
            self.send_append_entries(peer, &mut outputs)?;
        }
        outputs.push(RaftOutput::ResetHeartbeatTimer {
            interval: self.ctx.heartbeat_interval(),
        });
        Ok(outputs)
    }

    /// Appends `data` to the log as a new entry and starts replicating it.
    ///
    /// Returns the index assigned to the entry. The entry is durable in the
    /// local log on return, but not yet committed.
    ///
    /// # Errors
    /// Returns `NotLeader` with a hint when this node is not the leader, or
    /// `Storage` if the entry could not be appended.
    pub fn propose(&mut self, data: Bytes) -> RaftResult<(LogIndex, Vec<RaftOutput>)> {
        if !self.is_leader() {
            return Err(RaftError::NotLeader {
                leader_hint: self.leader_id(),
            });
        }

        let entry = self.next_entry(data);
        let index = entry.index;
        self.ctx.log_mut().append(std::slice::from_ref(&entry))?;
        debug!(
            node = %self.ctx.node_id(),
            term = entry.term.get(),
            index = index.get(),
            "Proposed entry"
        );

        let mut outputs = Vec::new();
        for peer in self.ctx.peers().to_vec() {
            self.send_append_entries(peer, &mut outputs)?;
        }
        self.try_advance_commit(&mut outputs);
        Ok((index, outputs))
    }

    /// Sends `peer` everything from its `next_index`, or asks for a snapshot
    /// when those entries have been compacted.
    pub(crate) fn send_append_entries(
        &mut self,
        peer: NodeId,
        outputs: &mut Vec<RaftOutput>,
    ) -> RaftResult<()> {
        let node = self.ctx.node_id();
        let term = self.ctx.current_term();
        let Behavior::Leader(state) = &mut self.behavior else {
            return Ok(());
        };
        let Some(progress) = state.progress.get_mut(&peer) else {
            return Ok(());
        };

        let log = self.ctx.log();
        let snapshot_index = log.snapshot_index();
        if progress.next_index <= snapshot_index {
            debug!(
                node = %node,
                peer = %peer,
                next_index = progress.next_index.get(),
                snapshot_index = snapshot_index.get(),
                "Peer needs a snapshot"
            );
            outputs.push(RaftOutput::SnapshotRequired {
                peer,
                snapshot_index,
            });
            return Ok(());
        }

        // Precondition: next_index never runs past the end of the log.
        debug_assert!(progress.next_index <= log.last_index().next());
        let prev_log_index = progress.next_index.prev();
        let prev_log_term = log
            .term_at(prev_log_index)
            .ok_or(StorageError::NotFound {
                index: prev_log_index,
            })?;
        let entries = log.entries_from(progress.next_index, self.ctx.max_entries_per_append())?;

        let request = if entries.is_empty() {
            AppendEntries::heartbeat(
                term,
                node,
                peer,
                prev_log_index,
                prev_log_term,
                log.commit_index(),
            )
        } else {
            AppendEntries::new(
                term,
                node,
                peer,
                prev_log_index,
                prev_log_term,
                entries,
                log.commit_index(),
            )
        };
        progress.next_index = request.last_index().next();
        outputs.push(RaftOutput::Send(Message::AppendEntries(request)));
        Ok(())
    }

    /// Updates a peer's progress from its reply.
    pub(crate) fn handle_append_entries_reply(
        &mut self,
        reply: &AppendEntriesReply,
        outputs: &mut Vec<RaftOutput>,
    ) -> RaftResult<()> {
        let node = self.ctx.node_id();
        let term = self.ctx.current_term();
        let last_index = self.ctx.log().last_index();
        let role = self.role();

        let Behavior::Leader(state) = &mut self.behavior else {
            debug!(
                node = %node,
                from = %reply.from,
                role = role.as_str(),
                "Ignoring AppendEntries reply outside leadership"
            );
            return Ok(());
        };
        if reply.term < term {
            debug!(
                node = %node,
                from = %reply.from,
                their_term = reply.term.get(),
                our_term = term.get(),
                "Ignoring stale AppendEntries reply"
            );
            return Ok(());
        }
        let Some(progress) = state.progress.get_mut(&reply.from) else {
            return Ok(());
        };

        if reply.success {
            // Precondition: peers only acknowledge entries we sent.
            debug_assert!(reply.match_index <= last_index);
            if reply.match_index > progress.match_index {
                progress.match_index = reply.match_index.min(last_index);
            }
            progress.next_index = progress.next_index.max(progress.match_index.next());
            let behind = progress.next_index <= last_index;

            self.try_advance_commit(outputs);
            if behind {
                self.send_append_entries(reply.from, outputs)?;
            }
        } else {
            // Step back one entry, or straight to the end of the peer's log.
            let hinted = progress.next_index.prev().min(reply.match_index.next());
            progress.next_index = hinted
                .max(progress.match_index.next())
                .max(LogIndex::new(1));
            debug!(
                node = %node,
                peer = %reply.from,
                next_index = progress.next_index.get(),
                peer_last = reply.match_index.get(),
                "AppendEntries rejected; backing off"
            );
            self.send_append_entries(reply.from, outputs)?;
        }
        Ok(())
    }

    /// Commits the highest index stored on a majority, if it is from this term.
    ///
    /// Entries from earlier terms are never committed by counting replicas;
    /// they become committed implicitly once a current-term entry after them is.
    pub(crate) fn try_advance_commit(&mut self, outputs: &mut Vec<RaftOutput>) {
        let Behavior::Leader(state) = &self.behavior else {
            return;
        };
        debug_assert_eq!(self.role(), Role::Leader);

        let log = self.ctx.log();
        let candidate = majority_index(&state.acknowledged(log.last_index()));
        if candidate <= log.commit_index() {
            return;
        }
        if log.term_at(candidate) != Some(self.ctx.current_term()) {
            debug!(
                node = %self.ctx.node_id(),
                index = candidate.get(),
                "Majority index is from an earlier term; not committing yet"
            );
            return;
        }
        self.advance_commit(candidate, outputs);
    }
}
