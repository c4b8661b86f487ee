//! Follower behavior: granting votes, accepting entries, stepping down.
//!
//! Vote requests are answered here for every role. A candidate or leader has
//! already voted for itself in its term, so it can only deny at equal term.

use shoal_core::{LogIndex, NodeId};
use tracing::{debug, error, info, warn};

use crate::behavior::{Behavior, FollowerState, Role};
use crate::error::RaftResult;
use crate::log::{LogEntry, LogStore};
use crate::message::{AppendEntries, AppendEntriesReply, Message, RequestVote, RequestVoteReply};
use crate::node::{RaftNode, RaftOutput};
use crate::storage::TermStore;

impl<L: LogStore, T: TermStore> RaftNode<L, T> {
    /// Switches to the Follower role.
    pub(crate) fn become_follower(&mut self, leader: Option<NodeId>, outputs: &mut Vec<RaftOutput>) {
        let from = self.role();
        // Precondition: followers update their state in place.
        debug_assert_ne!(from, Role::Follower);

        self.exit_role(outputs);
        self.behavior = Behavior::Follower(FollowerState::new(leader));

        let term = self.ctx.current_term();
        info!(
            node = %self.ctx.node_id(),
            term = term.get(),
            from = from.as_str(),
            leader = ?leader,
            "Became follower"
        );
        outputs.push(RaftOutput::BecameFollower { term, leader });
        outputs.push(RaftOutput::ResetElectionTimer {
            timeout: self.ctx.random_election_timeout(),
        });
    }

    /// Answers a vote request. The request's term is never newer than ours here.
    pub(crate) fn handle_request_vote(
        &mut self,
        req: &RequestVote,
        outputs: &mut Vec<RaftOutput>,
    ) -> RaftResult<()> {
        let node = self.ctx.node_id();
        let term = self.ctx.current_term();
        debug_assert!(req.term <= term);

        let granted = if req.term < term {
            debug!(
                node = %node,
                candidate = %req.candidate_id,
                their_term = req.term.get(),
                our_term = term.get(),
                "Denying stale vote request"
            );
            false
        } else {
            let can_vote = self
                .ctx
                .voted_for()
                .map_or(true, |voted| voted == req.candidate_id);
            let log_ok = self
                .ctx
                .log()
                .is_up_to_date(req.last_log_term, req.last_log_index);
            debug!(
                node = %node,
                candidate = %req.candidate_id,
                term = term.get(),
                can_vote,
                log_ok,
                "Evaluated vote request"
            );
            can_vote && log_ok
        };

        if granted {
            // Only a follower can still have its vote in this term.
            debug_assert_eq!(self.role(), Role::Follower);
            if self.ctx.voted_for().is_none() {
                self.ctx.record_vote(req.candidate_id)?;
            }
            info!(
                node = %node,
                candidate = %req.candidate_id,
                term = term.get(),
                "Granted vote"
            );
            outputs.push(RaftOutput::ResetElectionTimer {
                timeout: self.ctx.random_election_timeout(),
            });
        }

        outputs.push(RaftOutput::Send(Message::RequestVoteReply(RequestVoteReply::new(
            term,
            node,
            req.candidate_id,
            granted,
        ))));
        Ok(())
    }

    /// Accepts or rejects replicated entries from a leader.
    pub(crate) fn handle_append_entries(
        &mut self,
        req: AppendEntries,
        outputs: &mut Vec<RaftOutput>,
    ) -> RaftResult<()> {
        let node = self.ctx.node_id();
        let term = self.ctx.current_term();
        debug_assert!(req.term <= term);

        if req.term < term {
            debug!(
                node = %node,
                leader = %req.leader_id,
                their_term = req.term.get(),
                our_term = term.get(),
                "Rejecting stale AppendEntries"
            );
            self.reply_append(req.leader_id, false, self.ctx.log().last_index(), outputs);
            return Ok(());
        }

        match self.role() {
            Role::Leader => {
                error!(
                    node = %node,
                    other = %req.leader_id,
                    term = term.get(),
                    "Two leaders in one term"
                );
                self.reply_append(req.leader_id, false, self.ctx.log().last_index(), outputs);
                return Ok(());
            }
            Role::Candidate => self.become_follower(Some(req.leader_id), outputs),
            Role::Follower => {
                if let Behavior::Follower(state) = &mut self.behavior {
                    if state.leader_id != Some(req.leader_id) {
                        info!(
                            node = %node,
                            leader = %req.leader_id,
                            term = term.get(),
                            "Following new leader"
                        );
                        state.leader_id = Some(req.leader_id);
                    }
                }
                outputs.push(RaftOutput::ResetElectionTimer {
                    timeout: self.ctx.random_election_timeout(),
                });
            }
        }

        let leader = req.leader_id;
        let leader_commit = req.leader_commit;
        let request_last = req.last_index();
        let heartbeat = req.is_heartbeat();

        // Entries at or before the snapshot are committed, so they already match.
        let snapshot_index = self.ctx.log().snapshot_index();
        let (prev_index, prev_term, entries) = if req.prev_log_index < snapshot_index {
            let entries: Vec<LogEntry> = req
                .entries
                .into_iter()
                .filter(|e| e.index > snapshot_index)
                .collect();
            (snapshot_index, self.ctx.log().snapshot_term(), entries)
        } else {
            (req.prev_log_index, req.prev_log_term, req.entries)
        };

        let prev_matches =
            prev_index.get() == 0 || self.ctx.log().term_at(prev_index) == Some(prev_term);
        if !prev_matches {
            debug!(
                node = %node,
                leader = %leader,
                prev_index = prev_index.get(),
                prev_term = prev_term.get(),
                our_last = self.ctx.log().last_index().get(),
                "Log consistency check failed"
            );
            self.reply_append(leader, false, self.ctx.log().last_index(), outputs);
            return Ok(());
        }

        let contiguous = entries
            .iter()
            .zip(1..)
            .all(|(e, offset)| e.index.get() == prev_index.get() + offset);
        if !contiguous {
            warn!(
                node = %node,
                leader = %leader,
                prev_index = prev_index.get(),
                first = entries.first().map(|e| e.index.get()),
                "Ignoring AppendEntries with non-contiguous entries"
            );
            self.reply_append(leader, false, self.ctx.log().last_index(), outputs);
            return Ok(());
        }

        if !self.store_entries(&entries)? {
            self.reply_append(leader, false, self.ctx.log().last_index(), outputs);
            return Ok(());
        }

        if !heartbeat {
            debug!(
                node = %node,
                leader = %leader,
                last = request_last.get(),
                "Stored entries"
            );
        }

        let commit = self.ctx.log().commit_index();
        if leader_commit > commit {
            self.advance_commit(leader_commit.min(request_last), outputs);
        }

        self.reply_append(leader, true, request_last, outputs);
        Ok(())
    }

    /// Appends `entries` after a matched prefix, truncating the first conflict.
    ///
    /// Returns false if the leader asked to overwrite a committed entry.
    fn store_entries(&mut self, entries: &[LogEntry]) -> RaftResult<bool> {
        for (offset, entry) in entries.iter().enumerate() {
            match self.ctx.log().term_at(entry.index) {
                Some(existing) if existing == entry.term => {}
                Some(existing) => {
                    let commit = self.ctx.log().commit_index();
                    if entry.index <= commit {
                        error!(
                            node = %self.ctx.node_id(),
                            index = entry.index.get(),
                            commit = commit.get(),
                            "Refusing to overwrite committed entry"
                        );
                        return Ok(false);
                    }
                    debug!(
                        node = %self.ctx.node_id(),
                        index = entry.index.get(),
                        existing_term = existing.get(),
                        new_term = entry.term.get(),
                        "Truncating conflicting suffix"
                    );
                    self.ctx.log_mut().truncate_from(entry.index)?;
                    self.ctx.log_mut().append(&entries[offset..])?;
                    return Ok(true);
                }
                None => {
                    self.ctx.log_mut().append(&entries[offset..])?;
                    return Ok(true);
                }
            }
        }
        Ok(true)
    }

    fn reply_append(
        &self,
        leader: NodeId,
        success: bool,
        match_index: LogIndex,
        outputs: &mut Vec<RaftOutput>,
    ) {
        outputs.push(RaftOutput::Send(Message::AppendEntriesReply(
            AppendEntriesReply::new(
                self.ctx.current_term(),
                self.ctx.node_id(),
                leader,
                success,
                match_index,
            ),
        )));
    }
}
