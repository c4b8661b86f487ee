//! Candidate behavior: starting elections and counting votes.

use tracing::{debug, info};

use crate::behavior::{Behavior, CandidateState, Role};
use crate::error::RaftResult;
use crate::log::LogStore;
use crate::message::{Message, RequestVote, RequestVoteReply};
use crate::node::{RaftNode, RaftOutput};
use crate::quorum::VoteTally;
use crate::storage::TermStore;

impl<L: LogStore, T: TermStore> RaftNode<L, T> {
    /// Starts an election in a new term.
    ///
    /// The new term and the self-vote are persisted before anything is sent.
    /// A node without peers already holds a majority and becomes leader here,
    /// before any election timer is armed.
    pub(crate) fn become_candidate(&mut self, outputs: &mut Vec<RaftOutput>) -> RaftResult<()> {
        let from = self.role();
        // Precondition: leaders never start elections.
        debug_assert_ne!(from, Role::Leader);
        let prev_term = self.ctx.current_term();

        let term = self.ctx.start_election_term()?;
        self.exit_role(outputs);

        let node = self.ctx.node_id();
        let votes = VoteTally::new(node, self.ctx.cluster_size());
        let won = votes.has_majority();
        self.behavior = Behavior::Candidate(CandidateState::new(votes));

        info!(
            node = %node,
            term = term.get(),
            from = from.as_str(),
            quorum = self.ctx.quorum(),
            "Became candidate"
        );

        // Postcondition: term incremented, we voted for ourselves.
        debug_assert_eq!(term, prev_term.next());
        debug_assert_eq!(self.ctx.voted_for(), Some(node));

        if won {
            return self.become_leader(outputs);
        }

        outputs.push(RaftOutput::ResetElectionTimer {
            timeout: self.ctx.random_election_timeout(),
        });

        let last_log_index = self.ctx.log().last_index();
        let last_log_term = self.ctx.log().last_term();
        for &peer in self.ctx.peers() {
            outputs.push(RaftOutput::Send(Message::RequestVote(RequestVote::new(
                term,
                node,
                peer,
                last_log_index,
                last_log_term,
            ))));
        }
        Ok(())
    }

    /// Counts a vote reply. Only candidates care; everyone else drops it.
    pub(crate) fn handle_request_vote_reply(
        &mut self,
        reply: &RequestVoteReply,
        outputs: &mut Vec<RaftOutput>,
    ) -> RaftResult<()> {
        let node = self.ctx.node_id();
        let term = self.ctx.current_term();
        let role = self.role();

        let won = {
            let Behavior::Candidate(state) = &mut self.behavior else {
                debug!(
                    node = %node,
                    from = %reply.from,
                    role = role.as_str(),
                    "Ignoring vote reply outside candidacy"
                );
                return Ok(());
            };

            if reply.term < term {
                debug!(
                    node = %node,
                    from = %reply.from,
                    their_term = reply.term.get(),
                    our_term = term.get(),
                    "Ignoring stale vote reply"
                );
                return Ok(());
            }
            if !reply.vote_granted {
                debug!(node = %node, from = %reply.from, term = term.get(), "Vote denied");
                return Ok(());
            }
            if !state.votes.record(reply.from) {
                debug!(node = %node, from = %reply.from, "Duplicate vote ignored");
                return Ok(());
            }

            debug!(
                node = %node,
                from = %reply.from,
                term = term.get(),
                granted = state.votes.granted(),
                "Vote received"
            );
            state.votes.has_majority()
        };

        if won {
            self.become_leader(outputs)?;
        }
        Ok(())
    }
}
