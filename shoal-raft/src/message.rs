//! Raft messages and the events that drive a node.
//!
//! Wire encoding is the transport's concern; these are plain values.

use shoal_core::{LogIndex, NodeId, TermId};

use crate::LogEntry;

/// Messages exchanged between the members of one shard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Candidate asking for a vote.
    RequestVote(RequestVote),
    /// Answer to a vote request.
    RequestVoteReply(RequestVoteReply),
    /// Leader replicating entries (also used as heartbeat).
    AppendEntries(AppendEntries),
    /// Answer to an `AppendEntries`.
    AppendEntriesReply(AppendEntriesReply),
}

impl Message {
    /// Returns the sender of this message.
    #[must_use]
    pub const fn from(&self) -> NodeId {
        match self {
            Self::RequestVote(r) => r.candidate_id,
            Self::RequestVoteReply(r) => r.from,
            Self::AppendEntries(r) => r.leader_id,
            Self::AppendEntriesReply(r) => r.from,
        }
    }

    /// Returns the destination of this message.
    #[must_use]
    pub const fn to(&self) -> NodeId {
        match self {
            Self::RequestVote(r) => r.to,
            Self::RequestVoteReply(r) => r.to,
            Self::AppendEntries(r) => r.to,
            Self::AppendEntriesReply(r) => r.to,
        }
    }

    /// Returns the sender's term.
    #[must_use]
    pub const fn term(&self) -> TermId {
        match self {
            Self::RequestVote(r) => r.term,
            Self::RequestVoteReply(r) => r.term,
            Self::AppendEntries(r) => r.term,
            Self::AppendEntriesReply(r) => r.term,
        }
    }

    /// Short name for logging.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::RequestVote(_) => "RequestVote",
            Self::RequestVoteReply(_) => "RequestVoteReply",
            Self::AppendEntries(_) => "AppendEntries",
            Self::AppendEntriesReply(_) => "AppendEntriesReply",
        }
    }
}

/// Everything that can make a node act.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// A message from a peer.
    Message(Message),
    /// The election timer fired.
    ElectionTimeout,
    /// The heartbeat timer fired (meaningful for leaders only).
    SendHeartbeat,
}

impl From<Message> for Event {
    fn from(message: Message) -> Self {
        Self::Message(message)
    }
}

/// `RequestVote` RPC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestVote {
    /// Candidate's term.
    pub term: TermId,
    /// Candidate requesting the vote.
    pub candidate_id: NodeId,
    /// Target node.
    pub to: NodeId,
    /// Index of the candidate's last log entry.
    pub last_log_index: LogIndex,
    /// Term of the candidate's last log entry.
    pub last_log_term: TermId,
}

impl RequestVote {
    /// Creates a new vote request.
    #[must_use]
    pub const fn new(
        term: TermId,
        candidate_id: NodeId,
        to: NodeId,
        last_log_index: LogIndex,
        last_log_term: TermId,
    ) -> Self {
        Self {
            term,
            candidate_id,
            to,
            last_log_index,
            last_log_term,
        }
    }
}

/// Reply to `RequestVote`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestVoteReply {
    /// Voter's current term, for the candidate to update itself.
    pub term: TermId,
    /// The voter.
    pub from: NodeId,
    /// The candidate.
    pub to: NodeId,
    /// True if the vote was granted.
    pub vote_granted: bool,
}

impl RequestVoteReply {
    /// Creates a new vote reply.
    #[must_use]
    pub const fn new(term: TermId, from: NodeId, to: NodeId, vote_granted: bool) -> Self {
        Self {
            term,
            from,
            to,
            vote_granted,
        }
    }
}

/// `AppendEntries` RPC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendEntries {
    /// Leader's term.
    pub term: TermId,
    /// Leader sending this request.
    pub leader_id: NodeId,
    /// Target follower.
    pub to: NodeId,
    /// Index of the entry immediately preceding `entries`.
    pub prev_log_index: LogIndex,
    /// Term of the `prev_log_index` entry.
    pub prev_log_term: TermId,
    /// Entries to store (empty for heartbeat).
    pub entries: Vec<LogEntry>,
    /// Leader's commit index.
    pub leader_commit: LogIndex,
}

impl AppendEntries {
    /// Creates a new `AppendEntries` request.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub const fn new(
        term: TermId,
        leader_id: NodeId,
        to: NodeId,
        prev_log_index: LogIndex,
        prev_log_term: TermId,
        entries: Vec<LogEntry>,
        leader_commit: LogIndex,
    ) -> Self {
        Self {
            term,
            leader_id,
            to,
            prev_log_index,
            prev_log_term,
            entries,
            leader_commit,
        }
    }

    /// Creates a heartbeat (`AppendEntries` with no entries).
    #[must_use]
    pub const fn heartbeat(
        term: TermId,
        leader_id: NodeId,
        to: NodeId,
        prev_log_index: LogIndex,
        prev_log_term: TermId,
        leader_commit: LogIndex,
    ) -> Self {
        Self::new(
            term,
            leader_id,
            to,
            prev_log_index,
            prev_log_term,
            Vec::new(),
            leader_commit,
        )
    }

    /// Returns true if this is a heartbeat (no entries).
    #[must_use]
    pub fn is_heartbeat(&self) -> bool {
        self.entries.is_empty()
    }

    /// Index of the last entry carried, or `prev_log_index` for a heartbeat.
    #[must_use]
    pub fn last_index(&self) -> LogIndex {
        // Safe cast: batch sizes are bounded by `Limits::max_entries_per_append`.
        #[allow(clippy::cast_possible_truncation)]
        let count = self.entries.len() as u64;
        LogIndex::new(self.prev_log_index.get() + count)
    }
}

/// Reply to `AppendEntries`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendEntriesReply {
    /// Follower's current term, for the leader to update itself.
    pub term: TermId,
    /// The follower.
    pub from: NodeId,
    /// The leader.
    pub to: NodeId,
    /// True if the follower matched `prev_log_index`/`prev_log_term`.
    pub success: bool,
    /// On success, the last index now known to match the leader.
    /// On failure, the follower's last log index (a back-off hint).
    pub match_index: LogIndex,
}

impl AppendEntriesReply {
    /// Creates a new `AppendEntries` reply.
    #[must_use]
    pub const fn new(
        term: TermId,
        from: NodeId,
        to: NodeId,
        success: bool,
        match_index: LogIndex,
    ) -> Self {
        Self {
            term,
            from,
            to,
            success,
            match_index,
        }
    }
}
