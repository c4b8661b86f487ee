//! Shoal Raft - leader election and log replication for one shard.
//!
//! Every shard in a Shoal cluster is an independent Raft group. This crate is
//! the per-shard state machine: it decides when to start elections, whom to
//! vote for, when to step down, what to replicate and when entries commit.
//!
//! # Design Principles
//!
//! - **Pure handlers**: [`RaftNode::handle`] consumes one event and returns the
//!   outputs the host must execute; no I/O, no clocks, no threads
//! - **Durable before visible**: term and vote writes complete before any
//!   reply that depends on them is returned
//! - **One role at a time**: role-local state lives in [`Behavior`] and is
//!   dropped on every transition
//! - **Deterministic**: timeout randomization comes from a seeded RNG
//! - **No unsafe code**

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod behavior;
mod candidate;
mod config;
mod context;
mod error;
mod file_store;
mod follower;
mod leader;
mod log;
mod message;
pub mod multi;
mod node;
mod peers;
mod quorum;
mod storage;

pub use behavior::{Behavior, CandidateState, FollowerState, LeaderState, PeerProgress, Role};
pub use config::RaftConfig;
pub use context::RaftContext;
pub use error::{RaftError, RaftResult};
pub use file_store::FileTermStore;
pub use log::{LogEntry, LogStore, MemoryLog};
pub use message::{
    AppendEntries, AppendEntriesReply, Event, Message, RequestVote, RequestVoteReply,
};
pub use multi::{MultiRaft, MultiRaftError, MultiRaftOutput, ShardMessage, ShardStatus};
pub use node::{RaftNode, RaftOutput};
pub use peers::{PeerResolver, StaticPeers};
pub use quorum::{majority, majority_index, VoteTally};
pub use storage::{MemoryTermStore, PersistentState, StorageError, StorageResult, TermStore};
