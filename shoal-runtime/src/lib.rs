//! Shoal Runtime - drives Raft shards on tokio.
//!
//! The state machine in `shoal-raft` is pure: it returns outputs and never
//! touches a clock or a socket. This crate supplies the rest:
//!
//! - [`ShardDriver`]: one task per shard owning its [`RaftNode`], timers and
//!   inbound queue
//! - [`ShardHandle`]: cloneable handle for proposing, delivering peer
//!   messages and reading status
//! - [`Transport`]: the seam to the network, with the in-process
//!   [`LocalNetwork`] implementation
//! - [`RaftListener`] and [`LeaderLocalDelegate`]: host callbacks
//! - [`LocalCluster`]: a whole cluster in one process
//!
//! # Example
//!
//! ```ignore
//! use shoal_runtime::{LocalCluster, TimingConfig};
//! use shoal_core::ShardId;
//!
//! let (cluster, events) = LocalCluster::start(3, 1, TimingConfig::default(), None).await?;
//! let leader = cluster.wait_for_leader(ShardId::new(1), Duration::from_secs(2)).await;
//! cluster.propose(ShardId::new(1), Bytes::from("x=1")).await?;
//! ```
//!
//! [`RaftNode`]: shoal_raft::RaftNode

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod cluster;
mod config;
mod delegate;
mod driver;
mod listener;
mod transport;

pub use cluster::{BoxedTermStore, ClusterError, HostedNode, LocalCluster};
pub use config::{ConfigError, NodeConfig, PeerConfig, TimingConfig};
pub use delegate::LeaderLocalDelegate;
pub use driver::{DriverError, ShardCommand, ShardDriver, ShardHandle};
pub use listener::{ChannelListener, ListenerEvent, NoopListener, RaftListener};
pub use transport::{LocalNetwork, LocalTransport, Transport, TransportError, TransportResult};
