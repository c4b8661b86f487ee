//! Shoal Tests - deterministic simulation testing for Shoal consensus.
//!
//! ## Test Organization
//!
//! **Simulation tests** (`simulation_tests`): whole clusters of
//! [`RaftNode`](shoal_raft::RaftNode)s on a logical clock with seeded message
//! loss, duplication, reordering, partitions and crash/restart, checked
//! against the safety properties after every event.
//!
//! **Integration tests** (`*_tests.rs`):
//! - `raft_tests`: hand-driven scenarios on a few nodes
//! - `multi_raft_tests`: many shards batched over one engine per node
//! - `runtime_tests`: shard drivers on tokio
//!
//! **Support modules**:
//! - `simulation`: the discrete-event simulator
//! - `properties`: safety property checker
//! - `scenarios`: seeds and fault profiles
//!
//! ## Naming Conventions
//!
//! - Simulation tests: `test_simulation_<scenario>`
//! - Integration tests: `test_<component>_<scenario>`
//! - Unit tests: inline in each crate under `#[cfg(test)]`

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod properties;
pub mod scenarios;
pub mod simulation;

#[cfg(test)]
mod simulation_tests;

#[cfg(test)]
mod runtime_tests;
