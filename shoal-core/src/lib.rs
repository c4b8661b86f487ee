//! Shoal Core - Strongly-typed identifiers, limits and errors for Shoal.
//!
//! Every other Shoal crate builds on these types. Nothing here performs I/O.
//!
//! # Design Principles
//!
//! - **Strongly-typed IDs**: a `TermId` can never be passed where a `LogIndex` is expected
//! - **Explicit limits**: every queue, batch and timeout has a bounded maximum
//! - **Explicit types**: use u32/u64, not usize, for anything that crosses a node boundary
//! - **No unsafe code**

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;
mod limits;
mod types;

pub use error::{Error, Result};
pub use limits::Limits;
pub use types::{LogIndex, NodeId, ShardId, TermId};
