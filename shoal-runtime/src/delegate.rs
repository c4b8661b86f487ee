//! Leader-local delegates.
//!
//! Some per-shard work should only happen on the shard leader, for example
//! coordinating transactions or serving leader-only reads. A
//! [`LeaderLocalDelegate`] registered with a shard driver is told about every
//! leadership change and receives application messages together with the
//! current leadership flag, so it can act or forward.

use bytes::Bytes;
use shoal_core::ShardId;

/// Work that runs next to a shard and cares whether this node leads it.
pub trait LeaderLocalDelegate: Send + 'static {
    /// Called whenever this node gains or loses leadership of `shard`.
    fn on_leadership_change(&mut self, shard: ShardId, is_leader: bool);

    /// Called for each application message addressed to the delegate.
    fn on_message(&mut self, shard: ShardId, message: Bytes, is_leader: bool);
}
