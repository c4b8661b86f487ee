//! Strongly-typed identifiers for Shoal entities.
//!
//! All IDs are 64-bit newtypes. Mixing up a term and an index is a compile error.

use std::fmt;

/// Generates a strongly-typed ID wrapper around a u64.
macro_rules! define_id {
    ($name:ident, $prefix:expr, $doc:expr) => {
        #[doc = $doc]
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
        #[repr(transparent)]
        pub struct $name(u64);

        impl $name {
            /// Creates a new ID from a raw u64 value.
            #[inline]
            #[must_use]
            pub const fn new(value: u64) -> Self {
                Self(value)
            }

            /// Returns the raw u64 value.
            #[inline]
            #[must_use]
            pub const fn get(self) -> u64 {
                self.0
            }

            /// Returns the next ID in sequence.
            ///
            /// # Panics
            /// Panics if the ID would overflow.
            #[inline]
            #[must_use]
            pub const fn next(self) -> Self {
                assert!(self.0 < u64::MAX, "ID overflow");
                Self(self.0 + 1)
            }

            /// Returns the previous ID, saturating at zero.
            #[inline]
            #[must_use]
            pub const fn prev(self) -> Self {
                Self(self.0.saturating_sub(1))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", $prefix, self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}-{}", $prefix, self.0)
            }
        }

        impl From<u64> for $name {
            fn from(value: u64) -> Self {
                Self::new(value)
            }
        }

        impl From<$name> for u64 {
            fn from(id: $name) -> Self {
                id.get()
            }
        }
    };
}

define_id!(NodeId, "node", "Unique identifier for a Shoal node (one process).");
define_id!(ShardId, "shard", "Unique identifier for a shard, i.e. one independent consensus group.");
define_id!(TermId, "term", "Raft term number. Never decreases on any node.");
define_id!(LogIndex, "idx", "Index into the replicated log. The first entry has index 1.");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_display() {
        let node = NodeId::new(42);
        assert_eq!(format!("{node}"), "node-42");
        assert_eq!(format!("{node:?}"), "node(42)");
        assert_eq!(format!("{}", ShardId::new(7)), "shard-7");
    }

    #[test]
    fn test_id_next_and_prev() {
        let idx = LogIndex::new(0);
        assert_eq!(idx.next().get(), 1);
        assert_eq!(idx.next().next().get(), 2);
        assert_eq!(idx.prev().get(), 0);
        assert_eq!(LogIndex::new(5).prev().get(), 4);
    }

    #[test]
    #[should_panic(expected = "ID overflow")]
    fn test_id_overflow_panics() {
        let _ = TermId::new(u64::MAX).next();
    }

    #[test]
    fn test_id_ordering() {
        let a = TermId::new(1);
        let b = TermId::new(2);

        assert!(a < b);
        assert_eq!(a, TermId::from(1));
        assert_eq!(u64::from(b), 2);
    }
}
