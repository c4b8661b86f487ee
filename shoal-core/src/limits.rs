//! System limits and configuration bounds.
//!
//! Put limits on everything: every batch, timeout and cluster has an explicit
//! maximum so that behavior stays predictable under load.

use std::time::Duration;

/// System-wide limits for Shoal consensus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    // Replication.
    /// Maximum number of entries carried by a single `AppendEntries`.
    pub max_entries_per_append: u32,

    // Membership.
    /// Maximum number of voting members in one shard, self included.
    pub max_cluster_size: u32,
    /// Maximum number of shards hosted by one node.
    pub max_shards_per_node: u32,

    // Timing.
    /// Leader heartbeat interval.
    pub heartbeat_interval: Duration,
    /// Lower bound of the randomized election timeout.
    pub election_timeout_min: Duration,
    /// Upper bound of the randomized election timeout.
    pub election_timeout_max: Duration,
}

impl Limits {
    /// Creates limits with safe defaults.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            max_entries_per_append: 1000,

            max_cluster_size: 7,
            max_shards_per_node: 10_000,

            // Heartbeat well below the election window so a live leader is never deposed.
            heartbeat_interval: Duration::from_millis(50),
            election_timeout_min: Duration::from_millis(150),
            election_timeout_max: Duration::from_millis(300),
        }
    }

    /// Validates that all limits are internally consistent.
    ///
    /// # Errors
    /// Returns an error if any limit is zero or the timing bounds are inconsistent.
    pub fn validate(&self) -> crate::Result<()> {
        if self.max_entries_per_append == 0 {
            return Err(crate::Error::InvalidArgument {
                name: "max_entries_per_append",
                reason: "must be positive",
            });
        }

        if self.max_cluster_size == 0 {
            return Err(crate::Error::InvalidArgument {
                name: "max_cluster_size",
                reason: "must be positive",
            });
        }

        if self.election_timeout_min <= self.heartbeat_interval {
            return Err(crate::Error::InvalidArgument {
                name: "election_timeout_min",
                reason: "must be > heartbeat_interval",
            });
        }

        if self.election_timeout_max < self.election_timeout_min {
            return Err(crate::Error::InvalidArgument {
                name: "election_timeout_max",
                reason: "must be >= election_timeout_min",
            });
        }

        Ok(())
    }
}

impl Default for Limits {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_limits_are_valid() {
        assert!(Limits::new().validate().is_ok());
    }

    #[test]
    fn test_zero_batch_rejected() {
        let mut limits = Limits::new();
        limits.max_entries_per_append = 0;
        assert!(limits.validate().is_err());
    }

    #[test]
    fn test_election_timeout_less_than_heartbeat() {
        let mut limits = Limits::new();
        limits.election_timeout_min = Duration::from_millis(40);
        limits.heartbeat_interval = Duration::from_millis(50);
        assert!(limits.validate().is_err());
    }

    #[test]
    fn test_inverted_election_range() {
        let mut limits = Limits::new();
        limits.election_timeout_min = Duration::from_millis(400);
        limits.election_timeout_max = Duration::from_millis(300);
        assert!(limits.validate().is_err());
    }
}
