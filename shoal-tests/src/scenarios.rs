//! Reusable seeds and fault profiles for simulation.

use std::time::Duration;

/// Network fault profiles.
pub mod faults {
    use super::Duration;

    /// How the simulated network misbehaves.
    #[derive(Debug, Clone, Copy, PartialEq)]
    pub struct NetworkFaults {
        /// Probability that a message is lost.
        pub drop_rate: f64,
        /// Probability that a delivered message is delivered twice.
        pub duplicate_rate: f64,
        /// Lowest delivery latency.
        pub min_latency: Duration,
        /// Highest delivery latency. A spread above `min_latency` reorders messages.
        pub max_latency: Duration,
    }

    impl NetworkFaults {
        /// A network that delivers everything, in order, after 1ms.
        pub const RELIABLE: Self = Self {
            drop_rate: 0.0,
            duplicate_rate: 0.0,
            min_latency: Duration::from_millis(1),
            max_latency: Duration::from_millis(1),
        };

        /// Some loss, some duplication and heavy reordering.
        pub const LOSSY: Self = Self {
            drop_rate: 0.10,
            duplicate_rate: 0.05,
            min_latency: Duration::from_millis(1),
            max_latency: Duration::from_millis(40),
        };

        /// Frequent loss and duplication.
        pub const HOSTILE: Self = Self {
            drop_rate: 0.30,
            duplicate_rate: 0.20,
            min_latency: Duration::from_millis(1),
            max_latency: Duration::from_millis(80),
        };
    }

    impl Default for NetworkFaults {
        fn default() -> Self {
            Self::RELIABLE
        }
    }
}

/// Standard cluster sizes.
pub mod clusters {
    /// Smallest cluster that tolerates a failure.
    pub const THREE_NODE: u64 = 3;

    /// Tolerates two failures.
    pub const FIVE_NODE: u64 = 5;
}

/// Seeds for reproducible testing.
pub mod seeds {
    /// Standard test seeds that have historically found bugs.
    pub const REGRESSION_SEEDS: &[u64] = &[
        42,
        12345,
        0xDEAD_BEEF,
        999,
        7777,
        0x1337,
        0xCAFE_BABE,
        1,
        u64::MAX,
        0,
    ];

    /// Number of extra random seeds swept by the long-running tests.
    pub const SWEEP_SEED_COUNT: u64 = 50;
}

/// Election timing used by simulations: wide enough that split votes resolve
/// quickly, with heartbeats far below the election window.
pub mod timing {
    use super::Duration;

    /// Election timeout lower bound.
    pub const ELECTION_TIMEOUT_MIN: Duration = Duration::from_millis(150);
    /// Election timeout upper bound.
    pub const ELECTION_TIMEOUT_MAX: Duration = Duration::from_millis(300);
    /// Heartbeat interval.
    pub const HEARTBEAT_INTERVAL: Duration = Duration::from_millis(50);
}

/// Time after which a healthy cluster is expected to have a leader.
pub const ELECTION_SETTLE: Duration = Duration::from_secs(3);
