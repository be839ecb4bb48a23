//! Reusable test scenarios for Shoal simulation.
//!
//! Scenarios define timing presets and fleet shapes that can be composed to
//! create integration and DST tests.

/// Standard fleet configurations.
pub mod fleets {
    /// Two competing workers.
    pub const TWO_WORKERS: &[&str] = &["worker-a", "worker-b"];

    /// Three workers, for rebalancing and failover.
    pub const THREE_WORKERS: &[&str] = &["worker-a", "worker-b", "worker-c"];
}

/// Timing presets for workers running on the real tokio clock.
pub mod timing {
    use std::time::Duration;

    /// Lease expiry used by fast tests.
    pub const FAILOVER: Duration = Duration::from_millis(400);

    /// Renewal period, well below `FAILOVER`.
    pub const RENEWAL: Duration = Duration::from_millis(50);

    /// Reconciliation period.
    pub const SHARD_SYNC: Duration = Duration::from_millis(50);

    /// Upper bound for anything a test waits on.
    pub const WAIT: Duration = Duration::from_secs(10);
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

    /// Number of random seeds to test in CI.
    pub const CI_SEED_COUNT: u32 = 50;
}
