//! System limits and configuration bounds.
//!
//! Following TigerStyle: put limits on everything.
//! Every batch, pool and timer has an explicit bound so a misconfigured
//! worker fails at startup instead of misbehaving in production.

/// System-wide limits for Shoal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    // Fetch limits.
    /// Maximum records requested in a single fetch.
    pub max_records_per_fetch: u32,

    // Ownership limits.
    /// Maximum leases a single worker may hold.
    pub max_leases_per_worker: u32,
    /// Maximum shards tracked in the lease table.
    pub max_shards: u32,

    // Timer limits (in microseconds).
    /// Shortest allowed failover timeout.
    pub min_failover_timeout_us: u64,
    /// Longest allowed failover timeout.
    pub max_failover_timeout_us: u64,
    /// Shortest allowed interval for any periodic task.
    pub min_interval_us: u64,

    // Retry limits.
    /// Maximum attempts for any retried operation.
    pub max_retry_attempts: u32,
}

impl Limits {
    /// Creates limits with safe defaults.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            // Fetch: the stream caps a single read at 10k records.
            max_records_per_fetch: 10_000,

            // Ownership: 10k leases/worker, 100k shards.
            max_leases_per_worker: 10_000,
            max_shards: 100_000,

            // Timers: failover between 10ms and 1h, periodic tasks >= 1ms.
            min_failover_timeout_us: 10 * 1000,
            max_failover_timeout_us: 60 * 60 * 1_000_000,
            min_interval_us: 1000,

            // Retries: 100 attempts.
            max_retry_attempts: 100,
        }
    }

    /// Validates that all limits are internally consistent.
    ///
    /// # Errors
    /// Returns an error if any limits are invalid or inconsistent.
    pub fn validate(&self) -> crate::Result<()> {
        if self.max_records_per_fetch == 0 {
            return Err(crate::Error::InvalidArgument {
                name: "max_records_per_fetch",
                reason: "must be positive",
            });
        }

        if self.max_leases_per_worker == 0 {
            return Err(crate::Error::InvalidArgument {
                name: "max_leases_per_worker",
                reason: "must be positive",
            });
        }

        if self.max_leases_per_worker > self.max_shards {
            return Err(crate::Error::InvalidArgument {
                name: "max_leases_per_worker",
                reason: "must be <= max_shards",
            });
        }

        if self.max_failover_timeout_us < self.min_failover_timeout_us {
            return Err(crate::Error::InvalidArgument {
                name: "max_failover_timeout_us",
                reason: "must be >= min_failover_timeout_us",
            });
        }

        if self.min_interval_us >= self.min_failover_timeout_us {
            return Err(crate::Error::InvalidArgument {
                name: "min_interval_us",
                reason: "must be < min_failover_timeout_us",
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
