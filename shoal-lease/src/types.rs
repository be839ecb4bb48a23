//! Lease rows and coordinator configuration.

use std::time::Duration;

use shoal_core::{duration_us, Checkpoint, LeaseCounter, Limits, RetryPolicy, ShardId, WorkerId};

// -----------------------------------------------------------------------------
// Lease
// -----------------------------------------------------------------------------

/// One row of the lease table.
///
/// A lease grants one worker the right to consume a shard. Every successful
/// mutation bumps `counter`; writes are conditioned on the counter the writer
/// last observed, so a worker that lost ownership cannot overwrite the row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    /// Shard this lease covers.
    pub shard_id: ShardId,
    /// Worker holding the lease. `None` means unowned.
    pub owner: Option<WorkerId>,
    /// Fence token, incremented on every successful mutation.
    pub counter: LeaseCounter,
    /// Last acknowledged position. `None` until the shard has been started.
    pub checkpoint: Option<Checkpoint>,
    /// Time of the last successful mutation (microseconds since epoch).
    pub last_update_us: u64,
    /// Parents recorded when the shard was discovered.
    pub parent_shard_ids: Vec<ShardId>,
}

impl Lease {
    /// Creates an unowned, unstarted lease for a newly discovered shard.
    #[must_use]
    pub const fn new(shard_id: ShardId, parent_shard_ids: Vec<ShardId>, current_time_us: u64) -> Self {
        Self {
            shard_id,
            owner: None,
            counter: LeaseCounter::new(0),
            checkpoint: None,
            last_update_us: current_time_us,
            parent_shard_ids,
        }
    }

    /// Returns true if no renewal happened within `failover_timeout_us`.
    #[must_use]
    pub const fn is_expired(&self, failover_timeout_us: u64, current_time_us: u64) -> bool {
        current_time_us.saturating_sub(self.last_update_us) > failover_timeout_us
    }

    /// Returns true if `worker_id` owns this lease.
    #[must_use]
    pub fn is_owned_by(&self, worker_id: &WorkerId) -> bool {
        self.owner.as_ref() == Some(worker_id)
    }

    /// Returns true if `worker_id` may take this lease: it is unowned,
    /// expired, or already recorded as owned by `worker_id`.
    #[must_use]
    pub fn is_available_to(
        &self,
        worker_id: &WorkerId,
        failover_timeout_us: u64,
        current_time_us: u64,
    ) -> bool {
        self.owner.is_none()
            || self.is_owned_by(worker_id)
            || self.is_expired(failover_timeout_us, current_time_us)
    }

    /// Returns true once the shard has been checkpointed at `SHARD_END`.
    #[must_use]
    pub fn is_shard_end(&self) -> bool {
        self.checkpoint.as_ref().is_some_and(Checkpoint::is_shard_end)
    }

    /// Returns the row a successful mutation at `current_time_us` produces.
    #[must_use]
    pub fn next_version(&self, current_time_us: u64) -> Self {
        let mut next = self.clone();
        next.counter = self.counter.next();
        next.last_update_us = current_time_us;
        next
    }
}

// -----------------------------------------------------------------------------
// Lease Config
// -----------------------------------------------------------------------------

/// Configuration for the lease coordinator and checkpointer.
#[derive(Debug, Clone)]
pub struct LeaseConfig {
    /// Identity written into the `owner` field.
    pub worker_id: WorkerId,
    /// Time without renewal after which a lease may be taken over.
    pub failover_timeout_us: u64,
    /// Maximum number of leases this worker holds at once.
    pub max_leases_for_worker: u32,
    /// Maximum number of shards shard sync will track.
    pub max_shards: u32,
    /// Retry policy for transient lease table failures on checkpoint.
    pub store_retry: RetryPolicy,
}

impl LeaseConfig {
    /// Creates config from system limits.
    #[must_use]
    pub const fn from_limits(worker_id: WorkerId, limits: &Limits) -> Self {
        Self {
            worker_id,
            failover_timeout_us: 10_000_000, // 10 seconds.
            max_leases_for_worker: limits.max_leases_per_worker,
            max_shards: limits.max_shards,
            store_retry: RetryPolicy::new(5, Duration::from_millis(100), Duration::from_secs(5)),
        }
    }

    /// Creates config for testing with a short failover timeout.
    #[must_use]
    pub fn for_testing(worker_id: impl Into<WorkerId>) -> Self {
        Self {
            worker_id: worker_id.into(),
            failover_timeout_us: duration_us(Duration::from_millis(500)),
            max_leases_for_worker: 100,
            max_shards: Limits::new().max_shards,
            store_retry: RetryPolicy::fast_for_testing(),
        }
    }

    /// Builder: set failover timeout.
    #[must_use]
    pub fn with_failover_timeout(mut self, timeout: Duration) -> Self {
        self.failover_timeout_us = duration_us(timeout);
        self
    }

    /// Builder: set maximum leases.
    #[must_use]
    pub const fn with_max_leases(mut self, max: u32) -> Self {
        self.max_leases_for_worker = max;
        self
    }

    /// Builder: set maximum tracked shards.
    #[must_use]
    pub const fn with_max_shards(mut self, max: u32) -> Self {
        self.max_shards = max;
        self
    }
}

// -----------------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------------
