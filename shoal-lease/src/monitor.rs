//! Monitoring hooks.
//!
//! The monitoring service is passed explicitly into the coordinator,
//! checkpointer and worker. There is no process-wide metrics registry.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use parking_lot::Mutex;
use shoal_core::{duration_us, Checkpoint, ShardId};

/// Sink for per-shard operational metrics.
///
/// Every method has a no-op default so implementations only override what
/// they export.
pub trait MonitoringService: Send + Sync + fmt::Debug + 'static {
    /// This worker acquired the lease of `shard_id`.
    fn lease_gained(&self, _shard_id: &ShardId) {}

    /// This worker lost or released the lease of `shard_id`.
    fn lease_lost(&self, _shard_id: &ShardId) {}

    /// A renewal of `shard_id` succeeded.
    fn lease_renewed(&self, _shard_id: &ShardId) {}

    /// A batch was delivered to the record processor.
    fn records_processed(&self, _shard_id: &ShardId, _records: u64, _bytes: u64) {}

    /// Latest lag reported by the stream.
    fn millis_behind_latest(&self, _shard_id: &ShardId, _millis: u64) {}

    /// Duration of one `get_records` call, including retries.
    fn get_records_latency(&self, _shard_id: &ShardId, _latency: Duration) {}

    /// Duration of one `process_records` callback.
    fn process_records_latency(&self, _shard_id: &ShardId, _latency: Duration) {}

    /// A checkpoint write was accepted.
    fn checkpoint_written(&self, _shard_id: &ShardId, _checkpoint: &Checkpoint) {}
}

/// Monitoring service that discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMonitoringService;

impl MonitoringService for NoopMonitoringService {}

// -----------------------------------------------------------------------------
// In-Memory Monitoring
// -----------------------------------------------------------------------------

/// Metrics accumulated for one shard.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShardMetrics {
    /// Times the lease was acquired.
    pub leases_gained: u64,
    /// Times the lease was lost or released.
    pub leases_lost: u64,
    /// Successful renewals.
    pub renewals: u64,
    /// Records delivered to the processor.
    pub records_processed: u64,
    /// Payload bytes delivered to the processor.
    pub bytes_processed: u64,
    /// Last reported lag.
    pub millis_behind_latest: u64,
    /// Number of `get_records` latency samples.
    pub get_records_calls: u64,
    /// Maximum `get_records` latency (microseconds).
    pub get_records_latency_max_us: u64,
    /// Number of `process_records` latency samples.
    pub process_records_calls: u64,
    /// Maximum `process_records` latency (microseconds).
    pub process_records_latency_max_us: u64,
    /// Accepted checkpoint writes.
    pub checkpoints_written: u64,
    /// Last accepted checkpoint.
    pub last_checkpoint: Option<Checkpoint>,
}

/// Monitoring service that keeps per-shard metrics in memory.
///
/// Used by tests and the simulation binary.
#[derive(Debug, Default)]
pub struct InMemoryMonitoringService {
    shards: Mutex<BTreeMap<ShardId, ShardMetrics>>,
}

impl InMemoryMonitoringService {
    /// Creates an empty service.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns metrics for one shard.
    #[must_use]
    pub fn shard(&self, shard_id: &ShardId) -> ShardMetrics {
        self.shards.lock().get(shard_id).cloned().unwrap_or_default()
    }

    /// Returns metrics for every shard seen.
    #[must_use]
    pub fn snapshot(&self) -> BTreeMap<ShardId, ShardMetrics> {
        self.shards.lock().clone()
    }

    /// Total records processed across shards.
    #[must_use]
    pub fn total_records_processed(&self) -> u64 {
        self.shards.lock().values().map(|m| m.records_processed).sum()
    }

    fn update(&self, shard_id: &ShardId, f: impl FnOnce(&mut ShardMetrics)) {
        let mut shards = self.shards.lock();
        f(shards.entry(shard_id.clone()).or_default());
    }
}

impl MonitoringService for InMemoryMonitoringService {
    fn lease_gained(&self, shard_id: &ShardId) {
        self.update(shard_id, |m| m.leases_gained += 1);
    }

    fn lease_lost(&self, shard_id: &ShardId) {
        self.update(shard_id, |m| m.leases_lost += 1);
    }

    fn lease_renewed(&self, shard_id: &ShardId) {
        self.update(shard_id, |m| m.renewals += 1);
    }

    fn records_processed(&self, shard_id: &ShardId, records: u64, bytes: u64) {
        self.update(shard_id, |m| {
            m.records_processed += records;
            m.bytes_processed += bytes;
        });
    }

    fn millis_behind_latest(&self, shard_id: &ShardId, millis: u64) {
        self.update(shard_id, |m| m.millis_behind_latest = millis);
    }

    fn get_records_latency(&self, shard_id: &ShardId, latency: Duration) {
        let latency_us = duration_us(latency);
        self.update(shard_id, |m| {
            m.get_records_calls += 1;
            m.get_records_latency_max_us = m.get_records_latency_max_us.max(latency_us);
        });
    }

    fn process_records_latency(&self, shard_id: &ShardId, latency: Duration) {
        let latency_us = duration_us(latency);
        self.update(shard_id, |m| {
            m.process_records_calls += 1;
            m.process_records_latency_max_us = m.process_records_latency_max_us.max(latency_us);
        });
    }

    fn checkpoint_written(&self, shard_id: &ShardId, checkpoint: &Checkpoint) {
        self.update(shard_id, |m| {
            m.checkpoints_written += 1;
            m.last_checkpoint = Some(checkpoint.clone());
        });
    }
}
