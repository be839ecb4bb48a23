//! In-memory simulated stream for deterministic testing.
//!
//! Supports publishing records (plain and aggregated), shard splits, and
//! deterministic fault injection on reads, following the fault model of the
//! simulated lease table.

#![allow(clippy::significant_drop_tightening)]

use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, MutexGuard};
use shoal_core::{Clock, ExtendedSequenceNumber, SequenceNumber, ShardId, SystemClock};
use tracing::debug;

use crate::error::{StreamError, StreamResult};
use crate::transport::StreamTransport;
use crate::types::{GetRecordsOutput, ReadPosition, Record, ShardInfo};

/// Leading digits of every simulated sequence number. Together with the
/// zero-padded counter this yields numbers wider than `u128`.
const SEQUENCE_PREFIX: &str = "49590338271490256608559692538";

// -----------------------------------------------------------------------------
// Fault Configuration
// -----------------------------------------------------------------------------

/// Fault configuration for the simulated stream.
#[derive(Debug, Clone, Default)]
pub struct StreamFaultConfig {
    /// Probability of `get_records` failing (0.0 - 1.0).
    pub get_records_fail_rate: f64,
    /// Probability of `list_shards` failing (0.0 - 1.0).
    pub list_shards_fail_rate: f64,
    /// Force next `get_records` to fail (one-shot).
    pub force_get_records_fail: bool,
}

impl StreamFaultConfig {
    /// No faults (all operations succeed).
    #[must_use]
    pub const fn none() -> Self {
        Self {
            get_records_fail_rate: 0.0,
            list_shards_fail_rate: 0.0,
            force_get_records_fail: false,
        }
    }

    /// Flaky configuration for stress testing.
    #[must_use]
    pub const fn flaky() -> Self {
        Self {
            get_records_fail_rate: 0.05,
            list_shards_fail_rate: 0.02,
            force_get_records_fail: false,
        }
    }

    /// Builder: set `get_records` fail rate.
    #[must_use]
    pub const fn with_get_records_fail_rate(mut self, rate: f64) -> Self {
        self.get_records_fail_rate = rate;
        self
    }

    /// Builder: set `list_shards` fail rate.
    #[must_use]
    pub const fn with_list_shards_fail_rate(mut self, rate: f64) -> Self {
        self.list_shards_fail_rate = rate;
        self
    }
}

// -----------------------------------------------------------------------------
// Simulated Stream
// -----------------------------------------------------------------------------

#[derive(Debug)]
struct SimulatedShard {
    parent_shard_ids: Vec<ShardId>,
    records: Vec<Record>,
    closed: bool,
}

#[derive(Debug, Default)]
struct StreamState {
    shards: BTreeMap<ShardId, SimulatedShard>,
    next_sequence: u128,
}

impl StreamState {
    fn next_sequence_number(&mut self) -> SequenceNumber {
        self.next_sequence += 1;
        let raw = format!("{SEQUENCE_PREFIX}{:030}", self.next_sequence);
        // Built from digits only.
        SequenceNumber::parse(raw).unwrap_or_else(|_| SequenceNumber::from_u128(self.next_sequence))
    }

    fn open_shard_mut(&mut self, shard_id: &ShardId) -> StreamResult<&mut SimulatedShard> {
        let shard = self
            .shards
            .get_mut(shard_id)
            .ok_or_else(|| StreamError::ShardNotFound {
                shard_id: shard_id.clone(),
            })?;
        if shard.closed {
            return Err(StreamError::Unavailable {
                operation: "put_record",
                message: format!("shard {shard_id} is closed"),
            });
        }
        Ok(shard)
    }
}

/// In-memory sharded stream.
///
/// Clones share state via `Arc` so a test can publish through one handle
/// while workers read through another.
#[derive(Debug, Clone)]
pub struct SimulatedStream {
    state: Arc<Mutex<StreamState>>,
    fault_config: Arc<Mutex<StreamFaultConfig>>,
    seed: u64,
    counter: Arc<AtomicU64>,
}

impl SimulatedStream {
    /// Creates an empty stream with no faults.
    #[must_use]
    pub fn new(seed: u64) -> Self {
        Self::with_faults(seed, StreamFaultConfig::none())
    }

    /// Creates an empty stream with fault injection.
    #[must_use]
    pub fn with_faults(seed: u64, config: StreamFaultConfig) -> Self {
        Self {
            state: Arc::new(Mutex::new(StreamState::default())),
            fault_config: Arc::new(Mutex::new(config)),
            seed,
            counter: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Creates a stream with `count` root shards named `shardId-000000000000`
    /// onwards.
    #[must_use]
    pub fn with_shards(seed: u64, count: u32) -> Self {
        let stream = Self::new(seed);
        for index in 0..count {
            stream.create_shard(Self::shard_name(index), Vec::new());
        }
        stream
    }

    /// Canonical shard name for an index.
    #[must_use]
    pub fn shard_name(index: u32) -> ShardId {
        ShardId::new(format!("shardId-{index:012}"))
    }

    /// Returns fault config for modification.
    pub fn fault_config(&self) -> MutexGuard<'_, StreamFaultConfig> {
        self.fault_config.lock()
    }

    /// Adds a shard. No-op if it already exists.
    pub fn create_shard(&self, shard_id: ShardId, parent_shard_ids: Vec<ShardId>) {
        let mut state = self.state.lock();
        state
            .shards
            .entry(shard_id)
            .or_insert_with(|| SimulatedShard {
                parent_shard_ids,
                records: Vec::new(),
                closed: false,
            });
    }

    /// Appends a record to a shard.
    ///
    /// # Errors
    ///
    /// Returns `ShardNotFound` for an unknown shard and `Unavailable` if the
    /// shard has been closed by a split.
    pub fn put_record(
        &self,
        shard_id: &ShardId,
        partition_key: &str,
        data: impl Into<Bytes>,
    ) -> StreamResult<ExtendedSequenceNumber> {
        let mut state = self.state.lock();
        let sequence_number = state.next_sequence_number();
        let position = ExtendedSequenceNumber::new(sequence_number);
        let shard = state.open_shard_mut(shard_id)?;
        shard.records.push(Record {
            position: position.clone(),
            partition_key: partition_key.to_string(),
            data: data.into(),
            approximate_arrival_ms: SystemClock.now_us() / 1000,
        });
        Ok(position)
    }

    /// Appends a record to the open shard selected by hashing the partition key.
    ///
    /// # Errors
    ///
    /// Returns `Unavailable` if the stream has no open shard.
    pub fn put_record_by_key(
        &self,
        partition_key: &str,
        data: impl Into<Bytes>,
    ) -> StreamResult<(ShardId, ExtendedSequenceNumber)> {
        let shard_id = {
            let state = self.state.lock();
            let open: Vec<&ShardId> = state
                .shards
                .iter()
                .filter(|(_, shard)| !shard.closed)
                .map(|(id, _)| id)
                .collect();
            if open.is_empty() {
                return Err(StreamError::Unavailable {
                    operation: "put_record",
                    message: "no open shard".into(),
                });
            }
            let mut hasher = DefaultHasher::new();
            partition_key.hash(&mut hasher);
            #[allow(clippy::cast_possible_truncation)]
            let index = (hasher.finish() % open.len() as u64) as usize;
            open[index].clone()
        };
        let position = self.put_record(&shard_id, partition_key, data)?;
        Ok((shard_id, position))
    }

    /// Appends an aggregated record: one sequence number, one logical record
    /// per payload with increasing sub-sequence numbers.
    ///
    /// # Errors
    ///
    /// Same as [`Self::put_record`].
    ///
    /// # Panics
    ///
    /// Panics if `payloads` is empty.
    pub fn put_aggregated(
        &self,
        shard_id: &ShardId,
        partition_key: &str,
        payloads: Vec<Bytes>,
    ) -> StreamResult<Vec<ExtendedSequenceNumber>> {
        assert!(!payloads.is_empty(), "aggregated record needs payloads");

        let mut state = self.state.lock();
        let sequence_number = state.next_sequence_number();
        let shard = state.open_shard_mut(shard_id)?;
        let arrival_ms = SystemClock.now_us() / 1000;

        let mut positions = Vec::with_capacity(payloads.len());
        for (sub, data) in payloads.into_iter().enumerate() {
            let position =
                ExtendedSequenceNumber::with_sub_sequence(sequence_number.clone(), sub as u64);
            shard.records.push(Record {
                position: position.clone(),
                partition_key: partition_key.to_string(),
                data,
                approximate_arrival_ms: arrival_ms,
            });
            positions.push(position);
        }
        Ok(positions)
    }

    /// Closes `parent` and opens `children` with `parent` as their parent.
    ///
    /// # Errors
    ///
    /// Returns `ShardNotFound` for an unknown parent and `Unavailable` if the
    /// parent is already closed.
    pub fn split_shard(&self, parent: &ShardId, children: &[ShardId]) -> StreamResult<()> {
        let mut state = self.state.lock();
        state.open_shard_mut(parent)?.closed = true;
        for child in children {
            state
                .shards
                .entry(child.clone())
                .or_insert_with(|| SimulatedShard {
                    parent_shard_ids: vec![parent.clone()],
                    records: Vec::new(),
                    closed: false,
                });
        }
        debug!(parent = %parent, children = children.len(), "Split shard");
        Ok(())
    }

    /// Closes a shard without children. Readers reach shard end once drained.
    ///
    /// # Errors
    ///
    /// Returns `ShardNotFound` for an unknown shard.
    pub fn close_shard(&self, shard_id: &ShardId) -> StreamResult<()> {
        let mut state = self.state.lock();
        let shard = state
            .shards
            .get_mut(shard_id)
            .ok_or_else(|| StreamError::ShardNotFound {
                shard_id: shard_id.clone(),
            })?;
        shard.closed = true;
        Ok(())
    }

    /// Returns all records of a shard (bypasses faults, for assertions).
    #[must_use]
    pub fn records(&self, shard_id: &ShardId) -> Vec<Record> {
        let state = self.state.lock();
        state
            .shards
            .get(shard_id)
            .map(|shard| shard.records.clone())
            .unwrap_or_default()
    }

    /// Deterministic fault decision from `(seed + counter) * M`.
    fn should_inject_fault(&self, rate: f64) -> bool {
        if rate <= 0.0 {
            return false;
        }
        if rate >= 1.0 {
            return true;
        }
        let counter = self.counter.fetch_add(1, Ordering::Relaxed);
        let hash = self
            .seed
            .wrapping_add(counter)
            .wrapping_mul(0x9e37_79b9_7f4a_7c15);
        #[allow(clippy::cast_precision_loss)]
        let normalized = (hash as f64) / (u64::MAX as f64);
        normalized < rate
    }
}

#[async_trait]
impl StreamTransport for SimulatedStream {
    async fn list_shards(&self) -> StreamResult<Vec<ShardInfo>> {
        let rate = self.fault_config.lock().list_shards_fail_rate;
        if self.should_inject_fault(rate) {
            return Err(StreamError::Unavailable {
                operation: "list_shards",
                message: "simulated failure (random)".into(),
            });
        }

        let state = self.state.lock();
        Ok(state
            .shards
            .iter()
            .map(|(id, shard)| ShardInfo::child(id.clone(), shard.parent_shard_ids.clone()))
            .collect())
    }

    async fn get_records(
        &self,
        shard_id: &ShardId,
        position: &ReadPosition,
        max_count: u32,
    ) -> StreamResult<GetRecordsOutput> {
        // TigerStyle: Assert precondition.
        assert!(max_count > 0, "max_count must be positive");

        {
            let mut config = self.fault_config.lock();
            if config.force_get_records_fail {
                config.force_get_records_fail = false;
                return Err(StreamError::Unavailable {
                    operation: "get_records",
                    message: "simulated failure (forced)".into(),
                });
            }
        }
        let rate = self.fault_config.lock().get_records_fail_rate;
        if self.should_inject_fault(rate) {
            return Err(StreamError::Unavailable {
                operation: "get_records",
                message: "simulated failure (random)".into(),
            });
        }

        let state = self.state.lock();
        let shard = state
            .shards
            .get(shard_id)
            .ok_or_else(|| StreamError::ShardNotFound {
                shard_id: shard_id.clone(),
            })?;
        let records = &shard.records;

        let start = match position {
            ReadPosition::TrimHorizon => 0,
            ReadPosition::Latest => records.len(),
            ReadPosition::After(after) => records.partition_point(|r| r.position <= *after),
        };
        let end = start.saturating_add(max_count as usize).min(records.len());
        let batch = records[start..end].to_vec();

        let next_position = match (batch.last(), position) {
            (Some(last), _) => ReadPosition::After(last.position.clone()),
            // Pin LATEST to the current tip so records published between
            // empty reads are not skipped.
            (None, ReadPosition::Latest) => records
                .last()
                .map_or(ReadPosition::TrimHorizon, |r| ReadPosition::After(r.position.clone())),
            (None, other) => other.clone(),
        };

        let millis_behind_latest = match (batch.last(), records.last()) {
            (Some(last), Some(tip)) if end < records.len() => tip
                .approximate_arrival_ms
                .saturating_sub(last.approximate_arrival_ms),
            _ => 0,
        };

        Ok(GetRecordsOutput {
            records: batch,
            next_position,
            millis_behind_latest,
            is_at_shard_end: shard.closed && end == records.len(),
        })
    }
}

// -----------------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------------
