//! Records, shard metadata and read positions.

use bytes::Bytes;
use shoal_core::{ExtendedSequenceNumber, ShardId};

// -----------------------------------------------------------------------------
// Shard Info
// -----------------------------------------------------------------------------

/// A shard as reported by the stream's shard listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardInfo {
    /// Shard identifier.
    pub shard_id: ShardId,
    /// Shards this one was split or merged from. Empty for root shards.
    pub parent_shard_ids: Vec<ShardId>,
}

impl ShardInfo {
    /// Creates info for a root shard.
    #[must_use]
    pub const fn root(shard_id: ShardId) -> Self {
        Self {
            shard_id,
            parent_shard_ids: Vec::new(),
        }
    }

    /// Creates info for a child shard.
    #[must_use]
    pub const fn child(shard_id: ShardId, parent_shard_ids: Vec<ShardId>) -> Self {
        Self {
            shard_id,
            parent_shard_ids,
        }
    }

    /// Builds info from raw identifiers returned by a shard listing.
    ///
    /// # Errors
    /// Returns `InvalidArgument` if the shard or any parent id is empty.
    pub fn from_listing<S: Into<String>>(
        shard_id: impl Into<String>,
        parent_shard_ids: impl IntoIterator<Item = S>,
    ) -> shoal_core::Result<Self> {
        let parent_shard_ids = parent_shard_ids
            .into_iter()
            .map(ShardId::try_new)
            .collect::<shoal_core::Result<Vec<_>>>()?;
        Ok(Self::child(ShardId::try_new(shard_id)?, parent_shard_ids))
    }
}

// -----------------------------------------------------------------------------
// Record
// -----------------------------------------------------------------------------

/// A logical stream record delivered to a record processor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Checkpointable position of this record.
    pub position: ExtendedSequenceNumber,
    /// Partition key used to route the record to its shard.
    pub partition_key: String,
    /// Record payload.
    pub data: Bytes,
    /// Time the stream accepted the record (milliseconds since epoch).
    pub approximate_arrival_ms: u64,
}

// -----------------------------------------------------------------------------
// Read Position
// -----------------------------------------------------------------------------

/// Where the next read of a shard starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadPosition {
    /// From the oldest record in the shard.
    TrimHorizon,
    /// After the newest record at the time of the read.
    Latest,
    /// Strictly after the given position.
    After(ExtendedSequenceNumber),
}

// -----------------------------------------------------------------------------
// Get Records Output
// -----------------------------------------------------------------------------

/// Result of a single fetch.
#[derive(Debug, Clone)]
pub struct GetRecordsOutput {
    /// Records in stream order. May be empty.
    pub records: Vec<Record>,
    /// Position to pass to the next fetch.
    pub next_position: ReadPosition,
    /// How far the last returned record trails the tip of the shard.
    pub millis_behind_latest: u64,
    /// True once the shard is closed and every record has been returned.
    pub is_at_shard_end: bool,
}

impl GetRecordsOutput {
    /// Total payload bytes in this batch.
    #[must_use]
    pub fn payload_bytes(&self) -> u64 {
        self.records.iter().map(|r| r.data.len() as u64).sum()
    }
}

// -----------------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------------
