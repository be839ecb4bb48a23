//! Stream transport trait abstraction.
//!
//! The transport is the boundary to the source stream. Shoal only needs two
//! operations from it: a shard listing with parent links, and ordered batch
//! reads from a position.
//!
//! Production deployments implement this trait over their stream service.
//! Tests and the simulation binary use [`crate::SimulatedStream`].

use async_trait::async_trait;
use shoal_core::ShardId;

use crate::error::StreamResult;
use crate::types::{GetRecordsOutput, ReadPosition, ShardInfo};

/// Read access to a sharded, ordered stream.
///
/// # Implementation Notes
///
/// Implementations must be `Send + Sync` for use across async tasks. Reads
/// must return the records of one shard in stream order, and
/// `is_at_shard_end` must only be set once every record of a closed shard has
/// been returned.
#[async_trait]
pub trait StreamTransport: Send + Sync + 'static {
    /// Lists all shards with their parent relationships.
    ///
    /// # Errors
    ///
    /// Returns `Unavailable` on transient failure.
    async fn list_shards(&self) -> StreamResult<Vec<ShardInfo>>;

    /// Reads up to `max_count` records of `shard_id` starting at `position`.
    ///
    /// # Errors
    ///
    /// Returns `ShardNotFound` for an unknown shard and `Unavailable` on
    /// transient failure.
    async fn get_records(
        &self,
        shard_id: &ShardId,
        position: &ReadPosition,
        max_count: u32,
    ) -> StreamResult<GetRecordsOutput>;
}
