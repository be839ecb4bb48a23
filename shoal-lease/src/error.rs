//! Lease coordination error types.

use shoal_core::{LeaseCounter, ShardId};
use shoal_stream::StreamError;
use thiserror::Error;

/// Result type for lease and checkpoint operations.
pub type LeaseResult<T> = Result<T, LeaseError>;

/// Errors that can occur during lease and checkpoint operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LeaseError {
    /// Ownership was fenced out by another worker. Never retried.
    #[error("lease lost for shard {shard_id} (fence token {fence_token})")]
    LeaseLost {
        /// The shard whose lease was lost.
        shard_id: ShardId,
        /// The fence token the rejected write carried.
        fence_token: LeaseCounter,
    },

    /// Transient lease table failure.
    #[error("lease table unavailable: {operation}: {message}")]
    StoreUnavailable {
        /// The operation that failed.
        operation: &'static str,
        /// Error message.
        message: String,
    },

    /// Conditional write rejected by the lease table.
    #[error("condition failed for shard {shard_id}: expected counter {expected}, found {actual}")]
    ConditionFailed {
        /// The shard being written.
        shard_id: ShardId,
        /// Counter the write was conditioned on.
        expected: LeaseCounter,
        /// Counter stored in the table.
        actual: LeaseCounter,
    },

    /// No lease row exists for the shard.
    #[error("lease not found for shard {shard_id}")]
    LeaseNotFound {
        /// The shard that has no lease.
        shard_id: ShardId,
    },

    /// `SHARD_END` was already checkpointed through this handle.
    #[error("shard {shard_id} already checkpointed at SHARD_END")]
    ShardEnded {
        /// The terminated shard.
        shard_id: ShardId,
    },

    /// The stream lists more shards than the configured limit.
    #[error("stream lists {listed} shards, limit is {max}")]
    TooManyShards {
        /// Shards in the listing.
        listed: usize,
        /// Configured maximum.
        max: u32,
    },

    /// Shard listing failed.
    #[error("stream error: {0}")]
    Stream(#[from] StreamError),
}

impl LeaseError {
    /// Returns true if the identical operation may succeed when retried.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::StoreUnavailable { .. } => true,
            Self::Stream(err) => err.is_retryable(),
            Self::LeaseLost { .. }
            | Self::ConditionFailed { .. }
            | Self::LeaseNotFound { .. }
            | Self::ShardEnded { .. }
            | Self::TooManyShards { .. } => false,
        }
    }
}
