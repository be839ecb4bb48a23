//! Worker, consumer and processor error types.

use shoal_core::ShardId;
use shoal_lease::LeaseError;
use shoal_stream::StreamError;
use thiserror::Error;

use crate::config::ConfigError;

/// Result type for worker control operations.
pub type WorkerResult<T> = Result<T, WorkerError>;

// -----------------------------------------------------------------------------
// Processor Error
// -----------------------------------------------------------------------------

/// Error returned by a record processor callback.
///
/// Any error is fatal for the shard consumer that invoked the callback.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProcessorError {
    /// Business logic failed.
    #[error("record processor failed: {message}")]
    Failed {
        /// Error message.
        message: String,
    },

    /// A checkpoint call made by the processor failed.
    #[error("checkpoint failed: {0}")]
    Checkpoint(#[from] LeaseError),
}

impl ProcessorError {
    /// Creates a business logic failure.
    #[must_use]
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
        }
    }
}

// -----------------------------------------------------------------------------
// Consumer Error
// -----------------------------------------------------------------------------

/// Error that ended a shard consumer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConsumerError {
    /// Ownership was fenced out by another worker.
    #[error("lease lost for shard {shard_id}")]
    LeaseLost {
        /// The shard.
        shard_id: ShardId,
    },

    /// The lease table stayed unavailable past the retry policy.
    #[error("lease table unavailable for shard {shard_id}: {message}")]
    StoreUnavailable {
        /// The shard.
        shard_id: ShardId,
        /// Error message.
        message: String,
    },

    /// Stream reads kept failing past the retry policy.
    #[error("transport failed for shard {shard_id} after {attempts} attempts: {source}")]
    Transport {
        /// The shard.
        shard_id: ShardId,
        /// Attempts made.
        attempts: u32,
        /// Last error.
        source: StreamError,
    },

    /// A record processor callback returned an error.
    #[error("{callback} failed for shard {shard_id}: {source}")]
    UserCallback {
        /// The shard.
        shard_id: ShardId,
        /// Callback name.
        callback: &'static str,
        /// Error returned by the callback.
        source: ProcessorError,
    },

    /// The processor returned from a `Terminate` shutdown without
    /// checkpointing `SHARD_END`.
    #[error("shard {shard_id} ended without a SHARD_END checkpoint")]
    CheckpointProtocolViolation {
        /// The shard.
        shard_id: ShardId,
    },
}

impl ConsumerError {
    /// Maps a lease error raised while `shard_id` was running.
    #[must_use]
    pub fn from_lease(shard_id: &ShardId, err: &LeaseError) -> Self {
        match err {
            LeaseError::LeaseLost { .. }
            | LeaseError::ConditionFailed { .. }
            | LeaseError::LeaseNotFound { .. } => Self::LeaseLost {
                shard_id: shard_id.clone(),
            },
            LeaseError::StoreUnavailable { .. }
            | LeaseError::ShardEnded { .. }
            | LeaseError::TooManyShards { .. }
            | LeaseError::Stream(_) => Self::StoreUnavailable {
                shard_id: shard_id.clone(),
                message: err.to_string(),
            },
        }
    }

    /// Shard the error belongs to.
    #[must_use]
    pub const fn shard_id(&self) -> &ShardId {
        match self {
            Self::LeaseLost { shard_id }
            | Self::StoreUnavailable { shard_id, .. }
            | Self::Transport { shard_id, .. }
            | Self::UserCallback { shard_id, .. }
            | Self::CheckpointProtocolViolation { shard_id } => shard_id,
        }
    }
}

// -----------------------------------------------------------------------------
// Worker Error
// -----------------------------------------------------------------------------

/// Errors returned by the worker control surface.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// Configuration rejected.
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    /// `start` was called twice.
    #[error("worker already started")]
    AlreadyStarted,

    /// `shutdown` was called before `start`.
    #[error("worker not started")]
    NotStarted,

    /// Lease table or shard listing failed during start.
    #[error("lease coordination failed: {0}")]
    Lease(#[from] LeaseError),

    /// The reconciliation task panicked.
    #[error("reconciliation task failed: {message}")]
    TaskFailed {
        /// Error message.
        message: String,
    },
}
