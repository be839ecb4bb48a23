//! Stream transport error types.

use shoal_core::ShardId;
use thiserror::Error;

/// Result type for stream transport operations.
pub type StreamResult<T> = Result<T, StreamError>;

/// Errors returned by a stream transport.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StreamError {
    /// The shard is unknown to the stream.
    #[error("shard not found: {shard_id}")]
    ShardNotFound {
        /// The shard that was not found.
        shard_id: ShardId,
    },

    /// Transient failure reading from the stream.
    #[error("stream unavailable: {operation}: {message}")]
    Unavailable {
        /// The operation that failed.
        operation: &'static str,
        /// Error message.
        message: String,
    },
}

impl StreamError {
    /// Returns true if the operation may succeed when retried.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }
}
