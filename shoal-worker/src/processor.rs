//! Record processor interfaces implemented by the application.
//!
//! The worker asks a [`RecordProcessorFactory`] for a fresh processor each
//! time it starts consuming a shard. The processor is driven by exactly one
//! shard consumer: `initialize` once, `process_records` for every batch in
//! stream order, then `shutdown` once.

use std::fmt;

use async_trait::async_trait;
use shoal_core::ShardId;
use shoal_lease::ShardCheckpointer;
use shoal_stream::{ReadPosition, Record};

use crate::error::ProcessorError;

/// Why a shard consumer is shutting down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShutdownReason {
    /// The lease was lost to another worker. Checkpointing is forbidden.
    Zombie,
    /// The shard was fully consumed. The processor must checkpoint
    /// `SHARD_END` before returning.
    Terminate,
    /// The worker asked the consumer to stop.
    Requested,
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Zombie => "ZOMBIE",
            Self::Terminate => "TERMINATE",
            Self::Requested => "REQUESTED",
        })
    }
}

/// Input to [`RecordProcessor::initialize`].
#[derive(Debug, Clone)]
pub struct InitializationInput {
    /// Shard the processor is bound to.
    pub shard_id: ShardId,
    /// Where reading starts.
    pub starting_position: ReadPosition,
}

/// Input to [`RecordProcessor::process_records`].
#[derive(Debug, Clone)]
pub struct ProcessRecordsInput {
    /// Records in stream order. Empty only when empty batch delivery is on.
    pub records: Vec<Record>,
    /// How far the last record trails the tip of the shard.
    pub millis_behind_latest: u64,
    /// Checkpoint handle scoped to this shard.
    pub checkpointer: ShardCheckpointer,
}

/// Input to [`RecordProcessor::shutdown`].
#[derive(Debug, Clone)]
pub struct ShutdownInput {
    /// Why the consumer is shutting down.
    pub reason: ShutdownReason,
    /// Checkpoint handle scoped to this shard. Revoked for `Zombie`.
    pub checkpointer: ShardCheckpointer,
}

/// Application logic for one shard.
///
/// Any error returned is fatal for the shard consumer: it shuts down with
/// reason `Requested` and the worker restarts it from the last checkpoint if
/// the lease is still held.
#[async_trait]
pub trait RecordProcessor: Send + Sync + 'static {
    /// Called once before any records are delivered.
    async fn initialize(&mut self, input: InitializationInput) -> Result<(), ProcessorError>;

    /// Called with each batch. Checkpoint at whatever cadence suits the
    /// application; the consumer never checkpoints on its own.
    async fn process_records(&mut self, input: ProcessRecordsInput) -> Result<(), ProcessorError>;

    /// Called once when the consumer stops.
    async fn shutdown(&mut self, input: ShutdownInput) -> Result<(), ProcessorError>;
}

/// Creates one processor per shard consumer.
pub trait RecordProcessorFactory: Send + Sync + 'static {
    /// Returns a fresh processor for `shard_id`.
    fn create_processor(&self, shard_id: &ShardId) -> Box<dyn RecordProcessor>;
}

impl<F> RecordProcessorFactory for F
where
    F: Fn(&ShardId) -> Box<dyn RecordProcessor> + Send + Sync + 'static,
{
    fn create_processor(&self, shard_id: &ShardId) -> Box<dyn RecordProcessor> {
        self(shard_id)
    }
}
