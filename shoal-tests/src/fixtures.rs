//! Test fixtures: recording record processors and polling helpers.
//!
//! `RecordingProcessor` logs every callback into a shared `ProcessorLog` so
//! tests can assert delivery order, start positions and shutdown reasons
//! across processor instances and workers.

#![allow(clippy::significant_drop_tightening)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use shoal_core::{Checkpoint, ExtendedSequenceNumber, ShardId, SystemClock};
use shoal_lease::{LeaseError, NoopMonitoringService, SimulatedLeaseTable};
use shoal_stream::{ReadPosition, SimulatedStream, StreamTransport};
use shoal_worker::{
    InitializationInput, ProcessRecordsInput, ProcessorError, RecordProcessor,
    RecordProcessorFactory, ShutdownInput, ShutdownReason, Worker, WorkerConfig,
};

// ============================================================================
// Processor Log
// ============================================================================

/// One observed record processor callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessorEvent {
    /// `initialize` was called.
    Initialized {
        /// The shard.
        shard_id: ShardId,
        /// Start position handed to the processor.
        starting_position: ReadPosition,
    },
    /// `process_records` was called.
    Batch {
        /// The shard.
        shard_id: ShardId,
        /// Positions of the delivered records, in delivery order.
        positions: Vec<ExtendedSequenceNumber>,
        /// Lag reported with the batch.
        millis_behind_latest: u64,
    },
    /// A checkpoint made by the processor was rejected.
    CheckpointRejected {
        /// The shard.
        shard_id: ShardId,
        /// Why.
        error: LeaseError,
    },
    /// `shutdown` was called.
    Shutdown {
        /// The shard.
        shard_id: ShardId,
        /// Reason handed to the processor.
        reason: ShutdownReason,
    },
}

impl ProcessorEvent {
    /// Shard the event belongs to.
    #[must_use]
    pub const fn shard_id(&self) -> &ShardId {
        match self {
            Self::Initialized { shard_id, .. }
            | Self::Batch { shard_id, .. }
            | Self::CheckpointRejected { shard_id, .. }
            | Self::Shutdown { shard_id, .. } => shard_id,
        }
    }
}

/// Callback log shared by every processor a factory creates.
#[derive(Debug, Clone, Default)]
pub struct ProcessorLog {
    events: Arc<Mutex<Vec<ProcessorEvent>>>,
}

impl ProcessorLog {
    /// Creates an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, event: ProcessorEvent) {
        self.events.lock().push(event);
    }

    /// Returns every event in arrival order.
    #[must_use]
    pub fn events(&self) -> Vec<ProcessorEvent> {
        self.events.lock().clone()
    }

    /// Returns the events of one shard.
    #[must_use]
    pub fn events_for(&self, shard_id: &ShardId) -> Vec<ProcessorEvent> {
        self.events
            .lock()
            .iter()
            .filter(|event| event.shard_id() == shard_id)
            .cloned()
            .collect()
    }

    /// Positions delivered for `shard_id`, across all processor instances.
    #[must_use]
    pub fn delivered(&self, shard_id: &ShardId) -> Vec<ExtendedSequenceNumber> {
        self.events_for(shard_id)
            .into_iter()
            .filter_map(|event| match event {
                ProcessorEvent::Batch { positions, .. } => Some(positions),
                _ => None,
            })
            .flatten()
            .collect()
    }

    /// Number of batches delivered for `shard_id`.
    #[must_use]
    pub fn batch_count(&self, shard_id: &ShardId) -> usize {
        self.events_for(shard_id)
            .iter()
            .filter(|event| matches!(event, ProcessorEvent::Batch { .. }))
            .count()
    }

    /// Start positions handed to processors of `shard_id`.
    #[must_use]
    pub fn initializations(&self, shard_id: &ShardId) -> Vec<ReadPosition> {
        self.events_for(shard_id)
            .into_iter()
            .filter_map(|event| match event {
                ProcessorEvent::Initialized {
                    starting_position, ..
                } => Some(starting_position),
                _ => None,
            })
            .collect()
    }

    /// Shutdown reasons handed to processors of `shard_id`.
    #[must_use]
    pub fn shutdowns(&self, shard_id: &ShardId) -> Vec<ShutdownReason> {
        self.events_for(shard_id)
            .into_iter()
            .filter_map(|event| match event {
                ProcessorEvent::Shutdown { reason, .. } => Some(reason),
                _ => None,
            })
            .collect()
    }

    /// Checkpoint errors seen by processors of `shard_id`.
    #[must_use]
    pub fn rejected_checkpoints(&self, shard_id: &ShardId) -> Vec<LeaseError> {
        self.events_for(shard_id)
            .into_iter()
            .filter_map(|event| match event {
                ProcessorEvent::CheckpointRejected { error, .. } => Some(error),
                _ => None,
            })
            .collect()
    }
}

// ============================================================================
// Recording Processor
// ============================================================================

/// What a `RecordingProcessor` does besides logging.
#[derive(Debug, Clone, Default)]
pub struct ProcessorBehavior {
    /// Checkpoint the last record of every batch.
    pub checkpoint_every_batch: bool,
    /// Checkpoint `SHARD_END` on a `Terminate` shutdown.
    pub checkpoint_shard_end: bool,
    /// Try to checkpoint during a `Zombie` shutdown and log the rejection.
    pub checkpoint_on_zombie: bool,
    /// Fail the batch with this index (per processor instance).
    pub fail_batch: Option<usize>,
    /// Fail `initialize`.
    pub fail_initialize: bool,
    /// Time spent in each `process_records` call.
    pub batch_delay: Duration,
}

impl ProcessorBehavior {
    /// Logs callbacks and never checkpoints.
    #[must_use]
    pub fn passive() -> Self {
        Self::default()
    }

    /// Checkpoints every batch and `SHARD_END`.
    #[must_use]
    pub fn checkpointing() -> Self {
        Self {
            checkpoint_every_batch: true,
            checkpoint_shard_end: true,
            ..Self::default()
        }
    }

    /// Builder: skip the `SHARD_END` checkpoint.
    #[must_use]
    pub const fn without_shard_end(mut self) -> Self {
        self.checkpoint_shard_end = false;
        self
    }

    /// Builder: attempt a checkpoint during `Zombie` shutdown.
    #[must_use]
    pub const fn with_zombie_checkpoint(mut self) -> Self {
        self.checkpoint_on_zombie = true;
        self
    }

    /// Builder: fail the batch with index `index`.
    #[must_use]
    pub const fn with_failing_batch(mut self, index: usize) -> Self {
        self.fail_batch = Some(index);
        self
    }

    /// Builder: fail `initialize`.
    #[must_use]
    pub const fn with_failing_initialize(mut self) -> Self {
        self.fail_initialize = true;
        self
    }

    /// Builder: spend `delay` in every batch.
    #[must_use]
    pub const fn with_batch_delay(mut self, delay: Duration) -> Self {
        self.batch_delay = delay;
        self
    }
}

/// Record processor that logs its callbacks.
#[derive(Debug)]
pub struct RecordingProcessor {
    shard_id: ShardId,
    behavior: ProcessorBehavior,
    log: ProcessorLog,
    batches: usize,
}

impl RecordingProcessor {
    /// Creates a processor for `shard_id`.
    #[must_use]
    pub const fn new(shard_id: ShardId, behavior: ProcessorBehavior, log: ProcessorLog) -> Self {
        Self {
            shard_id,
            behavior,
            log,
            batches: 0,
        }
    }

    fn rejected(&self, error: LeaseError) -> ProcessorError {
        self.log.push(ProcessorEvent::CheckpointRejected {
            shard_id: self.shard_id.clone(),
            error: error.clone(),
        });
        ProcessorError::Checkpoint(error)
    }
}

#[async_trait]
impl RecordProcessor for RecordingProcessor {
    async fn initialize(&mut self, input: InitializationInput) -> Result<(), ProcessorError> {
        self.log.push(ProcessorEvent::Initialized {
            shard_id: input.shard_id,
            starting_position: input.starting_position,
        });
        if self.behavior.fail_initialize {
            return Err(ProcessorError::failed("initialize failure injected"));
        }
        Ok(())
    }

    async fn process_records(&mut self, input: ProcessRecordsInput) -> Result<(), ProcessorError> {
        let index = self.batches;
        self.batches += 1;
        self.log.push(ProcessorEvent::Batch {
            shard_id: self.shard_id.clone(),
            positions: input.records.iter().map(|r| r.position.clone()).collect(),
            millis_behind_latest: input.millis_behind_latest,
        });

        if self.behavior.fail_batch == Some(index) {
            return Err(ProcessorError::failed(format!("batch {index} failure injected")));
        }
        if !self.behavior.batch_delay.is_zero() {
            tokio::time::sleep(self.behavior.batch_delay).await;
        }
        if self.behavior.checkpoint_every_batch {
            if let Some(last) = input.records.last() {
                if let Err(error) = input.checkpointer.checkpoint_record(last).await {
                    return Err(self.rejected(error));
                }
            }
        }
        Ok(())
    }

    async fn shutdown(&mut self, input: ShutdownInput) -> Result<(), ProcessorError> {
        self.log.push(ProcessorEvent::Shutdown {
            shard_id: self.shard_id.clone(),
            reason: input.reason,
        });

        match input.reason {
            ShutdownReason::Terminate if self.behavior.checkpoint_shard_end => {
                if let Err(error) = input.checkpointer.checkpoint_shard_end().await {
                    return Err(self.rejected(error));
                }
            }
            ShutdownReason::Zombie if self.behavior.checkpoint_on_zombie => {
                if let Err(error) = input.checkpointer.checkpoint(Checkpoint::TrimHorizon).await {
                    self.rejected(error);
                }
            }
            _ => {}
        }
        Ok(())
    }
}

/// Factory creating `RecordingProcessor`s that share one log.
#[derive(Debug, Default)]
pub struct RecordingFactory {
    log: ProcessorLog,
    behavior: ProcessorBehavior,
    overrides: BTreeMap<ShardId, ProcessorBehavior>,
    created: AtomicUsize,
}

impl RecordingFactory {
    /// Creates a factory whose processors all behave as `behavior`.
    #[must_use]
    pub fn new(behavior: ProcessorBehavior) -> Self {
        Self {
            behavior,
            ..Self::default()
        }
    }

    /// Builder: use `behavior` for processors of `shard_id`.
    #[must_use]
    pub fn with_override(mut self, shard_id: ShardId, behavior: ProcessorBehavior) -> Self {
        self.overrides.insert(shard_id, behavior);
        self
    }

    /// Returns the shared callback log.
    #[must_use]
    pub const fn log(&self) -> &ProcessorLog {
        &self.log
    }

    /// Number of processors created so far.
    #[must_use]
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }
}

impl RecordProcessorFactory for RecordingFactory {
    fn create_processor(&self, shard_id: &ShardId) -> Box<dyn RecordProcessor> {
        self.created.fetch_add(1, Ordering::SeqCst);
        let behavior = self
            .overrides
            .get(shard_id)
            .unwrap_or(&self.behavior)
            .clone();
        Box::new(RecordingProcessor::new(
            shard_id.clone(),
            behavior,
            self.log.clone(),
        ))
    }
}

// ============================================================================
// Worker Fixtures
// ============================================================================

/// Builds an unstarted worker on the shared table and stream with the
/// fast test configuration, adjusted by `configure`.
///
/// # Panics
/// Panics if the adjusted configuration is invalid.
pub fn test_worker(
    worker_id: &str,
    table: &SimulatedLeaseTable,
    stream: &SimulatedStream,
    factory: Arc<RecordingFactory>,
    configure: impl FnOnce(WorkerConfig) -> WorkerConfig,
) -> Worker<SimulatedLeaseTable> {
    let config = configure(WorkerConfig::fast_for_testing(worker_id));
    let transport: Arc<dyn StreamTransport> = Arc::new(stream.clone());
    Worker::new(
        config,
        Arc::new(table.clone()),
        transport,
        factory,
        Arc::new(NoopMonitoringService),
        Arc::new(SystemClock),
    )
    .expect("test worker configuration should be valid")
}

// ============================================================================
// Polling
// ============================================================================

/// Polls `condition` every few milliseconds until it holds or `timeout`
/// elapses. Returns whether it held.
pub async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Publishes `count` records to `shard_id` and returns their positions.
///
/// # Panics
/// Panics if the shard does not exist or is closed.
pub fn publish(stream: &SimulatedStream, shard_id: &ShardId, count: usize) -> Vec<ExtendedSequenceNumber> {
    (0..count)
        .map(|i| {
            stream
                .put_record(shard_id, &format!("key-{i}"), format!("payload-{i}"))
                .expect("publish to open shard")
        })
        .collect()
}
