//! Shard consumer state machine.
//!
//! One consumer runs per held shard, as its own task:
//!
//! ```text
//! WaitingOnParent -> Initializing -> Processing -> ShutdownRequested
//!                                                 -> ShuttingDown -> ShutdownComplete
//! ```
//!
//! Shutdown signals are advisory. They are observed between batches and
//! while waiting (idle reads, parent polls), never inside a callback.

#![allow(clippy::significant_drop_tightening)]

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use shoal_core::{Checkpoint, InitialPosition, ShardId};
use shoal_lease::{LeaseCoordinator, LeaseError, LeaseTable, ShardCheckpointer};
use shoal_stream::{GetRecordsOutput, ReadPosition};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::ConsumerConfig;
use crate::error::{ConsumerError, ProcessorError};
use crate::processor::{
    InitializationInput, ProcessRecordsInput, RecordProcessor, ShutdownInput, ShutdownReason,
};

// -----------------------------------------------------------------------------
// Consumer State
// -----------------------------------------------------------------------------

/// Lifecycle state of a shard consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConsumerState {
    /// A parent shard has not reached `SHARD_END` yet.
    WaitingOnParent,
    /// Resolving the start position and initializing the processor.
    Initializing,
    /// Fetching and delivering batches.
    Processing,
    /// A shutdown reason has been recorded.
    ShutdownRequested,
    /// The processor's shutdown callback is running.
    ShuttingDown,
    /// Terminal.
    ShutdownComplete,
}

impl ConsumerState {
    /// Returns true for `ShutdownComplete`.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::ShutdownComplete)
    }
}

impl fmt::Display for ConsumerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::WaitingOnParent => "WAITING_ON_PARENT",
            Self::Initializing => "INITIALIZING",
            Self::Processing => "PROCESSING",
            Self::ShutdownRequested => "SHUTDOWN_REQUESTED",
            Self::ShuttingDown => "SHUTTING_DOWN",
            Self::ShutdownComplete => "SHUTDOWN_COMPLETE",
        })
    }
}

// -----------------------------------------------------------------------------
// Consumer Status
// -----------------------------------------------------------------------------

#[derive(Debug)]
struct StatusInner {
    state: ConsumerState,
    history: Vec<(ConsumerState, Instant)>,
    reason: Option<ShutdownReason>,
}

/// Observable status of a consumer, shared with the worker.
#[derive(Debug, Clone)]
pub struct ConsumerStatus {
    inner: Arc<Mutex<StatusInner>>,
}

impl ConsumerStatus {
    fn new(initial: ConsumerState) -> Self {
        Self {
            inner: Arc::new(Mutex::new(StatusInner {
                state: initial,
                history: vec![(initial, Instant::now())],
                reason: None,
            })),
        }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> ConsumerState {
        self.inner.lock().state
    }

    /// Every state entered so far, in order.
    #[must_use]
    pub fn history(&self) -> Vec<ConsumerState> {
        self.inner.lock().history.iter().map(|(state, _)| *state).collect()
    }

    /// Time the consumer entered `state`, if it did.
    #[must_use]
    pub fn entered_at(&self, state: ConsumerState) -> Option<Instant> {
        self.inner
            .lock()
            .history
            .iter()
            .find(|(entered, _)| *entered == state)
            .map(|(_, at)| *at)
    }

    /// Recorded shutdown reason, once known.
    #[must_use]
    pub fn shutdown_reason(&self) -> Option<ShutdownReason> {
        self.inner.lock().reason
    }

    fn transition(&self, state: ConsumerState) {
        let mut inner = self.inner.lock();
        if inner.state == state {
            return;
        }
        // TigerStyle: Assert invariant.
        assert!(!inner.state.is_terminal(), "transition out of {}", inner.state);
        inner.state = state;
        inner.history.push((state, Instant::now()));
    }

    fn set_reason(&self, reason: ShutdownReason) {
        self.inner.lock().reason = Some(reason);
    }
}

// -----------------------------------------------------------------------------
// Consumer Exit
// -----------------------------------------------------------------------------

/// Outcome of a consumer, reported to the worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerExit {
    /// The shard.
    pub shard_id: ShardId,
    /// Final shutdown reason.
    pub reason: ShutdownReason,
    /// Error that ended the consumer, if any.
    pub error: Option<ConsumerError>,
}

impl ConsumerExit {
    /// Returns true if the consumer ended because of an error.
    #[must_use]
    pub const fn is_failure(&self) -> bool {
        self.error.is_some()
    }
}

type Outcome = (ShutdownReason, Option<ConsumerError>);

// -----------------------------------------------------------------------------
// Shard Consumer
// -----------------------------------------------------------------------------

/// Drives one record processor over one shard.
pub struct ShardConsumer<T: LeaseTable> {
    shard_id: ShardId,
    parent_shard_ids: Vec<ShardId>,
    coordinator: Arc<LeaseCoordinator<T>>,
    processor: Box<dyn RecordProcessor>,
    checkpointer: ShardCheckpointer,
    config: ConsumerConfig,
    shutdown_rx: watch::Receiver<Option<ShutdownReason>>,
    status: ConsumerStatus,
    initialized: bool,
    completed_before_start: bool,
}

impl<T: LeaseTable> fmt::Debug for ShardConsumer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShardConsumer")
            .field("shard_id", &self.shard_id)
            .field("state", &self.status.state())
            .finish_non_exhaustive()
    }
}

impl<T: LeaseTable> ShardConsumer<T> {
    /// Creates a consumer for a shard whose lease `checkpointer` was built
    /// from.
    #[must_use]
    pub fn new(
        coordinator: Arc<LeaseCoordinator<T>>,
        parent_shard_ids: Vec<ShardId>,
        processor: Box<dyn RecordProcessor>,
        checkpointer: ShardCheckpointer,
        config: ConsumerConfig,
        shutdown_rx: watch::Receiver<Option<ShutdownReason>>,
    ) -> Self {
        // TigerStyle: Assert preconditions.
        assert!(config.max_records > 0, "max_records must be positive");

        let initial = if parent_shard_ids.is_empty() {
            ConsumerState::Initializing
        } else {
            ConsumerState::WaitingOnParent
        };
        Self {
            shard_id: checkpointer.shard_id().clone(),
            parent_shard_ids,
            coordinator,
            processor,
            checkpointer,
            config,
            shutdown_rx,
            status: ConsumerStatus::new(initial),
            initialized: false,
            completed_before_start: false,
        }
    }

    /// Returns a handle observing this consumer's state.
    #[must_use]
    pub fn status(&self) -> ConsumerStatus {
        self.status.clone()
    }

    /// Runs the consumer to completion.
    pub async fn run(mut self) -> ConsumerExit {
        info!(shard_id = %self.shard_id, state = %self.status.state(), "Shard consumer started");

        let (requested, mut error) = self.drive().await;

        self.status.transition(ConsumerState::ShutdownRequested);
        let mut reason = if self.checkpointer.is_revoked() {
            ShutdownReason::Zombie
        } else {
            requested
        };
        self.status.set_reason(reason);
        debug!(shard_id = %self.shard_id, %reason, "Shutdown requested");

        self.status.transition(ConsumerState::ShuttingDown);
        if reason == ShutdownReason::Zombie {
            self.checkpointer.revoke();
        }

        if self.initialized {
            let input = ShutdownInput {
                reason,
                checkpointer: self.checkpointer.clone(),
            };
            if let Err(err) = self.processor.shutdown(input).await {
                warn!(shard_id = %self.shard_id, error = %err, "Shutdown callback failed");
                if error.is_none() {
                    error = Some(ConsumerError::UserCallback {
                        shard_id: self.shard_id.clone(),
                        callback: "shutdown",
                        source: err,
                    });
                }
            }
        }

        if reason == ShutdownReason::Terminate
            && !self.completed_before_start
            && !self.checkpointer.shard_end_written()
        {
            if self.checkpointer.is_revoked() {
                reason = ShutdownReason::Zombie;
                self.status.set_reason(reason);
            } else {
                error!(
                    shard_id = %self.shard_id,
                    "Processor returned from TERMINATE shutdown without checkpointing SHARD_END"
                );
                error = Some(ConsumerError::CheckpointProtocolViolation {
                    shard_id: self.shard_id.clone(),
                });
            }
        }
        if reason == ShutdownReason::Zombie && error.is_none() {
            error = Some(ConsumerError::LeaseLost {
                shard_id: self.shard_id.clone(),
            });
        }

        self.status.transition(ConsumerState::ShutdownComplete);
        match &error {
            Some(err) => warn!(shard_id = %self.shard_id, %reason, error = %err, "Shard consumer failed"),
            None => info!(shard_id = %self.shard_id, %reason, "Shard consumer finished"),
        }
        ConsumerExit {
            shard_id: self.shard_id,
            reason,
            error,
        }
    }

    async fn drive(&mut self) -> Outcome {
        if !self.parent_shard_ids.is_empty() {
            if let Some(reason) = self.wait_for_parents().await {
                return (reason, None);
            }
        }

        self.status.transition(ConsumerState::Initializing);
        let start = match self.initialize().await {
            Ok(Some(start)) => start,
            Ok(None) => return (ShutdownReason::Terminate, None),
            Err(outcome) => return outcome,
        };

        self.status.transition(ConsumerState::Processing);
        self.process(start).await
    }

    // -------------------------------------------------------------------------
    // WaitingOnParent
    // -------------------------------------------------------------------------

    async fn wait_for_parents(&mut self) -> Option<ShutdownReason> {
        debug!(shard_id = %self.shard_id, parents = ?self.parent_shard_ids, "Waiting on parent shards");
        loop {
            if let Some(reason) = self.pending_shutdown() {
                return Some(reason);
            }
            match self.coordinator.parents_completed(&self.parent_shard_ids).await {
                Ok(true) => {
                    info!(shard_id = %self.shard_id, "Parent shards completed");
                    return None;
                }
                Ok(false) => {}
                Err(err) => {
                    warn!(shard_id = %self.shard_id, error = %err, "Failed to check parent shards");
                }
            }
            if let Some(reason) = self
                .wait_or_shutdown(self.config.parent_shard_poll_interval)
                .await
            {
                return Some(reason);
            }
        }
    }

    // -------------------------------------------------------------------------
    // Initializing
    // -------------------------------------------------------------------------

    /// Returns the read position, or `None` if the shard was already at
    /// `SHARD_END`.
    async fn initialize(&mut self) -> Result<Option<ReadPosition>, Outcome> {
        // The held row is the persisted row: only the owner writes it.
        let stored = match self.coordinator.held_lease(&self.shard_id) {
            Some(held) => held.snapshot().await.checkpoint,
            None => {
                return Err((
                    ShutdownReason::Zombie,
                    Some(ConsumerError::LeaseLost {
                        shard_id: self.shard_id.clone(),
                    }),
                ))
            }
        };

        let start = match stored {
            Some(Checkpoint::ShardEnd) => {
                info!(shard_id = %self.shard_id, "Shard already at SHARD_END");
                self.completed_before_start = true;
                return Ok(None);
            }
            Some(Checkpoint::TrimHorizon) => ReadPosition::TrimHorizon,
            Some(Checkpoint::Sequence(position)) => ReadPosition::After(position),
            None => {
                let from_trim_horizon = !self.parent_shard_ids.is_empty()
                    || self.config.initial_position == InitialPosition::TrimHorizon;
                if from_trim_horizon {
                    self.checkpointer
                        .checkpoint(Checkpoint::TrimHorizon)
                        .await
                        .map_err(|err| self.lease_failure(&err))?;
                    ReadPosition::TrimHorizon
                } else {
                    ReadPosition::Latest
                }
            }
        };

        let input = InitializationInput {
            shard_id: self.shard_id.clone(),
            starting_position: start.clone(),
        };
        let result = self.processor.initialize(input).await;
        result.map_err(|err| self.callback_failure("initialize", err))?;
        self.initialized = true;

        debug!(shard_id = %self.shard_id, start = ?start, "Initialized record processor");
        Ok(Some(start))
    }

    // -------------------------------------------------------------------------
    // Processing
    // -------------------------------------------------------------------------

    async fn process(&mut self, start: ReadPosition) -> Outcome {
        let monitor = self.coordinator.monitor().clone();
        let mut position = start;

        loop {
            if let Some(reason) = self.pending_shutdown() {
                return (reason, None);
            }

            let output = match self.fetch(&position).await {
                Ok(output) => output,
                Err(err) => {
                    error!(shard_id = %self.shard_id, error = %err, "Giving up on stream reads");
                    return (ShutdownReason::Requested, Some(err));
                }
            };
            let bytes = output.payload_bytes();
            let GetRecordsOutput {
                records,
                next_position,
                millis_behind_latest,
                is_at_shard_end,
            } = output;
            monitor.millis_behind_latest(&self.shard_id, millis_behind_latest);

            let is_empty = records.is_empty();
            if !is_empty || self.config.call_process_records_even_for_empty_record_list {
                let count = records.len() as u64;
                let input = ProcessRecordsInput {
                    records,
                    millis_behind_latest,
                    checkpointer: self.checkpointer.clone(),
                };
                let started = Instant::now();
                let result = self.processor.process_records(input).await;
                monitor.process_records_latency(&self.shard_id, started.elapsed());
                if let Err(err) = result {
                    return self.callback_failure("process_records", err);
                }
                monitor.records_processed(&self.shard_id, count, bytes);
                debug!(shard_id = %self.shard_id, records = count, millis_behind_latest, "Processed batch");
            }

            position = next_position;
            if is_at_shard_end {
                info!(shard_id = %self.shard_id, "Reached shard end");
                return (ShutdownReason::Terminate, None);
            }
            if is_empty {
                if let Some(reason) = self.wait_or_shutdown(self.config.idle_time_between_reads).await {
                    return (reason, None);
                }
            }
        }
    }

    async fn fetch(&self, position: &ReadPosition) -> Result<GetRecordsOutput, ConsumerError> {
        let transport = self.coordinator.transport();
        let retry = self.config.transport_retry;
        let started = Instant::now();
        let mut attempt = 0;
        loop {
            attempt += 1;
            match transport
                .get_records(&self.shard_id, position, self.config.max_records)
                .await
            {
                Ok(output) => {
                    self.coordinator
                        .monitor()
                        .get_records_latency(&self.shard_id, started.elapsed());
                    return Ok(output);
                }
                Err(err) if err.is_retryable() && retry.should_retry(attempt) => {
                    let delay = retry.delay_for(attempt);
                    warn!(shard_id = %self.shard_id, attempt, ?delay, error = %err, "Retrying get_records");
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    return Err(ConsumerError::Transport {
                        shard_id: self.shard_id.clone(),
                        attempts: attempt,
                        source: err,
                    });
                }
            }
        }
    }

    // -------------------------------------------------------------------------
    // Helpers
    // -------------------------------------------------------------------------

    fn pending_shutdown(&self) -> Option<ShutdownReason> {
        *self.shutdown_rx.borrow()
    }

    /// Sleeps for `duration` unless a shutdown signal arrives first.
    async fn wait_or_shutdown(&mut self, duration: Duration) -> Option<ShutdownReason> {
        tokio::select! {
            () = tokio::time::sleep(duration) => self.pending_shutdown(),
            changed = self.shutdown_rx.changed() => match changed {
                Ok(()) => self.pending_shutdown(),
                // The worker is gone.
                Err(_) => Some(ShutdownReason::Requested),
            },
        }
    }

    fn lease_failure(&self, err: &LeaseError) -> Outcome {
        let mapped = ConsumerError::from_lease(&self.shard_id, err);
        let reason = if matches!(mapped, ConsumerError::LeaseLost { .. }) {
            ShutdownReason::Zombie
        } else {
            ShutdownReason::Requested
        };
        (reason, Some(mapped))
    }

    fn callback_failure(&self, callback: &'static str, err: ProcessorError) -> Outcome {
        warn!(shard_id = %self.shard_id, callback, error = %err, "Record processor callback failed");
        (
            ShutdownReason::Requested,
            Some(ConsumerError::UserCallback {
                shard_id: self.shard_id.clone(),
                callback,
                source: err,
            }),
        )
    }
}
