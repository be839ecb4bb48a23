//! Worker orchestrator.
//!
//! A worker owns one reconciliation task and, for every lease it holds, one
//! shard consumer task plus one renewal task:
//!
//! ```text
//!                 ┌──────────────────────┐
//!                 │  reconciliation task │ every shard_sync_interval
//!                 └──────────┬───────────┘
//!        sync / reap / take / start / stop / cleanup
//!                 ┌──────────┴───────────┐
//!        ┌────────┴───────┐     ┌────────┴───────┐
//!        │ consumer(s0)   │ ... │ consumer(sN)   │
//!        │ renewer(s0)    │     │ renewer(sN)    │
//!        └────────────────┘     └────────────────┘
//! ```
//!
//! The consumer pool is only mutated by the reconciliation task. `shutdown`
//! stops that task first and takes the pool back from it.

#![allow(clippy::significant_drop_tightening)]

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use shoal_core::{duration_us, Clock, ShardId, WorkerId};
use shoal_lease::{LeaseCoordinator, LeaseError, LeaseTable, MonitoringService};
use shoal_stream::StreamTransport;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::WorkerConfig;
use crate::consumer::{ConsumerExit, ConsumerState, ConsumerStatus, ShardConsumer};
use crate::error::{ConsumerError, WorkerError, WorkerResult};
use crate::processor::{RecordProcessorFactory, ShutdownReason};

type ShutdownSender = Arc<watch::Sender<Option<ShutdownReason>>>;

// -----------------------------------------------------------------------------
// Status Types
// -----------------------------------------------------------------------------

/// A consumer that ended with an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardFailure {
    /// The shard.
    pub shard_id: ShardId,
    /// Shutdown reason the consumer ended with.
    pub reason: ShutdownReason,
    /// What went wrong.
    pub error: ConsumerError,
}

/// Snapshot of a worker.
#[derive(Debug, Clone)]
pub struct WorkerStatus {
    /// This worker.
    pub worker_id: WorkerId,
    /// Leases currently held.
    pub held: Vec<ShardId>,
    /// Running consumers and their states.
    pub consumers: BTreeMap<ShardId, ConsumerState>,
    /// Failures surfaced so far, oldest first.
    pub failures: Vec<ShardFailure>,
}

/// Outcome of [`Worker::shutdown`].
#[derive(Debug, Clone, Default)]
pub struct ShutdownReport {
    /// Consumers that reached `ShutdownComplete` within the grace period.
    pub completed: Vec<ConsumerExit>,
    /// Consumers aborted at the deadline. Their leases are left to expire.
    pub abandoned: Vec<ShardId>,
    /// Every failure surfaced during the worker's lifetime.
    pub failures: Vec<ShardFailure>,
}

#[derive(Debug, Default)]
struct Registry {
    consumers: BTreeMap<ShardId, ConsumerStatus>,
    failures: Vec<ShardFailure>,
}

impl Registry {
    fn record_failure(&mut self, exit: &ConsumerExit) {
        if let Some(error) = &exit.error {
            self.failures.push(ShardFailure {
                shard_id: exit.shard_id.clone(),
                reason: exit.reason,
                error: error.clone(),
            });
        }
    }
}

// -----------------------------------------------------------------------------
// Worker
// -----------------------------------------------------------------------------

/// Consumes a stream as one member of a fleet.
pub struct Worker<T: LeaseTable> {
    config: WorkerConfig,
    coordinator: Arc<LeaseCoordinator<T>>,
    factory: Arc<dyn RecordProcessorFactory>,
    clock: Arc<dyn Clock>,
    registry: Arc<Mutex<Registry>>,
    running: Option<Running<T>>,
}

struct Running<T: LeaseTable> {
    stop_tx: mpsc::Sender<()>,
    handle: JoinHandle<Pool<T>>,
}

impl<T: LeaseTable> fmt::Debug for Worker<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("worker_id", &self.config.worker_id)
            .field("running", &self.running.is_some())
            .finish_non_exhaustive()
    }
}

impl<T: LeaseTable> Worker<T> {
    /// Creates a worker.
    ///
    /// # Errors
    /// Returns `Config` if the configuration is invalid.
    pub fn new(
        config: WorkerConfig,
        table: Arc<T>,
        transport: Arc<dyn StreamTransport>,
        factory: Arc<dyn RecordProcessorFactory>,
        monitor: Arc<dyn MonitoringService>,
        clock: Arc<dyn Clock>,
    ) -> WorkerResult<Self> {
        config.validate()?;

        let coordinator = Arc::new(LeaseCoordinator::new(
            table,
            transport,
            monitor,
            clock.clone(),
            config.lease_config(),
        ));
        Ok(Self {
            config,
            coordinator,
            factory,
            clock,
            registry: Arc::new(Mutex::new(Registry::default())),
            running: None,
        })
    }

    /// Returns this worker's identity.
    #[must_use]
    pub const fn worker_id(&self) -> &WorkerId {
        &self.config.worker_id
    }

    /// Returns the configuration.
    #[must_use]
    pub const fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Returns the lease coordinator.
    #[must_use]
    pub const fn coordinator(&self) -> &Arc<LeaseCoordinator<T>> {
        &self.coordinator
    }

    /// Returns true between `start` and `shutdown`.
    #[must_use]
    pub const fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Starts consuming.
    ///
    /// Runs shard sync and one reconciliation pass before returning, then
    /// spawns the reconciliation task.
    ///
    /// # Errors
    /// Returns `AlreadyStarted` on a second call, or a lease error if the
    /// initial shard sync fails.
    pub async fn start(&mut self) -> WorkerResult<()> {
        if self.running.is_some() {
            return Err(WorkerError::AlreadyStarted);
        }

        let created = self.coordinator.sync_shards(self.clock.now_us()).await?;
        info!(
            worker_id = %self.config.worker_id,
            application = %self.config.application_name,
            stream = %self.config.stream_name,
            created,
            "Worker starting"
        );

        let mut pool = Pool {
            config: self.config.clone(),
            coordinator: self.coordinator.clone(),
            factory: self.factory.clone(),
            clock: self.clock.clone(),
            registry: self.registry.clone(),
            slots: BTreeMap::new(),
        };
        pool.reconcile().await;

        let (stop_tx, stop_rx) = mpsc::channel(1);
        let handle = tokio::spawn(reconcile_task(pool, stop_rx, self.config.shard_sync_interval));
        self.running = Some(Running { stop_tx, handle });
        Ok(())
    }

    /// Returns a snapshot of held leases, consumer states and failures.
    #[must_use]
    pub fn status(&self) -> WorkerStatus {
        let registry = self.registry.lock();
        WorkerStatus {
            worker_id: self.config.worker_id.clone(),
            held: self.coordinator.held_shards(),
            consumers: registry
                .consumers
                .iter()
                .map(|(shard_id, status)| (shard_id.clone(), status.state()))
                .collect(),
            failures: registry.failures.clone(),
        }
    }

    /// Stops the worker.
    ///
    /// Every consumer is asked to stop and gets `shutdown_grace` to finish.
    /// Leases of finished consumers are released; stalled consumers are
    /// aborted and their leases left to expire.
    ///
    /// # Errors
    /// Returns `NotStarted` if the worker is not running, or `TaskFailed` if
    /// the reconciliation task panicked.
    pub async fn shutdown(&mut self) -> WorkerResult<ShutdownReport> {
        let Some(running) = self.running.take() else {
            return Err(WorkerError::NotStarted);
        };

        // A closed channel means the task already ended.
        let _ = running.stop_tx.send(()).await;
        let pool = running.handle.await.map_err(|err| WorkerError::TaskFailed {
            message: err.to_string(),
        })?;

        info!(
            worker_id = %self.config.worker_id,
            consumers = pool.slots.len(),
            "Worker shutting down"
        );
        Ok(pool.shutdown().await)
    }
}

// -----------------------------------------------------------------------------
// Reconciliation Task
// -----------------------------------------------------------------------------

async fn reconcile_task<T: LeaseTable>(
    mut pool: Pool<T>,
    mut stop_rx: mpsc::Receiver<()>,
    period: Duration,
) -> Pool<T> {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = stop_rx.recv() => {
                debug!(worker_id = %pool.config.worker_id, "Reconciliation task stopping");
                break;
            }
            _ = ticker.tick() => {
                pool.reconcile().await;
            }
        }
    }
    pool
}

struct Renewer {
    stop_tx: mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

impl Renewer {
    async fn stop(self) {
        let _ = self.stop_tx.send(()).await;
        if let Err(err) = self.handle.await {
            warn!(error = %err, "Renewal task failed");
        }
    }
}

struct ShardSlot {
    shutdown_tx: ShutdownSender,
    renewer: Renewer,
    consumer: JoinHandle<ConsumerExit>,
}

/// The consumer pool, owned by the reconciliation task.
struct Pool<T: LeaseTable> {
    config: WorkerConfig,
    coordinator: Arc<LeaseCoordinator<T>>,
    factory: Arc<dyn RecordProcessorFactory>,
    clock: Arc<dyn Clock>,
    registry: Arc<Mutex<Registry>>,
    slots: BTreeMap<ShardId, ShardSlot>,
}

impl<T: LeaseTable> Pool<T> {
    async fn reconcile(&mut self) {
        if let Err(err) = self.coordinator.sync_shards(self.clock.now_us()).await {
            warn!(worker_id = %self.config.worker_id, error = %err, "Shard sync failed");
        }

        self.reap().await;

        match self.coordinator.take_leases(self.clock.now_us()).await {
            Ok(taken) if !taken.is_empty() => {
                debug!(worker_id = %self.config.worker_id, taken = taken.len(), "Took leases");
            }
            Ok(_) => {}
            Err(err) => {
                warn!(worker_id = %self.config.worker_id, error = %err, "Taking leases failed");
            }
        }

        self.start_consumers().await;

        let held = self.coordinator.held_shards();
        for (shard_id, slot) in &self.slots {
            if held.binary_search(shard_id).is_err() {
                signal(&slot.shutdown_tx, ShutdownReason::Requested);
            }
        }

        if self.config.cleanup_terminated_shards {
            match self.coordinator.cleanup_terminated_leases().await {
                Ok(0) => {}
                Ok(deleted) => info!(deleted, "Cleaned up terminated shard leases"),
                Err(err) => warn!(error = %err, "Terminated shard cleanup failed"),
            }
        }
    }

    /// Collects finished consumers and settles their leases.
    async fn reap(&mut self) {
        let finished: Vec<ShardId> = self
            .slots
            .iter()
            .filter(|(_, slot)| slot.consumer.is_finished())
            .map(|(shard_id, _)| shard_id.clone())
            .collect();

        for shard_id in finished {
            let Some(slot) = self.slots.remove(&shard_id) else {
                continue;
            };
            slot.renewer.stop().await;
            self.registry.lock().consumers.remove(&shard_id);

            match slot.consumer.await {
                Ok(exit) => self.settle(exit).await,
                Err(err) => {
                    error!(shard_id = %shard_id, error = %err, "Shard consumer task failed");
                }
            }
        }
    }

    /// Decides what happens to the lease of a finished consumer.
    async fn settle(&self, exit: ConsumerExit) {
        self.registry.lock().record_failure(&exit);

        match (&exit.reason, &exit.error) {
            (ShutdownReason::Zombie, _) => {
                self.coordinator.forget_lease(&exit.shard_id);
            }
            (_, Some(ConsumerError::CheckpointProtocolViolation { .. })) => {
                // Replaying the shard would violate the protocol again.
                let until_us = self
                    .clock
                    .now_us()
                    .saturating_add(duration_us(self.config.failed_shard_backoff));
                self.coordinator.back_off_shard(&exit.shard_id, until_us);
                self.release(&exit.shard_id).await;
            }
            (_, None) => {
                self.release(&exit.shard_id).await;
            }
            // Kept so the consumer restarts from the last checkpoint.
            (_, Some(_)) => {}
        }
    }

    async fn release(&self, shard_id: &ShardId) {
        match self.coordinator.release_lease(shard_id, self.clock.now_us()).await {
            Ok(()) => {}
            Err(LeaseError::LeaseLost { .. }) => {
                debug!(shard_id = %shard_id, "Lease taken over before release");
            }
            Err(err) => warn!(shard_id = %shard_id, error = %err, "Releasing lease failed"),
        }
    }

    /// Starts a consumer and a renewer for every held shard without one.
    async fn start_consumers(&mut self) {
        for shard_id in self.coordinator.held_shards() {
            if self.slots.contains_key(&shard_id) {
                continue;
            }
            let (Some(held), Some(checkpointer)) = (
                self.coordinator.held_lease(&shard_id),
                self.coordinator.shard_checkpointer(&shard_id),
            ) else {
                continue;
            };
            let parent_shard_ids = held.snapshot().await.parent_shard_ids;

            let (shutdown_tx, shutdown_rx) = watch::channel(None);
            let shutdown_tx = Arc::new(shutdown_tx);

            let consumer = ShardConsumer::new(
                self.coordinator.clone(),
                parent_shard_ids,
                self.factory.create_processor(&shard_id),
                checkpointer,
                self.config.consumer_config(),
                shutdown_rx,
            );
            let status = consumer.status();
            let consumer = tokio::spawn(consumer.run());

            let (stop_tx, stop_rx) = mpsc::channel(1);
            let handle = tokio::spawn(renew_task(
                self.coordinator.clone(),
                self.clock.clone(),
                shard_id.clone(),
                self.config.lease_renewal_interval,
                shutdown_tx.clone(),
                stop_rx,
            ));

            info!(
                shard_id = %shard_id,
                worker_id = %self.config.worker_id,
                "Started shard consumer"
            );
            self.registry.lock().consumers.insert(shard_id.clone(), status);
            self.slots.insert(
                shard_id,
                ShardSlot {
                    shutdown_tx,
                    renewer: Renewer { stop_tx, handle },
                    consumer,
                },
            );
        }
    }

    /// Asks every consumer to stop and waits for them up to the grace
    /// period.
    async fn shutdown(mut self) -> ShutdownReport {
        for slot in self.slots.values() {
            signal(&slot.shutdown_tx, ShutdownReason::Requested);
        }

        let deadline = Instant::now() + self.config.shutdown_grace;
        let mut report = ShutdownReport::default();
        let slots = std::mem::take(&mut self.slots);

        for (shard_id, mut slot) in slots {
            match tokio::time::timeout_at(deadline, &mut slot.consumer).await {
                Ok(Ok(exit)) => {
                    slot.renewer.stop().await;
                    self.settle(exit.clone()).await;
                    report.completed.push(exit);
                }
                Ok(Err(err)) => {
                    slot.renewer.stop().await;
                    error!(shard_id = %shard_id, error = %err, "Shard consumer task failed");
                }
                Err(_) => {
                    slot.consumer.abort();
                    slot.renewer.stop().await;
                    warn!(
                        shard_id = %shard_id,
                        grace = ?self.config.shutdown_grace,
                        "Abandoned shard consumer at shutdown deadline"
                    );
                    report.abandoned.push(shard_id.clone());
                }
            }
            self.registry.lock().consumers.remove(&shard_id);
        }

        report.failures = self.registry.lock().failures.clone();
        info!(
            worker_id = %self.config.worker_id,
            completed = report.completed.len(),
            abandoned = report.abandoned.len(),
            failures = report.failures.len(),
            "Worker shut down"
        );
        report
    }
}

// -----------------------------------------------------------------------------
// Renewal Task
// -----------------------------------------------------------------------------

async fn renew_task<T: LeaseTable>(
    coordinator: Arc<LeaseCoordinator<T>>,
    clock: Arc<dyn Clock>,
    shard_id: ShardId,
    period: Duration,
    shutdown_tx: ShutdownSender,
    mut stop_rx: mpsc::Receiver<()>,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = stop_rx.recv() => break,
            _ = ticker.tick() => {
                match coordinator.renew_lease(&shard_id, clock.now_us()).await {
                    Ok(()) => {}
                    Err(LeaseError::LeaseLost { .. }) => {
                        signal(&shutdown_tx, ShutdownReason::Zombie);
                        break;
                    }
                    Err(err) => {
                        warn!(shard_id = %shard_id, error = %err, "Lease renewal will be retried");
                    }
                }
            }
        }
    }
}

/// Records a shutdown reason for a consumer. `Zombie` overrides any other
/// reason; otherwise the first reason wins.
fn signal(tx: &watch::Sender<Option<ShutdownReason>>, reason: ShutdownReason) {
    tx.send_if_modified(|current| match *current {
        Some(ShutdownReason::Zombie) => false,
        Some(_) if reason != ShutdownReason::Zombie => false,
        _ => {
            *current = Some(reason);
            true
        }
    });
}
