//! Worker integration tests.
//!
//! Workers run on the real tokio clock with the fast test timers: 50ms
//! reconciliation and renewal, 400ms failover. Workers in one test share a
//! `SimulatedLeaseTable` and a `SimulatedStream` the way separate processes
//! share the real table and stream.

#![allow(clippy::significant_drop_tightening)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use shoal_core::{Checkpoint, Clock, ManualClock, ShardId, SystemClock, WorkerId};
use shoal_lease::{
    LeaseConfig, LeaseCoordinator, LeaseError, LeaseTable, NoopMonitoringService,
    SimulatedLeaseTable,
};
use shoal_stream::{ReadPosition, SimulatedStream};
use shoal_worker::{ConsumerError, ConsumerState, ShutdownReason, WorkerError};

use crate::fixtures::{
    publish, test_worker, wait_until, ProcessorBehavior, ProcessorEvent, RecordingFactory,
};
use crate::properties::{accepted_checkpoints, LeaseTableChecker};
use crate::scenarios::{fleets, timing};

fn shard(index: u32) -> ShardId {
    SimulatedStream::shard_name(index)
}

fn checkpoint_of(table: &SimulatedLeaseTable, shard_id: &ShardId) -> Option<Checkpoint> {
    table
        .snapshot()
        .into_iter()
        .find(|lease| &lease.shard_id == shard_id)
        .and_then(|lease| lease.checkpoint)
}

fn owner_of(table: &SimulatedLeaseTable, shard_id: &ShardId) -> Option<WorkerId> {
    table
        .snapshot()
        .into_iter()
        .find(|lease| &lease.shard_id == shard_id)
        .and_then(|lease| lease.owner)
}

// ============================================================================
// Lifecycle
// ============================================================================

#[tokio::test]
async fn test_worker_start_and_shutdown_are_checked() {
    let stream = SimulatedStream::with_shards(42, 1);
    let table = SimulatedLeaseTable::new(42);
    let factory = Arc::new(RecordingFactory::new(ProcessorBehavior::checkpointing()));
    let mut worker = test_worker("worker-a", &table, &stream, factory, |c| c);

    assert!(matches!(worker.shutdown().await, Err(WorkerError::NotStarted)));

    worker.start().await.unwrap();
    assert!(worker.is_running());
    assert!(matches!(worker.start().await, Err(WorkerError::AlreadyStarted)));

    worker.shutdown().await.unwrap();
    assert!(!worker.is_running());
    assert!(matches!(worker.shutdown().await, Err(WorkerError::NotStarted)));
}

#[tokio::test]
async fn test_worker_start_acquires_before_returning() {
    let stream = SimulatedStream::with_shards(42, 3);
    let table = SimulatedLeaseTable::new(42);
    let factory = Arc::new(RecordingFactory::new(ProcessorBehavior::checkpointing()));
    let mut worker = test_worker("worker-a", &table, &stream, factory.clone(), |c| c);

    worker.start().await.unwrap();
    let status = worker.status();
    assert_eq!(status.worker_id, WorkerId::new("worker-a"));
    assert_eq!(status.held, vec![shard(0), shard(1), shard(2)]);
    assert_eq!(status.consumers.len(), 3);
    assert_eq!(factory.created(), 3);

    worker.shutdown().await.unwrap();
}

/// Shutdown stops every consumer with `Requested` and releases its lease so
/// another worker can take over at once.
#[tokio::test]
async fn test_shutdown_releases_leases() {
    let stream = SimulatedStream::with_shards(42, 3);
    for index in 0..3 {
        publish(&stream, &shard(index), 10);
    }
    let table = SimulatedLeaseTable::new(42);
    let factory = Arc::new(RecordingFactory::new(ProcessorBehavior::checkpointing()));
    let log = factory.log().clone();
    let mut worker = test_worker("worker-a", &table, &stream, factory, |c| c);

    worker.start().await.unwrap();
    assert!(
        wait_until(timing::WAIT, || (0..3).all(|i| log.delivered(&shard(i)).len() == 10)).await,
        "all records delivered"
    );

    let report = worker.shutdown().await.unwrap();
    assert_eq!(report.completed.len(), 3);
    assert!(report.abandoned.is_empty());
    assert!(report.failures.is_empty());
    assert!(report
        .completed
        .iter()
        .all(|exit| exit.reason == ShutdownReason::Requested && !exit.is_failure()));

    for index in 0..3 {
        assert_eq!(log.shutdowns(&shard(index)), vec![ShutdownReason::Requested]);
        assert!(owner_of(&table, &shard(index)).is_none());
    }
    assert!(worker.coordinator().held_shards().is_empty());

    // Released leases are taken at once, not after the failover timeout.
    let factory = Arc::new(RecordingFactory::new(ProcessorBehavior::passive()));
    let mut successor = test_worker("worker-b", &table, &stream, factory, |c| c);
    successor.start().await.unwrap();
    assert_eq!(successor.status().held.len(), 3);
    successor.shutdown().await.unwrap();
}

/// A consumer stuck in a callback is abandoned at the shutdown deadline; its
/// lease is left to expire instead of being released.
#[tokio::test]
async fn test_shutdown_abandons_stalled_consumer() {
    let stream = SimulatedStream::with_shards(42, 1);
    publish(&stream, &shard(0), 5);
    let table = SimulatedLeaseTable::new(42);
    let behavior = ProcessorBehavior::checkpointing().with_batch_delay(Duration::from_secs(30));
    let factory = Arc::new(RecordingFactory::new(behavior));
    let log = factory.log().clone();
    let mut worker = test_worker("worker-a", &table, &stream, factory, |c| {
        c.with_shutdown_grace(Duration::from_millis(100))
    });

    worker.start().await.unwrap();
    assert!(wait_until(timing::WAIT, || log.batch_count(&shard(0)) == 1).await);

    let started = Instant::now();
    let report = worker.shutdown().await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(report.abandoned, vec![shard(0)]);
    assert!(report.completed.is_empty());

    assert!(log.shutdowns(&shard(0)).is_empty());
    assert_eq!(owner_of(&table, &shard(0)), Some(WorkerId::new("worker-a")));
}

// ============================================================================
// Scenario: Single Worker Drains a Shard
// ============================================================================

#[tokio::test]
async fn test_single_worker_checkpoints_every_record() {
    let stream = SimulatedStream::with_shards(42, 1);
    let positions = publish(&stream, &shard(0), 100);
    let table = SimulatedLeaseTable::new(42);
    let factory = Arc::new(RecordingFactory::new(ProcessorBehavior::checkpointing()));
    let log = factory.log().clone();
    let mut worker = test_worker("worker-a", &table, &stream, factory, |c| c);

    worker.start().await.unwrap();
    let last = Checkpoint::Sequence(positions[99].clone());
    assert!(
        wait_until(timing::WAIT, || checkpoint_of(&table, &shard(0)).as_ref() == Some(&last)).await,
        "checkpoint reaches the last record"
    );

    assert_eq!(log.delivered(&shard(0)), positions);
    assert_eq!(log.initializations(&shard(0)), vec![ReadPosition::TrimHorizon]);
    assert_eq!(
        worker.status().consumers.get(&shard(0)),
        Some(&ConsumerState::Processing)
    );

    let report = worker.shutdown().await.unwrap();
    assert!(report.failures.is_empty());
    assert_eq!(checkpoint_of(&table, &shard(0)), Some(last));

    let mut checker = LeaseTableChecker::with_fleet(["worker-a"]);
    checker.record_history(&table.write_history());
    checker.record_snapshot(&table.snapshot());
    checker.assert_valid();
}

// ============================================================================
// Scenario: Competing Workers
// ============================================================================

/// Two workers start together against one shard. Only one consumes it and
/// the other never creates a processor while the winner keeps renewing.
#[tokio::test]
async fn test_competing_workers_have_single_owner() {
    let stream = SimulatedStream::with_shards(42, 1);
    let positions = publish(&stream, &shard(0), 30);
    let table = SimulatedLeaseTable::new(42);
    let factory_a = Arc::new(RecordingFactory::new(ProcessorBehavior::checkpointing()));
    let factory_b = Arc::new(RecordingFactory::new(ProcessorBehavior::checkpointing()));
    let mut a = test_worker(fleets::TWO_WORKERS[0], &table, &stream, factory_a.clone(), |c| c);
    let mut b = test_worker(fleets::TWO_WORKERS[1], &table, &stream, factory_b.clone(), |c| c);

    let (started_a, started_b) = tokio::join!(a.start(), b.start());
    started_a.unwrap();
    started_b.unwrap();

    let last = Checkpoint::Sequence(positions[29].clone());
    assert!(wait_until(timing::WAIT, || checkpoint_of(&table, &shard(0)).as_ref() == Some(&last)).await);

    // Several renewal periods with both workers reconciling.
    tokio::time::sleep(timing::FAILOVER * 2).await;

    let held_a = a.status().held;
    let held_b = b.status().held;
    assert_eq!(held_a.len() + held_b.len(), 1, "exactly one owner");
    assert_eq!(factory_a.created() + factory_b.created(), 1);

    let winner_log = if held_a.is_empty() { factory_b.log() } else { factory_a.log() };
    assert_eq!(winner_log.delivered(&shard(0)), positions);

    a.shutdown().await.unwrap();
    b.shutdown().await.unwrap();

    let mut checker = LeaseTableChecker::with_fleet(fleets::TWO_WORKERS.iter().copied());
    checker.record_history(&table.write_history());
    checker.assert_valid();
}

/// Three workers split six shards without overlap.
#[tokio::test]
async fn test_fleet_partitions_shards() {
    let stream = SimulatedStream::with_shards(42, 6);
    let table = SimulatedLeaseTable::new(42);
    let mut workers: Vec<_> = fleets::THREE_WORKERS
        .iter()
        .map(|id| {
            let factory = Arc::new(RecordingFactory::new(ProcessorBehavior::checkpointing()));
            test_worker(id, &table, &stream, factory, |c| c.with_max_leases_for_worker(2))
        })
        .collect();

    for worker in &mut workers {
        worker.start().await.unwrap();
    }

    let mut held: Vec<ShardId> = workers.iter().flat_map(|w| w.status().held).collect();
    assert!(workers.iter().all(|w| w.status().held.len() == 2));
    held.sort();
    held.dedup();
    assert_eq!(held.len(), 6);

    for worker in &mut workers {
        worker.shutdown().await.unwrap();
    }
}

// ============================================================================
// Scenario: Failover
// ============================================================================

/// A worker crashes after checkpointing part of a shard. Another worker takes
/// the lease only after the failover timeout and resumes after the
/// checkpoint.
#[tokio::test]
async fn test_failover_resumes_after_checkpoint() {
    let stream = SimulatedStream::with_shards(42, 1);
    let positions = publish(&stream, &shard(0), 50);
    let table = SimulatedLeaseTable::new(42);

    let started = Instant::now();
    {
        // Crashed worker: acquires and checkpoints, then never renews.
        let crashed = LeaseCoordinator::new(
            Arc::new(table.clone()),
            Arc::new(stream.clone()),
            Arc::new(NoopMonitoringService),
            Arc::new(SystemClock),
            LeaseConfig::for_testing("worker-crashed"),
        );
        crashed.sync_shards(SystemClock.now_us()).await.unwrap();
        crashed.acquire_lease(&shard(0), SystemClock.now_us()).await.unwrap().unwrap();
        crashed
            .shard_checkpointer(&shard(0))
            .unwrap()
            .checkpoint_sequence(positions[19].clone())
            .await
            .unwrap();
    }

    let factory = Arc::new(RecordingFactory::new(ProcessorBehavior::checkpointing()));
    let log = factory.log().clone();
    let mut survivor = test_worker("worker-b", &table, &stream, factory, |c| c);
    survivor.start().await.unwrap();
    assert!(survivor.status().held.is_empty());

    assert!(wait_until(timing::WAIT, || !survivor.status().held.is_empty()).await);
    assert!(started.elapsed() >= timing::FAILOVER);

    let last = Checkpoint::Sequence(positions[49].clone());
    assert!(wait_until(timing::WAIT, || checkpoint_of(&table, &shard(0)).as_ref() == Some(&last)).await);
    assert_eq!(
        log.initializations(&shard(0)),
        vec![ReadPosition::After(positions[19].clone())]
    );
    assert_eq!(log.delivered(&shard(0)), positions[20..].to_vec());

    survivor.shutdown().await.unwrap();
}

/// A worker whose lease is taken over learns it on the next renewal: the
/// consumer shuts down as a zombie and cannot checkpoint.
#[tokio::test]
async fn test_renewal_detects_takeover() {
    let stream = SimulatedStream::with_shards(42, 1);
    publish(&stream, &shard(0), 10);
    let table = SimulatedLeaseTable::new(42);
    let behavior = ProcessorBehavior::checkpointing().with_zombie_checkpoint();
    let factory = Arc::new(RecordingFactory::new(behavior));
    let log = factory.log().clone();
    let mut worker = test_worker("worker-a", &table, &stream, factory, |c| c);

    worker.start().await.unwrap();
    assert!(wait_until(timing::WAIT, || log.delivered(&shard(0)).len() == 10).await);

    // Another worker takes the row and, as far as worker-a can tell, keeps
    // it fresh forever.
    let mut stolen = table.get_lease(&shard(0)).await.unwrap().unwrap();
    stolen.counter = stolen.counter.next();
    stolen.owner = Some(WorkerId::new("worker-b"));
    stolen.last_update_us = SystemClock.now_us() + 3_600_000_000;
    table.put_lease(stolen.clone());

    assert!(wait_until(timing::WAIT, || log.shutdowns(&shard(0)) == vec![ShutdownReason::Zombie]).await);
    assert!(
        wait_until(timing::WAIT, || {
            worker
                .status()
                .failures
                .iter()
                .any(|f| f.reason == ShutdownReason::Zombie)
        })
        .await
    );

    let status = worker.status();
    let failure = &status.failures[0];
    assert_eq!(failure.shard_id, shard(0));
    assert!(matches!(failure.error, ConsumerError::LeaseLost { .. }));
    assert!(matches!(
        log.rejected_checkpoints(&shard(0)).as_slice(),
        [LeaseError::LeaseLost { .. }]
    ));
    assert!(status.held.is_empty());
    assert!(status.consumers.is_empty());

    // The zombie wrote nothing after the takeover.
    let stored = table.get_lease(&shard(0)).await.unwrap().unwrap();
    assert_eq!(stored, stolen);

    worker.shutdown().await.unwrap();
}

/// A failing processor is restarted from the last checkpoint with a fresh
/// instance; the lease is kept throughout.
#[tokio::test]
async fn test_processor_failure_restarts_consumer() {
    let stream = SimulatedStream::with_shards(42, 1);
    publish(&stream, &shard(0), 10);
    let table = SimulatedLeaseTable::new(42);
    let behavior = ProcessorBehavior::checkpointing().with_failing_batch(0);
    let factory = Arc::new(RecordingFactory::new(behavior));
    let mut worker = test_worker("worker-a", &table, &stream, factory.clone(), |c| c);

    worker.start().await.unwrap();
    assert!(wait_until(timing::WAIT, || factory.created() >= 3).await);

    let status = worker.status();
    assert_eq!(status.held, vec![shard(0)]);
    assert!(status.failures.len() >= 2);
    assert!(status
        .failures
        .iter()
        .all(|f| f.reason == ShutdownReason::Requested
            && matches!(f.error, ConsumerError::UserCallback { .. })));

    // Nothing was checkpointed past the initial position.
    assert_eq!(checkpoint_of(&table, &shard(0)), Some(Checkpoint::TrimHorizon));
    assert!(factory
        .log()
        .initializations(&shard(0))
        .iter()
        .all(|position| *position == ReadPosition::TrimHorizon));

    worker.shutdown().await.unwrap();
}

// ============================================================================
// Scenario: Resharding
// ============================================================================

/// After a split the child is consumed only once the parent reached
/// `SHARD_END`, and the parent's lease is cleaned up afterwards.
#[tokio::test]
async fn test_child_follows_parent_after_split() {
    let stream = SimulatedStream::with_shards(42, 1);
    let parent_positions = publish(&stream, &shard(0), 40);
    stream.split_shard(&shard(0), &[shard(1)]).unwrap();
    let child_positions = publish(&stream, &shard(1), 20);

    let table = SimulatedLeaseTable::new(42);
    let factory = Arc::new(RecordingFactory::new(ProcessorBehavior::checkpointing()));
    let log = factory.log().clone();
    let mut worker = test_worker("worker-a", &table, &stream, factory, |c| c);

    worker.start().await.unwrap();
    let last = Checkpoint::Sequence(child_positions[19].clone());
    assert!(wait_until(timing::WAIT, || checkpoint_of(&table, &shard(1)).as_ref() == Some(&last)).await);

    assert_eq!(log.delivered(&shard(0)), parent_positions);
    assert_eq!(log.delivered(&shard(1)), child_positions);
    assert_eq!(log.shutdowns(&shard(0)), vec![ShutdownReason::Terminate]);

    let events = log.events();
    let parent_shutdown = events
        .iter()
        .position(|e| matches!(e, ProcessorEvent::Shutdown { shard_id, .. } if *shard_id == shard(0)))
        .unwrap();
    let child_init = events
        .iter()
        .position(|e| matches!(e, ProcessorEvent::Initialized { shard_id, .. } if *shard_id == shard(1)))
        .unwrap();
    assert!(parent_shutdown < child_init, "child started before parent finished");
    assert_eq!(log.initializations(&shard(1)), vec![ReadPosition::TrimHorizon]);

    // Parent lease is released, then deleted by cleanup.
    assert!(
        wait_until(timing::WAIT, || {
            table.snapshot().iter().all(|lease| lease.shard_id != shard(0))
        })
        .await,
        "parent lease cleaned up"
    );

    let history = table.write_history();
    assert_eq!(
        accepted_checkpoints(&history, &shard(0)).last(),
        Some(&Checkpoint::ShardEnd)
    );
    let mut checker = LeaseTableChecker::with_fleet(["worker-a"]);
    checker.record_history(&history);
    checker.assert_valid();

    let report = worker.shutdown().await.unwrap();
    assert!(report.failures.is_empty());
}

/// A processor that ignores `SHARD_END` is reported and its shard is not
/// marked finished, so the child stays blocked.
#[tokio::test]
async fn test_missing_shard_end_blocks_child() {
    let stream = SimulatedStream::with_shards(42, 1);
    publish(&stream, &shard(0), 5);
    stream.split_shard(&shard(0), &[shard(1)]).unwrap();

    let table = SimulatedLeaseTable::new(42);
    let factory = Arc::new(
        RecordingFactory::new(ProcessorBehavior::checkpointing())
            .with_override(shard(0), ProcessorBehavior::checkpointing().without_shard_end()),
    );
    let log = factory.log().clone();
    let mut worker = test_worker("worker-a", &table, &stream, factory, |c| c);

    worker.start().await.unwrap();
    assert!(
        wait_until(timing::WAIT, || {
            worker
                .status()
                .failures
                .iter()
                .any(|f| matches!(f.error, ConsumerError::CheckpointProtocolViolation { .. }))
        })
        .await
    );

    assert_ne!(checkpoint_of(&table, &shard(0)), Some(Checkpoint::ShardEnd));
    assert!(log.initializations(&shard(1)).is_empty());
    assert_eq!(
        worker.status().consumers.get(&shard(1)),
        Some(&ConsumerState::WaitingOnParent)
    );

    worker.shutdown().await.unwrap();
}

/// After a protocol violation the worker leaves the shard alone instead of
/// replaying it every reconciliation pass.
#[tokio::test]
async fn test_protocol_violation_backs_off_shard() {
    let stream = SimulatedStream::with_shards(42, 1);
    publish(&stream, &shard(0), 5);
    stream.close_shard(&shard(0)).unwrap();

    let table = SimulatedLeaseTable::new(42);
    let factory = Arc::new(RecordingFactory::new(
        ProcessorBehavior::checkpointing().without_shard_end(),
    ));
    let log = factory.log().clone();
    let mut worker = test_worker("worker-a", &table, &stream, factory, |c| {
        c.with_failed_shard_backoff(Duration::from_secs(60))
    });

    worker.start().await.unwrap();
    assert!(wait_until(timing::WAIT, || !worker.status().failures.is_empty()).await);
    tokio::time::sleep(timing::SHARD_SYNC * 8).await;

    assert_eq!(log.initializations(&shard(0)).len(), 1);
    assert!(worker.status().held.is_empty());
    assert_eq!(owner_of(&table, &shard(0)), None);
    assert_ne!(checkpoint_of(&table, &shard(0)), Some(Checkpoint::ShardEnd));

    worker.shutdown().await.unwrap();
}

/// The coordinator the worker exposes is the one it acquires with.
#[tokio::test]
async fn test_worker_coordinator_reflects_leases() {
    let stream = SimulatedStream::with_shards(42, 2);
    let table = SimulatedLeaseTable::new(42);
    let factory = Arc::new(RecordingFactory::new(ProcessorBehavior::checkpointing()));
    let mut worker = test_worker("worker-a", &table, &stream, factory, |c| c);
    worker.start().await.unwrap();

    let coordinator = worker.coordinator().clone();
    assert_eq!(coordinator.held_shards(), worker.status().held);

    // An independent observer sees the same owner.
    let observer = LeaseCoordinator::new(
        Arc::new(table.clone()),
        Arc::new(stream.clone()),
        Arc::new(NoopMonitoringService),
        Arc::new(ManualClock::new(0)),
        LeaseConfig::for_testing("observer"),
    );
    assert!(observer.acquire_lease(&shard(0), 0).await.unwrap().is_none());

    worker.shutdown().await.unwrap();
}
