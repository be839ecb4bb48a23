//! Lease coordination integration tests.
//!
//! Several `LeaseCoordinator`s share one `SimulatedLeaseTable`, the way
//! workers in separate processes share the real table. Time is passed
//! explicitly, so expiry is exact.

#![allow(clippy::significant_drop_tightening)]

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use shoal_core::{Checkpoint, LeaseCounter, ManualClock, ShardId, WorkerId};
use shoal_lease::{
    Lease, LeaseConfig, LeaseCoordinator, LeaseError, LeaseResult, LeaseTable,
    NoopMonitoringService, SimulatedLeaseTable,
};
use shoal_stream::SimulatedStream;
use tokio::sync::Barrier;

use crate::properties::LeaseTableChecker;

const FAILOVER_US: u64 = 500_000;

fn coordinator<T: LeaseTable>(
    worker: &str,
    table: Arc<T>,
    stream: &SimulatedStream,
    config: impl FnOnce(LeaseConfig) -> LeaseConfig,
) -> LeaseCoordinator<T> {
    LeaseCoordinator::new(
        table,
        Arc::new(stream.clone()),
        Arc::new(NoopMonitoringService),
        Arc::new(ManualClock::new(0)),
        config(LeaseConfig::for_testing(worker)),
    )
}

fn shard(index: u32) -> ShardId {
    SimulatedStream::shard_name(index)
}

/// Lease table whose reads wait until every racer has read, so that all
/// racers observe the same counter before any of them writes.
#[derive(Debug)]
struct LockstepTable {
    inner: SimulatedLeaseTable,
    barrier: Barrier,
}

#[async_trait]
impl LeaseTable for LockstepTable {
    async fn create_lease_if_absent(&self, lease: &Lease) -> LeaseResult<bool> {
        self.inner.create_lease_if_absent(lease).await
    }

    async fn get_lease(&self, shard_id: &ShardId) -> LeaseResult<Option<Lease>> {
        let lease = self.inner.get_lease(shard_id).await?;
        self.barrier.wait().await;
        Ok(lease)
    }

    async fn list_leases(&self) -> LeaseResult<Vec<Lease>> {
        self.inner.list_leases().await
    }

    async fn update_lease(&self, lease: &Lease, expected_counter: LeaseCounter) -> LeaseResult<()> {
        self.inner.update_lease(lease, expected_counter).await
    }

    async fn delete_lease(&self, shard_id: &ShardId, expected_counter: LeaseCounter) -> LeaseResult<()> {
        self.inner.delete_lease(shard_id, expected_counter).await
    }
}

// ============================================================================
// Acquisition Races
// ============================================================================

/// Two workers read `counter = 0` and both try to take the lease: exactly
/// one conditional write succeeds and only the winner holds the shard.
#[tokio::test]
async fn test_lease_race_has_single_winner() {
    let stream = SimulatedStream::with_shards(42, 1);
    let inner = SimulatedLeaseTable::new(42);
    inner
        .create_lease_if_absent(&Lease::new(shard(0), Vec::new(), 0))
        .await
        .unwrap();
    let table = Arc::new(LockstepTable {
        inner: inner.clone(),
        barrier: Barrier::new(2),
    });

    let a = coordinator("worker-a", table.clone(), &stream, |c| c);
    let b = coordinator("worker-b", table.clone(), &stream, |c| c);

    let shard_id = shard(0);
    let (result_a, result_b) = tokio::join!(
        a.acquire_lease(&shard_id, 10),
        b.acquire_lease(&shard_id, 10)
    );
    let won_a = result_a.unwrap().is_some();
    let won_b = result_b.unwrap().is_some();
    assert!(won_a ^ won_b, "exactly one worker must win (a={won_a}, b={won_b})");

    let (winner, loser) = if won_a { (&a, &b) } else { (&b, &a) };
    assert_eq!(winner.held_shards(), vec![shard(0)]);
    assert!(loser.held_shards().is_empty());
    assert!(loser.shard_checkpointer(&shard(0)).is_none());

    let stored = inner.get_lease(&shard(0)).await.unwrap().unwrap();
    assert_eq!(stored.counter, LeaseCounter::new(1));
    assert_eq!(stored.owner.as_ref(), Some(winner.worker_id()));
}

#[tokio::test]
async fn test_lease_race_many_workers() {
    const WORKERS: usize = 6;

    let stream = SimulatedStream::with_shards(42, 1);
    let inner = SimulatedLeaseTable::new(7);
    inner
        .create_lease_if_absent(&Lease::new(shard(0), Vec::new(), 0))
        .await
        .unwrap();
    let table = Arc::new(LockstepTable {
        inner: inner.clone(),
        barrier: Barrier::new(WORKERS),
    });

    let coordinators: Vec<_> = (0..WORKERS)
        .map(|i| coordinator(&format!("worker-{i}"), table.clone(), &stream, |c| c))
        .collect();
    let shard_id = shard(0);
    let results = join_all(coordinators.iter().map(|c| c.acquire_lease(&shard_id, 10))).await;

    let winners = results
        .into_iter()
        .filter(|result| matches!(result, Ok(Some(_))))
        .count();
    assert_eq!(winners, 1);
    assert_eq!(
        coordinators
            .iter()
            .filter(|c| !c.held_shards().is_empty())
            .count(),
        1
    );

    let mut checker = LeaseTableChecker::new();
    checker.record_history(&inner.write_history());
    checker.assert_valid();
}

// ============================================================================
// Expiry and Stealing
// ============================================================================

/// A renewed lease is not acquirable; one that missed renewals past the
/// failover timeout is.
#[tokio::test]
async fn test_lease_expiry_and_renewal() {
    let stream = SimulatedStream::with_shards(42, 1);
    let table = Arc::new(SimulatedLeaseTable::new(42));
    let a = coordinator("worker-a", table.clone(), &stream, |c| c);
    let b = coordinator("worker-b", table.clone(), &stream, |c| c);
    a.sync_shards(0).await.unwrap();

    a.acquire_lease(&shard(0), 0).await.unwrap().unwrap();
    a.renew_lease(&shard(0), 400_000).await.unwrap();

    // 200ms since the renewal: still fresh.
    assert!(b.acquire_lease(&shard(0), 600_000).await.unwrap().is_none());
    // Exactly at the timeout: still fresh.
    assert!(b
        .acquire_lease(&shard(0), 400_000 + FAILOVER_US)
        .await
        .unwrap()
        .is_none());

    let stolen = b
        .acquire_lease(&shard(0), 400_000 + FAILOVER_US + 1)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stolen.owner, Some(WorkerId::new("worker-b")));
    assert_eq!(stolen.counter, LeaseCounter::new(3));

    // The previous owner finds out on its next renewal, without retrying.
    let result = a.renew_lease(&shard(0), 1_000_000).await;
    assert!(matches!(result, Err(LeaseError::LeaseLost { .. })));
    assert!(a.held_shards().is_empty());
    assert!(a.renew_lease(&shard(0), 1_000_001).await.is_err());

    let stored = table.get_lease(&shard(0)).await.unwrap().unwrap();
    assert_eq!(stored, stolen);
}

#[tokio::test]
async fn test_stolen_lease_keeps_checkpoint() {
    let stream = SimulatedStream::with_shards(42, 1);
    let table = Arc::new(SimulatedLeaseTable::new(42));
    let a = coordinator("worker-a", table.clone(), &stream, |c| c);
    let b = coordinator("worker-b", table.clone(), &stream, |c| c);
    a.sync_shards(0).await.unwrap();

    a.acquire_lease(&shard(0), 0).await.unwrap().unwrap();
    a.shard_checkpointer(&shard(0))
        .unwrap()
        .checkpoint(Checkpoint::TrimHorizon)
        .await
        .unwrap();

    let stolen = b.acquire_lease(&shard(0), FAILOVER_US + 1).await.unwrap().unwrap();
    assert_eq!(stolen.checkpoint, Some(Checkpoint::TrimHorizon));
    assert_eq!(b.get_checkpoint(&shard(0)).await.unwrap(), Some(Checkpoint::TrimHorizon));
}

#[tokio::test]
async fn test_released_lease_is_immediately_acquirable() {
    let stream = SimulatedStream::with_shards(42, 1);
    let table = Arc::new(SimulatedLeaseTable::new(42));
    let a = coordinator("worker-a", table.clone(), &stream, |c| c);
    let b = coordinator("worker-b", table.clone(), &stream, |c| c);
    a.sync_shards(0).await.unwrap();

    a.acquire_lease(&shard(0), 0).await.unwrap().unwrap();
    let handle = a.shard_checkpointer(&shard(0)).unwrap();
    a.release_lease(&shard(0), 10).await.unwrap();
    assert!(handle.is_revoked());

    let taken = b.acquire_lease(&shard(0), 20).await.unwrap().unwrap();
    assert_eq!(taken.owner, Some(WorkerId::new("worker-b")));
    assert_eq!(taken.counter, LeaseCounter::new(3));

    // The released handle cannot write over the new owner.
    let result = handle.checkpoint(Checkpoint::TrimHorizon).await;
    assert!(matches!(result, Err(LeaseError::LeaseLost { .. })));
}

// ============================================================================
// Assignment
// ============================================================================

/// Workers fill up to their cap in ascending shard order, and a second
/// worker picks up what the first left.
#[tokio::test]
async fn test_take_leases_splits_shards_between_workers() {
    let stream = SimulatedStream::with_shards(42, 6);
    let table = Arc::new(SimulatedLeaseTable::new(42));
    let a = coordinator("worker-a", table.clone(), &stream, |c| c.with_max_leases(3));
    let b = coordinator("worker-b", table.clone(), &stream, |c| c.with_max_leases(3));
    a.sync_shards(0).await.unwrap();

    let taken_a: Vec<ShardId> = a.take_leases(0).await.unwrap().into_iter().map(|l| l.shard_id).collect();
    let taken_b: Vec<ShardId> = b.take_leases(0).await.unwrap().into_iter().map(|l| l.shard_id).collect();

    assert_eq!(taken_a, vec![shard(0), shard(1), shard(2)]);
    assert_eq!(taken_b, vec![shard(3), shard(4), shard(5)]);
    assert!(a.take_leases(0).await.unwrap().is_empty());

    // Every row has exactly one owner.
    for lease in table.snapshot() {
        let owner = lease.owner.expect("every lease owned");
        let expected = if taken_a.contains(&lease.shard_id) { "worker-a" } else { "worker-b" };
        assert_eq!(owner, WorkerId::new(expected));
    }
}

/// When a worker dies, the survivors take over its leases once they expire.
#[tokio::test]
async fn test_take_leases_after_worker_death() {
    let stream = SimulatedStream::with_shards(42, 4);
    let table = Arc::new(SimulatedLeaseTable::new(42));
    let a = coordinator("worker-a", table.clone(), &stream, |c| c.with_max_leases(2));
    let b = coordinator("worker-b", table.clone(), &stream, |c| c);
    a.sync_shards(0).await.unwrap();

    assert_eq!(a.take_leases(0).await.unwrap().len(), 2);
    assert_eq!(b.take_leases(0).await.unwrap().len(), 2);

    // Worker a stops renewing. Worker b keeps renewing its own.
    for shard_id in b.held_shards() {
        b.renew_lease(&shard_id, 400_000).await.unwrap();
    }
    assert!(b.take_leases(400_000).await.unwrap().is_empty());

    let taken = b.take_leases(FAILOVER_US + 1).await.unwrap();
    assert_eq!(
        taken.into_iter().map(|l| l.shard_id).collect::<Vec<_>>(),
        vec![shard(0), shard(1)]
    );
    assert_eq!(b.held_shards().len(), 4);

    let mut checker = LeaseTableChecker::with_fleet(["worker-a", "worker-b"]);
    checker.record_history(&table.write_history());
    checker.record_snapshot(&table.snapshot());
    checker.assert_valid();
}

#[tokio::test]
async fn test_acquire_surfaces_store_unavailable() {
    let stream = SimulatedStream::with_shards(42, 1);
    let table = Arc::new(SimulatedLeaseTable::new(42));
    let a = coordinator("worker-a", table.clone(), &stream, |c| c);
    a.sync_shards(0).await.unwrap();

    table.fault_config().force_read_fail = true;
    let result = a.acquire_lease(&shard(0), 0).await;
    assert!(matches!(result, Err(LeaseError::StoreUnavailable { .. })));
    assert!(a.held_shards().is_empty());

    assert!(a.acquire_lease(&shard(0), 0).await.unwrap().is_some());
}

#[tokio::test]
async fn test_acquire_unknown_shard_is_not_found() {
    let stream = SimulatedStream::with_shards(42, 1);
    let table = Arc::new(SimulatedLeaseTable::new(42));
    let a = coordinator("worker-a", table, &stream, |c| c);

    let result = a.acquire_lease(&shard(0), 0).await;
    assert!(matches!(result, Err(LeaseError::LeaseNotFound { .. })));
}

// ============================================================================
// Shard Discovery and Cleanup
// ============================================================================

#[tokio::test]
async fn test_sync_discovers_children_after_split() {
    let stream = SimulatedStream::with_shards(42, 2);
    let table = Arc::new(SimulatedLeaseTable::new(42));
    let a = coordinator("worker-a", table.clone(), &stream, |c| c);
    assert_eq!(a.sync_shards(0).await.unwrap(), 2);

    stream.split_shard(&shard(0), &[shard(2), shard(3)]).unwrap();
    assert_eq!(a.sync_shards(0).await.unwrap(), 2);

    let child = table.get_lease(&shard(2)).await.unwrap().unwrap();
    assert_eq!(child.parent_shard_ids, vec![shard(0)]);
    assert!(child.owner.is_none());
    assert!(child.checkpoint.is_none());

    let listed = a.list_shards().await.unwrap();
    assert_eq!(listed.len(), 4);
}

/// A child that sorts before its parent gets no lease while the parent's
/// create fails, so it cannot start ahead of the parent's records.
#[tokio::test]
async fn test_sync_creates_parent_lease_before_child() {
    let stream = SimulatedStream::with_shards(42, 1);
    let child = ShardId::new("child-a");
    stream.split_shard(&shard(0), &[child.clone()]).unwrap();
    let table = Arc::new(SimulatedLeaseTable::new(42));
    let a = coordinator("worker-a", table.clone(), &stream, |c| c);

    table.fault_config().force_write_failures = 1;
    let result = a.sync_shards(0).await;
    assert!(matches!(result, Err(LeaseError::StoreUnavailable { .. })));
    assert!(table.snapshot().is_empty());

    assert_eq!(a.sync_shards(10).await.unwrap(), 2);
    let stored = table.get_lease(&child).await.unwrap().unwrap();
    assert_eq!(stored.parent_shard_ids, vec![shard(0)]);
    assert!(!a.parents_completed(&stored.parent_shard_ids).await.unwrap());
}

#[tokio::test]
async fn test_sync_continues_past_failed_create() {
    let stream = SimulatedStream::with_shards(42, 3);
    let table = Arc::new(SimulatedLeaseTable::new(42));
    let a = coordinator("worker-a", table.clone(), &stream, |c| c);

    table.fault_config().force_write_failures = 1;
    assert!(a.sync_shards(0).await.is_err());
    assert_eq!(table.snapshot().len(), 2);

    assert_eq!(a.sync_shards(10).await.unwrap(), 1);
    assert_eq!(table.snapshot().len(), 3);
}

/// A finished parent is deleted once its children started, and shard sync
/// does not bring it back.
#[tokio::test]
async fn test_cleanup_then_sync_does_not_resurrect_parent() {
    let stream = SimulatedStream::with_shards(42, 1);
    stream.split_shard(&shard(0), &[shard(1)]).unwrap();
    let table = Arc::new(SimulatedLeaseTable::new(42));
    let a = coordinator("worker-a", table.clone(), &stream, |c| c);
    a.sync_shards(0).await.unwrap();

    // Parent drained and released.
    a.acquire_lease(&shard(0), 0).await.unwrap().unwrap();
    a.shard_checkpointer(&shard(0))
        .unwrap()
        .checkpoint_shard_end()
        .await
        .unwrap();

    // Still owned: not deleted.
    assert_eq!(a.cleanup_terminated_leases().await.unwrap(), 0);
    a.release_lease(&shard(0), 10).await.unwrap();

    // Child not started yet: not deleted.
    assert_eq!(a.cleanup_terminated_leases().await.unwrap(), 0);
    assert!(a.parents_completed(&[shard(0)]).await.unwrap());

    a.acquire_lease(&shard(1), 20).await.unwrap().unwrap();
    a.shard_checkpointer(&shard(1))
        .unwrap()
        .checkpoint(Checkpoint::TrimHorizon)
        .await
        .unwrap();

    assert_eq!(a.cleanup_terminated_leases().await.unwrap(), 1);
    assert!(table.get_lease(&shard(0)).await.unwrap().is_none());
    assert_eq!(a.sync_shards(30).await.unwrap(), 0);
    assert!(table.get_lease(&shard(0)).await.unwrap().is_none());

    // A deleted parent counts as completed.
    assert!(a.parents_completed(&[shard(0)]).await.unwrap());

    let mut checker = LeaseTableChecker::new();
    checker.record_history(&table.write_history());
    checker.assert_valid();
}
