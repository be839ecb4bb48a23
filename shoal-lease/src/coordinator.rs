//! Lease coordinator: shard discovery, lease acquisition and renewal.
//!
//! The `LeaseCoordinator` decides which shards this worker should consume:
//! - Shard sync creates a lease row for every newly discovered shard
//! - `take_leases` acquires unowned or expired leases up to the worker's cap
//! - `renew_lease` keeps held leases alive and detects takeovers
//! - `release_lease` gives a lease back on graceful shutdown
//! - Terminated-shard cleanup deletes leases no longer needed
//!
//! All mutations are conditional writes through the `LeaseTable`.
//! Timestamps are passed explicitly so expiry is testable with a manual clock.

#![allow(clippy::significant_drop_tightening)]

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use shoal_core::{Checkpoint, Clock, LeaseCounter, ShardId, WorkerId};
use shoal_stream::{ShardInfo, StreamTransport};
use tracing::{debug, info, warn};

use crate::checkpointer::{Checkpointer, ShardCheckpointer};
use crate::error::{LeaseError, LeaseResult};
use crate::held::HeldLease;
use crate::monitor::MonitoringService;
use crate::table::LeaseTable;
use crate::types::{Lease, LeaseConfig};

// -----------------------------------------------------------------------------
// Lease Coordinator
// -----------------------------------------------------------------------------

/// Lease coordinator for one worker.
///
/// # Design
///
/// There is no central scheduler. Every worker independently takes leases
/// that are unowned or expired, in ascending shard order, until it holds
/// `max_leases_for_worker`. A lease is eligible for takeover once it has not
/// been renewed for `failover_timeout`, whether or not its owner is alive, so
/// two workers may briefly both believe they own a shard. The counter fence
/// keeps the stale owner from writing; delivery is at-least-once.
///
/// The coordinator does NOT run background work. The worker calls
/// `sync_shards`, `take_leases` and `renew_lease` on its own schedule.
pub struct LeaseCoordinator<T: LeaseTable> {
    /// Lease table backend.
    table: Arc<T>,
    /// Source of the shard listing.
    transport: Arc<dyn StreamTransport>,
    /// Metrics sink.
    monitor: Arc<dyn MonitoringService>,
    /// Fenced checkpoint writer sharing the table.
    checkpointer: Checkpointer,
    /// Configuration.
    config: LeaseConfig,
    /// Leases this worker currently holds.
    held: Mutex<BTreeMap<ShardId, Arc<HeldLease>>>,
    /// Shards this worker skips in `take_leases` until the given time (µs).
    backed_off: Mutex<BTreeMap<ShardId, u64>>,
}

impl<T: LeaseTable> fmt::Debug for LeaseCoordinator<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LeaseCoordinator")
            .field("worker_id", &self.config.worker_id)
            .field("held", &self.held_shards())
            .finish_non_exhaustive()
    }
}

impl<T: LeaseTable> LeaseCoordinator<T> {
    /// Creates a coordinator.
    #[must_use]
    pub fn new(
        table: Arc<T>,
        transport: Arc<dyn StreamTransport>,
        monitor: Arc<dyn MonitoringService>,
        clock: Arc<dyn Clock>,
        config: LeaseConfig,
    ) -> Self {
        // TigerStyle: Assert preconditions.
        assert!(config.failover_timeout_us > 0, "failover timeout must be positive");
        assert!(config.max_leases_for_worker > 0, "max leases must be positive");

        let checkpointer = Checkpointer::new(
            table.clone(),
            monitor.clone(),
            clock,
            config.store_retry,
        );
        Self {
            table,
            transport,
            monitor,
            checkpointer,
            config,
            held: Mutex::new(BTreeMap::new()),
            backed_off: Mutex::new(BTreeMap::new()),
        }
    }

    /// Returns the lease table.
    #[must_use]
    pub fn table(&self) -> &T {
        &self.table
    }

    /// Returns the configuration.
    #[must_use]
    pub const fn config(&self) -> &LeaseConfig {
        &self.config
    }

    /// Returns this worker's identity.
    #[must_use]
    pub const fn worker_id(&self) -> &WorkerId {
        &self.config.worker_id
    }

    /// Returns the fenced checkpoint writer.
    #[must_use]
    pub const fn checkpointer(&self) -> &Checkpointer {
        &self.checkpointer
    }

    /// Returns the stream transport.
    #[must_use]
    pub const fn transport(&self) -> &Arc<dyn StreamTransport> {
        &self.transport
    }

    /// Returns the monitoring service.
    #[must_use]
    pub const fn monitor(&self) -> &Arc<dyn MonitoringService> {
        &self.monitor
    }

    // -------------------------------------------------------------------------
    // Shard Discovery
    // -------------------------------------------------------------------------

    /// Lists every shard with its parents. Pure read.
    ///
    /// # Errors
    ///
    /// Returns `Stream` if the transport fails.
    pub async fn list_shards(&self) -> LeaseResult<Vec<ShardInfo>> {
        Ok(self.transport.list_shards().await?)
    }

    /// Creates an unowned lease for every listed shard that has none.
    ///
    /// Parents are created before their children, and a child is only
    /// created once every listed parent has a lease. A missing parent lease
    /// therefore always means cleanup deleted it after it completed.
    ///
    /// A shard whose child has already started is skipped: its lease was
    /// deleted by cleanup and must not be recreated. A failed create does not
    /// stop the sync; its descendants wait for the next one. Returns the
    /// number of leases created.
    ///
    /// # Errors
    ///
    /// Returns `TooManyShards` if the listing exceeds `max_shards`, error if
    /// the listing fails, or the first create failure once every other shard
    /// has been attempted.
    pub async fn sync_shards(&self, current_time_us: u64) -> LeaseResult<usize> {
        let shards = self.list_shards().await?;
        if shards.len() > self.config.max_shards as usize {
            return Err(LeaseError::TooManyShards {
                listed: shards.len(),
                max: self.config.max_shards,
            });
        }
        let leases: BTreeMap<ShardId, Lease> = self
            .table
            .list_leases()
            .await?
            .into_iter()
            .map(|lease| (lease.shard_id.clone(), lease))
            .collect();

        let started_children_of: BTreeSet<&ShardId> = shards
            .iter()
            .filter(|shard| {
                leases
                    .get(&shard.shard_id)
                    .is_some_and(|lease| lease.checkpoint.is_some())
            })
            .flat_map(|shard| shard.parent_shard_ids.iter())
            .collect();
        let listed: BTreeSet<&ShardId> = shards.iter().map(|shard| &shard.shard_id).collect();

        let mut present: BTreeSet<&ShardId> = leases.keys().collect();
        let mut pending: Vec<&ShardInfo> = shards
            .iter()
            .filter(|shard| {
                !present.contains(&shard.shard_id)
                    && !started_children_of.contains(&shard.shard_id)
            })
            .collect();

        let mut created = 0;
        let mut first_error = None;
        loop {
            let (ready, blocked): (Vec<&ShardInfo>, Vec<&ShardInfo>) =
                pending.into_iter().partition(|shard| {
                    shard.parent_shard_ids.iter().all(|parent| {
                        !listed.contains(parent)
                            || present.contains(parent)
                            || started_children_of.contains(parent)
                    })
                });
            if ready.is_empty() {
                for shard in &blocked {
                    debug!(shard_id = %shard.shard_id, "Deferred lease until parent lease exists");
                }
                break;
            }

            for shard in ready {
                let lease = Lease::new(
                    shard.shard_id.clone(),
                    shard.parent_shard_ids.clone(),
                    current_time_us,
                );
                match self.table.create_lease_if_absent(&lease).await {
                    Ok(inserted) => {
                        present.insert(&shard.shard_id);
                        if inserted {
                            created += 1;
                            info!(
                                shard_id = %shard.shard_id,
                                parents = shard.parent_shard_ids.len(),
                                "Created lease for new shard"
                            );
                        }
                    }
                    Err(err) => {
                        warn!(shard_id = %shard.shard_id, error = %err, "Failed to create lease");
                        if first_error.is_none() {
                            first_error = Some(err);
                        }
                    }
                }
            }
            pending = blocked;
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(created),
        }
    }

    // -------------------------------------------------------------------------
    // Lease Ownership
    // -------------------------------------------------------------------------

    /// Tries to acquire the lease of `shard_id`.
    ///
    /// Succeeds only if the lease is unowned, expired, or recorded as owned
    /// by this worker (after a restart). Losing the race to another worker is
    /// a denial (`Ok(None)`), not an error.
    ///
    /// # Errors
    ///
    /// Returns `LeaseNotFound` if no row exists and `StoreUnavailable` on
    /// transient table failure.
    pub async fn acquire_lease(
        &self,
        shard_id: &ShardId,
        current_time_us: u64,
    ) -> LeaseResult<Option<Lease>> {
        if let Some(held) = self.held_lease(shard_id) {
            return Ok(Some(held.snapshot().await));
        }

        let current = self
            .table
            .get_lease(shard_id)
            .await?
            .ok_or_else(|| LeaseError::LeaseNotFound {
                shard_id: shard_id.clone(),
            })?;

        if !current.is_available_to(
            &self.config.worker_id,
            self.config.failover_timeout_us,
            current_time_us,
        ) {
            debug!(shard_id = %shard_id, owner = ?current.owner, "Lease held by another worker");
            return Ok(None);
        }

        let mut next = current.next_version(current_time_us);
        next.owner = Some(self.config.worker_id.clone());

        match self.table.update_lease(&next, current.counter).await {
            Ok(()) => {}
            Err(LeaseError::ConditionFailed { actual, .. }) => {
                debug!(shard_id = %shard_id, counter = %actual, "Lost race to acquire lease");
                return Ok(None);
            }
            Err(LeaseError::LeaseNotFound { .. }) => return Ok(None),
            Err(err) => return Err(err),
        }

        match &current.owner {
            Some(previous) if previous != &self.config.worker_id => info!(
                shard_id = %shard_id,
                worker_id = %self.config.worker_id,
                previous_owner = %previous,
                counter = %next.counter,
                "Took over expired lease"
            ),
            _ => info!(
                shard_id = %shard_id,
                worker_id = %self.config.worker_id,
                counter = %next.counter,
                "Acquired lease"
            ),
        }

        self.held
            .lock()
            .insert(shard_id.clone(), Arc::new(HeldLease::new(next.clone())));
        self.monitor.lease_gained(shard_id);
        Ok(Some(next))
    }

    /// Renews a held lease: bumps the counter and refreshes
    /// `last_update_us`, conditioned on the last-known counter.
    ///
    /// # Errors
    ///
    /// Returns `LeaseLost` if the lease is not held or was taken over; the
    /// lease is then dropped and marked lost. Returns `StoreUnavailable` on
    /// transient failure; the lease stays held.
    pub async fn renew_lease(&self, shard_id: &ShardId, current_time_us: u64) -> LeaseResult<()> {
        let held = self.held_lease(shard_id).ok_or_else(|| LeaseError::LeaseLost {
            shard_id: shard_id.clone(),
            fence_token: LeaseCounter::default(),
        })?;

        let mut lease = held.lock().await;
        if held.is_lost() {
            return Err(LeaseError::LeaseLost {
                shard_id: shard_id.clone(),
                fence_token: lease.counter,
            });
        }

        let next = lease.next_version(current_time_us);
        match self.table.update_lease(&next, lease.counter).await {
            Ok(()) => {
                debug!(shard_id = %shard_id, counter = %next.counter, "Renewed lease");
                *lease = next;
                self.monitor.lease_renewed(shard_id);
                Ok(())
            }
            Err(LeaseError::ConditionFailed { .. } | LeaseError::LeaseNotFound { .. }) => {
                let fence_token = lease.counter;
                drop(lease);
                self.drop_lease(&held);
                warn!(
                    shard_id = %shard_id,
                    worker_id = %self.config.worker_id,
                    counter = %fence_token,
                    "Lease lost during renewal"
                );
                Err(LeaseError::LeaseLost {
                    shard_id: shard_id.clone(),
                    fence_token,
                })
            }
            Err(err) => {
                warn!(shard_id = %shard_id, error = %err, "Lease renewal failed");
                Err(err)
            }
        }
    }

    /// Gives a held lease back so another worker can acquire it immediately.
    ///
    /// Clears `owner` with a single counter bump. The checkpoint is kept.
    /// Releasing a lease that is not held is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `LeaseLost` if the lease had been taken over, and
    /// `StoreUnavailable` on transient failure. The lease is dropped from the
    /// held set in every case.
    pub async fn release_lease(&self, shard_id: &ShardId, current_time_us: u64) -> LeaseResult<()> {
        let Some(held) = self.held.lock().remove(shard_id) else {
            return Ok(());
        };

        let lease = held.lock().await;
        held.mark_lost();
        self.monitor.lease_lost(shard_id);

        let mut next = lease.next_version(current_time_us);
        next.owner = None;
        match self.table.update_lease(&next, lease.counter).await {
            Ok(()) => {
                info!(
                    shard_id = %shard_id,
                    worker_id = %self.config.worker_id,
                    counter = %next.counter,
                    "Released lease"
                );
                Ok(())
            }
            Err(LeaseError::ConditionFailed { .. } | LeaseError::LeaseNotFound { .. }) => {
                debug!(shard_id = %shard_id, "Lease already taken over at release");
                Err(LeaseError::LeaseLost {
                    shard_id: shard_id.clone(),
                    fence_token: lease.counter,
                })
            }
            Err(err) => Err(err),
        }
    }

    /// Forgets a held lease without writing to the table.
    ///
    /// Used after a zombie shutdown, where another worker already owns the
    /// row.
    pub fn forget_lease(&self, shard_id: &ShardId) {
        if let Some(held) = self.held.lock().remove(shard_id) {
            held.mark_lost();
            self.monitor.lease_lost(shard_id);
        }
    }

    /// Keeps `shard_id` out of this worker's `take_leases` until
    /// `until_us`. Other workers may still take it.
    pub fn back_off_shard(&self, shard_id: &ShardId, until_us: u64) {
        debug!(shard_id = %shard_id, until_us, "Backing off from shard");
        self.backed_off.lock().insert(shard_id.clone(), until_us);
    }

    fn drop_lease(&self, held: &Arc<HeldLease>) {
        held.mark_lost();
        let mut map = self.held.lock();
        if map
            .get(held.shard_id())
            .is_some_and(|current| Arc::ptr_eq(current, held))
        {
            map.remove(held.shard_id());
            self.monitor.lease_lost(held.shard_id());
        }
    }

    /// Acquires available leases until this worker holds
    /// `max_leases_for_worker`.
    ///
    /// Candidates are leases that are unowned, expired, or recorded as owned
    /// by this worker but not held, excluding shards already at `SHARD_END`
    /// and shards this worker backed off from.
    /// They are tried in ascending shard order. Returns the leases acquired.
    ///
    /// # Errors
    ///
    /// Returns error if listing the lease table fails. Failures acquiring an
    /// individual lease are logged and skipped.
    pub async fn take_leases(&self, current_time_us: u64) -> LeaseResult<Vec<Lease>> {
        let max = self.config.max_leases_for_worker as usize;
        let mut held_count = self.held.lock().len();
        if held_count >= max {
            return Ok(Vec::new());
        }

        let held_now: BTreeSet<ShardId> = self.held_shards().into_iter().collect();
        let backed_off: BTreeSet<ShardId> = {
            let mut backed_off = self.backed_off.lock();
            backed_off.retain(|_, until_us| *until_us > current_time_us);
            backed_off.keys().cloned().collect()
        };
        let candidates: Vec<ShardId> = self
            .table
            .list_leases()
            .await?
            .into_iter()
            .filter(|lease| {
                !lease.is_shard_end()
                    && !held_now.contains(&lease.shard_id)
                    && !backed_off.contains(&lease.shard_id)
                    && lease.is_available_to(
                        &self.config.worker_id,
                        self.config.failover_timeout_us,
                        current_time_us,
                    )
            })
            .map(|lease| lease.shard_id)
            .collect();

        let mut acquired = Vec::new();
        for shard_id in candidates {
            if held_count >= max {
                break;
            }
            match self.acquire_lease(&shard_id, current_time_us).await {
                Ok(Some(lease)) => {
                    held_count += 1;
                    acquired.push(lease);
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(shard_id = %shard_id, error = %err, "Failed to acquire lease");
                }
            }
        }

        // TigerStyle: Assert postcondition.
        debug_assert!(self.held.lock().len() <= max);
        Ok(acquired)
    }

    /// Shards this worker currently holds, in ascending order.
    #[must_use]
    pub fn held_shards(&self) -> Vec<ShardId> {
        self.held.lock().keys().cloned().collect()
    }

    /// Returns the held lease handle for `shard_id`.
    #[must_use]
    pub fn held_lease(&self, shard_id: &ShardId) -> Option<Arc<HeldLease>> {
        self.held.lock().get(shard_id).cloned()
    }

    /// Creates a checkpoint handle for a held shard.
    #[must_use]
    pub fn shard_checkpointer(&self, shard_id: &ShardId) -> Option<ShardCheckpointer> {
        self.held_lease(shard_id)
            .map(|held| ShardCheckpointer::new(held, self.checkpointer.clone()))
    }

    // -------------------------------------------------------------------------
    // Progress Queries
    // -------------------------------------------------------------------------

    /// Reads the persisted checkpoint of a shard.
    ///
    /// # Errors
    ///
    /// Returns `LeaseNotFound` if no row exists.
    pub async fn get_checkpoint(&self, shard_id: &ShardId) -> LeaseResult<Option<Checkpoint>> {
        self.table
            .get_lease(shard_id)
            .await?
            .map(|lease| lease.checkpoint)
            .ok_or_else(|| LeaseError::LeaseNotFound {
                shard_id: shard_id.clone(),
            })
    }

    /// Returns true when every parent has been fully processed: its lease is
    /// at `SHARD_END`, or gone because cleanup deleted it. Shard sync never
    /// creates a child lease before its parent's, so an absent parent lease
    /// is a deleted one.
    ///
    /// # Errors
    ///
    /// Returns error if the lease table fails.
    pub async fn parents_completed(&self, parent_shard_ids: &[ShardId]) -> LeaseResult<bool> {
        for parent in parent_shard_ids {
            if let Some(lease) = self.table.get_lease(parent).await? {
                if !lease.is_shard_end() {
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }

    /// Deletes leases of terminated shards that are no longer needed.
    ///
    /// A lease is deleted once it is at `SHARD_END`, unowned, and every
    /// child shard has a lease with a checkpoint. Deletes are conditional on
    /// the observed counter. Returns the number of leases deleted.
    ///
    /// # Errors
    ///
    /// Returns error if listing the lease table fails.
    pub async fn cleanup_terminated_leases(&self) -> LeaseResult<usize> {
        let leases = self.table.list_leases().await?;

        let mut children: BTreeMap<&ShardId, Vec<&Lease>> = BTreeMap::new();
        for lease in &leases {
            for parent in &lease.parent_shard_ids {
                children.entry(parent).or_default().push(lease);
            }
        }

        let mut deleted = 0;
        for lease in &leases {
            if !lease.is_shard_end() || lease.owner.is_some() {
                continue;
            }
            let Some(kids) = children.get(&lease.shard_id) else {
                continue;
            };
            if !kids.iter().all(|child| child.checkpoint.is_some()) {
                continue;
            }
            match self.table.delete_lease(&lease.shard_id, lease.counter).await {
                Ok(()) => {
                    deleted += 1;
                    info!(shard_id = %lease.shard_id, "Deleted lease of terminated shard");
                }
                Err(err) => {
                    debug!(shard_id = %lease.shard_id, error = %err, "Skipped terminated lease cleanup");
                }
            }
        }
        Ok(deleted)
    }
}

// -----------------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------------
