//! Lease table abstraction.
//!
//! Provides the `LeaseTable` trait, a compare-and-swap store holding one
//! lease row per shard, and `SimulatedLeaseTable` for deterministic
//! simulation testing.

#![allow(clippy::significant_drop_tightening)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, MutexGuard};
use shoal_core::{LeaseCounter, ShardId};

use crate::error::{LeaseError, LeaseResult};
use crate::types::Lease;

// -----------------------------------------------------------------------------
// Lease Table Trait
// -----------------------------------------------------------------------------

/// Lease table trait for persistence.
///
/// Every mutation is conditional on the counter the writer last observed.
/// This is the only mechanism preventing two workers from clobbering each
/// other, since ownership spans process boundaries.
#[async_trait]
pub trait LeaseTable: Send + Sync + 'static {
    /// Creates `lease` if no row exists for its shard.
    ///
    /// Returns true if the row was created.
    async fn create_lease_if_absent(&self, lease: &Lease) -> LeaseResult<bool>;

    /// Gets the lease for a shard.
    ///
    /// Returns `None` if no row exists.
    async fn get_lease(&self, shard_id: &ShardId) -> LeaseResult<Option<Lease>>;

    /// Lists every lease row, ordered by shard id.
    async fn list_leases(&self) -> LeaseResult<Vec<Lease>>;

    /// Replaces the row with `lease` if the stored counter equals
    /// `expected_counter`.
    ///
    /// # Errors
    ///
    /// Returns `ConditionFailed` if the stored counter differs and
    /// `LeaseNotFound` if the row does not exist.
    async fn update_lease(&self, lease: &Lease, expected_counter: LeaseCounter)
        -> LeaseResult<()>;

    /// Deletes the row if the stored counter equals `expected_counter`.
    ///
    /// # Errors
    ///
    /// Returns `ConditionFailed` if the stored counter differs.
    async fn delete_lease(&self, shard_id: &ShardId, expected_counter: LeaseCounter)
        -> LeaseResult<()>;
}

// -----------------------------------------------------------------------------
// Fault Configuration
// -----------------------------------------------------------------------------

/// Fault configuration for the simulated lease table.
#[derive(Debug, Clone, Default)]
pub struct LeaseTableFaultConfig {
    /// Probability of read operations failing (0.0 - 1.0).
    pub read_fail_rate: f64,
    /// Probability of conditional writes failing (0.0 - 1.0).
    pub write_fail_rate: f64,
    /// Force next read to fail (one-shot).
    pub force_read_fail: bool,
    /// Force the next N writes to fail.
    pub force_write_failures: u32,
}

impl LeaseTableFaultConfig {
    /// No faults (all operations succeed).
    #[must_use]
    pub const fn none() -> Self {
        Self {
            read_fail_rate: 0.0,
            write_fail_rate: 0.0,
            force_read_fail: false,
            force_write_failures: 0,
        }
    }

    /// Flaky configuration for stress testing.
    #[must_use]
    pub const fn flaky() -> Self {
        Self {
            read_fail_rate: 0.05,
            write_fail_rate: 0.05,
            force_read_fail: false,
            force_write_failures: 0,
        }
    }

    /// Builder: set read fail rate.
    #[must_use]
    pub const fn with_read_fail_rate(mut self, rate: f64) -> Self {
        self.read_fail_rate = rate;
        self
    }

    /// Builder: set write fail rate.
    #[must_use]
    pub const fn with_write_fail_rate(mut self, rate: f64) -> Self {
        self.write_fail_rate = rate;
        self
    }
}

// -----------------------------------------------------------------------------
// Write History
// -----------------------------------------------------------------------------

/// Kind of accepted lease table mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteKind {
    /// Row created by shard sync.
    Create,
    /// Conditional update.
    Update,
    /// Conditional delete.
    Delete,
}

/// One accepted mutation, recorded for invariant checking.
#[derive(Debug, Clone)]
pub struct LeaseWrite {
    /// Kind of mutation.
    pub kind: WriteKind,
    /// Row contents after the mutation (before it, for deletes).
    pub lease: Lease,
}

#[derive(Debug, Default)]
struct TableState {
    leases: BTreeMap<ShardId, Lease>,
    history: Vec<LeaseWrite>,
}

// -----------------------------------------------------------------------------
// Simulated Lease Table
// -----------------------------------------------------------------------------

/// In-memory simulated lease table for DST.
///
/// Clones share state via `Arc`, so several workers in one test can use the
/// same table. Supports deterministic fault injection for testing error paths.
#[derive(Debug, Clone)]
pub struct SimulatedLeaseTable {
    /// Lease rows and accepted write history.
    state: Arc<Mutex<TableState>>,
    /// Fault configuration.
    fault_config: Arc<Mutex<LeaseTableFaultConfig>>,
    /// RNG seed for deterministic faults.
    seed: u64,
    /// Operation counter for deterministic RNG.
    counter: Arc<AtomicU64>,
}

impl SimulatedLeaseTable {
    /// Creates a new simulated table with no faults.
    #[must_use]
    pub fn new(seed: u64) -> Self {
        Self::with_faults(seed, LeaseTableFaultConfig::none())
    }

    /// Creates a simulated table with fault injection.
    #[must_use]
    pub fn with_faults(seed: u64, config: LeaseTableFaultConfig) -> Self {
        Self {
            state: Arc::new(Mutex::new(TableState::default())),
            fault_config: Arc::new(Mutex::new(config)),
            seed,
            counter: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Returns fault config for modification.
    pub fn fault_config(&self) -> MutexGuard<'_, LeaseTableFaultConfig> {
        self.fault_config.lock()
    }

    /// Returns all leases (bypasses faults, for invariant checking in tests).
    #[must_use]
    pub fn snapshot(&self) -> Vec<Lease> {
        let state = self.state.lock();
        state.leases.values().cloned().collect()
    }

    /// Returns every accepted mutation in acceptance order.
    #[must_use]
    pub fn write_history(&self) -> Vec<LeaseWrite> {
        let state = self.state.lock();
        state.history.clone()
    }

    /// Overwrites a row unconditionally (administrative, for test setup).
    pub fn put_lease(&self, lease: Lease) {
        let mut state = self.state.lock();
        state.history.push(LeaseWrite {
            kind: WriteKind::Update,
            lease: lease.clone(),
        });
        state.leases.insert(lease.shard_id.clone(), lease);
    }

    /// Deterministic RNG: `(seed + counter) * M`.
    fn should_inject_fault(&self, rate: f64) -> bool {
        if rate <= 0.0 {
            return false;
        }
        if rate >= 1.0 {
            return true;
        }
        let counter = self.counter.fetch_add(1, Ordering::Relaxed);
        let hash = self
            .seed
            .wrapping_add(counter)
            .wrapping_mul(0x9e37_79b9_7f4a_7c15);
        #[allow(clippy::cast_precision_loss)]
        let normalized = (hash as f64) / (u64::MAX as f64);
        normalized < rate
    }

    fn check_read_fault(&self, operation: &'static str) -> LeaseResult<()> {
        {
            let mut config = self.fault_config.lock();
            if config.force_read_fail {
                config.force_read_fail = false;
                return Err(LeaseError::StoreUnavailable {
                    operation,
                    message: "simulated failure (forced)".into(),
                });
            }
        }
        let rate = self.fault_config.lock().read_fail_rate;
        if self.should_inject_fault(rate) {
            return Err(LeaseError::StoreUnavailable {
                operation,
                message: "simulated failure (random)".into(),
            });
        }
        Ok(())
    }

    fn check_write_fault(&self, operation: &'static str) -> LeaseResult<()> {
        {
            let mut config = self.fault_config.lock();
            if config.force_write_failures > 0 {
                config.force_write_failures -= 1;
                return Err(LeaseError::StoreUnavailable {
                    operation,
                    message: "simulated failure (forced)".into(),
                });
            }
        }
        let rate = self.fault_config.lock().write_fail_rate;
        if self.should_inject_fault(rate) {
            return Err(LeaseError::StoreUnavailable {
                operation,
                message: "simulated failure (random)".into(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl LeaseTable for SimulatedLeaseTable {
    async fn create_lease_if_absent(&self, lease: &Lease) -> LeaseResult<bool> {
        self.check_write_fault("create_lease_if_absent")?;

        let mut state = self.state.lock();
        if state.leases.contains_key(&lease.shard_id) {
            return Ok(false);
        }
        state.leases.insert(lease.shard_id.clone(), lease.clone());
        state.history.push(LeaseWrite {
            kind: WriteKind::Create,
            lease: lease.clone(),
        });
        Ok(true)
    }

    async fn get_lease(&self, shard_id: &ShardId) -> LeaseResult<Option<Lease>> {
        self.check_read_fault("get_lease")?;

        let state = self.state.lock();
        Ok(state.leases.get(shard_id).cloned())
    }

    async fn list_leases(&self) -> LeaseResult<Vec<Lease>> {
        self.check_read_fault("list_leases")?;

        let state = self.state.lock();
        Ok(state.leases.values().cloned().collect())
    }

    async fn update_lease(
        &self,
        lease: &Lease,
        expected_counter: LeaseCounter,
    ) -> LeaseResult<()> {
        // TigerStyle: Assert precondition.
        assert!(
            lease.counter > expected_counter,
            "update must advance the counter ({} -> {})",
            expected_counter,
            lease.counter
        );

        self.check_write_fault("update_lease")?;

        let mut state = self.state.lock();
        let stored = state
            .leases
            .get_mut(&lease.shard_id)
            .ok_or_else(|| LeaseError::LeaseNotFound {
                shard_id: lease.shard_id.clone(),
            })?;
        if stored.counter != expected_counter {
            return Err(LeaseError::ConditionFailed {
                shard_id: lease.shard_id.clone(),
                expected: expected_counter,
                actual: stored.counter,
            });
        }
        *stored = lease.clone();
        state.history.push(LeaseWrite {
            kind: WriteKind::Update,
            lease: lease.clone(),
        });
        Ok(())
    }

    async fn delete_lease(
        &self,
        shard_id: &ShardId,
        expected_counter: LeaseCounter,
    ) -> LeaseResult<()> {
        self.check_write_fault("delete_lease")?;

        let mut state = self.state.lock();
        let Some(stored) = state.leases.get(shard_id) else {
            return Ok(());
        };
        if stored.counter != expected_counter {
            return Err(LeaseError::ConditionFailed {
                shard_id: shard_id.clone(),
                expected: expected_counter,
                actual: stored.counter,
            });
        }
        if let Some(removed) = state.leases.remove(shard_id) {
            state.history.push(LeaseWrite {
                kind: WriteKind::Delete,
                lease: removed,
            });
        }
        Ok(())
    }
}

// -----------------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------------
