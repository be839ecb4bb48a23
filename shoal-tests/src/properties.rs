//! Property definitions and checkers for Shoal lease tables.
//!
//! Properties are invariants that must hold for every accepted mutation of
//! the lease table, whatever the interleaving of workers. The checker replays
//! a `SimulatedLeaseTable` write history and also inspects snapshots.

use std::collections::{BTreeMap, BTreeSet};

use shoal_core::{Checkpoint, LeaseCounter, ShardId, WorkerId};
use shoal_lease::{Lease, LeaseWrite, WriteKind};

// ============================================================================
// Property Violation Types
// ============================================================================

/// A violation of a lease table property.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropertyViolation {
    /// An accepted mutation did not advance the lease counter.
    CounterNotIncreasing {
        /// The shard.
        shard_id: ShardId,
        /// Counter before the mutation.
        previous: LeaseCounter,
        /// Counter written by the mutation.
        written: LeaseCounter,
    },
    /// An accepted checkpoint moved backwards.
    CheckpointRegressed {
        /// The shard.
        shard_id: ShardId,
        /// Checkpoint before the mutation.
        previous: Checkpoint,
        /// Checkpoint written by the mutation.
        written: Option<Checkpoint>,
    },
    /// A row names an owner outside the fleet.
    UnknownOwner {
        /// The shard.
        shard_id: ShardId,
        /// The owner recorded in the row.
        owner: WorkerId,
    },
    /// A snapshot contains two rows for one shard.
    DuplicateRow {
        /// The shard.
        shard_id: ShardId,
    },
}

impl std::fmt::Display for PropertyViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CounterNotIncreasing {
                shard_id,
                previous,
                written,
            } => write!(
                f,
                "Counter for {shard_id} did not increase: {previous} -> {written}"
            ),
            Self::CheckpointRegressed {
                shard_id,
                previous,
                written,
            } => write!(
                f,
                "Checkpoint for {shard_id} regressed: {previous} -> {written:?}"
            ),
            Self::UnknownOwner { shard_id, owner } => {
                write!(f, "Lease {shard_id} owned by unknown worker {owner}")
            }
            Self::DuplicateRow { shard_id } => {
                write!(f, "Snapshot holds more than one row for {shard_id}")
            }
        }
    }
}

// ============================================================================
// Property Checker
// ============================================================================

/// Tracks lease rows across a write history for property verification.
#[derive(Debug, Default)]
pub struct LeaseTableChecker {
    /// Workers allowed to appear as owners. Empty means any.
    fleet: BTreeSet<WorkerId>,
    /// Last accepted row per shard. Removed on delete.
    rows: BTreeMap<ShardId, Lease>,
    /// Number of history entries already replayed.
    replayed: usize,
    /// Violations found.
    violations: Vec<PropertyViolation>,
}

impl LeaseTableChecker {
    /// Creates a checker that accepts any owner.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a checker that only accepts owners from `fleet`.
    #[must_use]
    pub fn with_fleet<I, W>(fleet: I) -> Self
    where
        I: IntoIterator<Item = W>,
        W: Into<WorkerId>,
    {
        Self {
            fleet: fleet.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Replays the entries of `history` not seen yet.
    ///
    /// Pass the full history each time; already replayed entries are skipped.
    pub fn record_history(&mut self, history: &[LeaseWrite]) {
        for write in history.iter().skip(self.replayed) {
            self.apply(write);
        }
        self.replayed = self.replayed.max(history.len());
    }

    /// Checks a snapshot of the table.
    pub fn record_snapshot(&mut self, snapshot: &[Lease]) {
        let mut seen = BTreeSet::new();
        for lease in snapshot {
            if !seen.insert(lease.shard_id.clone()) {
                self.violations.push(PropertyViolation::DuplicateRow {
                    shard_id: lease.shard_id.clone(),
                });
            }
            self.check_owner(lease);
        }
    }

    fn apply(&mut self, write: &LeaseWrite) {
        let lease = &write.lease;
        match write.kind {
            WriteKind::Delete => {
                self.rows.remove(&lease.shard_id);
                return;
            }
            WriteKind::Create => {
                // A row may be recreated after cleanup; it starts a new
                // counter lineage.
                self.rows.insert(lease.shard_id.clone(), lease.clone());
                self.check_owner(lease);
                return;
            }
            WriteKind::Update => {}
        }

        if let Some(previous) = self.rows.get(&lease.shard_id) {
            if lease.counter <= previous.counter {
                self.violations.push(PropertyViolation::CounterNotIncreasing {
                    shard_id: lease.shard_id.clone(),
                    previous: previous.counter,
                    written: lease.counter,
                });
            }
            if let Some(before) = &previous.checkpoint {
                // Anything other than SHARD_END after SHARD_END is a regression.
                let regressed = lease
                    .checkpoint
                    .as_ref()
                    .map_or(true, |written| written < before);
                if regressed {
                    self.violations.push(PropertyViolation::CheckpointRegressed {
                        shard_id: lease.shard_id.clone(),
                        previous: before.clone(),
                        written: lease.checkpoint.clone(),
                    });
                }
            }
        }
        self.check_owner(lease);
        self.rows.insert(lease.shard_id.clone(), lease.clone());
    }

    fn check_owner(&mut self, lease: &Lease) {
        if self.fleet.is_empty() {
            return;
        }
        if let Some(owner) = &lease.owner {
            if !self.fleet.contains(owner) {
                self.violations.push(PropertyViolation::UnknownOwner {
                    shard_id: lease.shard_id.clone(),
                    owner: owner.clone(),
                });
            }
        }
    }

    /// Returns all violations found.
    #[must_use]
    pub fn violations(&self) -> &[PropertyViolation] {
        &self.violations
    }

    /// Returns true if no violations were found.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.violations.is_empty()
    }

    /// Panics with every violation if any were found.
    ///
    /// # Panics
    /// Panics if a property was violated.
    pub fn assert_valid(&self) {
        assert!(
            self.is_valid(),
            "lease table properties violated:\n{}",
            self.violations
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("\n")
        );
    }
}

/// Checkpoints accepted for `shard_id`, in acceptance order.
#[must_use]
pub fn accepted_checkpoints(history: &[LeaseWrite], shard_id: &ShardId) -> Vec<Checkpoint> {
    let mut accepted: Vec<Checkpoint> = Vec::new();
    for write in history {
        if write.kind == WriteKind::Delete || &write.lease.shard_id != shard_id {
            continue;
        }
        if let Some(checkpoint) = &write.lease.checkpoint {
            if accepted.last() != Some(checkpoint) {
                accepted.push(checkpoint.clone());
            }
        }
    }
    accepted
}
