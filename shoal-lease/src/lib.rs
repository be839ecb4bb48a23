//! Lease coordination and fenced checkpointing for Shoal.
//!
//! This crate assigns shards to workers through a shared lease table and
//! persists per-shard progress inside the same rows.
//!
//! # Overview
//!
//! - **Leases**: one row per shard naming its owner. A lease that has not
//!   been renewed within the failover timeout may be taken over by any
//!   worker, so ownership survives worker crashes without a lock service.
//! - **Fencing**: every mutation bumps the lease counter and is conditioned
//!   on the counter the writer last saw. A worker whose lease was taken over
//!   can no longer renew or checkpoint.
//! - **Checkpoints**: the last processed position, or `SHARD_END` once a
//!   shard is drained. Children of a split wait for their parents to reach
//!   `SHARD_END` before they start.
//!
//! # Example
//!
//! ```ignore
//! use shoal_lease::{LeaseConfig, LeaseCoordinator, NoopMonitoringService, SimulatedLeaseTable};
//!
//! let coordinator = LeaseCoordinator::new(
//!     Arc::new(SimulatedLeaseTable::new(42)),
//!     Arc::new(stream),
//!     Arc::new(NoopMonitoringService),
//!     Arc::new(SystemClock),
//!     LeaseConfig::for_testing("worker-1"),
//! );
//!
//! coordinator.sync_shards(now_us).await?;
//! for lease in coordinator.take_leases(now_us).await? {
//!     let checkpointer = coordinator.shard_checkpointer(&lease.shard_id);
//!     // Start a consumer for the shard.
//! }
//! ```
//!
//! # Design Principles (TigerStyle)
//!
//! - **Conditional writes only**: the table is the single source of truth
//! - **Explicit time**: expiry decisions take the current time as an argument
//! - **Deterministic simulation**: `SimulatedLeaseTable` injects faults by seed
//! - **No unsafe code**: Safety > Performance

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod checkpointer;
mod coordinator;
mod error;
mod held;
mod monitor;
mod table;
mod types;

pub use checkpointer::{Checkpointer, ShardCheckpointer};
pub use coordinator::LeaseCoordinator;
pub use error::{LeaseError, LeaseResult};
pub use held::HeldLease;
pub use monitor::{InMemoryMonitoringService, MonitoringService, NoopMonitoringService, ShardMetrics};
pub use table::{LeaseTable, LeaseTableFaultConfig, LeaseWrite, SimulatedLeaseTable, WriteKind};
pub use types::{Lease, LeaseConfig};
