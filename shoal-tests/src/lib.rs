//! Shoal Tests - Integration and deterministic simulation tests for Shoal.
//!
//! This crate contains the multi-component tests for Shoal. Tests are
//! organized by component and type:
//!
//! ## Test Organization
//!
//! **DST Tests** (`*_dst.rs`): Seeded simulation with fault injection
//! - `lease_dst`: Multi-worker lease contention with a flaky lease table
//!
//! **Integration Tests** (`*_tests.rs`): Multi-component integration
//! - `lease_tests`: Lease acquisition, expiry and stealing across workers
//! - `checkpoint_tests`: Fenced checkpoints through the shard handle
//! - `consumer_tests`: Shard consumer state machine against a simulated stream
//! - `worker_tests`: Full workers, end-to-end scenarios and shutdown
//!
//! **Support Modules**:
//! - `fixtures`: Recording record processors and polling helpers
//! - `properties`: Lease table invariant checker
//! - `scenarios`: Seeds and timing presets
//!
//! ## Naming Conventions
//!
//! - DST tests: `test_dst_<component>_<scenario>`
//! - Integration tests: `test_<component>_<scenario>`
//! - Unit tests: Inline in each crate under `#[cfg(test)]`

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod fixtures;
pub mod properties;
pub mod scenarios;

// DST test modules (seeded simulation with fault injection).
#[cfg(test)]
mod lease_dst;

#[cfg(test)]
mod lease_tests;
#[cfg(test)]
mod worker_tests;
