//! Shoal Core - Strongly-typed identifiers, positions and limits for Shoal.
//!
//! This crate provides the vocabulary shared by every Shoal crate: shard and
//! worker identifiers, the lease counter used as a fence token, checkpoint
//! positions with their total order, system limits, time sources and retry
//! bounds. It performs no I/O.
//!
//! # Design Principles (TigerStyle)
//!
//! - **Strongly-typed IDs**: Prevent mixing up `ShardId` with `WorkerId`
//! - **Explicit limits**: Every resource has a bounded maximum
//! - **Explicit time**: Lease logic takes timestamps as arguments
//! - **No unsafe code**: Safety > Performance

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod clock;
mod error;
mod limits;
mod position;
mod retry;
mod types;

pub use clock::{duration_us, Clock, ManualClock, SystemClock};
pub use error::{Error, Result};
pub use limits::Limits;
pub use position::{Checkpoint, ExtendedSequenceNumber, InitialPosition, SequenceNumber};
pub use retry::RetryPolicy;
pub use types::{LeaseCounter, ShardId, WorkerId};
