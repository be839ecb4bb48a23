//! Shoal Stream - Read-side view of a sharded record stream.
//!
//! This crate defines the transport a shard consumer reads through:
//!
//! - Shard listing with parent links, so split and merge lineage is visible
//! - Fetches that resume strictly after a position and report shard end
//! - An in-memory [`SimulatedStream`] with deterministic fault injection
//!
//! # Design Principles (TigerStyle)
//!
//! - **Positions are opaque**: sequence numbers compare numerically, never parsed
//! - **Faults are deterministic**: simulation outcomes depend only on the seed
//! - **No unsafe code**: Safety > Performance

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;
mod simulated;
mod transport;
mod types;

pub use error::{StreamError, StreamResult};
pub use simulated::{SimulatedStream, StreamFaultConfig};
pub use transport::StreamTransport;
pub use types::{GetRecordsOutput, ReadPosition, Record, ShardInfo};
