//! Shoal Worker - shard consumers and fleet orchestration.
//!
//! A [`Worker`] joins a fleet consuming one stream. It discovers shards,
//! competes for their leases through the lease table, and runs one
//! [`ShardConsumer`] per lease it holds. Each consumer drives an
//! application-supplied [`RecordProcessor`] through
//! `initialize → process_records* → shutdown`.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use shoal_core::SystemClock;
//! use shoal_lease::{NoopMonitoringService, SimulatedLeaseTable};
//! use shoal_stream::SimulatedStream;
//! use shoal_worker::{Worker, WorkerConfig};
//!
//! let config = WorkerConfig::new("billing", "orders", "worker-1");
//! let mut worker = Worker::new(
//!     config,
//!     Arc::new(SimulatedLeaseTable::new(42)),
//!     Arc::new(SimulatedStream::with_shards(42, 4)),
//!     factory,
//!     Arc::new(NoopMonitoringService),
//!     Arc::new(SystemClock),
//! )?;
//! worker.start().await?;
//! // ...
//! let report = worker.shutdown().await?;
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod config;
mod consumer;
mod error;
mod processor;
mod worker;

pub use config::{ConfigError, ConsumerConfig, WorkerConfig};
pub use consumer::{ConsumerExit, ConsumerState, ConsumerStatus, ShardConsumer};
pub use error::{ConsumerError, ProcessorError, WorkerError, WorkerResult};
pub use processor::{
    InitializationInput, ProcessRecordsInput, RecordProcessor, RecordProcessorFactory,
    ShutdownInput, ShutdownReason,
};
pub use worker::{ShardFailure, ShutdownReport, Worker, WorkerStatus};
