//! Shoal simulation binary.
//!
//! Runs a fleet of workers against an in-memory stream and lease table, then
//! prints the final lease table.
//!
//! ```bash
//! shoal-sim --shards 4 --workers 3 --records 2000 --split --duration-ms 5000
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use clap::Parser;
use shoal_core::{InitialPosition, ShardId, SystemClock};
use shoal_lease::{InMemoryMonitoringService, SimulatedLeaseTable};
use shoal_stream::{SimulatedStream, StreamTransport};
use shoal_worker::{
    InitializationInput, ProcessRecordsInput, ProcessorError, RecordProcessor,
    RecordProcessorFactory, ShutdownInput, ShutdownReason, Worker, WorkerConfig,
};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

/// Shoal fleet simulation.
#[derive(Parser, Debug)]
#[command(name = "shoal-sim")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Number of shards in the stream.
    #[arg(long, default_value = "4")]
    shards: u32,

    /// Number of records written before the workers start.
    #[arg(long, default_value = "1000")]
    records: u32,

    /// Number of workers in the fleet.
    #[arg(long, default_value = "2")]
    workers: u32,

    /// Split the first shard halfway through the run.
    #[arg(long)]
    split: bool,

    /// How long the fleet runs before shutdown.
    #[arg(long, default_value = "3000")]
    duration_ms: u64,

    /// Seed for the simulated stream and lease table.
    #[arg(long, default_value = "42")]
    seed: u64,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: Level,
}

/// Checkpoints after every batch and at shard end.
#[derive(Debug, Default)]
struct CheckpointingProcessor {
    shard_id: Option<ShardId>,
    processed: u64,
}

#[async_trait]
impl RecordProcessor for CheckpointingProcessor {
    async fn initialize(&mut self, input: InitializationInput) -> Result<(), ProcessorError> {
        info!(
            shard_id = %input.shard_id,
            start = ?input.starting_position,
            "Processor initialized"
        );
        self.shard_id = Some(input.shard_id);
        Ok(())
    }

    async fn process_records(&mut self, input: ProcessRecordsInput) -> Result<(), ProcessorError> {
        self.processed += input.records.len() as u64;
        if let Some(last) = input.records.last() {
            input.checkpointer.checkpoint_record(last).await?;
        }
        Ok(())
    }

    async fn shutdown(&mut self, input: ShutdownInput) -> Result<(), ProcessorError> {
        if input.reason == ShutdownReason::Terminate {
            input.checkpointer.checkpoint_shard_end().await?;
        }
        info!(
            shard_id = ?self.shard_id,
            reason = %input.reason,
            processed = self.processed,
            "Processor shut down"
        );
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(args.log_level)
        .with_target(true)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!(
        shards = args.shards,
        records = args.records,
        workers = args.workers,
        split = args.split,
        seed = args.seed,
        "Starting Shoal simulation"
    );

    let stream = SimulatedStream::with_shards(args.seed, args.shards);
    for i in 0..args.records {
        stream.put_record_by_key(&format!("key-{i}"), format!("record-{i}"))?;
    }

    let table = Arc::new(SimulatedLeaseTable::new(args.seed));
    let transport: Arc<dyn StreamTransport> = Arc::new(stream.clone());
    let monitor = Arc::new(InMemoryMonitoringService::new());
    let factory: Arc<dyn RecordProcessorFactory> =
        Arc::new(|_shard_id: &ShardId| -> Box<dyn RecordProcessor> {
            Box::new(CheckpointingProcessor::default())
        });

    let mut workers = Vec::with_capacity(args.workers as usize);
    for index in 0..args.workers {
        let config = WorkerConfig::new("shoal-sim", "sim-stream", format!("worker-{index}"))
            .with_initial_position(InitialPosition::TrimHorizon)
            .with_shard_sync_interval(Duration::from_millis(500))
            .with_failover_timeout(Duration::from_secs(3))
            .with_lease_renewal_interval(Duration::from_secs(1))
            .with_idle_time_between_reads(Duration::from_millis(100))
            .with_parent_shard_poll_interval(Duration::from_millis(200))
            .with_shutdown_grace(Duration::from_secs(5));
        let mut worker = Worker::new(
            config,
            table.clone(),
            transport.clone(),
            factory.clone(),
            monitor.clone(),
            Arc::new(SystemClock),
        )?;
        worker.start().await?;
        workers.push(worker);
    }

    let duration = Duration::from_millis(args.duration_ms);
    if args.split && args.shards > 0 {
        tokio::time::sleep(duration / 2).await;
        let parent = SimulatedStream::shard_name(0);
        let children = [
            SimulatedStream::shard_name(args.shards),
            SimulatedStream::shard_name(args.shards + 1),
        ];
        stream.split_shard(&parent, &children)?;
        info!(parent = %parent, "Split shard");
        for i in 0..args.records / 2 {
            stream.put_record_by_key(&format!("post-split-{i}"), format!("record-{i}"))?;
        }
        tokio::time::sleep(duration / 2).await;
    } else {
        tokio::time::sleep(duration).await;
    }

    for worker in &mut workers {
        let status = worker.status();
        let report = worker.shutdown().await?;
        info!(
            worker_id = %status.worker_id,
            held = status.held.len(),
            completed = report.completed.len(),
            abandoned = report.abandoned.len(),
            failures = report.failures.len(),
            "Worker stopped"
        );
    }

    println!("shard_id\towner\tcounter\tcheckpoint");
    for lease in table.snapshot() {
        println!(
            "{}\t{}\t{}\t{}",
            lease.shard_id,
            lease.owner.map_or_else(|| "-".to_string(), |owner| owner.to_string()),
            lease.counter,
            lease
                .checkpoint
                .map_or_else(|| "-".to_string(), |checkpoint| checkpoint.to_string()),
        );
    }
    println!(
        "records processed: {}",
        monitor.total_records_processed()
    );
    Ok(())
}
