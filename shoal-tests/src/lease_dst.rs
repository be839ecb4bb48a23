//! Lease coordination simulation tests.
//!
//! Several coordinators share a flaky `SimulatedLeaseTable` and act in a
//! random, seed-determined order: shard sync, lease taking, renewal,
//! checkpointing, release and crash-restart, with the clock advancing
//! between steps. After every step the table history is replayed through
//! `LeaseTableChecker` and fencing is checked across coordinators.

// Test-specific lint allowances - these are less critical in test code.
#![allow(clippy::cast_possible_truncation)] // Small indices in test data
#![allow(clippy::too_many_lines)] // Simulation loops are long for clarity
#![allow(clippy::significant_drop_tightening)] // Test code clarity > drop optimization
#![allow(clippy::unreadable_literal)] // Large seed numbers are fine without separators

use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use shoal_core::{Checkpoint, Clock, ExtendedSequenceNumber, ManualClock, ShardId};
use shoal_lease::{
    LeaseConfig, LeaseCoordinator, LeaseTableFaultConfig, NoopMonitoringService,
    SimulatedLeaseTable,
};
use shoal_stream::{SimulatedStream, StreamFaultConfig};
use tracing::debug;

use crate::fixtures::{publish, test_worker, wait_until, ProcessorBehavior, RecordingFactory};
use crate::properties::LeaseTableChecker;
use crate::scenarios::{fleets, seeds, timing};

const SHARDS: u32 = 4;
const RECORDS_PER_SHARD: usize = 20;
const STEPS: usize = 300;

type Coordinator = LeaseCoordinator<SimulatedLeaseTable>;

fn shard(index: u32) -> ShardId {
    SimulatedStream::shard_name(index)
}

// ============================================================================
// Simulation Harness
// ============================================================================

struct Simulation {
    seed: u64,
    rng: StdRng,
    clock: ManualClock,
    table: Arc<SimulatedLeaseTable>,
    stream: SimulatedStream,
    positions: Vec<Vec<ExtendedSequenceNumber>>,
    coordinators: Vec<Coordinator>,
    checker: LeaseTableChecker,
}

impl Simulation {
    fn new(seed: u64, workers: &[&str]) -> Self {
        let stream = SimulatedStream::with_shards(seed, SHARDS);
        let positions = (0..SHARDS)
            .map(|index| publish(&stream, &shard(index), RECORDS_PER_SHARD))
            .collect();
        let table = Arc::new(SimulatedLeaseTable::with_faults(
            seed,
            LeaseTableFaultConfig::flaky(),
        ));
        let clock = ManualClock::new(1_000_000);

        let mut simulation = Self {
            seed,
            rng: StdRng::seed_from_u64(seed),
            clock,
            table,
            stream,
            positions,
            coordinators: Vec::new(),
            checker: LeaseTableChecker::with_fleet(workers.iter().copied()),
        };
        simulation.coordinators = workers.iter().map(|id| simulation.coordinator(id)).collect();
        simulation
    }

    fn coordinator(&self, worker: &str) -> Coordinator {
        LeaseCoordinator::new(
            self.table.clone(),
            Arc::new(self.stream.clone()),
            Arc::new(NoopMonitoringService),
            Arc::new(self.clock.clone()),
            LeaseConfig::for_testing(worker).with_max_leases(3),
        )
    }

    async fn run(&mut self, steps: usize) {
        for step in 0..steps {
            let worker = self.rng.gen_range(0..self.coordinators.len());
            let action = self.rng.gen_range(0..10);
            self.act(worker, action).await;

            let advance = self.rng.gen_range(0..150);
            self.clock.advance(Duration::from_millis(advance));

            self.checker.record_history(&self.table.write_history());
            assert!(
                self.checker.is_valid(),
                "seed {}, step {step}: {:?}",
                self.seed,
                self.checker.violations()
            );
            self.check_single_writer(step).await;
        }
        self.checker.record_snapshot(&self.table.snapshot());
        assert!(
            self.checker.is_valid(),
            "seed {}: {:?}",
            self.seed,
            self.checker.violations()
        );
    }

    async fn act(&mut self, worker: usize, action: u32) {
        let now = self.clock.now_us();
        let coordinator = &self.coordinators[worker];
        match action {
            0 => {
                let _ = coordinator.sync_shards(now).await;
            }
            1 | 2 => {
                let _ = coordinator.take_leases(now).await;
            }
            3..=5 => {
                for shard_id in coordinator.held_shards() {
                    let _ = coordinator.renew_lease(&shard_id, now).await;
                }
            }
            6 | 7 => self.checkpoint(worker).await,
            8 => {
                let held = coordinator.held_shards();
                if !held.is_empty() {
                    let shard_id = &held[self.rng.gen_range(0..held.len())];
                    let _ = coordinator.release_lease(shard_id, now).await;
                }
            }
            _ => {
                // Crash: the process restarts with no memory of its leases.
                let id = coordinator.worker_id().clone();
                debug!(seed = self.seed, worker = %id, "Simulated crash");
                self.coordinators[worker] = self.coordinator(id.as_str());
            }
        }
    }

    /// Advances a random held shard by a few records, or to `SHARD_END`.
    async fn checkpoint(&mut self, worker: usize) {
        let coordinator = &self.coordinators[worker];
        let held = coordinator.held_shards();
        if held.is_empty() {
            return;
        }
        let shard_id = held[self.rng.gen_range(0..held.len())].clone();
        let (Some(lease), Some(handle)) = (
            coordinator.held_lease(&shard_id),
            coordinator.shard_checkpointer(&shard_id),
        ) else {
            return;
        };

        let index = shard_id
            .as_str()
            .trim_start_matches("shardId-")
            .parse::<usize>()
            .unwrap_or(0);
        let positions = &self.positions[index];
        let next = match lease.snapshot().await.checkpoint {
            Some(Checkpoint::ShardEnd) => return,
            None | Some(Checkpoint::TrimHorizon) => 0,
            Some(Checkpoint::Sequence(position)) => {
                positions.iter().position(|p| *p == position).unwrap_or(0) + 1
            }
        } + self.rng.gen_range(0..4);
        let checkpoint = positions
            .get(next)
            .map_or(Checkpoint::ShardEnd, |p| Checkpoint::Sequence(p.clone()));

        if handle.checkpoint(checkpoint.clone()).await.is_ok() {
            let stored = self
                .table
                .snapshot()
                .into_iter()
                .find(|l| l.shard_id == shard_id)
                .and_then(|l| l.checkpoint);
            assert_eq!(
                stored,
                Some(checkpoint),
                "seed {}: accepted checkpoint not stored",
                self.seed
            );
        }
    }

    /// At most one coordinator holds a live handle whose fence token matches
    /// the stored row.
    async fn check_single_writer(&self, step: usize) {
        for stored in self.table.snapshot() {
            let mut writers = Vec::new();
            for coordinator in &self.coordinators {
                let Some(held) = coordinator.held_lease(&stored.shard_id) else {
                    continue;
                };
                if !held.is_lost() && held.fence_token().await == stored.counter {
                    writers.push(coordinator.worker_id().clone());
                }
            }
            assert!(
                writers.len() <= 1,
                "seed {}, step {step}: {} has writers {writers:?}",
                self.seed,
                stored.shard_id
            );
        }
    }
}

// ============================================================================
// Coordinator Simulation
// ============================================================================

#[tokio::test]
async fn test_dst_lease_regression_seeds() {
    for &seed in seeds::REGRESSION_SEEDS {
        let mut simulation = Simulation::new(seed, fleets::THREE_WORKERS);
        simulation.run(STEPS).await;
    }
}

#[tokio::test]
async fn test_dst_lease_many_seeds() {
    for i in 0..u64::from(seeds::CI_SEED_COUNT) {
        let seed = 0x5EED_0000 + i;
        let mut simulation = Simulation::new(seed, fleets::TWO_WORKERS);
        simulation.run(STEPS / 3).await;
    }
}

/// Same seed, same history.
#[tokio::test]
async fn test_dst_lease_is_deterministic() {
    let mut first = Simulation::new(42, fleets::THREE_WORKERS);
    first.run(100).await;
    let mut second = Simulation::new(42, fleets::THREE_WORKERS);
    second.run(100).await;

    assert_eq!(first.table.snapshot(), second.table.snapshot());
    assert_eq!(
        first.table.write_history().len(),
        second.table.write_history().len()
    );
}

// ============================================================================
// Worker Simulation
// ============================================================================

/// A fleet of workers over a flaky table and stream, with one worker leaving
/// midway. Every record is delivered at least once and every shard reaches
/// its final checkpoint.
#[tokio::test]
async fn test_dst_worker_fleet_under_faults() {
    for &seed in &seeds::REGRESSION_SEEDS[..2] {
        let stream = SimulatedStream::with_shards(seed, SHARDS);
        let mut positions: Vec<Vec<ExtendedSequenceNumber>> = (0..SHARDS)
            .map(|index| publish(&stream, &shard(index), RECORDS_PER_SHARD))
            .collect();
        stream.split_shard(&shard(0), &[shard(SHARDS)]).unwrap();
        positions.push(publish(&stream, &shard(SHARDS), RECORDS_PER_SHARD));
        *stream.fault_config() = StreamFaultConfig::flaky();

        let table = SimulatedLeaseTable::with_faults(seed, LeaseTableFaultConfig::flaky());
        let factory = Arc::new(RecordingFactory::new(ProcessorBehavior::checkpointing()));
        let log = factory.log().clone();

        let mut workers = Vec::new();
        for id in fleets::THREE_WORKERS {
            let mut worker = test_worker(id, &table, &stream, factory.clone(), |c| {
                c.with_max_leases_for_worker(2)
            });
            // Shard sync at start may hit an injected fault.
            let mut started = false;
            for _ in 0..20 {
                if worker.start().await.is_ok() {
                    started = true;
                    break;
                }
            }
            assert!(started, "seed {seed}: {id} failed to start");
            workers.push(worker);
        }

        tokio::time::sleep(timing::FAILOVER / 2).await;
        let report = workers.remove(1).shutdown().await;
        assert!(report.is_ok(), "seed {seed}: {report:?}");

        let finished = |table: &SimulatedLeaseTable| {
            let snapshot = table.snapshot();
            (0..=SHARDS).all(|index| {
                let row = snapshot.iter().find(|l| l.shard_id == shard(index));
                match (index, row) {
                    // The parent row may already be cleaned up.
                    (0, None) => true,
                    (0, Some(lease)) => lease.is_shard_end(),
                    (_, Some(lease)) => {
                        lease.checkpoint
                            == positions[index as usize]
                                .last()
                                .cloned()
                                .map(Checkpoint::Sequence)
                    }
                    (_, None) => false,
                }
            })
        };
        assert!(
            wait_until(timing::WAIT * 3, || finished(&table)).await,
            "seed {seed}: fleet did not finish: {:?}",
            table.snapshot()
        );

        for worker in &mut workers {
            worker.shutdown().await.unwrap();
        }

        for (index, published) in positions.iter().enumerate() {
            let delivered = log.delivered(&shard(index as u32));
            for position in published {
                assert!(
                    delivered.contains(position),
                    "seed {seed}: {position} on shard {index} never delivered"
                );
            }
        }

        let mut checker = LeaseTableChecker::with_fleet(fleets::THREE_WORKERS.iter().copied());
        checker.record_history(&table.write_history());
        checker.record_snapshot(&table.snapshot());
        checker.assert_valid();
    }
}
