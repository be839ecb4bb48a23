//! Worker configuration.
//!
//! Timers, batch sizes and retry bounds are all configuration. Validation
//! checks them against the system `Limits` before a worker starts.

use std::time::Duration;

use shoal_core::{duration_us, InitialPosition, Limits, RetryPolicy, WorkerId};
use shoal_lease::LeaseConfig;
use thiserror::Error;

/// Configuration for a worker.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Name of the consuming application.
    pub application_name: String,
    /// Name of the stream being consumed.
    pub stream_name: String,
    /// Name of the lease table. Defaults to the application name.
    pub lease_table_name: String,
    /// Identity of this worker in the fleet.
    pub worker_id: WorkerId,
    /// Where to start shards that were never checkpointed.
    pub initial_position: InitialPosition,
    /// Maximum records per fetch.
    pub max_records: u32,
    /// Maximum leases this worker holds at once.
    pub max_leases_for_worker: u32,
    /// Interval between reconciliation passes.
    pub shard_sync_interval: Duration,
    /// Time without renewal after which a lease may be taken over.
    pub failover_timeout: Duration,
    /// Interval between renewals of each held lease.
    pub lease_renewal_interval: Duration,
    /// Sleep after an empty fetch.
    pub idle_time_between_reads: Duration,
    /// Poll interval while waiting for parent shards.
    pub parent_shard_poll_interval: Duration,
    /// How long shutdown waits for consumers before abandoning them.
    pub shutdown_grace: Duration,
    /// How long this worker leaves a shard alone after its processor broke
    /// the checkpoint protocol.
    pub failed_shard_backoff: Duration,
    /// Retry policy for transient lease table failures.
    pub store_retry: RetryPolicy,
    /// Retry policy for transient stream read failures.
    pub transport_retry: RetryPolicy,
    /// Deliver empty batches to the record processor.
    pub call_process_records_even_for_empty_record_list: bool,
    /// Delete leases of terminated shards once their children started.
    pub cleanup_terminated_shards: bool,
    /// System limits used for validation.
    pub limits: Limits,
}

impl WorkerConfig {
    /// Creates a configuration with production defaults.
    #[must_use]
    pub fn new(
        application_name: impl Into<String>,
        stream_name: impl Into<String>,
        worker_id: impl Into<WorkerId>,
    ) -> Self {
        let application_name = application_name.into();
        Self {
            lease_table_name: application_name.clone(),
            application_name,
            stream_name: stream_name.into(),
            worker_id: worker_id.into(),
            initial_position: InitialPosition::Latest,
            max_records: 10_000,
            max_leases_for_worker: Limits::new().max_leases_per_worker,
            shard_sync_interval: Duration::from_secs(60),
            failover_timeout: Duration::from_secs(10),
            lease_renewal_interval: Duration::from_secs(3),
            idle_time_between_reads: Duration::from_secs(1),
            parent_shard_poll_interval: Duration::from_secs(10),
            shutdown_grace: Duration::from_secs(30),
            failed_shard_backoff: Duration::from_secs(300),
            store_retry: RetryPolicy::default(),
            transport_retry: RetryPolicy::default(),
            call_process_records_even_for_empty_record_list: false,
            cleanup_terminated_shards: true,
            limits: Limits::new(),
        }
    }

    /// Creates a configuration with short timers, suitable for testing.
    #[must_use]
    pub fn fast_for_testing(worker_id: impl Into<WorkerId>) -> Self {
        Self {
            initial_position: InitialPosition::TrimHorizon,
            max_records: 25,
            max_leases_for_worker: 100,
            shard_sync_interval: Duration::from_millis(50),
            failover_timeout: Duration::from_millis(400),
            lease_renewal_interval: Duration::from_millis(50),
            idle_time_between_reads: Duration::from_millis(5),
            parent_shard_poll_interval: Duration::from_millis(10),
            shutdown_grace: Duration::from_secs(2),
            failed_shard_backoff: Duration::from_secs(30),
            store_retry: RetryPolicy::fast_for_testing(),
            transport_retry: RetryPolicy::fast_for_testing(),
            ..Self::new("shoal-test", "test-stream", worker_id)
        }
    }

    /// Sets the lease table name.
    #[must_use]
    pub fn with_lease_table_name(mut self, name: impl Into<String>) -> Self {
        self.lease_table_name = name.into();
        self
    }

    /// Sets the initial position.
    #[must_use]
    pub const fn with_initial_position(mut self, position: InitialPosition) -> Self {
        self.initial_position = position;
        self
    }

    /// Sets the maximum records per fetch.
    #[must_use]
    pub const fn with_max_records(mut self, max_records: u32) -> Self {
        self.max_records = max_records;
        self
    }

    /// Sets the maximum leases for this worker.
    #[must_use]
    pub const fn with_max_leases_for_worker(mut self, max: u32) -> Self {
        self.max_leases_for_worker = max;
        self
    }

    /// Sets the reconciliation interval.
    #[must_use]
    pub const fn with_shard_sync_interval(mut self, interval: Duration) -> Self {
        self.shard_sync_interval = interval;
        self
    }

    /// Sets the failover timeout.
    #[must_use]
    pub const fn with_failover_timeout(mut self, timeout: Duration) -> Self {
        self.failover_timeout = timeout;
        self
    }

    /// Sets the lease renewal interval.
    #[must_use]
    pub const fn with_lease_renewal_interval(mut self, interval: Duration) -> Self {
        self.lease_renewal_interval = interval;
        self
    }

    /// Sets the idle time between empty reads.
    #[must_use]
    pub const fn with_idle_time_between_reads(mut self, idle: Duration) -> Self {
        self.idle_time_between_reads = idle;
        self
    }

    /// Sets the parent shard poll interval.
    #[must_use]
    pub const fn with_parent_shard_poll_interval(mut self, interval: Duration) -> Self {
        self.parent_shard_poll_interval = interval;
        self
    }

    /// Sets the shutdown grace period.
    #[must_use]
    pub const fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Sets the back-off after a checkpoint protocol violation.
    #[must_use]
    pub const fn with_failed_shard_backoff(mut self, backoff: Duration) -> Self {
        self.failed_shard_backoff = backoff;
        self
    }

    /// Sets the lease table retry policy.
    #[must_use]
    pub const fn with_store_retry(mut self, retry: RetryPolicy) -> Self {
        self.store_retry = retry;
        self
    }

    /// Sets the stream read retry policy.
    #[must_use]
    pub const fn with_transport_retry(mut self, retry: RetryPolicy) -> Self {
        self.transport_retry = retry;
        self
    }

    /// Delivers empty batches to the record processor.
    #[must_use]
    pub const fn with_empty_batch_delivery(mut self, enabled: bool) -> Self {
        self.call_process_records_even_for_empty_record_list = enabled;
        self
    }

    /// Enables or disables terminated shard cleanup.
    #[must_use]
    pub const fn with_cleanup_terminated_shards(mut self, enabled: bool) -> Self {
        self.cleanup_terminated_shards = enabled;
        self
    }

    /// Validates the configuration.
    ///
    /// # Errors
    /// Returns an error if any value is empty, zero, above its limit, or if
    /// the renewal interval is not strictly below the failover timeout.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.limits.validate()?;

        for (name, value) in [
            ("application_name", &self.application_name),
            ("stream_name", &self.stream_name),
            ("lease_table_name", &self.lease_table_name),
        ] {
            if value.is_empty() {
                return Err(ConfigError::invalid(name, "must be non-empty"));
            }
        }

        if self.max_records == 0 || self.max_records > self.limits.max_records_per_fetch {
            return Err(ConfigError::invalid(
                "max_records",
                format!("must be in 1..={}", self.limits.max_records_per_fetch),
            ));
        }
        if self.max_leases_for_worker == 0
            || self.max_leases_for_worker > self.limits.max_leases_per_worker
        {
            return Err(ConfigError::invalid(
                "max_leases_for_worker",
                format!("must be in 1..={}", self.limits.max_leases_per_worker),
            ));
        }

        let failover_us = duration_us(self.failover_timeout);
        if failover_us < self.limits.min_failover_timeout_us
            || failover_us > self.limits.max_failover_timeout_us
        {
            return Err(ConfigError::invalid(
                "failover_timeout",
                format!(
                    "must be in {}us..={}us",
                    self.limits.min_failover_timeout_us, self.limits.max_failover_timeout_us
                ),
            ));
        }
        if self.lease_renewal_interval >= self.failover_timeout {
            return Err(ConfigError::invalid(
                "lease_renewal_interval",
                "must be < failover_timeout",
            ));
        }

        for (name, interval) in [
            ("shard_sync_interval", self.shard_sync_interval),
            ("lease_renewal_interval", self.lease_renewal_interval),
            ("idle_time_between_reads", self.idle_time_between_reads),
            ("parent_shard_poll_interval", self.parent_shard_poll_interval),
        ] {
            if duration_us(interval) < self.limits.min_interval_us {
                return Err(ConfigError::invalid(
                    name,
                    format!("must be >= {}us", self.limits.min_interval_us),
                ));
            }
        }

        self.store_retry.validate(&self.limits)?;
        self.transport_retry.validate(&self.limits)?;
        Ok(())
    }

    /// Derives the lease coordinator configuration.
    #[must_use]
    pub fn lease_config(&self) -> LeaseConfig {
        LeaseConfig {
            worker_id: self.worker_id.clone(),
            failover_timeout_us: duration_us(self.failover_timeout),
            max_leases_for_worker: self.max_leases_for_worker,
            max_shards: self.limits.max_shards,
            store_retry: self.store_retry,
        }
    }

    /// Derives the per-shard consumer configuration.
    #[must_use]
    pub const fn consumer_config(&self) -> ConsumerConfig {
        ConsumerConfig {
            initial_position: self.initial_position,
            max_records: self.max_records,
            idle_time_between_reads: self.idle_time_between_reads,
            parent_shard_poll_interval: self.parent_shard_poll_interval,
            transport_retry: self.transport_retry,
            call_process_records_even_for_empty_record_list: self
                .call_process_records_even_for_empty_record_list,
        }
    }
}

/// Settings a shard consumer needs.
#[derive(Debug, Clone, Copy)]
pub struct ConsumerConfig {
    /// Where to start a root shard that was never checkpointed.
    pub initial_position: InitialPosition,
    /// Maximum records per fetch.
    pub max_records: u32,
    /// Sleep after an empty fetch.
    pub idle_time_between_reads: Duration,
    /// Poll interval while waiting for parent shards.
    pub parent_shard_poll_interval: Duration,
    /// Retry policy for transient stream read failures.
    pub transport_retry: RetryPolicy,
    /// Deliver empty batches to the record processor.
    pub call_process_records_even_for_empty_record_list: bool,
}

/// Configuration errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A value is out of range.
    #[error("invalid {name}: {reason}")]
    Invalid {
        /// Option name.
        name: &'static str,
        /// What is wrong with it.
        reason: String,
    },

    /// Limits or retry policy rejected.
    #[error("{0}")]
    Limits(#[from] shoal_core::Error),
}

impl ConfigError {
    fn invalid(name: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            name,
            reason: reason.into(),
        }
    }
}
