//! Fenced checkpoint writes.
//!
//! A checkpoint is only accepted while the writer's fence token matches the
//! lease row's counter. A worker whose lease was taken over is therefore
//! unable to move the shard's progress, even if it keeps processing for a
//! while before it notices.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use shoal_core::{Checkpoint, Clock, ExtendedSequenceNumber, LeaseCounter, RetryPolicy, ShardId};
use shoal_stream::Record;
use tracing::{debug, warn};

use crate::error::{LeaseError, LeaseResult};
use crate::held::HeldLease;
use crate::monitor::MonitoringService;
use crate::table::LeaseTable;
use crate::types::Lease;

// -----------------------------------------------------------------------------
// Checkpointer
// -----------------------------------------------------------------------------

/// Writes checkpoints into lease rows, conditioned on the fence token.
///
/// Transient table failures are retried with bounded backoff. A failed
/// condition is reported as `LeaseLost` and never retried.
#[derive(Clone)]
pub struct Checkpointer {
    table: Arc<dyn LeaseTable>,
    monitor: Arc<dyn MonitoringService>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
}

impl fmt::Debug for Checkpointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Checkpointer")
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl Checkpointer {
    /// Creates a checkpointer over `table`.
    #[must_use]
    pub fn new(
        table: Arc<dyn LeaseTable>,
        monitor: Arc<dyn MonitoringService>,
        clock: Arc<dyn Clock>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            table,
            monitor,
            clock,
            retry,
        }
    }

    /// Writes `checkpoint` for `shard_id` if the row's counter still equals
    /// `fence_token`. Returns the new fence token.
    ///
    /// Positions must be passed in non-decreasing order; this is not checked.
    ///
    /// # Errors
    ///
    /// Returns `LeaseLost` if the counter moved, `LeaseNotFound` if the row
    /// is gone, and `StoreUnavailable` once retries are exhausted.
    pub async fn checkpoint(
        &self,
        shard_id: &ShardId,
        checkpoint: Checkpoint,
        fence_token: LeaseCounter,
    ) -> LeaseResult<LeaseCounter> {
        let current = self
            .with_retry("get_lease", || self.table.get_lease(shard_id))
            .await?
            .ok_or_else(|| LeaseError::LeaseNotFound {
                shard_id: shard_id.clone(),
            })?;
        if current.counter != fence_token {
            return Err(LeaseError::LeaseLost {
                shard_id: shard_id.clone(),
                fence_token,
            });
        }
        let written = self.write(&current, checkpoint).await?;
        Ok(written.counter)
    }

    /// Writes `checkpoint` into the row last written by this worker. Returns
    /// the row as stored.
    pub(crate) async fn write(&self, lease: &Lease, checkpoint: Checkpoint) -> LeaseResult<Lease> {
        let mut next = lease.next_version(self.clock.now_us());
        next.checkpoint = Some(checkpoint);

        let mut attempts = 0_u32;
        let result = self
            .with_retry("update_lease", || {
                attempts += 1;
                self.table.update_lease(&next, lease.counter)
            })
            .await;
        let result = match result {
            Err(LeaseError::ConditionFailed { .. }) if attempts > 1 => {
                self.confirm_applied(&next, lease.counter).await
            }
            other => other,
        };
        match result {
            Ok(()) => {
                debug!(
                    shard_id = %next.shard_id,
                    counter = %next.counter,
                    checkpoint = ?next.checkpoint,
                    "Checkpoint written"
                );
                if let Some(written) = &next.checkpoint {
                    self.monitor.checkpoint_written(&next.shard_id, written);
                }
                Ok(next)
            }
            Err(LeaseError::ConditionFailed { .. } | LeaseError::LeaseNotFound { .. }) => {
                Err(LeaseError::LeaseLost {
                    shard_id: lease.shard_id.clone(),
                    fence_token: lease.counter,
                })
            }
            Err(err) => Err(err),
        }
    }

    /// Resolves a condition failure on a retried write. An earlier attempt
    /// may have been applied with its response lost, in which case the row
    /// already holds `next`.
    async fn confirm_applied(&self, next: &Lease, expected: LeaseCounter) -> LeaseResult<()> {
        let stored = self
            .with_retry("get_lease", || self.table.get_lease(&next.shard_id))
            .await?;
        match stored {
            Some(stored) if stored == *next => {
                debug!(shard_id = %next.shard_id, counter = %next.counter, "Retried checkpoint was already applied");
                Ok(())
            }
            Some(stored) => Err(LeaseError::ConditionFailed {
                shard_id: next.shard_id.clone(),
                expected,
                actual: stored.counter,
            }),
            None => Err(LeaseError::LeaseNotFound {
                shard_id: next.shard_id.clone(),
            }),
        }
    }

    async fn with_retry<T, F, Fut>(&self, operation: &'static str, mut f: F) -> LeaseResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = LeaseResult<T>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match f().await {
                Err(err) if err.is_retryable() && self.retry.should_retry(attempt) => {
                    let delay = self.retry.delay_for(attempt);
                    warn!(operation, attempt, ?delay, error = %err, "Retrying lease table operation");
                    tokio::time::sleep(delay).await;
                }
                other => return other,
            }
        }
    }
}

// -----------------------------------------------------------------------------
// Shard Checkpointer
// -----------------------------------------------------------------------------

#[derive(Debug, Default)]
struct HandleState {
    revoked: AtomicBool,
    shard_end_written: AtomicBool,
}

/// Checkpoint handle scoped to one shard, given to record processor callbacks.
///
/// The fence token is read from the held lease at call time, so renewals in
/// between do not invalidate the handle. Once the lease is lost or the handle
/// is revoked, every call fails fast with `LeaseLost`.
#[derive(Debug, Clone)]
pub struct ShardCheckpointer {
    held: Arc<HeldLease>,
    checkpointer: Checkpointer,
    state: Arc<HandleState>,
}

impl ShardCheckpointer {
    /// Creates a handle over a held lease.
    #[must_use]
    pub fn new(held: Arc<HeldLease>, checkpointer: Checkpointer) -> Self {
        Self {
            held,
            checkpointer,
            state: Arc::new(HandleState::default()),
        }
    }

    /// Shard this handle writes to.
    #[must_use]
    pub fn shard_id(&self) -> &ShardId {
        self.held.shard_id()
    }

    /// Current fence token.
    pub async fn fence_token(&self) -> LeaseCounter {
        self.held.fence_token().await
    }

    /// Records that everything up to and including `checkpoint` is processed.
    ///
    /// # Errors
    ///
    /// Returns `LeaseLost` once ownership is gone, `ShardEnded` after
    /// `SHARD_END` was written, and `StoreUnavailable` once retries are
    /// exhausted.
    pub async fn checkpoint(&self, checkpoint: Checkpoint) -> LeaseResult<()> {
        let mut lease = self.held.lock().await;
        if self.is_revoked() {
            return Err(LeaseError::LeaseLost {
                shard_id: lease.shard_id.clone(),
                fence_token: lease.counter,
            });
        }
        if self.shard_end_written() {
            return Err(LeaseError::ShardEnded {
                shard_id: lease.shard_id.clone(),
            });
        }

        let is_shard_end = checkpoint.is_shard_end();
        match self.checkpointer.write(&lease, checkpoint).await {
            Ok(written) => {
                *lease = written;
                if is_shard_end {
                    self.state.shard_end_written.store(true, Ordering::Release);
                }
                Ok(())
            }
            Err(err @ LeaseError::LeaseLost { .. }) => {
                self.held.mark_lost();
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    /// Checkpoints at the position of `record`.
    ///
    /// # Errors
    ///
    /// Same as [`Self::checkpoint`].
    pub async fn checkpoint_record(&self, record: &Record) -> LeaseResult<()> {
        self.checkpoint(Checkpoint::Sequence(record.position.clone()))
            .await
    }

    /// Checkpoints at an explicit position.
    ///
    /// # Errors
    ///
    /// Same as [`Self::checkpoint`].
    pub async fn checkpoint_sequence(&self, position: ExtendedSequenceNumber) -> LeaseResult<()> {
        self.checkpoint(Checkpoint::Sequence(position)).await
    }

    /// Marks the shard fully processed. Required when shutting down with
    /// reason `Terminate`.
    ///
    /// # Errors
    ///
    /// Same as [`Self::checkpoint`].
    pub async fn checkpoint_shard_end(&self) -> LeaseResult<()> {
        self.checkpoint(Checkpoint::ShardEnd).await
    }

    /// Forbids further writes through any clone of this handle.
    pub fn revoke(&self) {
        self.state.revoked.store(true, Ordering::Release);
    }

    /// Returns true if writes will fail with `LeaseLost`.
    #[must_use]
    pub fn is_revoked(&self) -> bool {
        self.state.revoked.load(Ordering::Acquire) || self.held.is_lost()
    }

    /// Returns true once `SHARD_END` was accepted through this handle.
    #[must_use]
    pub fn shard_end_written(&self) -> bool {
        self.state.shard_end_written.load(Ordering::Acquire)
    }
}

// -----------------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------------
