//! In-process handle for a lease this worker holds.

use std::sync::atomic::{AtomicBool, Ordering};

use shoal_core::{LeaseCounter, ShardId};
use tokio::sync::{Mutex, MutexGuard};

use crate::types::Lease;

/// A lease held by this worker.
///
/// Shared between the renewal task and the shard's checkpointer. The async
/// mutex serialises their writes so each one is conditioned on the counter
/// the previous one produced. Across processes only the counter fences.
#[derive(Debug)]
pub struct HeldLease {
    shard_id: ShardId,
    lease: Mutex<Lease>,
    lost: AtomicBool,
}

impl HeldLease {
    /// Wraps a lease row this worker just acquired.
    #[must_use]
    pub fn new(lease: Lease) -> Self {
        Self {
            shard_id: lease.shard_id.clone(),
            lease: Mutex::new(lease),
            lost: AtomicBool::new(false),
        }
    }

    /// Shard this lease covers.
    #[must_use]
    pub const fn shard_id(&self) -> &ShardId {
        &self.shard_id
    }

    /// Returns a copy of the last row this worker wrote or read.
    pub async fn snapshot(&self) -> Lease {
        self.lease.lock().await.clone()
    }

    /// Current fence token.
    pub async fn fence_token(&self) -> LeaseCounter {
        self.lease.lock().await.counter
    }

    /// Locks the row for a fenced write.
    pub(crate) async fn lock(&self) -> MutexGuard<'_, Lease> {
        self.lease.lock().await
    }

    /// Returns true once a write was fenced out or the lease was released.
    #[must_use]
    pub fn is_lost(&self) -> bool {
        self.lost.load(Ordering::Acquire)
    }

    /// Marks the lease lost. Irreversible.
    pub fn mark_lost(&self) {
        self.lost.store(true, Ordering::Release);
    }
}
