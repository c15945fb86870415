//! The lock capability shared by simple and composite locks

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;

/// A mutual-exclusion lock on one resource, coordinated across processes.
///
/// Implementations decide how the lock is backed. A [`MultiLock`](crate::MultiLock)
/// implements this trait as well, so composite locks can be nested or mixed
/// with simple ones.
#[async_trait]
pub trait DistributedLock: Send + Sync {
    /// Wait until the lock is acquired
    async fn acquire(&self) -> Result<()>;

    /// Wait at most `timeout` for the lock.
    ///
    /// Returns `Ok(false)` when the time ran out; that is not an error.
    async fn acquire_timeout(&self, timeout: Duration) -> Result<bool>;

    /// Release the lock. Must tolerate being called when the lock is not held.
    async fn release(&self) -> Result<()>;

    /// Whether this process currently holds the lock
    async fn is_held_by_this_process(&self) -> bool;
}

/// Shared handle to a lock
pub type LockHandle = Arc<dyn DistributedLock>;
