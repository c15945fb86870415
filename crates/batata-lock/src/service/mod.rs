//! Coordination service client used by [`ServiceLock`](crate::ServiceLock)
//!
//! This module provides:
//! - `LockService`: the client handle a lock talks to
//! - Lock record and request/response model
//! - `MemoryLockService`: an in-process implementation with renewable leases and FIFO waiters

mod memory;
mod model;

pub use memory::*;
pub use model::*;

use async_trait::async_trait;

/// Client handle for a service that grants named locks to owners
#[async_trait]
pub trait LockService: Send + Sync {
    /// Acquire a lock, queueing for at most `request.wait_ms`
    async fn acquire(&self, request: LockAcquireRequest) -> anyhow::Result<LockAcquireResult>;

    /// Release a lock held by `request.owner`
    async fn release(&self, request: LockReleaseRequest) -> anyhow::Result<LockReleaseResult>;

    /// Extend the lease of a grant still held by `request.owner`
    async fn renew(&self, request: LockRenewRequest) -> anyhow::Result<LockRenewResult>;

    /// Get a lock record by namespace and name
    async fn get(&self, namespace: &str, name: &str) -> anyhow::Result<Option<LockRecord>>;

    /// Release a lock regardless of its owner (admin operation)
    async fn force_release(&self, namespace: &str, name: &str) -> anyhow::Result<bool>;
}
