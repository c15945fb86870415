//! Composite lock: acquire and release an ordered set of locks as one unit
//!
//! Locks are acquired in the order given at construction and released in
//! reverse. Callers that always build their sets in the same order cannot
//! deadlock against each other on those resources.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::{AcquireErrorPolicy, MultiLockConfig, ServiceLockConfig, TimeoutScope};
use crate::error::{LockError, Result};
use crate::lock::{DistributedLock, LockHandle};
use crate::service::LockService;
use crate::service_lock::ServiceLock;

/// A set of locks managed as a single lock.
///
/// If acquiring any lock fails, every lock acquired so far in that attempt
/// is released before the call returns. [`release`](DistributedLock::release)
/// releases every lock in the set whether or not it is held.
pub struct MultiLock {
    locks: Vec<LockHandle>,
    config: MultiLockConfig,
    // Serializes release and is_held_by_this_process on this instance
    guard: Mutex<()>,
}

impl MultiLock {
    /// Create a multi lock over `locks`, in the order they are to be acquired
    pub fn new(locks: Vec<LockHandle>) -> Self {
        Self::with_config(locks, MultiLockConfig::default())
    }

    pub fn with_config(locks: Vec<LockHandle>, config: MultiLockConfig) -> Self {
        Self {
            locks,
            config,
            guard: Mutex::new(()),
        }
    }

    /// Create a multi lock of [`ServiceLock`]s, one per path, in the order
    /// they are to be acquired.
    ///
    /// When `config` has no owner, one owner id is generated and shared by
    /// every lock of the set.
    pub fn from_paths<I, S>(
        service: Arc<dyn LockService>,
        paths: I,
        config: &ServiceLockConfig,
    ) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut config = config.clone();
        if config.owner.is_none() {
            config.owner = Some(uuid::Uuid::new_v4().to_string());
        }

        let locks = paths
            .into_iter()
            .map(|path| {
                ServiceLock::new(service.clone(), path.as_ref(), &config)
                    .map(|lock| Arc::new(lock) as LockHandle)
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self::new(locks))
    }

    pub fn locks(&self) -> &[LockHandle] {
        &self.locks
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }

    pub fn config(&self) -> &MultiLockConfig {
        &self.config
    }

    /// Acquire every lock, waiting at most `timeout` per lock (or for the
    /// whole call under [`TimeoutScope::Deadline`]). `None` waits
    /// indefinitely.
    ///
    /// Returns `Ok(false)` if a lock was not acquired in time and the first
    /// error raised by a lock otherwise. Either way, locks acquired during
    /// the attempt have been released again.
    pub async fn acquire_within(&self, timeout: Option<Duration>) -> Result<bool> {
        let deadline = match (timeout, self.config.timeout_scope) {
            // A deadline past what `Instant` can represent is no deadline
            (Some(timeout), TimeoutScope::Deadline) => Instant::now().checked_add(timeout),
            _ => None,
        };

        let mut acquired: Vec<&LockHandle> = Vec::with_capacity(self.locks.len());
        let mut first_error: Option<LockError> = None;
        let mut success = true;

        for (index, lock) in self.locks.iter().enumerate() {
            let attempt = match (timeout, deadline) {
                (None, _) => lock.acquire().await.map(|()| true),
                (Some(_), Some(deadline)) => {
                    lock.acquire_timeout(deadline.saturating_duration_since(Instant::now()))
                        .await
                }
                (Some(timeout), None) => lock.acquire_timeout(timeout).await,
            };

            match attempt {
                Ok(true) => acquired.push(lock),
                Ok(false) => {
                    debug!(index, "Lock not acquired in time");
                    success = false;
                    break;
                }
                Err(err) => {
                    debug!(index, error = %err, "Lock acquisition failed");
                    success = false;
                    if first_error.is_none() {
                        first_error = Some(err);
                    }
                    if self.config.on_acquire_error == AcquireErrorPolicy::Stop {
                        break;
                    }
                }
            }
        }

        if !success {
            Self::roll_back(&acquired).await;
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(success),
        }
    }

    async fn roll_back(acquired: &[&LockHandle]) {
        debug!(count = acquired.len(), "Rolling back partially acquired locks");
        for lock in acquired.iter().rev() {
            if let Err(err) = lock.release().await {
                warn!(error = %err, "Ignoring release failure during rollback");
            }
        }
    }
}

#[async_trait]
impl DistributedLock for MultiLock {
    async fn acquire(&self) -> Result<()> {
        if self.acquire_within(None).await? {
            Ok(())
        } else {
            Err(LockError::NotAcquired)
        }
    }

    async fn acquire_timeout(&self, timeout: Duration) -> Result<bool> {
        self.acquire_within(Some(timeout)).await
    }

    /// Release every lock in reverse order.
    ///
    /// Every lock gets exactly one release attempt. Failures are chained in
    /// the order they happen; the root cause of the returned error is the
    /// first one.
    async fn release(&self) -> Result<()> {
        let _guard = self.guard.lock().await;

        let mut failure: Option<LockError> = None;
        for (index, lock) in self.locks.iter().enumerate().rev() {
            if let Err(err) = lock.release().await {
                debug!(index, error = %err, "Lock release failed");
                failure = Some(match failure.take() {
                    Some(previous) => previous.chain(err),
                    None => err,
                });
            }
        }

        match failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn is_held_by_this_process(&self) -> bool {
        let _guard = self.guard.lock().await;

        for lock in &self.locks {
            if !lock.is_held_by_this_process().await {
                return false;
            }
        }
        true
    }
}

impl std::fmt::Debug for MultiLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiLock")
            .field("locks", &self.locks.len())
            .field("config", &self.config)
            .finish()
    }
}
