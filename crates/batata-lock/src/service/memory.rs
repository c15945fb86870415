//! In-memory lock service with leases and FIFO waiters

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::oneshot;
use tokio::time::interval;
use tracing::{debug, info};

use super::LockService;
use super::model::*;

/// In-memory lock service using DashMap
///
/// Records and waiter queues are always locked in that order (record entry
/// first, then its queue) so hand-over and waiter removal never interleave.
pub struct MemoryLockService {
    locks: Arc<DashMap<String, LockRecord>>,
    waiters: Arc<DashMap<String, VecDeque<LockWaiter>>>,
    next_waiter_id: AtomicU64,
    cleanup_handle: Option<tokio::task::JoinHandle<()>>,
}

struct LockWaiter {
    id: u64,
    owner: String,
    ttl_ms: u64,
    /// None when the wait budget reaches past what `Instant` can express
    deadline: Option<Instant>,
    tx: oneshot::Sender<LockAcquireResult>,
}

impl MemoryLockService {
    pub fn new() -> Self {
        Self {
            locks: Arc::new(DashMap::new()),
            waiters: Arc::new(DashMap::new()),
            next_waiter_id: AtomicU64::new(0),
            cleanup_handle: None,
        }
    }

    /// Start a background task expiring stale leases.
    ///
    /// Must be called from within a tokio runtime.
    pub fn with_cleanup(mut self, every: Duration) -> Self {
        let locks = self.locks.clone();
        let waiters = self.waiters.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = interval(every);
            loop {
                ticker.tick().await;
                Self::cleanup_expired_locks(&locks, &waiters);
            }
        });

        info!(interval_ms = crate::config::duration_millis(every), "Lock expiry task started");
        self.cleanup_handle = Some(handle);
        self
    }

    fn cleanup_expired_locks(
        locks: &DashMap<String, LockRecord>,
        waiters: &DashMap<String, VecDeque<LockWaiter>>,
    ) {
        let expired_keys: Vec<String> = locks
            .iter()
            .filter(|entry| entry.state == LockState::Locked && entry.is_expired())
            .map(|entry| entry.key().clone())
            .collect();

        for key in &expired_keys {
            if let Some(mut record) = locks.get_mut(key) {
                if record.state == LockState::Locked && record.is_expired() {
                    record.expire();
                    Self::hand_over(&mut record, waiters);
                }
            }
        }

        if !expired_keys.is_empty() {
            debug!(count = expired_keys.len(), "Expired stale lock leases");
        }
    }

    /// Grant a free record to the first waiter that is still listening, and
    /// drop the queue once nobody is left in it
    fn hand_over(record: &mut LockRecord, waiters: &DashMap<String, VecDeque<LockWaiter>>) {
        if let Some(mut queue) = waiters.get_mut(&record.key) {
            Self::grant_first_waiter(record, &mut queue);
        }
        waiters.remove_if(&record.key, |_, queue| queue.is_empty());
    }

    fn grant_first_waiter(record: &mut LockRecord, queue: &mut VecDeque<LockWaiter>) {
        let now = Instant::now();
        while let Some(waiter) = queue.pop_front() {
            let timed_out = waiter.deadline.is_some_and(|deadline| deadline <= now);
            if timed_out || waiter.tx.is_closed() {
                continue;
            }
            if record.is_locked() {
                // Still held; put the waiter back
                queue.push_front(waiter);
                return;
            }
            record.ttl_ms = waiter.ttl_ms;
            record.acquire(&waiter.owner);
            let result = LockAcquireResult {
                acquired: true,
                fence_token: record.fence_token,
                ..Default::default()
            };
            if waiter.tx.send(result).is_ok() {
                debug!(key = %record.key, owner = %waiter.owner, "Lock handed to waiter");
                return;
            }
            record.force_release();
        }
    }
}

impl Default for MemoryLockService {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for MemoryLockService {
    fn drop(&mut self) {
        if let Some(handle) = self.cleanup_handle.take() {
            handle.abort();
        }
    }
}

#[async_trait]
impl LockService for MemoryLockService {
    async fn acquire(&self, request: LockAcquireRequest) -> anyhow::Result<LockAcquireResult> {
        let key = lock_key(&request.namespace, &request.name);

        let mut record = self
            .locks
            .entry(key.clone())
            .or_insert_with(|| LockRecord::new(&request.namespace, &request.name));

        if record.state == LockState::Locked && record.is_expired() {
            record.expire();
        }

        if !record.is_locked() {
            record.ttl_ms = request.ttl_ms;
        }
        if record.acquire(&request.owner) {
            debug!(key = %key, owner = %request.owner, "Lock acquired");
            return Ok(LockAcquireResult {
                acquired: true,
                fence_token: record.fence_token,
                ..Default::default()
            });
        }

        let current_owner = record.owner.clone();

        if request.wait_ms == 0 {
            return Ok(LockAcquireResult {
                acquired: false,
                current_owner,
                error: Some("Lock is held by another owner".to_string()),
                ..Default::default()
            });
        }

        // Queue while still holding the record so a concurrent release
        // cannot slip in between the check and the enqueue.
        let (tx, mut rx) = oneshot::channel();
        let wait = Duration::from_millis(request.wait_ms);
        let waiter_id = self.next_waiter_id.fetch_add(1, Ordering::Relaxed);
        self.waiters
            .entry(key.clone())
            .or_default()
            .push_back(LockWaiter {
                id: waiter_id,
                owner: request.owner.clone(),
                ttl_ms: request.ttl_ms,
                deadline: Instant::now().checked_add(wait),
                tx,
            });
        drop(record);

        if let Ok(Ok(result)) = tokio::time::timeout(wait, &mut rx).await {
            return Ok(result);
        }

        // Timed out. Dequeue under the record guard, then check whether a
        // grant raced the timeout.
        let guard = self.locks.get_mut(&key);
        if let Some(mut queue) = self.waiters.get_mut(&key) {
            queue.retain(|w| w.id != waiter_id);
        }
        self.waiters.remove_if(&key, |_, queue| queue.is_empty());
        drop(guard);

        if let Ok(result) = rx.try_recv() {
            return Ok(result);
        }

        Ok(LockAcquireResult {
            acquired: false,
            current_owner,
            error: Some("Lock acquisition timeout".to_string()),
            ..Default::default()
        })
    }

    async fn release(&self, request: LockReleaseRequest) -> anyhow::Result<LockReleaseResult> {
        let key = lock_key(&request.namespace, &request.name);

        let Some(mut record) = self.locks.get_mut(&key) else {
            return Ok(LockReleaseResult {
                released: false,
                error: Some("Lock not found".to_string()),
            });
        };

        if let Some(expected_token) = request.fence_token {
            if record.fence_token != expected_token {
                return Ok(LockReleaseResult {
                    released: false,
                    error: Some("Fence token mismatch".to_string()),
                });
            }
        }

        if !record.release(&request.owner) {
            return Ok(LockReleaseResult {
                released: false,
                error: Some("Not the lock owner".to_string()),
            });
        }

        debug!(key = %key, owner = %request.owner, "Lock released");
        Self::hand_over(&mut record, &self.waiters);

        Ok(LockReleaseResult {
            released: true,
            error: None,
        })
    }

    async fn renew(&self, request: LockRenewRequest) -> anyhow::Result<LockRenewResult> {
        let key = lock_key(&request.namespace, &request.name);

        let Some(mut record) = self.locks.get_mut(&key) else {
            return Ok(LockRenewResult {
                renewed: false,
                expires_at: None,
                error: Some("Lock not found".to_string()),
            });
        };

        if !record.renew(&request.owner, request.fence_token) {
            return Ok(LockRenewResult {
                renewed: false,
                expires_at: record.expires_at,
                error: Some("Not the lock owner".to_string()),
            });
        }

        Ok(LockRenewResult {
            renewed: true,
            expires_at: record.expires_at,
            error: None,
        })
    }

    async fn get(&self, namespace: &str, name: &str) -> anyhow::Result<Option<LockRecord>> {
        let key = lock_key(namespace, name);
        Ok(self.locks.get(&key).map(|record| record.clone()))
    }

    async fn force_release(&self, namespace: &str, name: &str) -> anyhow::Result<bool> {
        let key = lock_key(namespace, name);

        if let Some(mut record) = self.locks.get_mut(&key) {
            record.force_release();
            debug!(key = %key, "Lock force released");
            Self::hand_over(&mut record, &self.waiters);
            return Ok(true);
        }

        Ok(false)
    }
}
