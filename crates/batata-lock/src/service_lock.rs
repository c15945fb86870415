//! Default lock flavor: one named lock on a [`LockService`]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::{ServiceLockConfig, duration_millis};
use crate::error::Result;
use crate::lock::DistributedLock;
use crate::service::{
    LockAcquireRequest, LockReleaseRequest, LockRenewRequest, LockService, lock_key,
};

/// Notified when a lock this process believed it held turns out to be gone
/// (lease expired, force released, or service state lost).
pub trait LockLostListener: Send + Sync {
    fn on_lock_lost(&self, key: &str, reason: &str);
}

#[derive(Debug)]
struct Holding {
    fence_token: u64,
    holds: u32,
    /// Cleared once the service refuses to renew the lease
    valid: Arc<AtomicBool>,
    renewal: Option<JoinHandle<()>>,
}

impl Holding {
    fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }
}

impl Drop for Holding {
    fn drop(&mut self) {
        if let Some(handle) = self.renewal.take() {
            handle.abort();
        }
    }
}

fn notify_lost(key: &str, owner: &str, listener: Option<&dyn LockLostListener>, reason: &str) {
    warn!(key, owner, reason, "Lock was lost before release");
    if let Some(listener) = listener {
        listener.on_lock_lost(key, reason);
    }
}

/// A reentrant lock on one resource path, granted by a [`LockService`].
///
/// Reentrancy is tracked per instance: acquiring an already held instance
/// only bumps a hold count, and the service is released when the count
/// drops back to zero.
///
/// While held with a lease (`ttl_ms > 0`), a background task renews the
/// lease every third of its length. A refused renewal marks the lock lost.
pub struct ServiceLock {
    service: Arc<dyn LockService>,
    namespace: String,
    name: String,
    key: String,
    owner: String,
    ttl_ms: u64,
    poll_interval: Duration,
    state: Mutex<Option<Holding>>,
    listener: Option<Arc<dyn LockLostListener>>,
}

impl ServiceLock {
    pub fn new(
        service: Arc<dyn LockService>,
        path: &str,
        config: &ServiceLockConfig,
    ) -> Result<Self> {
        config.validate()?;
        let owner = config
            .owner
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        Ok(Self {
            service,
            namespace: config.namespace.clone(),
            name: path.to_string(),
            key: lock_key(&config.namespace, path),
            owner,
            ttl_ms: config.ttl_ms,
            poll_interval: config.poll_interval(),
            state: Mutex::new(None),
            listener: None,
        })
    }

    pub fn with_listener(mut self, listener: Arc<dyn LockLostListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Fence token of the current grant, if held
    pub fn fence_token(&self) -> Option<u64> {
        self.state.lock().as_ref().map(|h| h.fence_token)
    }

    fn reenter(&self) -> bool {
        let mut state = self.state.lock();
        match state.as_mut() {
            Some(holding) if holding.is_valid() => {
                holding.holds += 1;
                true
            }
            Some(_) => {
                // Lost while held; the next grant starts a fresh holding
                *state = None;
                false
            }
            None => false,
        }
    }

    fn start_renewal(&self, fence_token: u64, valid: Arc<AtomicBool>) -> Option<JoinHandle<()>> {
        if self.ttl_ms == 0 {
            return None;
        }

        let period = Duration::from_millis((self.ttl_ms / 3).max(1));
        let service = self.service.clone();
        let listener = self.listener.clone();
        let key = self.key.clone();
        let request = LockRenewRequest {
            namespace: self.namespace.clone(),
            name: self.name.clone(),
            owner: self.owner.clone(),
            fence_token,
        };

        Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(period).await;
                match service.renew(request.clone()).await {
                    Ok(result) if result.renewed => {
                        debug!(key = %key, expires_at = ?result.expires_at, "Lock lease renewed");
                    }
                    Ok(result) => {
                        valid.store(false, Ordering::Release);
                        let reason = result.error.as_deref().unwrap_or("renewal refused");
                        notify_lost(&key, &request.owner, listener.as_deref(), reason);
                        return;
                    }
                    Err(err) => {
                        warn!(key = %key, error = %err, "Lock renewal failed, will retry");
                    }
                }
            }
        }))
    }

    fn hold(&self, fence_token: u64) -> Holding {
        let valid = Arc::new(AtomicBool::new(true));
        Holding {
            fence_token,
            holds: 1,
            renewal: self.start_renewal(fence_token, valid.clone()),
            valid,
        }
    }

    async fn request(&self, wait: Duration) -> Result<bool> {
        let result = self
            .service
            .acquire(LockAcquireRequest {
                namespace: self.namespace.clone(),
                name: self.name.clone(),
                owner: self.owner.clone(),
                ttl_ms: self.ttl_ms,
                wait_ms: duration_millis(wait),
            })
            .await?;

        if !result.acquired {
            debug!(
                key = %self.key,
                current_owner = ?result.current_owner,
                "Lock not granted"
            );
            return Ok(false);
        }

        let mut state = self.state.lock();
        match state.as_mut() {
            Some(holding) if holding.is_valid() => holding.holds += 1,
            _ => *state = Some(self.hold(result.fence_token)),
        }
        debug!(key = %self.key, fence_token = result.fence_token, "Lock acquired");
        Ok(true)
    }

    fn lost(&self, reason: &str) {
        notify_lost(&self.key, &self.owner, self.listener.as_deref(), reason);
    }
}

#[async_trait]
impl DistributedLock for ServiceLock {
    async fn acquire(&self) -> Result<()> {
        if self.reenter() {
            return Ok(());
        }
        while !self.request(self.poll_interval).await? {
            debug!(key = %self.key, "Still waiting for lock");
        }
        Ok(())
    }

    async fn acquire_timeout(&self, timeout: Duration) -> Result<bool> {
        if self.reenter() {
            return Ok(true);
        }
        self.request(timeout).await
    }

    async fn release(&self) -> Result<()> {
        let (fence_token, valid, renewal) = {
            let mut state = self.state.lock();
            let Some(holding) = state.as_mut() else {
                return Ok(());
            };
            if holding.holds > 1 {
                holding.holds -= 1;
                return Ok(());
            }
            (
                holding.fence_token,
                holding.valid.clone(),
                holding.renewal.take(),
            )
        };

        // Stop renewing before giving the grant back so a late renewal
        // cannot report the released lock as lost.
        if let Some(handle) = renewal {
            handle.abort();
            let _ = handle.await;
        }
        if !valid.load(Ordering::Acquire) {
            // Already reported by the renewal task
            *self.state.lock() = None;
            return Ok(());
        }

        let released = self
            .service
            .release(LockReleaseRequest {
                namespace: self.namespace.clone(),
                name: self.name.clone(),
                owner: self.owner.clone(),
                fence_token: Some(fence_token),
            })
            .await;

        let result = match released {
            Ok(result) => result,
            Err(err) => {
                // Keep the holding so the caller can retry the release
                if let Some(holding) = self.state.lock().as_mut() {
                    if holding.renewal.is_none() {
                        holding.renewal = self.start_renewal(fence_token, valid);
                    }
                }
                return Err(err.into());
            }
        };

        *self.state.lock() = None;

        if result.released {
            debug!(key = %self.key, "Lock released");
        } else {
            let reason = result.error.as_deref().unwrap_or("released by the service");
            self.lost(reason);
        }
        Ok(())
    }

    async fn is_held_by_this_process(&self) -> bool {
        self.state.lock().as_ref().is_some_and(Holding::is_valid)
    }
}

impl std::fmt::Debug for ServiceLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceLock")
            .field("key", &self.key)
            .field("owner", &self.owner)
            .field("state", &*self.state.lock())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LockError;
    use crate::service::MemoryLockService;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn config(owner: &str) -> ServiceLockConfig {
        ServiceLockConfig::new("test")
            .with_owner(owner)
            .with_poll_interval(Duration::from_millis(20))
    }

    #[derive(Default)]
    struct CountingListener {
        lost: AtomicUsize,
    }

    impl LockLostListener for CountingListener {
        fn on_lock_lost(&self, _key: &str, _reason: &str) {
            self.lost.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_acquire_and_release() {
        let service: Arc<dyn LockService> = Arc::new(MemoryLockService::new());
        let lock = ServiceLock::new(service.clone(), "orders", &config("a")).unwrap();

        assert_eq!(lock.key(), "test::orders");
        assert!(!lock.is_held_by_this_process().await);

        lock.acquire().await.unwrap();
        assert!(lock.is_held_by_this_process().await);
        assert_eq!(lock.fence_token(), Some(1));

        let record = service.get("test", "orders").await.unwrap().unwrap();
        assert!(record.is_owned_by("a"));

        lock.release().await.unwrap();
        assert!(!lock.is_held_by_this_process().await);
        let record = service.get("test", "orders").await.unwrap().unwrap();
        assert!(!record.is_locked());
    }

    #[tokio::test]
    async fn test_contended_acquire_times_out() {
        let service: Arc<dyn LockService> = Arc::new(MemoryLockService::new());
        let first = ServiceLock::new(service.clone(), "orders", &config("a")).unwrap();
        let second = ServiceLock::new(service.clone(), "orders", &config("b")).unwrap();

        assert!(first.acquire_timeout(Duration::ZERO).await.unwrap());
        assert!(!second.acquire_timeout(Duration::from_millis(20)).await.unwrap());
        assert!(!second.is_held_by_this_process().await);
    }

    #[tokio::test]
    async fn test_reentrant_holds() {
        let service: Arc<dyn LockService> = Arc::new(MemoryLockService::new());
        let lock = ServiceLock::new(service.clone(), "orders", &config("a")).unwrap();

        lock.acquire().await.unwrap();
        assert!(lock.acquire_timeout(Duration::ZERO).await.unwrap());

        lock.release().await.unwrap();
        assert!(lock.is_held_by_this_process().await);
        let record = service.get("test", "orders").await.unwrap().unwrap();
        assert!(record.is_locked());

        lock.release().await.unwrap();
        assert!(!lock.is_held_by_this_process().await);
    }

    #[tokio::test]
    async fn test_release_when_not_held_is_noop() {
        let service: Arc<dyn LockService> = Arc::new(MemoryLockService::new());
        let lock = ServiceLock::new(service, "orders", &config("a")).unwrap();
        lock.release().await.unwrap();
        assert!(!lock.is_held_by_this_process().await);
    }

    #[tokio::test]
    async fn test_lost_lock_notifies_listener() {
        let service: Arc<dyn LockService> = Arc::new(MemoryLockService::new());
        let listener = Arc::new(CountingListener::default());
        let lock = ServiceLock::new(service.clone(), "orders", &config("a"))
            .unwrap()
            .with_listener(listener.clone());

        lock.acquire().await.unwrap();
        assert!(service.force_release("test", "orders").await.unwrap());

        lock.release().await.unwrap();
        assert_eq!(listener.lost.load(Ordering::SeqCst), 1);
        assert!(!lock.is_held_by_this_process().await);
    }

    #[tokio::test]
    async fn test_lease_is_renewed_while_held() {
        let service: Arc<dyn LockService> = Arc::new(MemoryLockService::new());
        let cfg = config("a").with_ttl(Duration::from_millis(60));
        let lock = ServiceLock::new(service.clone(), "orders", &cfg).unwrap();
        let contender = ServiceLock::new(service.clone(), "orders", &config("b")).unwrap();

        lock.acquire().await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert!(lock.is_held_by_this_process().await);
        assert!(!contender.acquire_timeout(Duration::ZERO).await.unwrap());
        let record = service.get("test", "orders").await.unwrap().unwrap();
        assert!(record.is_owned_by("a"));

        lock.release().await.unwrap();
        assert!(contender.acquire_timeout(Duration::ZERO).await.unwrap());
    }

    #[tokio::test]
    async fn test_refused_renewal_marks_lock_lost() {
        let service: Arc<dyn LockService> = Arc::new(MemoryLockService::new());
        let listener = Arc::new(CountingListener::default());
        let cfg = config("a").with_ttl(Duration::from_millis(60));
        let lock = ServiceLock::new(service.clone(), "orders", &cfg)
            .unwrap()
            .with_listener(listener.clone());

        lock.acquire().await.unwrap();
        assert!(service.force_release("test", "orders").await.unwrap());
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(!lock.is_held_by_this_process().await);
        assert_eq!(listener.lost.load(Ordering::SeqCst), 1);

        lock.release().await.unwrap();
        assert_eq!(listener.lost.load(Ordering::SeqCst), 1);

        // A lost lock can be acquired again
        assert!(lock.acquire_timeout(Duration::ZERO).await.unwrap());
        assert!(lock.is_held_by_this_process().await);
        assert_eq!(lock.fence_token(), Some(2));
    }

    #[tokio::test]
    async fn test_same_owner_on_two_instances_excludes() {
        let service: Arc<dyn LockService> = Arc::new(MemoryLockService::new());
        let first = ServiceLock::new(service.clone(), "orders", &config("w")).unwrap();
        let second = ServiceLock::new(service.clone(), "orders", &config("w")).unwrap();

        assert!(first.acquire_timeout(Duration::ZERO).await.unwrap());
        assert!(!second.acquire_timeout(Duration::from_millis(20)).await.unwrap());
        assert!(!second.is_held_by_this_process().await);
    }

    #[tokio::test]
    async fn test_unbounded_timeout_waits_for_release() {
        let service: Arc<dyn LockService> = Arc::new(MemoryLockService::new());
        let first = ServiceLock::new(service.clone(), "orders", &config("a")).unwrap();
        let second = Arc::new(ServiceLock::new(service.clone(), "orders", &config("b")).unwrap());

        first.acquire().await.unwrap();
        let waiting = {
            let second = second.clone();
            tokio::spawn(async move { second.acquire_timeout(Duration::MAX).await.unwrap() })
        };

        tokio::time::sleep(Duration::from_millis(30)).await;
        first.release().await.unwrap();

        assert!(waiting.await.unwrap());
        assert!(second.is_held_by_this_process().await);
    }

    #[tokio::test]
    async fn test_generated_owners_are_distinct() {
        let service: Arc<dyn LockService> = Arc::new(MemoryLockService::new());
        let cfg = ServiceLockConfig::default();
        let a = ServiceLock::new(service.clone(), "x", &cfg).unwrap();
        let b = ServiceLock::new(service, "x", &cfg).unwrap();
        assert_ne!(a.owner(), b.owner());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let service: Arc<dyn LockService> = Arc::new(MemoryLockService::new());
        let err = ServiceLock::new(service, "x", &ServiceLockConfig::new("")).unwrap_err();
        assert!(matches!(err, LockError::InvalidConfig(_)));
    }
}
