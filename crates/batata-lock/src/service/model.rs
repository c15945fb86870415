//! Lock records and request/response types exchanged with a lock service

use serde::{Deserialize, Serialize};

/// Lock state enumeration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockState {
    /// Lock is available
    #[default]
    Unlocked,
    /// Lock is held by an owner
    Locked,
    /// Lease ran out before the owner released it
    Expired,
}

/// A lock record as stored by the service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockRecord {
    /// Unique lock key (namespace::name format)
    pub key: String,
    pub name: String,
    pub namespace: String,
    pub state: LockState,
    /// Current owner
    #[serde(default)]
    pub owner: Option<String>,
    /// Monotonically increasing, bumped on every grant
    #[serde(default)]
    pub fence_token: u64,
    /// Unix millis
    #[serde(default)]
    pub acquired_at: Option<i64>,
    /// Unix millis
    #[serde(default)]
    pub expires_at: Option<i64>,
    /// Lease length in milliseconds (0 = no expiry)
    #[serde(default)]
    pub ttl_ms: u64,
}

impl LockRecord {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        let namespace = namespace.into();
        let name = name.into();
        Self {
            key: lock_key(&namespace, &name),
            name,
            namespace,
            state: LockState::Unlocked,
            owner: None,
            fence_token: 0,
            acquired_at: None,
            expires_at: None,
            ttl_ms: 0,
        }
    }

    /// Check if the lock is currently held
    pub fn is_locked(&self) -> bool {
        self.state == LockState::Locked && !self.is_expired()
    }

    /// Check if the lease has run out
    pub fn is_expired(&self) -> bool {
        match self.expires_at {
            Some(expires_at) => current_timestamp() >= expires_at,
            None => false,
        }
    }

    pub fn is_owned_by(&self, owner: &str) -> bool {
        self.is_locked() && self.owner.as_deref() == Some(owner)
    }

    /// Grant the lock to `owner` if it is free.
    ///
    /// A held lock is refused even to its own owner id: reentrancy is the
    /// client's business, and two holders sharing an owner id must still
    /// exclude each other.
    pub fn acquire(&mut self, owner: &str) -> bool {
        if self.is_locked() {
            return false;
        }
        let now = current_timestamp();
        self.state = LockState::Locked;
        self.owner = Some(owner.to_string());
        self.fence_token += 1;
        self.acquired_at = Some(now);
        self.expires_at = (self.ttl_ms > 0).then(|| lease_end(now, self.ttl_ms));
        true
    }

    /// Release the lock if `owner` holds it
    pub fn release(&mut self, owner: &str) -> bool {
        if !self.is_owned_by(owner) {
            return false;
        }
        self.force_release();
        true
    }

    /// Extend the lease of `owner`'s grant by another `ttl_ms`
    pub fn renew(&mut self, owner: &str, fence_token: u64) -> bool {
        if !self.is_owned_by(owner) || self.fence_token != fence_token {
            return false;
        }
        if self.ttl_ms > 0 {
            self.expires_at = Some(lease_end(current_timestamp(), self.ttl_ms));
        }
        true
    }

    pub fn force_release(&mut self) {
        self.state = LockState::Unlocked;
        self.owner = None;
        self.acquired_at = None;
        self.expires_at = None;
    }

    pub fn expire(&mut self) {
        self.state = LockState::Expired;
        self.owner = None;
        self.expires_at = None;
    }
}

/// Request to acquire a lock
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LockAcquireRequest {
    pub namespace: String,
    pub name: String,
    pub owner: String,
    /// Lease length in milliseconds (0 = no expiry)
    pub ttl_ms: u64,
    /// How long to queue for the lock (0 = try once)
    pub wait_ms: u64,
}

/// Result of an acquire request
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LockAcquireResult {
    pub acquired: bool,
    pub fence_token: u64,
    /// Holder at the time of a refusal
    pub current_owner: Option<String>,
    pub error: Option<String>,
}

/// Request to release a lock
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LockReleaseRequest {
    pub namespace: String,
    pub name: String,
    pub owner: String,
    /// When set, the release only succeeds if it matches the current grant
    pub fence_token: Option<u64>,
}

/// Result of a release request
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LockReleaseResult {
    pub released: bool,
    pub error: Option<String>,
}

/// Request to extend the lease of a held lock
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LockRenewRequest {
    pub namespace: String,
    pub name: String,
    pub owner: String,
    /// Grant being renewed
    pub fence_token: u64,
}

/// Result of a renew request
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LockRenewResult {
    pub renewed: bool,
    pub expires_at: Option<i64>,
    pub error: Option<String>,
}

pub fn lock_key(namespace: &str, name: &str) -> String {
    format!("{}::{}", namespace, name)
}

fn lease_end(now: i64, ttl_ms: u64) -> i64 {
    i64::try_from(ttl_ms).map_or(i64::MAX, |ttl| now.saturating_add(ttl))
}

pub(crate) fn current_timestamp() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
