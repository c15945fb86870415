//! Configuration for composite and service-backed locks

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{LockError, Result};

/// How a timeout passed to a composite acquire is spent
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutScope {
    /// Every lock in the set gets the full timeout
    #[default]
    PerLock,
    /// The timeout is one deadline shared by the whole acquisition
    Deadline,
}

/// What a composite acquire does after a lock raises an error
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AcquireErrorPolicy {
    /// Stop walking the set at the first error
    #[default]
    Stop,
    /// Keep attempting the remaining locks; the attempt still fails and
    /// everything acquired is rolled back
    Continue,
}

/// Configuration for a [`MultiLock`](crate::MultiLock)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MultiLockConfig {
    pub timeout_scope: TimeoutScope,
    pub on_acquire_error: AcquireErrorPolicy,
}

impl MultiLockConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout_scope(mut self, scope: TimeoutScope) -> Self {
        self.timeout_scope = scope;
        self
    }

    pub fn with_acquire_error_policy(mut self, policy: AcquireErrorPolicy) -> Self {
        self.on_acquire_error = policy;
        self
    }
}

/// Configuration for a [`ServiceLock`](crate::ServiceLock)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceLockConfig {
    /// Namespace the lock records live in
    pub namespace: String,
    /// Lease length granted by the service in milliseconds (0 = no expiry)
    pub ttl_ms: u64,
    /// Wait budget of each service request made by an unbounded acquire
    pub poll_interval_ms: u64,
    /// Fixed owner id; a random one is generated per lock when unset.
    ///
    /// The service refuses a held lock even to its own owner id, so two
    /// locks configured with the same owner still exclude each other.
    pub owner: Option<String>,
}

impl Default for ServiceLockConfig {
    fn default() -> Self {
        Self {
            namespace: "public".to_string(),
            ttl_ms: 30000,
            poll_interval_ms: 1000,
            owner: None,
        }
    }
}

impl ServiceLockConfig {
    /// Create a config for the given namespace
    pub fn new(namespace: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            ..Default::default()
        }
    }

    /// Set the lease length
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl_ms = duration_millis(ttl);
        self
    }

    /// Set the wait budget per request of an unbounded acquire
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = duration_millis(interval);
        self
    }

    /// Use a fixed owner id instead of a generated one
    pub fn with_owner(mut self, owner: &str) -> Self {
        self.owner = Some(owner.to_string());
        self
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.namespace.trim().is_empty() {
            return Err(LockError::InvalidConfig("namespace is empty".to_string()));
        }
        if self.poll_interval_ms == 0 {
            return Err(LockError::InvalidConfig(
                "poll_interval_ms must be greater than zero".to_string(),
            ));
        }
        if let Some(owner) = &self.owner {
            if owner.trim().is_empty() {
                return Err(LockError::InvalidConfig("owner is empty".to_string()));
            }
        }
        Ok(())
    }
}

/// Whole milliseconds in `d`, saturating at `u64::MAX`
pub(crate) fn duration_millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_multi_lock_config_default() {
        let config = MultiLockConfig::default();
        assert_eq!(config.timeout_scope, TimeoutScope::PerLock);
        assert_eq!(config.on_acquire_error, AcquireErrorPolicy::Stop);
    }

    #[test]
    fn test_multi_lock_config_builder() {
        let config = MultiLockConfig::new()
            .with_timeout_scope(TimeoutScope::Deadline)
            .with_acquire_error_policy(AcquireErrorPolicy::Continue);
        assert_eq!(config.timeout_scope, TimeoutScope::Deadline);
        assert_eq!(config.on_acquire_error, AcquireErrorPolicy::Continue);
    }

    #[test]
    fn test_multi_lock_config_deserialize() {
        let config: MultiLockConfig =
            serde_json::from_str(r#"{"timeout_scope": "deadline"}"#).unwrap();
        assert_eq!(config.timeout_scope, TimeoutScope::Deadline);
        assert_eq!(config.on_acquire_error, AcquireErrorPolicy::Stop);
    }

    #[test]
    fn test_service_lock_config_default() {
        let config = ServiceLockConfig::default();
        assert_eq!(config.namespace, "public");
        assert_eq!(config.ttl_ms, 30000);
        assert_eq!(config.poll_interval(), Duration::from_secs(1));
        assert!(config.owner.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_service_lock_config_builder() {
        let config = ServiceLockConfig::new("orders")
            .with_ttl(Duration::from_secs(5))
            .with_poll_interval(Duration::from_millis(50))
            .with_owner("worker-1");

        assert_eq!(config.namespace, "orders");
        assert_eq!(config.ttl_ms, 5000);
        assert_eq!(config.poll_interval_ms, 50);
        assert_eq!(config.owner.as_deref(), Some("worker-1"));
    }

    #[test]
    fn test_huge_durations_saturate() {
        assert_eq!(duration_millis(Duration::MAX), u64::MAX);
        assert_eq!(duration_millis(Duration::from_millis(1500)), 1500);

        let config = ServiceLockConfig::default()
            .with_ttl(Duration::MAX)
            .with_poll_interval(Duration::MAX);
        assert_eq!(config.ttl_ms, u64::MAX);
        assert_eq!(config.poll_interval_ms, u64::MAX);
    }

    #[test]
    fn test_service_lock_config_validate() {
        assert!(ServiceLockConfig::new("  ").validate().is_err());
        assert!(
            ServiceLockConfig::default()
                .with_poll_interval(Duration::ZERO)
                .validate()
                .is_err()
        );
        assert!(
            ServiceLockConfig::default()
                .with_owner("")
                .validate()
                .is_err()
        );
    }

    #[test]
    fn test_service_lock_config_deserialize() {
        let config: ServiceLockConfig =
            serde_json::from_str(r#"{"namespace": "jobs", "ttl_ms": 0}"#).unwrap();
        assert_eq!(config.namespace, "jobs");
        assert_eq!(config.ttl_ms, 0);
        assert_eq!(config.poll_interval_ms, 1000);
    }
}
