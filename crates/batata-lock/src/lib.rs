//! Batata Lock - composite distributed locks
//!
//! This crate provides:
//! - `DistributedLock`: the capability shared by every lock flavor
//! - `MultiLock`: acquires an ordered set of locks as one unit, rolling back
//!   on partial failure, and releases them in reverse order
//! - `ServiceLock`: the default flavor, one named lock on a `LockService`
//! - `MemoryLockService`: in-process lock service with leases and waiters

pub mod config;
pub mod error;
pub mod lock;
pub mod multi;
pub mod service;
pub mod service_lock;

pub use config::{AcquireErrorPolicy, MultiLockConfig, ServiceLockConfig, TimeoutScope};
pub use error::{LockError, Result};
pub use lock::{DistributedLock, LockHandle};
pub use multi::MultiLock;
pub use service::{LockService, MemoryLockService};
pub use service_lock::{LockLostListener, ServiceLock};
