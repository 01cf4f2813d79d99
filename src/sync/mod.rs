//! Per-key mutual exclusion
//!
//! Every store operation on a key runs under that key's lock. Two lockers
//! implement [`KeyLocker`]:
//!
//! - [`LocalLocker`]: in-process mutexes, for a single store instance
//! - [`LeaseLocker`]: a local mutex plus a time-bounded lease in a shared
//!   backend, for several processes sharing spill storage

pub mod lease;
pub mod local;

pub use lease::{FileLeaseBackend, Lease, LeaseBackend, LeaseGuard, LeaseLocker, MemoryLeaseBackend};
pub use local::{LocalGuard, LocalLocks};

use crate::config::{LeaseBackendKind, LockConfig, LockMode};
use crate::error::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Exclusive hold on one key, released when dropped
pub struct LockGuard {
    inner: GuardInner,
}

enum GuardInner {
    Local(LocalGuard),
    Lease(LeaseGuard),
}

impl LockGuard {
    /// Whether the hold is backed by a distributed lease
    pub fn is_lease(&self) -> bool {
        matches!(self.inner, GuardInner::Lease(_))
    }
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.inner {
            GuardInner::Local(g) => f.debug_tuple("LockGuard::Local").field(&g.key()).finish(),
            GuardInner::Lease(g) => f.debug_tuple("LockGuard::Lease").field(&g.holder()).finish(),
        }
    }
}

/// Source of per-key locks
#[async_trait]
pub trait KeyLocker: Send + Sync {
    /// Acquire the lock for `key`, waiting at most the configured timeout
    async fn lock(&self, key: &str) -> Result<LockGuard>;

    /// Diagnostic only: the answer may be stale by the time it is used
    fn is_locked(&self, key: &str) -> bool;
}

/// In-process locker
pub struct LocalLocker {
    locks: LocalLocks,
    acquire_timeout: Duration,
}

impl LocalLocker {
    pub fn new(config: &LockConfig) -> Self {
        Self {
            locks: LocalLocks::new(config.sweep_threshold),
            acquire_timeout: config.acquire_timeout(),
        }
    }
}

#[async_trait]
impl KeyLocker for LocalLocker {
    async fn lock(&self, key: &str) -> Result<LockGuard> {
        let guard = self.locks.acquire_timeout(key, self.acquire_timeout).await?;
        Ok(LockGuard {
            inner: GuardInner::Local(guard),
        })
    }

    fn is_locked(&self, key: &str) -> bool {
        self.locks.is_locked(key)
    }
}

#[async_trait]
impl KeyLocker for LeaseLocker {
    async fn lock(&self, key: &str) -> Result<LockGuard> {
        let guard = self.acquire(key).await?;
        Ok(LockGuard {
            inner: GuardInner::Lease(guard),
        })
    }

    fn is_locked(&self, key: &str) -> bool {
        LeaseLocker::is_locked(self, key)
    }
}

/// Build the locker selected by `config`; lease holders are prefixed with
/// `service_id`
pub fn locker_from_config(config: &LockConfig, service_id: &str) -> Result<Arc<dyn KeyLocker>> {
    let locker: Arc<dyn KeyLocker> = match config.mode {
        LockMode::Local => Arc::new(LocalLocker::new(config)),
        LockMode::Distributed => {
            let backend: Arc<dyn LeaseBackend> = match config.backend {
                LeaseBackendKind::Memory => Arc::new(MemoryLeaseBackend::new()),
                LeaseBackendKind::File => Arc::new(FileLeaseBackend::new(&config.directory)?),
            };
            Arc::new(LeaseLocker::new(backend, service_id, config))
        }
    };
    tracing::debug!(mode = ?config.mode, backend = ?config.backend, "Key locker ready");
    Ok(locker)
}
