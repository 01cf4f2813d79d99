//! In-process per-key mutexes
//!
//! A mutex is created the first time a key is locked and shared by every
//! later caller for that key. The registry is bounded: a guard removes its
//! key's entry on release when nobody else holds or waits on it, and idle
//! entries left behind by timed-out waiters are swept once the registry
//! grows past a threshold.

use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

type Registry = Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>;

/// Lazily created mutex per key
pub struct LocalLocks {
    registry: Registry,
    sweep_threshold: usize,
}

/// Exclusive hold on one key; released on drop
pub struct LocalGuard {
    key: String,
    registry: Registry,
    guard: Option<OwnedMutexGuard<()>>,
}

impl LocalLocks {
    pub fn new(sweep_threshold: usize) -> Self {
        Self {
            registry: Arc::new(Mutex::new(HashMap::new())),
            sweep_threshold,
        }
    }

    fn mutex_for(&self, key: &str) -> Arc<AsyncMutex<()>> {
        let mut registry = self.registry.lock();
        if registry.len() >= self.sweep_threshold {
            let before = registry.len();
            registry.retain(|_, m| Arc::strong_count(m) > 1);
            tracing::debug!(before, after = registry.len(), "Swept idle key mutexes");
        }
        registry
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Wait for a key's mutex
    pub async fn acquire(&self, key: &str) -> LocalGuard {
        let guard = self.mutex_for(key).lock_owned().await;
        LocalGuard {
            key: key.to_string(),
            registry: self.registry.clone(),
            guard: Some(guard),
        }
    }

    /// Wait for a key's mutex for at most `timeout`
    pub async fn acquire_timeout(&self, key: &str, timeout: Duration) -> Result<LocalGuard> {
        tokio::time::timeout(timeout, self.acquire(key))
            .await
            .map_err(|_| Error::LockTimeout {
                key: key.to_string(),
                waited_ms: timeout.as_millis() as u64,
            })
    }

    /// Diagnostic only: the answer may be stale by the time it is used
    pub fn is_locked(&self, key: &str) -> bool {
        self.registry
            .lock()
            .get(key)
            .map(|m| m.try_lock().is_err())
            .unwrap_or(false)
    }

    /// Number of keys currently tracked
    pub fn tracked_keys(&self) -> usize {
        self.registry.lock().len()
    }
}

impl LocalGuard {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for LocalGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut registry = self.registry.lock();
        let idle = registry
            .get(&self.key)
            .map(|m| Arc::strong_count(m) == 1)
            .unwrap_or(false);
        if idle {
            registry.remove(&self.key);
        }
    }
}
