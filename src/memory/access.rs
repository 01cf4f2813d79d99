//! Ownership permissions and byte quotas per key

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Access mode of a key
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum Permission {
    /// Any caller may read and write
    #[default]
    Shared,
    /// Nobody may write
    ReadOnly,
    /// Only the named owner may write
    Owned { owner: String },
}

impl Permission {
    /// Whether `caller` may mutate a key with this permission
    pub fn allows_write(&self, caller: &str) -> bool {
        match self {
            Permission::Shared => true,
            Permission::ReadOnly => false,
            Permission::Owned { owner } => owner == caller,
        }
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Permission::Shared => f.write_str("shared"),
            Permission::ReadOnly => f.write_str("read-only"),
            Permission::Owned { owner } => write!(f, "owned by {}", owner),
        }
    }
}

/// Key → permission map; unset keys report [`Permission::Shared`]
pub struct PermissionMap {
    permissions: Arc<RwLock<HashMap<String, Permission>>>,
}

impl PermissionMap {
    pub fn new() -> Self {
        Self {
            permissions: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn set_permission(&self, key: &str, permission: Permission) {
        self.permissions
            .write()
            .await
            .insert(key.to_string(), permission);
    }

    pub async fn get_permission(&self, key: &str) -> Permission {
        self.permissions
            .read()
            .await
            .get(key)
            .cloned()
            .unwrap_or_default()
    }

    /// Exact match against an explicitly set permission
    pub async fn check_permission(&self, key: &str, required: &Permission) -> bool {
        self.permissions.read().await.get(key) == Some(required)
    }
}

impl Default for PermissionMap {
    fn default() -> Self {
        Self::new()
    }
}

/// Byte allocations per key with an optional soft limit
pub struct QuotaTracker {
    allocations: Arc<RwLock<HashMap<String, u64>>>,
    limit: Option<u64>,
}

impl QuotaTracker {
    pub fn new(limit: Option<u64>) -> Self {
        Self {
            allocations: Arc::new(RwLock::new(HashMap::new())),
            limit,
        }
    }

    /// Record `bytes` as the key's allocation, replacing the previous one.
    ///
    /// Returns `true` when the total now exceeds the limit. Exceeding the
    /// limit is logged, never refused.
    pub async fn allocate(&self, key: &str, bytes: u64) -> bool {
        let mut allocations = self.allocations.write().await;
        allocations.insert(key.to_string(), bytes);
        let total: u64 = allocations.values().sum();
        match self.limit {
            Some(limit) if total > limit => {
                tracing::warn!(key, total, limit, "Allocation total exceeds quota limit");
                true
            }
            _ => false,
        }
    }

    pub async fn deallocate(&self, key: &str) -> Option<u64> {
        self.allocations.write().await.remove(key)
    }

    /// Allocation for a key; 0 when unknown
    pub async fn get_allocation(&self, key: &str) -> u64 {
        self.allocations.read().await.get(key).copied().unwrap_or(0)
    }

    pub async fn total(&self) -> u64 {
        self.allocations.read().await.values().sum()
    }

    pub fn limit(&self) -> Option<u64> {
        self.limit
    }
}
