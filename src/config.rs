//! Synapse configuration management

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main Synapse configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SynapseConfig {
    /// Store façade and in-memory tiers
    #[serde(default)]
    pub store: StoreConfig,

    /// Disk-backed spill tier
    #[serde(default)]
    pub spill: SpillConfig,

    /// Per-key locking
    #[serde(default)]
    pub lock: LockConfig,
}

impl SynapseConfig {
    /// Load a configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the store cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.store.partitions == 0 {
            return Err(Error::Config("store.partitions must be at least 1".to_string()));
        }
        if self.store.cache_capacity_bytes == 0 {
            return Err(Error::Config(
                "store.cache_capacity_bytes must be greater than 0".to_string(),
            ));
        }
        if self.lock.acquire_timeout_ms == 0 {
            return Err(Error::Config(
                "lock.acquire_timeout_ms must be greater than 0".to_string(),
            ));
        }
        if self.lock.lease_timeout_ms == 0 {
            return Err(Error::Config(
                "lock.lease_timeout_ms must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Identifier of the service owning this store, used as lease holder prefix
    pub service_id: String,

    /// Number of partition slots for small tensors (fixed for the store's lifetime)
    pub partitions: usize,

    /// Byte capacity of the bounded cache; larger tensors are spilled to disk
    pub cache_capacity_bytes: usize,

    /// Seconds after its last write before a cache entry expires
    pub cache_expire_secs: u64,

    /// Accelerator device ids, addressed by their index in this list
    pub gpu_devices: Vec<u32>,

    /// Soft byte limit across all allocations (warn only)
    pub quota_limit_bytes: Option<u64>,
}

impl StoreConfig {
    pub fn cache_expiry(&self) -> Duration {
        Duration::from_secs(self.cache_expire_secs)
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            service_id: "synapse".to_string(),
            partitions: 4,
            cache_capacity_bytes: 64 * 1024 * 1024,
            cache_expire_secs: 3600,
            gpu_devices: vec![0],
            quota_limit_bytes: None,
        }
    }
}

/// Spill tier configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpillConfig {
    /// Directory holding one backing file per spilled key
    pub directory: PathBuf,

    /// Verify the sidecar checksum on every retrieve
    pub verify_checksum: bool,
}

impl Default for SpillConfig {
    fn default() -> Self {
        Self {
            directory: base_dir().join("spill"),
            verify_checksum: true,
        }
    }
}

/// Lock mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LockMode {
    /// In-process mutex per key
    #[default]
    Local,

    /// In-process mutex plus a leased lock in a coordination backend
    Distributed,
}

/// Coordination backend for distributed leases
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LeaseBackendKind {
    /// Leases live in this process only
    #[default]
    Memory,

    /// Lease files in a shared directory, visible to every process using it
    File,
}

/// Lock configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// Local or distributed locking
    pub mode: LockMode,

    /// Coordination backend used in distributed mode
    pub backend: LeaseBackendKind,

    /// Lease lifetime; a holder that never releases is expired after this
    pub lease_timeout_ms: u64,

    /// How long a caller waits for a key before failing with a timeout
    pub acquire_timeout_ms: u64,

    /// Base delay between lease acquisition attempts
    pub retry_interval_ms: u64,

    /// Directory for lease files (file backend)
    pub directory: PathBuf,

    /// Idle local mutexes are swept once the registry grows past this size
    pub sweep_threshold: usize,
}

impl LockConfig {
    pub fn lease_timeout(&self) -> Duration {
        Duration::from_millis(self.lease_timeout_ms)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            mode: LockMode::Local,
            backend: LeaseBackendKind::Memory,
            lease_timeout_ms: 10_000,
            acquire_timeout_ms: 10_000,
            retry_interval_ms: 25,
            directory: base_dir().join("locks"),
            sweep_threshold: 1024,
        }
    }
}

fn base_dir() -> PathBuf {
    dirs_next::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("synapse")
}
