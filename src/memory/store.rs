//! Shared artifact store
//!
//! `SharedArtifactStore` is the single entry point callers use to store and
//! retrieve named artifacts. It owns every tier and helper as a field, so
//! several independent stores can live in one process.
//!
//! ## Placement
//!
//! - Text, vectors and blobs are compressed, cached and versioned.
//! - Tensors no larger than the cache capacity are compressed, split over
//!   the partition slots and cached. Larger tensors go to a spill file.
//! - Accelerator copies live in a separate namespace and are not versioned.
//!
//! Tensor retrieval cascades: cache, then partitions, then spill file, then
//! `KeyNotFound`. Asking for a specific version always reads the ledger
//! snapshot, never a live tier.
//!
//! Every operation on a key runs under that key's lock for its whole
//! duration. Accelerator operations lock `gpu:<key>` instead, so host and
//! device work on the same key do not contend.

use super::access::{Permission, PermissionMap, QuotaTracker};
use super::artifact::{
    ArtifactKind, ArtifactRecord, Layout, Metadata, Payload, Placement, Tensor,
};
use super::cache::{BoundedCache, CachePut};
use super::device::DeviceMemory;
use super::ledger::VersionLedger;
use super::partition::PartitionStore;
use super::spill::SpillManager;
use crate::codec;
use crate::config::SynapseConfig;
use crate::error::{Error, Result};
use crate::sync::{locker_from_config, KeyLocker};
use bytes::Bytes;
use chrono::Utc;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Tiered, versioned, lock-guarded artifact store
pub struct SharedArtifactStore {
    config: SynapseConfig,
    cache: BoundedCache,
    partitions: PartitionStore,
    spill: SpillManager,
    devices: DeviceMemory,
    ledger: VersionLedger,
    records: Arc<RwLock<HashMap<String, ArtifactRecord>>>,
    permissions: PermissionMap,
    quota: QuotaTracker,
    locker: Arc<dyn KeyLocker>,
}

fn gpu_key(key: &str) -> String {
    format!("gpu:{}", key)
}

fn kind_mismatch(key: &str, expected: ArtifactKind, actual: ArtifactKind) -> Error {
    Error::KindMismatch {
        key: key.to_string(),
        expected: expected.to_string(),
        actual: actual.to_string(),
    }
}

fn numeric(key: &str, payload: Payload) -> Result<Tensor> {
    match payload {
        Payload::Numeric(tensor) => Ok(tensor),
        _ => Err(Error::Internal(format!(
            "artifact '{}' decoded to a non-numeric payload",
            key
        ))),
    }
}

impl SharedArtifactStore {
    /// Build a store with the locker selected by `config.lock`
    pub fn new(config: SynapseConfig) -> Result<Self> {
        let locker = locker_from_config(&config.lock, &config.store.service_id)?;
        Self::with_locker(config, locker)
    }

    /// Build a store around an existing locker, e.g. one shared with other
    /// stores in the same process
    pub fn with_locker(config: SynapseConfig, locker: Arc<dyn KeyLocker>) -> Result<Self> {
        config.validate()?;
        let partitions = NonZeroUsize::new(config.store.partitions)
            .ok_or_else(|| Error::Config("store.partitions must be at least 1".to_string()))?;
        let expire_after = match config.store.cache_expire_secs {
            0 => None,
            _ => Some(config.store.cache_expiry()),
        };
        let spill = SpillManager::new(
            config.spill.directory.clone(),
            config.spill.verify_checksum,
        )?;

        tracing::info!(
            service = %config.store.service_id,
            partitions = partitions.get(),
            cache_capacity = config.store.cache_capacity_bytes,
            spill_dir = %config.spill.directory.display(),
            devices = config.store.gpu_devices.len(),
            "Artifact store ready"
        );

        Ok(Self {
            cache: BoundedCache::new(config.store.cache_capacity_bytes, expire_after),
            partitions: PartitionStore::new(partitions),
            spill,
            devices: DeviceMemory::new(config.store.gpu_devices.clone()),
            ledger: VersionLedger::new(),
            records: Arc::new(RwLock::new(HashMap::new())),
            permissions: PermissionMap::new(),
            quota: QuotaTracker::new(config.store.quota_limit_bytes),
            locker,
            config,
        })
    }

    pub fn config(&self) -> &SynapseConfig {
        &self.config
    }

    pub fn service_id(&self) -> &str {
        &self.config.store.service_id
    }

    pub fn cache(&self) -> &BoundedCache {
        &self.cache
    }

    pub fn partitions(&self) -> &PartitionStore {
        &self.partitions
    }

    pub fn spill(&self) -> &SpillManager {
        &self.spill
    }

    pub fn devices(&self) -> &DeviceMemory {
        &self.devices
    }

    pub fn ledger(&self) -> &VersionLedger {
        &self.ledger
    }

    pub fn locker(&self) -> &Arc<dyn KeyLocker> {
        &self.locker
    }

    pub fn quota(&self) -> &QuotaTracker {
        &self.quota
    }

    // -------------------------------------------------------------------
    // Text, vectors and blobs
    // -------------------------------------------------------------------

    /// Store text, returning the new version id
    pub async fn store_text(
        &self,
        key: &str,
        text: &str,
        metadata: Option<Metadata>,
    ) -> Result<u64> {
        let payload = Payload::Text(text.to_string());
        self.store_cached(key, ArtifactKind::Text, payload, metadata)
            .await
    }

    /// Latest text, or the text stored at `version`
    pub async fn retrieve_text(&self, key: &str, version: Option<u64>) -> Result<String> {
        match self
            .retrieve_cached(key, ArtifactKind::Text, version)
            .await?
        {
            Payload::Text(text) => Ok(text),
            _ => Err(Error::Internal(format!(
                "artifact '{}' decoded to a non-text payload",
                key
            ))),
        }
    }

    /// Store an embedding vector as a 1-D `float32` array
    pub async fn store_vector(
        &self,
        key: &str,
        values: &[f32],
        metadata: Option<Metadata>,
    ) -> Result<u64> {
        let payload = Payload::Numeric(Tensor::vector(values));
        self.store_cached(key, ArtifactKind::Vector, payload, metadata)
            .await
    }

    pub async fn retrieve_vector(&self, key: &str, version: Option<u64>) -> Result<Vec<f32>> {
        let payload = self
            .retrieve_cached(key, ArtifactKind::Vector, version)
            .await?;
        let tensor = numeric(key, payload)?;
        Ok(tensor.to_f64_vec().into_iter().map(|v| v as f32).collect())
    }

    /// Store opaque bytes
    pub async fn store_blob(
        &self,
        key: &str,
        data: Bytes,
        metadata: Option<Metadata>,
    ) -> Result<u64> {
        self.store_cached(key, ArtifactKind::Blob, Payload::Opaque(data), metadata)
            .await
    }

    pub async fn retrieve_blob(&self, key: &str, version: Option<u64>) -> Result<Bytes> {
        match self
            .retrieve_cached(key, ArtifactKind::Blob, version)
            .await?
        {
            Payload::Opaque(data) => Ok(data),
            _ => Err(Error::Internal(format!(
                "artifact '{}' decoded to a non-opaque payload",
                key
            ))),
        }
    }

    async fn store_cached(
        &self,
        key: &str,
        kind: ArtifactKind,
        payload: Payload,
        metadata: Option<Metadata>,
    ) -> Result<u64> {
        let _guard = self.locker.lock(key).await?;
        self.check_writable(key).await?;
        self.check_kind(key, kind).await?;

        let raw = payload.raw_bytes();
        let compressed = codec::compress(raw)?;
        self.cache_put(key, compressed.clone()).await;
        let version = self
            .commit(
                key,
                kind,
                payload.layout(),
                compressed,
                raw.len(),
                Placement::Memory,
                metadata,
            )
            .await;
        Ok(version)
    }

    async fn retrieve_cached(
        &self,
        key: &str,
        kind: ArtifactKind,
        version: Option<u64>,
    ) -> Result<Payload> {
        let _guard = self.locker.lock(key).await?;
        if let Some(version) = version {
            return self.versioned(key, kind, version).await;
        }

        let record = self
            .check_kind(key, kind)
            .await?
            .ok_or_else(|| Error::KeyNotFound(key.to_string()))?;
        if let Some(compressed) = self.cache.get(key).await {
            tracing::debug!(key, "Cache hit");
            return record.layout.decode(codec::decompress(&compressed)?);
        }

        // Evicted or expired: the latest snapshot holds the same payload
        let snapshot = self.ledger.get_latest(key).await?;
        self.cache_put(key, snapshot.payload.clone()).await;
        snapshot.decode()
    }

    // -------------------------------------------------------------------
    // Tensors
    // -------------------------------------------------------------------

    /// Store a tensor, spilling it to disk when it is larger than the cache
    pub async fn store_tensor(
        &self,
        key: &str,
        tensor: &Tensor,
        metadata: Option<Metadata>,
    ) -> Result<u64> {
        let _guard = self.locker.lock(key).await?;
        self.check_writable(key).await?;
        let previous = self.check_kind(key, ArtifactKind::Tensor).await?;
        self.place_tensor(key, tensor, previous.as_ref(), metadata)
            .await
    }

    /// Replace an existing tensor, appending one version
    pub async fn update_tensor(
        &self,
        key: &str,
        tensor: &Tensor,
        metadata: Option<Metadata>,
    ) -> Result<u64> {
        let _guard = self.locker.lock(key).await?;
        self.check_writable(key).await?;
        let previous = self
            .check_kind(key, ArtifactKind::Tensor)
            .await?
            .ok_or_else(|| Error::KeyNotFound(key.to_string()))?;
        self.place_tensor(key, tensor, Some(&previous), metadata)
            .await
    }

    async fn place_tensor(
        &self,
        key: &str,
        tensor: &Tensor,
        previous: Option<&ArtifactRecord>,
        metadata: Option<Metadata>,
    ) -> Result<u64> {
        let size = tensor.nbytes();
        let compressed = codec::compress(tensor.data())?;

        let placement = if size > self.cache.capacity() {
            let was_spilled = previous.is_some_and(|r| r.placement == Placement::Spill);
            if was_spilled && self.spill.exists(key) {
                self.spill.update(key, tensor)?;
            } else {
                self.spill.store(key, tensor)?;
            }
            // In-memory copies of an older version would shadow the file
            self.cache.evict(key).await;
            self.partitions.remove(key).await;
            tracing::debug!(
                key,
                size,
                capacity = self.cache.capacity(),
                "Tensor routed to spill"
            );
            Placement::Spill
        } else {
            self.partitions.store_partitioned(key, &compressed).await;
            self.cache_put(key, compressed.clone()).await;
            Placement::Memory
        };

        let layout = Layout::Numeric {
            dtype: tensor.dtype(),
            shape: tensor.shape().to_vec(),
        };
        Ok(self
            .commit(
                key,
                ArtifactKind::Tensor,
                layout,
                compressed,
                size,
                placement,
                metadata,
            )
            .await)
    }

    /// Latest tensor, or the tensor stored at `version`
    pub async fn retrieve_tensor(&self, key: &str, version: Option<u64>) -> Result<Tensor> {
        let _guard = self.locker.lock(key).await?;
        if let Some(version) = version {
            let payload = self.versioned(key, ArtifactKind::Tensor, version).await?;
            return numeric(key, payload);
        }

        let record = self.check_kind(key, ArtifactKind::Tensor).await?;
        if let Some(record) = &record {
            if let Some(compressed) = self.cache.get(key).await {
                tracing::debug!(key, "Cache hit");
                return numeric(key, record.layout.decode(codec::decompress(&compressed)?)?);
            }
            if let Some(compressed) = self.partitions.retrieve_partitioned(key).await {
                tracing::debug!(key, "Rebuilt from partitions");
                let payload = record.layout.decode(codec::decompress(&compressed)?)?;
                self.cache_put(key, compressed).await;
                return numeric(key, payload);
            }
        }

        // Without a record (e.g. a file left by another process) the
        // sidecar supplies the layout
        let layout = record
            .as_ref()
            .and_then(|r| r.dtype().zip(r.shape().map(<[usize]>::to_vec)));
        let view = match layout {
            Some((dtype, shape)) => self.spill.retrieve(key, dtype, &shape)?,
            None => self.spill.retrieve_described(key)?,
        };
        tracing::debug!(key, bytes = view.len(), "Read from spill");
        view.to_tensor()
    }

    // -------------------------------------------------------------------
    // Accelerators
    // -------------------------------------------------------------------

    pub async fn store_on_gpu(&self, device: usize, key: &str, tensor: &Tensor) -> Result<()> {
        let _guard = self.locker.lock(&gpu_key(key)).await?;
        self.check_writable(key).await?;
        self.devices.store(device, key, tensor).await
    }

    pub async fn retrieve_from_gpu(&self, device: usize, key: &str) -> Result<Tensor> {
        let _guard = self.locker.lock(&gpu_key(key)).await?;
        self.devices.retrieve(device, key).await
    }

    pub async fn update_on_gpu(&self, device: usize, key: &str, tensor: &Tensor) -> Result<()> {
        let _guard = self.locker.lock(&gpu_key(key)).await?;
        self.check_writable(key).await?;
        self.devices.update(device, key, tensor).await
    }

    /// Drop every tensor on a device; returns how many were dropped
    pub async fn clear_gpu(&self, device: usize) -> Result<usize> {
        self.devices.clear(device).await
    }

    // -------------------------------------------------------------------
    // Records, metadata and permissions
    // -------------------------------------------------------------------

    pub async fn get_metadata(&self, key: &str) -> Result<Metadata> {
        self.records
            .read()
            .await
            .get(key)
            .map(|r| r.metadata.clone())
            .ok_or_else(|| Error::KeyNotFound(key.to_string()))
    }

    /// Replace a key's metadata without creating a version
    pub async fn set_metadata(&self, key: &str, metadata: Metadata) -> Result<()> {
        let _guard = self.locker.lock(key).await?;
        self.check_writable(key).await?;
        let mut records = self.records.write().await;
        let record = records
            .get_mut(key)
            .ok_or_else(|| Error::KeyNotFound(key.to_string()))?;
        record.metadata = metadata;
        record.updated_at = Utc::now();
        Ok(())
    }

    pub async fn record(&self, key: &str) -> Option<ArtifactRecord> {
        self.records.read().await.get(key).cloned()
    }

    /// Keys with a live record, sorted
    pub async fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.records.read().await.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub async fn version_count(&self, key: &str) -> usize {
        self.ledger.version_count(key).await
    }

    pub async fn set_permission(&self, key: &str, permission: Permission) {
        tracing::debug!(key, %permission, "Permission set");
        self.permissions.set_permission(key, permission).await;
    }

    pub async fn get_permission(&self, key: &str) -> Permission {
        self.permissions.get_permission(key).await
    }

    pub async fn check_permission(&self, key: &str, required: &Permission) -> bool {
        self.permissions.check_permission(key, required).await
    }

    // -------------------------------------------------------------------
    // Helpers
    // -------------------------------------------------------------------

    async fn check_writable(&self, key: &str) -> Result<()> {
        let permission = self.permissions.get_permission(key).await;
        if permission.allows_write(self.service_id()) {
            return Ok(());
        }
        tracing::warn!(key, %permission, service = %self.service_id(), "Write refused");
        Err(Error::PermissionDenied {
            key: key.to_string(),
            permission: permission.to_string(),
        })
    }

    /// The key's record, if any, after checking it holds `expected`
    async fn check_kind(&self, key: &str, expected: ArtifactKind) -> Result<Option<ArtifactRecord>> {
        let record = self.records.read().await.get(key).cloned();
        match &record {
            Some(r) if r.kind != expected => Err(kind_mismatch(key, expected, r.kind)),
            _ => Ok(record),
        }
    }

    async fn versioned(&self, key: &str, kind: ArtifactKind, version: u64) -> Result<Payload> {
        let snapshot = self.ledger.get(key, version).await?;
        if snapshot.kind != kind {
            return Err(kind_mismatch(key, kind, snapshot.kind));
        }
        snapshot.decode()
    }

    /// Cache a compressed payload; a payload larger than the cache is still
    /// served by the partitions or the ledger
    async fn cache_put(&self, key: &str, compressed: Bytes) {
        if let CachePut::Inserted { evicted } = self.cache.put(key, compressed).await {
            for victim in &evicted {
                tracing::trace!(key, victim = %victim, "Evicted from cache");
            }
        }
    }

    /// Append the snapshot and refresh the record; `None` metadata keeps
    /// what the key already had
    #[allow(clippy::too_many_arguments)]
    async fn commit(
        &self,
        key: &str,
        kind: ArtifactKind,
        layout: Layout,
        compressed: Bytes,
        size_bytes: usize,
        placement: Placement,
        metadata: Option<Metadata>,
    ) -> u64 {
        let metadata = match metadata {
            Some(metadata) => metadata,
            None => self
                .records
                .read()
                .await
                .get(key)
                .map(|r| r.metadata.clone())
                .unwrap_or_default(),
        };
        let version = self
            .ledger
            .append_snapshot(key, kind, layout.clone(), compressed, metadata.clone())
            .await;

        let now = Utc::now();
        {
            let mut records = self.records.write().await;
            let created_at = records.get(key).map(|r| r.created_at).unwrap_or(now);
            records.insert(
                key.to_string(),
                ArtifactRecord {
                    key: key.to_string(),
                    kind,
                    layout,
                    version,
                    placement,
                    size_bytes,
                    metadata,
                    created_at,
                    updated_at: now,
                },
            );
        }
        self.quota.allocate(key, size_bytes as u64).await;

        tracing::debug!(key, %kind, version, ?placement, size_bytes, "Artifact stored");
        version
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::DType;
    use crate::config::{LeaseBackendKind, LockMode};
    use tempfile::TempDir;

    fn test_config(dir: &TempDir, capacity: usize) -> SynapseConfig {
        let mut config = SynapseConfig::default();
        config.store.cache_capacity_bytes = capacity;
        config.store.partitions = 3;
        config.store.gpu_devices = vec![0, 1];
        config.spill.directory = dir.path().join("spill");
        config.lock.acquire_timeout_ms = 5_000;
        config
    }

    fn store(dir: &TempDir, capacity: usize) -> SharedArtifactStore {
        SharedArtifactStore::new(test_config(dir, capacity)).unwrap()
    }

    fn ramp(n: usize, offset: f32) -> Tensor {
        let values: Vec<f32> = (0..n).map(|i| i as f32 + offset).collect();
        Tensor::from_f32(vec![n], &values).unwrap()
    }

    fn meta(pairs: &[(&str, serde_json::Value)]) -> Metadata {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[tokio::test]
    async fn test_tensor_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, 4096);
        let t1 = ramp(10, 0.5);

        assert_eq!(store.store_tensor("t1", &t1, None).await.unwrap(), 0);
        assert_eq!(store.retrieve_tensor("t1", None).await.unwrap(), t1);

        let record = store.record("t1").await.unwrap();
        assert_eq!(record.placement, Placement::Memory);
        assert_eq!(record.dtype(), Some(DType::Float32));
        assert_eq!(record.shape(), Some(&[10usize][..]));
    }

    #[tokio::test]
    async fn test_text_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, 4096);
        store.store_text("k", "hello", None).await.unwrap();
        assert_eq!(store.retrieve_text("k", None).await.unwrap(), "hello");
    }

    #[tokio::test]
    async fn test_vector_and_blob_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, 4096);

        let embedding = [0.25f32, -1.5, 3.0, 1e-3];
        store.store_vector("emb", &embedding, None).await.unwrap();
        assert_eq!(store.retrieve_vector("emb", None).await.unwrap(), embedding);

        let blob = Bytes::from_static(b"\x00\x01binary\xff");
        store.store_blob("raw", blob.clone(), None).await.unwrap();
        assert_eq!(store.retrieve_blob("raw", None).await.unwrap(), blob);
        assert_eq!(store.keys().await, vec!["emb".to_string(), "raw".to_string()]);
    }

    #[tokio::test]
    async fn test_cache_eviction_keeps_other_tiers() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, 4096);
        let t = ramp(8, 1.0);
        store.store_tensor("k", &t, None).await.unwrap();
        store.store_on_gpu(0, "k", &t).await.unwrap();

        store.cache().evict("k").await;
        assert!(store.cache().get("k").await.is_none());

        assert_eq!(store.retrieve_from_gpu(0, "k").await.unwrap(), t);
        // Rebuilt from partitions, which warms the cache again
        assert_eq!(store.retrieve_tensor("k", None).await.unwrap(), t);
        assert!(store.cache().contains("k").await);
    }

    #[tokio::test]
    async fn test_large_tensor_spills() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, 64);
        let big = ramp(32, 0.0);

        store.store_tensor("big", &big, None).await.unwrap();
        let record = store.record("big").await.unwrap();
        assert_eq!(record.placement, Placement::Spill);
        assert!(store.spill().exists("big"));
        assert!(!store.cache().contains("big").await);
        assert!(store.partitions().retrieve_partitioned("big").await.is_none());

        assert_eq!(store.retrieve_tensor("big", None).await.unwrap(), big);
        // Cache eviction does not affect the spill copy
        store.cache().evict("big").await;
        assert_eq!(store.retrieve_tensor("big", None).await.unwrap(), big);
    }

    #[tokio::test]
    async fn test_version_fidelity() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, 4096);
        for i in 0..5 {
            let v = store
                .store_text("doc", &format!("draft {}", i), None)
                .await
                .unwrap();
            assert_eq!(v, i);
        }
        for i in 0..5u64 {
            assert_eq!(
                store.retrieve_text("doc", Some(i)).await.unwrap(),
                format!("draft {}", i)
            );
        }
        assert_eq!(store.retrieve_text("doc", None).await.unwrap(), "draft 4");
        assert!(matches!(
            store.retrieve_text("doc", Some(5)).await,
            Err(Error::VersionNotFound { available: 5, .. })
        ));
    }

    #[tokio::test]
    async fn test_tensor_versions_across_tiers() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, 64);
        let small = ramp(4, 0.0);
        let big = ramp(32, 7.0);

        store.store_tensor("w", &small, None).await.unwrap();
        store.store_tensor("w", &big, None).await.unwrap();
        store.store_tensor("w", &small.cast(DType::Float64), None).await.unwrap();

        assert_eq!(store.retrieve_tensor("w", Some(0)).await.unwrap(), small);
        assert_eq!(store.retrieve_tensor("w", Some(1)).await.unwrap(), big);
        let latest = store.retrieve_tensor("w", None).await.unwrap();
        assert_eq!(latest.dtype(), DType::Float64);
        assert_eq!(latest.to_f64_vec(), vec![0.0, 1.0, 2.0, 3.0]);
    }

    #[tokio::test]
    async fn test_text_served_from_ledger_after_eviction() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, 4096);
        store.store_text("k", "persisted", None).await.unwrap();
        store.cache().clear().await;
        assert_eq!(store.retrieve_text("k", None).await.unwrap(), "persisted");
        assert!(store.cache().contains("k").await);
    }

    #[tokio::test]
    async fn test_update_tensor() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, 64);
        assert!(matches!(
            store.update_tensor("w", &ramp(4, 0.0), None).await,
            Err(Error::KeyNotFound(_))
        ));

        store.store_tensor("w", &ramp(32, 0.0), None).await.unwrap();
        let v = store.update_tensor("w", &ramp(32, 1.0), None).await.unwrap();
        assert_eq!(v, 1);
        assert_eq!(store.version_count("w").await, 2);
        assert_eq!(
            store.retrieve_tensor("w", None).await.unwrap(),
            ramp(32, 1.0)
        );
        assert_eq!(
            store.retrieve_tensor("w", Some(0)).await.unwrap(),
            ramp(32, 0.0)
        );
    }

    #[tokio::test]
    async fn test_missing_keys() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, 4096);
        assert!(matches!(
            store.retrieve_tensor("nope", None).await,
            Err(Error::KeyNotFound(_))
        ));
        assert!(matches!(
            store.retrieve_text("nope", None).await,
            Err(Error::KeyNotFound(_))
        ));
        assert!(matches!(
            store.retrieve_text("nope", Some(0)).await,
            Err(Error::KeyNotFound(_))
        ));
        assert!(matches!(
            store.get_metadata("nope").await,
            Err(Error::KeyNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_kind_mismatch() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, 4096);
        store.store_text("k", "words", None).await.unwrap();

        assert!(matches!(
            store.retrieve_tensor("k", None).await,
            Err(Error::KindMismatch { .. })
        ));
        assert!(matches!(
            store.store_tensor("k", &ramp(2, 0.0), None).await,
            Err(Error::KindMismatch { .. })
        ));
        assert!(matches!(
            store.retrieve_vector("k", Some(0)).await,
            Err(Error::KindMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn test_metadata() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, 4096);
        let first = meta(&[("source", serde_json::json!("crawler"))]);
        store
            .store_text("k", "v0", Some(first.clone()))
            .await
            .unwrap();
        assert_eq!(store.get_metadata("k").await.unwrap(), first);

        // A store without metadata keeps the existing map
        store.store_text("k", "v1", None).await.unwrap();
        assert_eq!(store.get_metadata("k").await.unwrap(), first);

        let second = meta(&[("stage", serde_json::json!(2))]);
        store.set_metadata("k", second.clone()).await.unwrap();
        assert_eq!(store.get_metadata("k").await.unwrap(), second);
        assert_eq!(store.version_count("k").await, 2);

        assert!(store.set_metadata("missing", second).await.is_err());
    }

    #[tokio::test]
    async fn test_permissions_guard_writes() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, 4096);
        store.store_text("frozen", "v0", None).await.unwrap();
        store.set_permission("frozen", Permission::ReadOnly).await;
        assert!(store.check_permission("frozen", &Permission::ReadOnly).await);

        let err = store.store_text("frozen", "v1", None).await.unwrap_err();
        assert!(matches!(err, Error::PermissionDenied { .. }));
        assert!(store.set_metadata("frozen", Metadata::new()).await.is_err());
        // Reads are unaffected
        assert_eq!(store.retrieve_text("frozen", None).await.unwrap(), "v0");

        store
            .set_permission(
                "mine",
                Permission::Owned {
                    owner: store.service_id().to_string(),
                },
            )
            .await;
        assert!(store.store_text("mine", "ok", None).await.is_ok());

        store
            .set_permission(
                "theirs",
                Permission::Owned {
                    owner: "other-service".to_string(),
                },
            )
            .await;
        assert!(store.store_tensor("theirs", &ramp(2, 0.0), None).await.is_err());
        assert!(store.store_on_gpu(0, "theirs", &ramp(2, 0.0)).await.is_err());
    }

    #[tokio::test]
    async fn test_quota_tracks_latest_size() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, 4096);
        store.store_tensor("w", &ramp(10, 0.0), None).await.unwrap();
        assert_eq!(store.quota().get_allocation("w").await, 40);
        store.store_tensor("w", &ramp(4, 0.0), None).await.unwrap();
        assert_eq!(store.quota().get_allocation("w").await, 16);
    }

    #[tokio::test]
    async fn test_gpu_isolation() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, 4096);
        let a = ramp(3, 0.0);
        let b = ramp(3, 10.0);
        store.store_on_gpu(0, "w", &a).await.unwrap();
        store.store_on_gpu(1, "w", &b).await.unwrap();

        assert_eq!(store.clear_gpu(0).await.unwrap(), 1);
        assert!(store.retrieve_from_gpu(0, "w").await.is_err());
        assert_eq!(store.retrieve_from_gpu(1, "w").await.unwrap(), b);

        store.update_on_gpu(1, "w", &a).await.unwrap();
        assert_eq!(store.retrieve_from_gpu(1, "w").await.unwrap(), a);

        assert!(matches!(
            store.store_on_gpu(2, "w", &a).await,
            Err(Error::DeviceNotFound { index: 2, .. })
        ));
        // Device copies are not host artifacts
        assert!(store.record("w").await.is_none());
    }

    #[tokio::test]
    async fn test_fresh_store_reads_existing_spill_file() {
        let dir = TempDir::new().unwrap();
        let big = Tensor::zeros(DType::Int64, vec![4, 8]).unwrap();
        {
            let first = store(&dir, 64);
            first.store_tensor("shared/big", &big, None).await.unwrap();
        }

        let second = store(&dir, 64);
        assert_eq!(second.retrieve_tensor("shared/big", None).await.unwrap(), big);
        // History lives in memory only
        assert!(matches!(
            second.retrieve_tensor("shared/big", Some(0)).await,
            Err(Error::KeyNotFound(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_stores_have_no_version_gaps() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(store(&dir, 4096));

        let mut handles = Vec::new();
        for task in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let mut written = Vec::new();
                for i in 0..10 {
                    let value = (task * 100 + i) as f32;
                    let tensor = Tensor::from_f32(vec![1], &[value]).unwrap();
                    let version = store.store_tensor("shared", &tensor, None).await.unwrap();
                    written.push((version, value));
                }
                written
            }));
        }

        let mut written = Vec::new();
        for handle in handles {
            written.extend(handle.await.unwrap());
        }
        written.sort_by_key(|(version, _)| *version);
        let versions: Vec<u64> = written.iter().map(|(v, _)| *v).collect();
        assert_eq!(versions, (0..80).collect::<Vec<u64>>());

        for (version, value) in written {
            let t = store.retrieve_tensor("shared", Some(version)).await.unwrap();
            assert_eq!(t.to_f64_vec(), vec![value as f64]);
        }
        assert!(!store.locker().is_locked("shared"));
    }

    #[tokio::test]
    async fn test_oversized_text_replaces_cached_value() {
        use rand::{distributions::Alphanumeric, Rng};

        let dir = TempDir::new().unwrap();
        let store = store(&dir, 4096);
        store.store_text("k", "hello", None).await.unwrap();
        assert!(store.cache().contains("k").await);

        let noise: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(20_000)
            .map(char::from)
            .collect();
        store.store_text("k", &noise, None).await.unwrap();

        assert!(!store.cache().contains("k").await);
        assert_eq!(store.retrieve_text("k", None).await.unwrap(), noise);
        assert_eq!(store.retrieve_text("k", Some(0)).await.unwrap(), "hello");
    }

    #[tokio::test]
    async fn test_incompressible_tensor_replaces_cached_value() {
        use rand::Rng;

        let dir = TempDir::new().unwrap();
        let store = store(&dir, 64);
        let small = ramp(4, 0.0);
        store.store_tensor("t", &small, None).await.unwrap();

        // 64 raw bytes stay in memory even if they compress past the cache
        let mut rng = rand::thread_rng();
        let values: Vec<f32> = (0..16).map(|_| rng.gen::<f32>()).collect();
        let noisy = Tensor::from_f32(vec![16], &values).unwrap();
        store.store_tensor("t", &noisy, None).await.unwrap();

        assert_eq!(store.record("t").await.unwrap().placement, Placement::Memory);
        assert_eq!(store.retrieve_tensor("t", None).await.unwrap(), noisy);
        assert_eq!(store.retrieve_tensor("t", Some(0)).await.unwrap(), small);
    }

    /// File lease backend that records which holder each lease was granted
    /// to and counts grants made while another holder still had the lease
    struct TrackedLeases {
        inner: crate::sync::FileLeaseBackend,
        holders: Arc<parking_lot::Mutex<HashMap<String, String>>>,
        overlaps: Arc<std::sync::atomic::AtomicUsize>,
    }

    impl crate::sync::LeaseBackend for TrackedLeases {
        fn try_acquire(
            &self,
            name: &str,
            holder: &str,
            ttl: std::time::Duration,
        ) -> Result<Option<crate::sync::Lease>> {
            let lease = self.inner.try_acquire(name, holder, ttl)?;
            if lease.is_some()
                && self
                    .holders
                    .lock()
                    .insert(name.to_string(), holder.to_string())
                    .is_some()
            {
                self.overlaps
                    .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            }
            Ok(lease)
        }

        fn release(&self, name: &str, holder: &str) -> Result<bool> {
            {
                let mut holders = self.holders.lock();
                if holders.get(name).map(String::as_str) == Some(holder) {
                    holders.remove(name);
                }
            }
            self.inner.release(name, holder)
        }

        fn current(&self, name: &str) -> Result<Option<crate::sync::Lease>> {
            self.inner.current(name)
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_stores_sharing_lease_directory_never_overlap() {
        use crate::sync::LeaseLocker;
        use std::sync::atomic::{AtomicUsize, Ordering};

        let dir = TempDir::new().unwrap();
        let holders = Arc::new(parking_lot::Mutex::new(HashMap::new()));
        let overlaps = Arc::new(AtomicUsize::new(0));

        let mut stores = Vec::new();
        for service in ["svc-a", "svc-b"] {
            let mut config = test_config(&dir, 4096);
            config.store.service_id = service.to_string();
            config.lock.retry_interval_ms = 2;
            config.lock.acquire_timeout_ms = 20_000;
            let backend = TrackedLeases {
                inner: crate::sync::FileLeaseBackend::new(dir.path().join("locks")).unwrap(),
                holders: holders.clone(),
                overlaps: overlaps.clone(),
            };
            let locker = LeaseLocker::new(Arc::new(backend), service, &config.lock);
            stores.push(Arc::new(
                SharedArtifactStore::with_locker(config, Arc::new(locker)).unwrap(),
            ));
        }

        let mut handles = Vec::new();
        for (s, store) in stores.iter().enumerate() {
            for task in 0..3 {
                let store = store.clone();
                handles.push(tokio::spawn(async move {
                    for i in 0..8 {
                        let value = (s * 1000 + task * 100 + i) as f32;
                        let tensor = Tensor::from_f32(vec![2], &[value, -value]).unwrap();
                        store.store_tensor("shared", &tensor, None).await.unwrap();
                    }
                }));
            }
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(overlaps.load(Ordering::SeqCst), 0);
        assert!(holders.lock().is_empty());
        for store in &stores {
            assert_eq!(store.version_count("shared").await, 24);
            assert!(!store.locker().is_locked("shared"));
        }
    }

    #[tokio::test]
    async fn test_store_with_distributed_locks() {
        let dir = TempDir::new().unwrap();
        let mut config = test_config(&dir, 4096);
        config.lock.mode = LockMode::Distributed;
        config.lock.backend = LeaseBackendKind::File;
        config.lock.directory = dir.path().join("locks");
        config.lock.retry_interval_ms = 5;
        let store = SharedArtifactStore::new(config).unwrap();

        store.store_text("k", "leased", None).await.unwrap();
        assert_eq!(store.retrieve_text("k", None).await.unwrap(), "leased");
        assert!(!store.locker().is_locked("k"));
    }
}
