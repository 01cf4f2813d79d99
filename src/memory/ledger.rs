//! Append-only version ledger
//!
//! Every store appends a self-contained [`Snapshot`] holding the compressed
//! payload, its layout and the metadata at that moment. Version ids start at
//! 0 and grow by one per append with no gaps. Snapshots are never mutated;
//! historical retrieval reads the stored payload directly.

use super::artifact::{ArtifactKind, Layout, Metadata, Payload};
use crate::codec;
use crate::error::{Error, Result};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// An immutable copy of one version of an artifact
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub version: u64,
    pub kind: ArtifactKind,
    pub layout: Layout,
    /// Compressed payload bytes
    pub payload: Bytes,
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
}

impl Snapshot {
    /// Decompress and rebuild the payload
    pub fn decode(&self) -> Result<Payload> {
        let raw = codec::decompress(&self.payload)?;
        self.layout.decode(raw)
    }
}

/// Per-key version history
pub struct VersionLedger {
    history: Arc<RwLock<HashMap<String, Vec<Arc<Snapshot>>>>>,
}

impl VersionLedger {
    pub fn new() -> Self {
        Self {
            history: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Append a snapshot, returning its version id
    pub async fn append_snapshot(
        &self,
        key: &str,
        kind: ArtifactKind,
        layout: Layout,
        payload: Bytes,
        metadata: Metadata,
    ) -> u64 {
        let mut history = self.history.write().await;
        let versions = history.entry(key.to_string()).or_default();
        let version = versions.len() as u64;
        versions.push(Arc::new(Snapshot {
            version,
            kind,
            layout,
            payload,
            metadata,
            created_at: Utc::now(),
        }));
        version
    }

    /// Exact version lookup
    pub async fn get(&self, key: &str, version: u64) -> Result<Arc<Snapshot>> {
        let history = self.history.read().await;
        let versions = history
            .get(key)
            .ok_or_else(|| Error::KeyNotFound(key.to_string()))?;
        usize::try_from(version)
            .ok()
            .and_then(|idx| versions.get(idx))
            .cloned()
            .ok_or_else(|| Error::VersionNotFound {
                key: key.to_string(),
                version,
                available: versions.len(),
            })
    }

    /// Highest-id snapshot
    pub async fn get_latest(&self, key: &str) -> Result<Arc<Snapshot>> {
        self.history
            .read()
            .await
            .get(key)
            .and_then(|versions| versions.last())
            .cloned()
            .ok_or_else(|| Error::KeyNotFound(key.to_string()))
    }

    /// Number of versions recorded for a key (0 if unknown)
    pub async fn version_count(&self, key: &str) -> usize {
        self.history
            .read()
            .await
            .get(key)
            .map(Vec::len)
            .unwrap_or(0)
    }

    pub async fn contains(&self, key: &str) -> bool {
        self.history.read().await.contains_key(key)
    }

    /// Total compressed bytes held across all snapshots
    pub async fn stored_bytes(&self) -> usize {
        self.history
            .read()
            .await
            .values()
            .flatten()
            .map(|s| s.payload.len())
            .sum()
    }
}

impl Default for VersionLedger {
    fn default() -> Self {
        Self::new()
    }
}
