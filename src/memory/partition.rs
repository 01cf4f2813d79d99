//! Fixed-count partitioning of flattened buffers
//!
//! [`split`] cuts a buffer into `n` contiguous shards of `len / n` elements,
//! the last shard absorbing the remainder; [`join`] concatenates them in slot
//! order and is the exact inverse. [`PartitionStore`] keeps one map per slot,
//! addressed by `(key, slot)`.

use crate::error::{Error, Result};
use bytes::{Bytes, BytesMut};
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Split a buffer into `n` contiguous shards.
pub fn split<T: Clone>(buffer: &[T], n: NonZeroUsize) -> Vec<Vec<T>> {
    let n = n.get();
    let base = buffer.len() / n;
    (0..n)
        .map(|i| {
            let start = i * base;
            let end = if i + 1 == n { buffer.len() } else { start + base };
            buffer[start..end].to_vec()
        })
        .collect()
}

/// Concatenate shards in slot order.
pub fn join<T: Clone>(shards: &[Vec<T>]) -> Vec<T> {
    let total = shards.iter().map(Vec::len).sum();
    let mut out = Vec::with_capacity(total);
    for shard in shards {
        out.extend_from_slice(shard);
    }
    out
}

/// Byte shards of each key spread over a fixed number of slots
pub struct PartitionStore {
    count: NonZeroUsize,
    slots: Arc<RwLock<Vec<HashMap<String, Bytes>>>>,
}

impl PartitionStore {
    /// Create a store with `count` slots; the count never changes afterwards.
    pub fn new(count: NonZeroUsize) -> Self {
        Self {
            count,
            slots: Arc::new(RwLock::new(vec![HashMap::new(); count.get()])),
        }
    }

    pub fn count(&self) -> usize {
        self.count.get()
    }

    /// Split `buffer` and place shard `i` in slot `i`
    pub async fn store_partitioned(&self, key: &str, buffer: &[u8]) {
        let shards = split(buffer, self.count);
        let mut slots = self.slots.write().await;
        for (slot, shard) in slots.iter_mut().zip(shards) {
            slot.insert(key.to_string(), Bytes::from(shard));
        }
    }

    /// Reassemble a key's buffer; `None` if any slot is missing its shard
    pub async fn retrieve_partitioned(&self, key: &str) -> Option<Bytes> {
        let slots = self.slots.read().await;
        let mut out = BytesMut::new();
        for slot in slots.iter() {
            out.extend_from_slice(slot.get(key)?);
        }
        Some(out.freeze())
    }

    /// Replace one shard in place
    pub async fn update_partition(&self, key: &str, index: usize, data: Bytes) -> Result<()> {
        let mut slots = self.slots.write().await;
        let count = slots.len();
        let slot = slots.get_mut(index).ok_or_else(|| {
            Error::Internal(format!(
                "partition slot {} out of range ({} slots)",
                index, count
            ))
        })?;
        slot.insert(key.to_string(), data);
        Ok(())
    }

    /// Read one shard
    pub async fn shard(&self, key: &str, index: usize) -> Option<Bytes> {
        self.slots.read().await.get(index)?.get(key).cloned()
    }

    /// Drop every shard of a key
    pub async fn remove(&self, key: &str) -> bool {
        let mut removed = false;
        for slot in self.slots.write().await.iter_mut() {
            removed |= slot.remove(key).is_some();
        }
        removed
    }
}
