//! Byte-bounded in-memory cache with LRU eviction and lazy expiry
//!
//! Capacity is measured in payload bytes, not entries. A `put` evicts
//! least-recently-used entries until the new value fits, so the resident
//! total never exceeds the capacity. A single value larger than the whole
//! capacity is not admitted at all: it is reported as [`CachePut::Rejected`],
//! any older value under the same key is dropped, and the other entries are
//! left alone.
//!
//! Expiry is checked on access only. An entry older than the configured
//! interval since its last write is dropped by the `get` that finds it.

use bytes::Bytes;
use lru::LruCache;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

/// A byte-bounded LRU cache keyed by artifact key.
pub struct BoundedCache {
    entries: Arc<RwLock<CacheInner>>,
    capacity: usize,
    expire_after: Option<Duration>,
}

struct CacheEntry {
    value: Bytes,
    written_at: Instant,
}

struct CacheInner {
    /// Unbounded by count; the byte budget is enforced in `put`
    map: LruCache<String, CacheEntry>,
    resident: usize,
}

/// Outcome of [`BoundedCache::put`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CachePut {
    /// Stored; lists the keys evicted to make room
    Inserted { evicted: Vec<String> },
    /// Value is larger than the whole capacity and was not stored
    Rejected { size: usize, capacity: usize },
}

impl CachePut {
    pub fn is_inserted(&self) -> bool {
        matches!(self, CachePut::Inserted { .. })
    }
}

impl CacheInner {
    fn detach(&mut self, key: &str) -> Option<CacheEntry> {
        let entry = self.map.pop(key)?;
        self.resident -= entry.value.len();
        Some(entry)
    }

    fn evict_lru(&mut self) -> Option<String> {
        let (lru, entry) = self.map.pop_lru()?;
        self.resident -= entry.value.len();
        Some(lru)
    }
}

impl BoundedCache {
    /// Create a cache holding at most `capacity` bytes.
    ///
    /// `expire_after` of `None` disables expiry.
    pub fn new(capacity: usize, expire_after: Option<Duration>) -> Self {
        Self {
            entries: Arc::new(RwLock::new(CacheInner {
                map: LruCache::unbounded(),
                resident: 0,
            })),
            capacity,
            expire_after,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn is_expired(&self, entry: &CacheEntry) -> bool {
        self.expire_after
            .map(|ttl| entry.written_at.elapsed() > ttl)
            .unwrap_or(false)
    }

    /// Insert or replace a value and mark it most-recently-used.
    pub async fn put(&self, key: &str, value: Bytes) -> CachePut {
        let size = value.len();
        let mut inner = self.entries.write().await;
        inner.detach(key);

        if size > self.capacity {
            tracing::debug!(key, size, capacity = self.capacity, "Cache rejected oversized value");
            return CachePut::Rejected {
                size,
                capacity: self.capacity,
            };
        }

        let mut evicted = Vec::new();
        while inner.resident + size > self.capacity {
            match inner.evict_lru() {
                Some(lru) => evicted.push(lru),
                None => break,
            }
        }
        if !evicted.is_empty() {
            tracing::debug!(key, evicted = evicted.len(), "Cache evicted entries to make room");
        }

        inner.resident += size;
        inner.map.push(
            key.to_string(),
            CacheEntry {
                value,
                written_at: Instant::now(),
            },
        );

        CachePut::Inserted { evicted }
    }

    /// Retrieve a value, promoting it to most-recently-used.
    ///
    /// Expired entries are removed and reported as absent.
    pub async fn get(&self, key: &str) -> Option<Bytes> {
        let mut inner = self.entries.write().await;
        let expired = self.is_expired(inner.map.peek(key)?);
        if expired {
            inner.detach(key);
            tracing::debug!(key, "Cache entry expired");
            return None;
        }
        inner.map.get(key).map(|e| e.value.clone())
    }

    /// Retrieve a value without promoting it.
    pub async fn peek(&self, key: &str) -> Option<Bytes> {
        let inner = self.entries.read().await;
        inner
            .map
            .peek(key)
            .filter(|e| !self.is_expired(e))
            .map(|e| e.value.clone())
    }

    /// Remove a value; other tiers are not touched.
    pub async fn evict(&self, key: &str) -> Option<Bytes> {
        self.entries.write().await.detach(key).map(|e| e.value)
    }

    pub async fn contains(&self, key: &str) -> bool {
        self.peek(key).await.is_some()
    }

    /// Bytes currently held
    pub async fn resident_bytes(&self) -> usize {
        self.entries.read().await.resident
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.map.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.map.is_empty()
    }

    /// Keys from least to most recently used
    pub async fn keys(&self) -> Vec<String> {
        let inner = self.entries.read().await;
        inner.map.iter().rev().map(|(k, _)| k.clone()).collect()
    }

    pub async fn clear(&self) {
        let mut inner = self.entries.write().await;
        inner.map.clear();
        inner.resident = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bytes(n: usize) -> Bytes {
        Bytes::from(vec![7u8; n])
    }

    #[tokio::test]
    async fn test_put_and_get() {
        let cache = BoundedCache::new(100, None);
        let outcome = cache.put("a", Bytes::from_static(b"hello")).await;
        assert_eq!(outcome, CachePut::Inserted { evicted: vec![] });

        assert_eq!(cache.get("a").await.unwrap().as_ref(), b"hello");
        assert_eq!(cache.resident_bytes().await, 5);
    }

    #[tokio::test]
    async fn test_eviction_by_bytes() {
        let cache = BoundedCache::new(100, None);
        cache.put("a", bytes(40)).await;
        cache.put("b", bytes(40)).await;

        let outcome = cache.put("c", bytes(40)).await;
        assert_eq!(
            outcome,
            CachePut::Inserted {
                evicted: vec!["a".to_string()]
            }
        );
        assert!(cache.get("a").await.is_none());
        assert_eq!(cache.resident_bytes().await, 80);
    }

    #[tokio::test]
    async fn test_resident_never_exceeds_capacity() {
        let cache = BoundedCache::new(256, None);
        for i in 0..200usize {
            let size = (i * 37) % 120 + 1;
            cache.put(&format!("k{}", i % 17), bytes(size)).await;
            assert!(cache.resident_bytes().await <= 256);
        }
    }

    #[tokio::test]
    async fn test_get_promotes_to_mru() {
        let cache = BoundedCache::new(90, None);
        cache.put("a", bytes(30)).await;
        cache.put("b", bytes(30)).await;
        cache.put("c", bytes(30)).await;

        // Touch "a" so "b" becomes LRU
        cache.get("a").await;

        cache.put("d", bytes(30)).await;
        assert!(cache.peek("b").await.is_none());
        assert!(cache.peek("a").await.is_some());
        assert_eq!(cache.keys().await, vec!["c", "a", "d"]);
    }

    #[tokio::test]
    async fn test_peek_does_not_promote() {
        let cache = BoundedCache::new(60, None);
        cache.put("a", bytes(30)).await;
        cache.put("b", bytes(30)).await;

        cache.peek("a").await;
        cache.put("c", bytes(30)).await;
        assert!(cache.peek("a").await.is_none());
    }

    #[tokio::test]
    async fn test_update_replaces_size() {
        let cache = BoundedCache::new(100, None);
        cache.put("a", bytes(60)).await;
        cache.put("a", bytes(10)).await;
        assert_eq!(cache.len().await, 1);
        assert_eq!(cache.resident_bytes().await, 10);
    }

    #[tokio::test]
    async fn test_oversized_value_rejected() {
        let cache = BoundedCache::new(50, None);
        cache.put("a", bytes(20)).await;

        let outcome = cache.put("huge", bytes(51)).await;
        assert_eq!(
            outcome,
            CachePut::Rejected {
                size: 51,
                capacity: 50
            }
        );
        assert!(!outcome.is_inserted());
        assert!(cache.get("huge").await.is_none());
        // Existing entries survive
        assert!(cache.get("a").await.is_some());
        assert_eq!(cache.resident_bytes().await, 20);
    }

    #[tokio::test]
    async fn test_oversized_replacement_drops_old_value() {
        let cache = BoundedCache::new(50, None);
        cache.put("k", bytes(10)).await;
        cache.put("other", bytes(10)).await;

        let outcome = cache.put("k", bytes(80)).await;
        assert!(!outcome.is_inserted());
        assert!(cache.get("k").await.is_none());
        assert!(cache.get("other").await.is_some());
        assert_eq!(cache.resident_bytes().await, 10);
        assert_eq!(cache.keys().await, vec!["other"]);
    }

    #[tokio::test]
    async fn test_value_equal_to_capacity_evicts_everything() {
        let cache = BoundedCache::new(50, None);
        cache.put("a", bytes(20)).await;
        cache.put("b", bytes(20)).await;

        let outcome = cache.put("full", bytes(50)).await;
        assert_eq!(
            outcome,
            CachePut::Inserted {
                evicted: vec!["a".to_string(), "b".to_string()]
            }
        );
        assert_eq!(cache.resident_bytes().await, 50);
    }

    #[tokio::test]
    async fn test_evict_decrements_resident() {
        let cache = BoundedCache::new(100, None);
        cache.put("k", bytes(42)).await;

        assert_eq!(cache.evict("k").await.map(|b| b.len()), Some(42));
        assert!(cache.get("k").await.is_none());
        assert_eq!(cache.resident_bytes().await, 0);
        assert!(cache.evict("k").await.is_none());
    }

    #[tokio::test]
    async fn test_lazy_expiry() {
        let cache = BoundedCache::new(100, Some(Duration::from_millis(30)));
        cache.put("k", bytes(10)).await;
        assert!(cache.get("k").await.is_some());

        tokio::time::sleep(Duration::from_millis(60)).await;

        // Still counted until an access notices it
        assert_eq!(cache.resident_bytes().await, 10);
        assert!(cache.get("k").await.is_none());
        assert_eq!(cache.resident_bytes().await, 0);
    }

    #[tokio::test]
    async fn test_clear() {
        let cache = BoundedCache::new(100, None);
        cache.put("a", bytes(10)).await;
        cache.put("b", bytes(10)).await;
        cache.clear().await;
        assert!(cache.is_empty().await);
        assert_eq!(cache.resident_bytes().await, 0);
    }
}
