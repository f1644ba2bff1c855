//! Persistence collaborator seam.

use crate::error::Result;
use crate::types::{segment_of, CacheEntry, SegmentId};
use async_trait::async_trait;
use dashmap::DashMap;

/// Opaque load/store service backing a cache.
///
/// The state transfer provider merges stored entries with in-memory ones
/// when streaming a segment out; everything else about persistence is
/// outside this crate.
#[async_trait]
pub trait SegmentStore: Send + Sync + std::fmt::Debug {
    /// Load every persisted entry belonging to a segment.
    async fn load_segment_entries(&self, segment: SegmentId) -> Result<Vec<(Vec<u8>, CacheEntry)>>;

    /// Persist one entry.
    async fn store(&self, key: &[u8], entry: &CacheEntry) -> Result<()>;
}

/// Store used by caches without persistence.
#[derive(Debug, Default)]
pub struct NoStore;

#[async_trait]
impl SegmentStore for NoStore {
    async fn load_segment_entries(
        &self,
        _segment: SegmentId,
    ) -> Result<Vec<(Vec<u8>, CacheEntry)>> {
        Ok(Vec::new())
    }

    async fn store(&self, _key: &[u8], _entry: &CacheEntry) -> Result<()> {
        Ok(())
    }
}

/// Map-backed store for tests.
#[derive(Debug)]
pub struct InMemorySegmentStore {
    num_segments: u32,
    entries: DashMap<Vec<u8>, CacheEntry>,
}

impl InMemorySegmentStore {
    /// Create an empty store for a cache with the given segment count.
    pub fn new(num_segments: u32) -> Self {
        Self {
            num_segments,
            entries: DashMap::new(),
        }
    }

    /// Total persisted entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl SegmentStore for InMemorySegmentStore {
    async fn load_segment_entries(&self, segment: SegmentId) -> Result<Vec<(Vec<u8>, CacheEntry)>> {
        Ok(self
            .entries
            .iter()
            .filter(|e| segment_of(e.key(), self.num_segments) == segment)
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect())
    }

    async fn store(&self, key: &[u8], entry: &CacheEntry) -> Result<()> {
        self.entries.insert(key.to_vec(), entry.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[tokio::test]
    async fn test_no_store_is_empty() {
        let store = NoStore;
        assert!(store.load_segment_entries(0).await.unwrap().is_empty());
        store
            .store(b"k", &CacheEntry::new(Bytes::from_static(b"v"), 1))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_in_memory_store_segment_filter() {
        let store = InMemorySegmentStore::new(4);
        for i in 0..50 {
            let key = format!("key-{i}").into_bytes();
            store
                .store(&key, &CacheEntry::new(Bytes::from_static(b"v"), 1))
                .await
                .unwrap();
        }
        let total: usize = {
            let mut n = 0;
            for s in 0..4 {
                for (key, _) in store.load_segment_entries(s).await.unwrap() {
                    assert_eq!(segment_of(&key, 4), s);
                    n += 1;
                }
            }
            n
        };
        assert_eq!(total, 50);
    }
}
