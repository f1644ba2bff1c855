//! Segmented in-memory data container.

use crate::types::{segment_of, CacheEntry, SegmentId};
use bytes::Bytes;
use dashmap::DashMap;

/// Concurrent entry store partitioned by segment.
///
/// User traffic and the state transfer consumer mutate it concurrently;
/// per-key linearization is the lock manager's job, the container itself
/// only guarantees per-entry atomicity and versioned apply.
#[derive(Debug)]
pub struct DataContainer {
    num_segments: u32,
    shards: Vec<DashMap<Vec<u8>, CacheEntry>>,
}

impl DataContainer {
    /// Create a container with the given segment count.
    pub fn new(num_segments: u32) -> Self {
        assert!(num_segments > 0);
        Self {
            num_segments,
            shards: (0..num_segments).map(|_| DashMap::new()).collect(),
        }
    }

    /// Segment count this container was built with.
    pub fn num_segments(&self) -> u32 {
        self.num_segments
    }

    /// The segment a key belongs to.
    pub fn segment_of(&self, key: &[u8]) -> SegmentId {
        segment_of(key, self.num_segments)
    }

    fn shard(&self, segment: SegmentId) -> &DashMap<Vec<u8>, CacheEntry> {
        &self.shards[segment as usize]
    }

    /// Look up an entry.
    pub fn get(&self, key: &[u8]) -> Option<CacheEntry> {
        self.shard(self.segment_of(key)).get(key).map(|e| e.clone())
    }

    /// Apply a user write, bumping the per-key version.
    /// Returns the version assigned to the write.
    pub fn put(&self, key: Vec<u8>, value: Bytes) -> u64 {
        let shard = self.shard(segment_of(&key, self.num_segments));
        match shard.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(mut existing) => {
                let version = existing.get().version + 1;
                existing.insert(CacheEntry::new(value, version));
                version
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(CacheEntry::new(value, 1));
                1
            }
        }
    }

    /// Apply a transferred entry, keeping whichever version is newer.
    ///
    /// Re-applying the same entry is a no-op beyond the duplicate write, so
    /// chunk retransmission under at-least-once delivery is safe; a user
    /// write that raced ahead of the transfer is never clobbered.
    pub fn apply_transferred(&self, key: Vec<u8>, entry: CacheEntry) {
        let shard = self.shard(segment_of(&key, self.num_segments));
        match shard.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(mut existing) => {
                if entry.version > existing.get().version {
                    existing.insert(entry);
                }
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(entry);
            }
        }
    }

    /// Remove an entry.
    pub fn remove(&self, key: &[u8]) -> Option<CacheEntry> {
        self.shard(self.segment_of(key))
            .remove(key)
            .map(|(_, e)| e)
    }

    /// Snapshot every entry in a segment.
    ///
    /// Bulk iteration; run it on a blocking pool when segments are large.
    pub fn entries_in_segment(&self, segment: SegmentId) -> Vec<(Vec<u8>, CacheEntry)> {
        self.shard(segment)
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    /// Entry count for one segment.
    pub fn segment_entry_count(&self, segment: SegmentId) -> usize {
        self.shard(segment).len()
    }

    /// Drop every entry in the given segments (ownership lost).
    pub fn remove_segments(&self, segments: &[SegmentId]) {
        for &s in segments {
            self.shard(s).clear();
        }
    }

    /// Total entry count.
    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.len()).sum()
    }

    /// Whether the container holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All keys in the container. Test/diagnostic helper.
    pub fn keys(&self) -> Vec<Vec<u8>> {
        self.shards
            .iter()
            .flat_map(|s| s.iter().map(|e| e.key().clone()))
            .collect()
    }
}
