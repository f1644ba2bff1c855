//! Core types used throughout the data grid.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::hash::{Hash, Hasher};
use twox_hash::XxHash64;

/// Node identifier in the cluster.
pub type NodeId = u64;

/// Segment identifier in `[0, num_segments)`.
pub type SegmentId = u32;

/// Name of a cache; the coordinator keeps one topology state machine per cache.
pub type CacheName = String;

/// Protocol version spoken by this build.
pub const PROTOCOL_VERSION: u16 = 2;

/// Map a key to its segment. Deterministic for the lifetime of a cache:
/// the segment count is fixed at cache creation.
pub fn segment_of(key: &[u8], num_segments: u32) -> SegmentId {
    debug_assert!(num_segments > 0);
    let mut hasher = XxHash64::with_seed(0);
    key.hash(&mut hasher);
    (hasher.finish() % num_segments as u64) as SegmentId
}

/// Cluster-wide transaction identity.
///
/// Created at the transaction's origin node; equality and hashing are on
/// `(origin, id)` only, so the same transaction seen remotely compares equal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct GlobalTransaction {
    /// Node where the transaction started.
    pub origin: NodeId,
    /// Per-origin monotonic counter.
    pub id: u64,
    /// True on every node other than the origin.
    pub remote: bool,
}

impl GlobalTransaction {
    /// Create a transaction identity at its origin.
    pub fn new(origin: NodeId, id: u64) -> Self {
        Self {
            origin,
            id,
            remote: false,
        }
    }

    /// The same identity as seen by a non-origin node.
    pub fn as_remote(&self) -> Self {
        Self {
            remote: true,
            ..*self
        }
    }
}

impl PartialEq for GlobalTransaction {
    fn eq(&self, other: &Self) -> bool {
        self.origin == other.origin && self.id == other.id
    }
}

impl Eq for GlobalTransaction {}

impl Hash for GlobalTransaction {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.origin.hash(state);
        self.id.hash(state);
    }
}

impl std::fmt::Display for GlobalTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "gtx:{}:{}", self.origin, self.id)
    }
}

/// A versioned cache entry.
///
/// Versions order a user write against a state-transfer write for the same key:
/// applying an entry with an older version than the stored one is a no-op.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// The stored value.
    pub value: Bytes,
    /// Monotonic per-key version.
    pub version: u64,
}

impl CacheEntry {
    /// Create an entry with an explicit version.
    pub fn new(value: impl Into<Bytes>, version: u64) -> Self {
        Self {
            value: value.into(),
            version,
        }
    }
}

/// A write operation recorded inside a transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WriteOp {
    /// Insert or update a key.
    Put { key: Vec<u8>, value: Bytes },
    /// Remove a key.
    Remove { key: Vec<u8> },
}

impl WriteOp {
    /// Create a Put operation.
    pub fn put(key: impl Into<Vec<u8>>, value: impl Into<Bytes>) -> Self {
        Self::Put {
            key: key.into(),
            value: value.into(),
        }
    }

    /// Create a Remove operation.
    pub fn remove(key: impl Into<Vec<u8>>) -> Self {
        Self::Remove { key: key.into() }
    }

    /// The key this operation touches.
    pub fn key(&self) -> &[u8] {
        match self {
            Self::Put { key, .. } => key,
            Self::Remove { key } => key,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segment_of_deterministic() {
        let a = segment_of(b"user:123", 256);
        let b = segment_of(b"user:123", 256);
        assert_eq!(a, b);
        assert!(a < 256);
    }

    #[test]
    fn test_segment_of_spread() {
        let mut seen = std::collections::HashSet::new();
        for i in 0..1000 {
            let key = format!("key-{}", i);
            seen.insert(segment_of(key.as_bytes(), 16));
        }
        // With 1000 keys all 16 segments should be hit.
        assert_eq!(seen.len(), 16);
    }

    #[test]
    fn test_global_transaction_equality_ignores_remote() {
        let origin = GlobalTransaction::new(1, 42);
        let remote = origin.as_remote();
        assert!(remote.remote);
        assert_eq!(origin, remote);

        let other = GlobalTransaction::new(2, 42);
        assert_ne!(origin, other);
    }

    #[test]
    fn test_write_op_key() {
        let put = WriteOp::put(b"k".to_vec(), b"v".to_vec());
        assert_eq!(put.key(), b"k");
        let rm = WriteOp::remove(b"k2".to_vec());
        assert_eq!(rm.key(), b"k2");
    }
}
