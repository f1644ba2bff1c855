//! Keyspace partitioning: consistent hash and topology snapshots.
//!
//! The keyspace is split into a fixed number of segments; a
//! [`ConsistentHash`] assigns each segment an ordered owner list, and a
//! [`CacheTopology`] is the versioned snapshot of membership plus current
//! (and, during a rebalance, pending) hashes that every node agrees on.

mod consistent_hash;
mod topology;

pub use consistent_hash::{ConsistentHash, ConsistentHashFactory, Member};
pub use topology::CacheTopology;
