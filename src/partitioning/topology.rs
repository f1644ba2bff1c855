//! Versioned cache topology snapshots.

use crate::partitioning::ConsistentHash;
use crate::types::{NodeId, SegmentId};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Immutable snapshot of a cache's membership and segment ownership.
///
/// Created by the cluster topology manager on every membership or rebalance
/// event and pushed to all members; never mutated, only superseded by a
/// snapshot with a strictly higher `topology_id`. The union hash is computed
/// eagerly at construction so the snapshot can cross node boundaries as a
/// plain value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheTopology {
    topology_id: u64,
    rebalance_id: u64,
    current_ch: ConsistentHash,
    pending_ch: Option<ConsistentHash>,
    union_ch: ConsistentHash,
    actual_members: Vec<NodeId>,
    persistent_uuids: Vec<Uuid>,
}

impl CacheTopology {
    /// Build a stable topology (no rebalance in progress).
    pub fn stable(
        topology_id: u64,
        rebalance_id: u64,
        ch: ConsistentHash,
        actual_members: Vec<NodeId>,
        persistent_uuids: Vec<Uuid>,
    ) -> Self {
        debug_assert_eq!(actual_members.len(), persistent_uuids.len());
        Self {
            topology_id,
            rebalance_id,
            union_ch: ch.clone(),
            current_ch: ch,
            pending_ch: None,
            actual_members,
            persistent_uuids,
        }
    }

    /// Build a topology with a rebalance in progress.
    pub fn rebalancing(
        topology_id: u64,
        rebalance_id: u64,
        current_ch: ConsistentHash,
        pending_ch: ConsistentHash,
        actual_members: Vec<NodeId>,
        persistent_uuids: Vec<Uuid>,
    ) -> Self {
        debug_assert_eq!(current_ch.num_segments(), pending_ch.num_segments());
        debug_assert_eq!(actual_members.len(), persistent_uuids.len());
        let union_ch = current_ch.union(&pending_ch);
        Self {
            topology_id,
            rebalance_id,
            current_ch,
            pending_ch: Some(pending_ch),
            union_ch,
            actual_members,
            persistent_uuids,
        }
    }

    /// Monotonically increasing topology version.
    pub fn topology_id(&self) -> u64 {
        self.topology_id
    }

    /// Monotonically increasing rebalance counter.
    pub fn rebalance_id(&self) -> u64 {
        self.rebalance_id
    }

    /// The committed hash; reads are served by its owners.
    pub fn current_ch(&self) -> &ConsistentHash {
        &self.current_ch
    }

    /// The hash being migrated to, if a rebalance is in progress.
    pub fn pending_ch(&self) -> Option<&ConsistentHash> {
        self.pending_ch.as_ref()
    }

    /// Owner-superset of current and pending hashes; writes are routed by it.
    pub fn union_ch(&self) -> &ConsistentHash {
        &self.union_ch
    }

    /// Members present when this topology was created.
    pub fn actual_members(&self) -> &[NodeId] {
        &self.actual_members
    }

    /// Restart-stable identities of `actual_members`, in the same order.
    pub fn persistent_uuids(&self) -> &[Uuid] {
        &self.persistent_uuids
    }

    /// True exactly while a rebalance is in progress.
    pub fn is_rebalancing(&self) -> bool {
        self.pending_ch.is_some()
    }

    /// Segment count shared by all hashes in this topology.
    pub fn num_segments(&self) -> u32 {
        self.current_ch.num_segments()
    }

    /// Owners serving reads for a segment.
    pub fn read_owners(&self, segment: SegmentId) -> &[NodeId] {
        self.current_ch.owners(segment)
    }

    /// Owners that must observe writes for a segment.
    pub fn write_owners(&self, segment: SegmentId) -> &[NodeId] {
        self.union_ch.owners(segment)
    }

    /// The stable topology that results from committing the pending hash.
    /// Returns `None` when no rebalance is in progress.
    pub fn commit_pending(&self) -> Option<CacheTopology> {
        let pending = self.pending_ch.clone()?;
        // Members that only existed in the replaced hash drop out here.
        let members = pending.members().to_vec();
        let uuids = members
            .iter()
            .filter_map(|n| {
                self.actual_members
                    .iter()
                    .position(|m| m == n)
                    .map(|i| self.persistent_uuids[i])
            })
            .collect();
        Some(CacheTopology::stable(
            self.topology_id + 1,
            self.rebalance_id,
            pending,
            members,
            uuids,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partitioning::{ConsistentHashFactory, Member};

    fn ch(ids: &[NodeId], segments: u32, owners: usize) -> ConsistentHash {
        let members: Vec<Member> = ids.iter().map(|&n| Member::new(n)).collect();
        ConsistentHashFactory::compute(&members, segments, owners, None).unwrap()
    }

    #[test]
    fn test_stable_topology_union_equals_current() {
        let hash = ch(&[1, 2], 8, 1);
        let t = CacheTopology::stable(3, 1, hash.clone(), vec![1, 2], vec![Uuid::new_v4(); 2]);
        assert!(!t.is_rebalancing());
        assert_eq!(t.union_ch(), &hash);
        for s in 0..8 {
            assert_eq!(t.read_owners(s), t.write_owners(s));
        }
    }

    #[test]
    fn test_rebalancing_topology_union_is_superset() {
        let current = ch(&[1], 8, 1);
        let pending = ch(&[1, 2], 8, 1);
        let t = CacheTopology::rebalancing(
            4,
            2,
            current.clone(),
            pending.clone(),
            vec![1, 2],
            vec![Uuid::new_v4(); 2],
        );
        assert!(t.is_rebalancing());
        for s in 0..8 {
            for &n in current.owners(s) {
                assert!(t.write_owners(s).contains(&n));
            }
            for &n in pending.owners(s) {
                assert!(t.write_owners(s).contains(&n));
            }
            // Reads stay on the committed owners.
            assert_eq!(t.read_owners(s), current.owners(s));
        }
    }

    #[test]
    fn test_commit_pending_increments_topology_id() {
        let current = ch(&[1], 8, 1);
        let pending = ch(&[1, 2], 8, 1);
        let t = CacheTopology::rebalancing(
            4,
            2,
            current,
            pending.clone(),
            vec![1, 2],
            vec![Uuid::new_v4(); 2],
        );
        let committed = t.commit_pending().unwrap();
        assert_eq!(committed.topology_id(), 5);
        assert_eq!(committed.current_ch(), &pending);
        assert_eq!(committed.actual_members(), &[1, 2]);
        assert!(!committed.is_rebalancing());
    }

    #[test]
    fn test_commit_pending_on_stable_is_none() {
        let t = CacheTopology::stable(1, 1, ch(&[1], 8, 1), vec![1], vec![Uuid::new_v4()]);
        assert!(t.commit_pending().is_none());
    }
}
