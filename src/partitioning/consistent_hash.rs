//! Segment-to-owners assignment and its deterministic factory.
//!
//! Unlike a virtual-node ring, segment ownership is materialized as an
//! explicit table: every segment has an ordered owner list, the first entry
//! being the primary. The factory recomputes assignments on membership
//! changes while moving as few segments as possible relative to the
//! previous assignment.

use crate::types::{NodeId, SegmentId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A cluster member as seen by the hash factory.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Member {
    /// The member's node id.
    pub node: NodeId,
    /// Relative share of segments this member should hold.
    /// A factor of 0 means the member holds no segments.
    pub capacity_factor: f32,
}

impl Member {
    /// Create a member with the default capacity factor of 1.
    pub fn new(node: NodeId) -> Self {
        Self {
            node,
            capacity_factor: 1.0,
        }
    }

    /// Set the capacity factor.
    pub fn with_capacity_factor(mut self, factor: f32) -> Self {
        self.capacity_factor = factor;
        self
    }
}

/// Immutable mapping of every segment to its ordered owner list.
///
/// The first owner of a segment is the primary, the rest are backups.
/// Two instances are comparable only if built with the same segment count.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsistentHash {
    /// Configured owners per segment; actual lists may be shorter when the
    /// cluster is smaller than this.
    num_owners: usize,
    /// Sorted member list.
    members: Vec<NodeId>,
    /// Owner list per segment, primary first.
    segment_owners: Vec<Vec<NodeId>>,
}

impl ConsistentHash {
    fn new(num_owners: usize, mut members: Vec<NodeId>, segment_owners: Vec<Vec<NodeId>>) -> Self {
        members.sort_unstable();
        members.dedup();
        Self {
            num_owners,
            members,
            segment_owners,
        }
    }

    /// Number of segments.
    pub fn num_segments(&self) -> u32 {
        self.segment_owners.len() as u32
    }

    /// Configured owners per segment.
    pub fn num_owners(&self) -> usize {
        self.num_owners
    }

    /// All members referenced by this hash, sorted.
    pub fn members(&self) -> &[NodeId] {
        &self.members
    }

    /// Whether a node is a member of this hash.
    pub fn contains_member(&self, node: NodeId) -> bool {
        self.members.binary_search(&node).is_ok()
    }

    /// Ordered owner list for a segment, primary first.
    pub fn owners(&self, segment: SegmentId) -> &[NodeId] {
        &self.segment_owners[segment as usize]
    }

    /// Primary owner of a segment, if the segment has any owner.
    pub fn primary_owner(&self, segment: SegmentId) -> Option<NodeId> {
        self.segment_owners[segment as usize].first().copied()
    }

    /// Whether a node owns a segment (primary or backup).
    pub fn is_owner(&self, segment: SegmentId, node: NodeId) -> bool {
        self.segment_owners[segment as usize].contains(&node)
    }

    /// All segments a node owns (primary or backup).
    pub fn segments_owned_by(&self, node: NodeId) -> Vec<SegmentId> {
        (0..self.num_segments())
            .filter(|&s| self.is_owner(s, node))
            .collect()
    }

    /// Segments for which a node is the primary owner.
    pub fn primary_segments_of(&self, node: NodeId) -> Vec<SegmentId> {
        (0..self.num_segments())
            .filter(|&s| self.primary_owner(s) == Some(node))
            .collect()
    }

    /// Owner-superset union of this hash and another, used to route
    /// reads/writes safely while a rebalance is in progress.
    ///
    /// Owners of `self` come first per segment, followed by owners only
    /// present in `other`.
    pub fn union(&self, other: &ConsistentHash) -> ConsistentHash {
        assert_eq!(
            self.num_segments(),
            other.num_segments(),
            "union requires hashes with the same segment count"
        );
        let segment_owners = self
            .segment_owners
            .iter()
            .zip(&other.segment_owners)
            .map(|(a, b)| {
                let mut owners = a.clone();
                for &n in b {
                    if !owners.contains(&n) {
                        owners.push(n);
                    }
                }
                owners
            })
            .collect();

        let mut members = self.members.clone();
        members.extend_from_slice(&other.members);
        ConsistentHash::new(self.num_owners.max(other.num_owners), members, segment_owners)
    }
}

/// Deterministic factory for [`ConsistentHash`] instances.
///
/// Given identical inputs the factory always produces the same assignment,
/// so any node recomputing a hash (for instance during coordinator
/// recovery) arrives at the same result.
pub struct ConsistentHashFactory;

impl ConsistentHashFactory {
    /// Compute an owner assignment for the given members.
    ///
    /// Returns `None` when no hash is possible (no members, or every member
    /// has zero capacity). When the member count is below `num_owners`, the
    /// per-segment owner count degrades instead of failing. Relative to
    /// `previous`, segments already placed on surviving members keep their
    /// owners; only the weighted overflow moves.
    pub fn compute(
        members: &[Member],
        num_segments: u32,
        num_owners: usize,
        previous: Option<&ConsistentHash>,
    ) -> Option<ConsistentHash> {
        if num_segments == 0 || num_owners == 0 {
            return None;
        }
        let mut eligible: Vec<Member> = members
            .iter()
            .copied()
            .filter(|m| m.capacity_factor > 0.0)
            .collect();
        if eligible.is_empty() {
            return None;
        }
        eligible.sort_unstable_by_key(|m| m.node);
        eligible.dedup_by_key(|m| m.node);

        let owners_per_segment = num_owners.min(eligible.len());
        let total_slots = num_segments as usize * owners_per_segment;
        let total_capacity: f64 = eligible.iter().map(|m| m.capacity_factor as f64).sum();

        // Weighted slot target per member.
        let targets: BTreeMap<NodeId, f64> = eligible
            .iter()
            .map(|m| {
                (
                    m.node,
                    total_slots as f64 * m.capacity_factor as f64 / total_capacity,
                )
            })
            .collect();

        // Inherit surviving owners from the previous assignment.
        let mut segment_owners: Vec<Vec<NodeId>> = match previous {
            Some(prev) if prev.num_segments() == num_segments => prev
                .segment_owners
                .iter()
                .map(|owners| {
                    let mut kept: Vec<NodeId> = owners
                        .iter()
                        .copied()
                        .filter(|n| targets.contains_key(n))
                        .collect();
                    kept.truncate(owners_per_segment);
                    kept
                })
                .collect(),
            _ => vec![Vec::new(); num_segments as usize],
        };

        let mut counts: BTreeMap<NodeId, usize> =
            targets.keys().map(|&n| (n, 0)).collect();
        for owners in &segment_owners {
            for &n in owners {
                // Inherited owners were already filtered to current members.
                *counts.get_mut(&n).unwrap() += 1;
            }
        }

        // Fill segments that lack owners, preferring the member with the
        // largest remaining capacity (ties broken by node id).
        for owners in segment_owners.iter_mut() {
            while owners.len() < owners_per_segment {
                let pick = targets
                    .iter()
                    .filter(|(n, _)| !owners.contains(n))
                    .map(|(&n, &t)| (n, t - counts[&n] as f64))
                    .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap().then(b.0.cmp(&a.0)))
                    .map(|(n, _)| n);
                match pick {
                    Some(n) => {
                        owners.push(n);
                        *counts.get_mut(&n).unwrap() += 1;
                    }
                    None => break,
                }
            }
        }

        // Move the overflow: any member above its ceiling hands segments to
        // the member furthest below its own ceiling. Each move shrinks the
        // total imbalance, so this terminates.
        loop {
            let over = counts
                .iter()
                .map(|(&n, &c)| (n, c as f64 - targets[&n]))
                .filter(|&(n, excess)| excess > 0.0 && counts[&n] as f64 > targets[&n].ceil())
                .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap().then(b.0.cmp(&a.0)))
                .map(|(n, _)| n);
            let under = counts
                .iter()
                .map(|(&n, &c)| (n, targets[&n] - c as f64))
                .filter(|&(n, deficit)| {
                    deficit > 0.0 && (counts[&n] as f64) < targets[&n].floor().max(1.0)
                })
                .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap().then(b.0.cmp(&a.0)))
                .map(|(n, _)| n);

            let (from, to) = match (over, under) {
                (Some(o), Some(u)) => (o, u),
                (Some(o), None) => {
                    // No one is starving; still trim members above their
                    // ceiling toward the member with the largest deficit
                    // that has room below its own ceiling.
                    let u = counts
                        .iter()
                        .map(|(&n, &c)| (n, targets[&n] - c as f64))
                        .filter(|&(n, _)| (counts[&n] as f64) < targets[&n].ceil())
                        .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap().then(b.0.cmp(&a.0)))
                        .map(|(n, _)| n);
                    match u {
                        Some(u) => (o, u),
                        None => break,
                    }
                }
                (None, Some(u)) => {
                    let o = counts
                        .iter()
                        .map(|(&n, &c)| (n, c as f64 - targets[&n]))
                        .filter(|&(_, excess)| excess > 0.0)
                        .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap().then(b.0.cmp(&a.0)))
                        .map(|(n, _)| n);
                    match o {
                        Some(o) => (o, u),
                        None => break,
                    }
                }
                (None, None) => break,
            };

            let moved = Self::reassign_one(&mut segment_owners, from, to);
            if !moved {
                break;
            }
            *counts.get_mut(&from).unwrap() -= 1;
            *counts.get_mut(&to).unwrap() += 1;
        }

        Self::balance_primaries(&mut segment_owners, &targets, num_segments);

        let member_ids: Vec<NodeId> = eligible.iter().map(|m| m.node).collect();
        Some(ConsistentHash::new(num_owners, member_ids, segment_owners))
    }

    /// Replace `from` with `to` in the first segment where that is possible.
    fn reassign_one(segment_owners: &mut [Vec<NodeId>], from: NodeId, to: NodeId) -> bool {
        for owners in segment_owners.iter_mut() {
            if owners.contains(&to) {
                continue;
            }
            if let Some(pos) = owners.iter().position(|&n| n == from) {
                owners[pos] = to;
                return true;
            }
        }
        false
    }

    /// Even out primary ownership by rotating within owner lists.
    /// Swapping positions inside a list moves no data.
    fn balance_primaries(
        segment_owners: &mut [Vec<NodeId>],
        targets: &BTreeMap<NodeId, f64>,
        num_segments: u32,
    ) {
        let total_capacity: f64 = targets.values().sum::<f64>();
        let primary_target: BTreeMap<NodeId, f64> = targets
            .iter()
            .map(|(&n, &t)| (n, num_segments as f64 * t / total_capacity))
            .collect();

        let mut primary_counts: BTreeMap<NodeId, usize> =
            targets.keys().map(|&n| (n, 0)).collect();
        for owners in segment_owners.iter() {
            if let Some(&p) = owners.first() {
                *primary_counts.get_mut(&p).unwrap() += 1;
            }
        }

        // Bounded pass: each swap strictly reduces primary imbalance.
        for _ in 0..segment_owners.len() {
            let over = primary_counts
                .iter()
                .map(|(&n, &c)| (n, c as f64 - primary_target[&n]))
                .filter(|&(n, excess)| {
                    excess > 0.0 && primary_counts[&n] as f64 > primary_target[&n].ceil()
                })
                .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap().then(b.0.cmp(&a.0)))
                .map(|(n, _)| n);
            let Some(over) = over else { break };

            let mut swapped = false;
            for owners in segment_owners.iter_mut() {
                if owners.first() != Some(&over) || owners.len() < 2 {
                    continue;
                }
                let candidate = owners
                    .iter()
                    .enumerate()
                    .skip(1)
                    .filter(|(_, &n)| {
                        (primary_counts[&n] as f64) < primary_target[&n].ceil()
                    })
                    .min_by_key(|(_, &n)| n)
                    .map(|(i, &n)| (i, n));
                if let Some((idx, backup)) = candidate {
                    owners.swap(0, idx);
                    *primary_counts.get_mut(&over).unwrap() -= 1;
                    *primary_counts.get_mut(&backup).unwrap() += 1;
                    swapped = true;
                    break;
                }
            }
            if !swapped {
                break;
            }
        }
    }
}
