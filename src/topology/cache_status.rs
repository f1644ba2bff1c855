//! Per-cache state machine kept by the coordinator.
//!
//! Pure bookkeeping: membership, the authoritative topology, and the
//! rebalance confirmation tally. All I/O (broadcasting updates, watchdogs)
//! lives in [`super::cluster`].

use crate::error::{MembershipError, Result};
use crate::partitioning::{CacheTopology, ConsistentHashFactory, Member};
use crate::rpc::commands::JoinInfo;
use crate::types::{CacheName, NodeId};
use std::collections::HashSet;
use tracing::{debug, info};
use uuid::Uuid;

/// One cache member as the coordinator tracks it.
#[derive(Debug, Clone)]
pub struct MemberInfo {
    pub node: NodeId,
    pub capacity_factor: f32,
    pub persistent_uuid: Uuid,
    pub protocol_version: u16,
}

impl From<&JoinInfo> for MemberInfo {
    fn from(info: &JoinInfo) -> Self {
        Self {
            node: info.node,
            capacity_factor: info.capacity_factor,
            persistent_uuid: info.persistent_uuid,
            protocol_version: info.protocol_version,
        }
    }
}

/// Whether a rebalance is running for the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebalanceState {
    NoRebalance,
    RebalanceInProgress,
}

/// Result of tallying one phase confirmation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmOutcome {
    /// Confirmation for an older topology, dropped.
    Stale,
    /// Counted; others still outstanding.
    Pending,
    /// Every expected member has confirmed.
    Complete,
}

#[derive(Debug)]
pub struct CacheStatus {
    cache: CacheName,
    num_segments: u32,
    num_owners: usize,
    min_protocol_version: u16,
    members: Vec<MemberInfo>,
    topology: Option<CacheTopology>,
    state: RebalanceState,
    /// Members whose confirmation for `confirm_topology_id` is outstanding.
    pending_confirmations: HashSet<NodeId>,
    confirm_topology_id: u64,
    /// Membership changed while a rebalance was running (or rebalancing was
    /// disabled); another rebalance is due once possible.
    queued_rebalance: bool,
}

impl CacheStatus {
    pub fn new(
        cache: CacheName,
        num_segments: u32,
        num_owners: usize,
        min_protocol_version: u16,
    ) -> Self {
        Self {
            cache,
            num_segments,
            num_owners,
            min_protocol_version,
            members: Vec::new(),
            topology: None,
            state: RebalanceState::NoRebalance,
            pending_confirmations: HashSet::new(),
            confirm_topology_id: 0,
            queued_rebalance: false,
        }
    }

    pub fn cache(&self) -> &CacheName {
        &self.cache
    }

    pub fn topology(&self) -> Option<&CacheTopology> {
        self.topology.as_ref()
    }

    pub fn state(&self) -> RebalanceState {
        self.state
    }

    pub fn member_nodes(&self) -> Vec<NodeId> {
        self.members.iter().map(|m| m.node).collect()
    }

    pub fn member_versions(&self) -> Vec<u16> {
        self.members.iter().map(|m| m.protocol_version).collect()
    }

    pub fn has_member(&self, node: NodeId) -> bool {
        self.members.iter().any(|m| m.node == node)
    }

    pub fn has_queued_rebalance(&self) -> bool {
        self.queued_rebalance
    }

    pub fn queue_rebalance(&mut self) {
        self.queued_rebalance = true;
    }

    /// Add a joiner, rejecting protocol versions the cluster cannot speak.
    /// Rejoining with the same node id replaces the old record.
    pub fn add_member(&mut self, info: &JoinInfo) -> Result<()> {
        if info.protocol_version < self.min_protocol_version {
            return Err(MembershipError::VersionMismatch {
                joiner: info.protocol_version,
                required: self.min_protocol_version,
            }
            .into());
        }
        self.members.retain(|m| m.node != info.node);
        self.members.push(MemberInfo::from(info));
        Ok(())
    }

    /// Remove a member. Confirmation it owed is forgiven; if that empties the
    /// outstanding set the caller sees it through [`Self::confirmations_done`].
    pub fn remove_member(&mut self, node: NodeId) -> bool {
        let before = self.members.len();
        self.members.retain(|m| m.node != node);
        if before == self.members.len() {
            return false;
        }
        self.pending_confirmations.remove(&node);
        true
    }

    fn ch_members(&self) -> Vec<Member> {
        self.members
            .iter()
            .map(|m| Member::new(m.node).with_capacity_factor(m.capacity_factor))
            .collect()
    }

    /// Install the first topology once the first member joins.
    pub fn ensure_initial_topology(&mut self) -> Option<&CacheTopology> {
        if self.topology.is_some() || self.members.is_empty() {
            return self.topology.as_ref();
        }
        let ch = ConsistentHashFactory::compute(
            &self.ch_members(),
            self.num_segments,
            self.num_owners,
            None,
        )?;
        let members = ch.members().to_vec();
        let uuids = self.uuids_for(&members, None);
        info!(cache = %self.cache, members = members.len(), "installing initial topology");
        self.topology = Some(CacheTopology::stable(1, 0, ch, members, uuids));
        self.topology.as_ref()
    }

    /// Resolve persistent uuids for `nodes`, in order. A node no longer in
    /// the membership (it just left, but the union hash still routes to it)
    /// keeps the uuid recorded in the previous topology.
    fn uuids_for(&self, nodes: &[NodeId], previous: Option<&CacheTopology>) -> Vec<Uuid> {
        nodes
            .iter()
            .filter_map(|n| {
                self.members
                    .iter()
                    .find(|m| m.node == *n)
                    .map(|m| m.persistent_uuid)
                    .or_else(|| {
                        previous.and_then(|t| {
                            t.actual_members()
                                .iter()
                                .position(|m| m == n)
                                .map(|i| t.persistent_uuids()[i])
                        })
                    })
            })
            .collect()
    }

    /// Whether current membership differs from what the topology reflects.
    pub fn needs_rebalance(&self) -> bool {
        match &self.topology {
            None => false,
            Some(t) => {
                let target: HashSet<NodeId> = self.members.iter().map(|m| m.node).collect();
                let current: HashSet<NodeId> =
                    t.current_ch().members().iter().copied().collect();
                target != current
            }
        }
    }

    /// Begin a rebalance towards current membership. Returns the rebalancing
    /// topology to broadcast, or `None` when nothing would change or one is
    /// already running.
    pub fn start_rebalance(&mut self) -> Option<CacheTopology> {
        if self.state == RebalanceState::RebalanceInProgress {
            self.queued_rebalance = true;
            return None;
        }
        let previous = self.topology.as_ref()?;
        if self.members.is_empty() {
            return None;
        }
        let pending = ConsistentHashFactory::compute(
            &self.ch_members(),
            self.num_segments,
            self.num_owners,
            Some(previous.current_ch()),
        )?;
        if pending == *previous.current_ch() {
            debug!(cache = %self.cache, "membership change produced identical hash, skipping");
            self.queued_rebalance = false;
            return None;
        }
        let actual: Vec<NodeId> = {
            let mut m = previous.current_ch().union(&pending).members().to_vec();
            m.sort_unstable();
            m
        };
        let uuids = self.uuids_for(&actual, Some(previous));
        let topology = CacheTopology::rebalancing(
            previous.topology_id() + 1,
            previous.rebalance_id() + 1,
            previous.current_ch().clone(),
            pending.clone(),
            actual,
            uuids,
        );
        // Everyone in the new hash must finish receiving state before the
        // topology can become stable.
        self.pending_confirmations = pending.members().iter().copied().collect();
        self.confirm_topology_id = topology.topology_id();
        self.state = RebalanceState::RebalanceInProgress;
        self.queued_rebalance = false;
        self.topology = Some(topology.clone());
        info!(
            cache = %self.cache,
            topology_id = topology.topology_id(),
            rebalance_id = topology.rebalance_id(),
            expected = self.pending_confirmations.len(),
            "rebalance started"
        );
        Some(topology)
    }

    /// Whether a confirmation tagged with this topology id belongs to the
    /// running rebalance. False for older ids and when nothing is running.
    pub fn expects_confirm(&self, topology_id: u64) -> bool {
        self.state == RebalanceState::RebalanceInProgress
            && topology_id == self.confirm_topology_id
    }

    /// Tally one confirmation against the running rebalance.
    pub fn confirm(&mut self, origin: NodeId, topology_id: u64) -> ConfirmOutcome {
        if !self.expects_confirm(topology_id) {
            return ConfirmOutcome::Stale;
        }
        self.pending_confirmations.remove(&origin);
        if self.pending_confirmations.is_empty() {
            ConfirmOutcome::Complete
        } else {
            ConfirmOutcome::Pending
        }
    }

    /// True when no confirmation is outstanding for the running rebalance.
    pub fn confirmations_done(&self) -> bool {
        self.state == RebalanceState::RebalanceInProgress && self.pending_confirmations.is_empty()
    }

    /// Nodes still owing a confirmation.
    pub fn outstanding_confirmations(&self) -> Vec<NodeId> {
        let mut nodes: Vec<NodeId> = self.pending_confirmations.iter().copied().collect();
        nodes.sort_unstable();
        nodes
    }

    /// Commit the pending hash and return the new stable topology.
    pub fn finish_rebalance(&mut self) -> Option<CacheTopology> {
        let committed = self.topology.as_ref()?.commit_pending()?;
        info!(
            cache = %self.cache,
            topology_id = committed.topology_id(),
            "rebalance finished, topology stable"
        );
        self.topology = Some(committed.clone());
        self.state = RebalanceState::NoRebalance;
        self.pending_confirmations.clear();
        Some(committed)
    }

    /// Adopt recovered state during coordinator handover. The highest
    /// topology reported by any member wins.
    pub fn recover(&mut self, join_info: &JoinInfo, topology: Option<CacheTopology>) -> Result<()> {
        self.add_member(join_info)?;
        if let Some(t) = topology {
            let newer = self
                .topology
                .as_ref()
                .map_or(true, |mine| t.topology_id() > mine.topology_id());
            if !newer {
                return Ok(());
            }
            if t.is_rebalancing() {
                // Resume tallying for the interrupted rebalance.
                self.state = RebalanceState::RebalanceInProgress;
                self.confirm_topology_id = t.topology_id();
                self.pending_confirmations = t
                    .pending_ch()
                    .map(|ch| ch.members().iter().copied().collect())
                    .unwrap_or_default();
            }
            self.topology = Some(t);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PROTOCOL_VERSION;

    fn join_info(node: NodeId) -> JoinInfo {
        JoinInfo {
            node,
            capacity_factor: 1.0,
            protocol_version: PROTOCOL_VERSION,
            persistent_uuid: Uuid::new_v4(),
            num_segments: 8,
            num_owners: 2,
        }
    }

    fn status() -> CacheStatus {
        CacheStatus::new("users".into(), 8, 2, PROTOCOL_VERSION)
    }

    #[test]
    fn test_first_join_creates_topology_id_one() {
        let mut s = status();
        s.add_member(&join_info(1)).unwrap();
        let t = s.ensure_initial_topology().unwrap();
        assert_eq!(t.topology_id(), 1);
        assert!(!t.is_rebalancing());
        assert_eq!(t.actual_members(), &[1]);
    }

    #[test]
    fn test_old_protocol_version_rejected() {
        let mut s = status();
        let mut info = join_info(1);
        info.protocol_version = PROTOCOL_VERSION - 1;
        let err = s.add_member(&info).unwrap_err();
        assert!(matches!(
            err,
            crate::error::Error::Membership(MembershipError::VersionMismatch { .. })
        ));
    }

    #[test]
    fn test_rebalance_lifecycle() {
        let mut s = status();
        s.add_member(&join_info(1)).unwrap();
        s.ensure_initial_topology();
        s.add_member(&join_info(2)).unwrap();
        assert!(s.needs_rebalance());

        let t = s.start_rebalance().unwrap();
        assert_eq!(t.topology_id(), 2);
        assert!(t.is_rebalancing());
        assert_eq!(s.state(), RebalanceState::RebalanceInProgress);

        assert_eq!(s.confirm(1, 2), ConfirmOutcome::Pending);
        // Duplicate confirmations do not double count.
        assert_eq!(s.confirm(1, 2), ConfirmOutcome::Pending);
        assert_eq!(s.confirm(2, 2), ConfirmOutcome::Complete);

        let stable = s.finish_rebalance().unwrap();
        assert_eq!(stable.topology_id(), 3);
        assert!(!stable.is_rebalancing());
        assert_eq!(s.state(), RebalanceState::NoRebalance);
    }

    #[test]
    fn test_stale_confirmation_dropped() {
        let mut s = status();
        s.add_member(&join_info(1)).unwrap();
        s.ensure_initial_topology();
        s.add_member(&join_info(2)).unwrap();
        s.start_rebalance().unwrap();
        assert_eq!(s.confirm(1, 1), ConfirmOutcome::Stale);
        assert_eq!(s.confirm(1, 99), ConfirmOutcome::Stale);
    }

    #[test]
    fn test_join_during_rebalance_is_queued() {
        let mut s = status();
        s.add_member(&join_info(1)).unwrap();
        s.ensure_initial_topology();
        s.add_member(&join_info(2)).unwrap();
        s.start_rebalance().unwrap();

        s.add_member(&join_info(3)).unwrap();
        assert!(s.start_rebalance().is_none());
        assert!(s.has_queued_rebalance());
    }

    #[test]
    fn test_leaver_confirmation_forgiven() {
        let mut s = status();
        s.add_member(&join_info(1)).unwrap();
        s.ensure_initial_topology();
        s.add_member(&join_info(2)).unwrap();
        let t = s.start_rebalance().unwrap();

        assert_eq!(s.confirm(1, t.topology_id()), ConfirmOutcome::Pending);
        assert!(s.remove_member(2));
        assert!(s.confirmations_done());
    }

    #[test]
    fn test_leave_rebalance_keeps_departed_uuid() {
        let mut s = status();
        s.add_member(&join_info(1)).unwrap();
        s.ensure_initial_topology();
        let info2 = join_info(2);
        s.add_member(&info2).unwrap();
        let t = s.start_rebalance().unwrap();
        s.confirm(1, t.topology_id());
        s.confirm(2, t.topology_id());
        s.finish_rebalance().unwrap();

        // Node 2 leaves; the union hash still routes writes to it, so the
        // rebalancing topology must pair it with its recorded uuid.
        assert!(s.remove_member(2));
        let t = s.start_rebalance().unwrap();
        assert_eq!(t.actual_members().len(), t.persistent_uuids().len());
        let pos = t.actual_members().iter().position(|&n| n == 2).unwrap();
        assert_eq!(t.persistent_uuids()[pos], info2.persistent_uuid);
    }

    #[test]
    fn test_expects_confirm_only_for_running_rebalance() {
        let mut s = status();
        s.add_member(&join_info(1)).unwrap();
        s.ensure_initial_topology();
        assert!(!s.expects_confirm(1));

        s.add_member(&join_info(2)).unwrap();
        let t = s.start_rebalance().unwrap();
        assert!(s.expects_confirm(t.topology_id()));
        assert!(!s.expects_confirm(t.topology_id() - 1));
    }

    #[test]
    fn test_no_rebalance_when_hash_unchanged() {
        let mut s = status();
        s.add_member(&join_info(1)).unwrap();
        s.ensure_initial_topology();
        // Same membership, nothing to move.
        assert!(!s.needs_rebalance());
        assert!(s.start_rebalance().is_none());
    }
}
