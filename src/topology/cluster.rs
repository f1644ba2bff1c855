//! Coordinator-side topology management.
//!
//! Exactly one node runs a [`ClusterTopologyManager`] at a time. It owns the
//! authoritative membership per cache, assigns topology ids, drives
//! rebalances, and broadcasts every topology change to the members. Any
//! other node receiving a coordinator-only command answers with a
//! not-coordinator error and the sender re-resolves.

use crate::config::RebalanceConfig;
use crate::error::{Error, MembershipError, Result, TopologyError};
use crate::partitioning::CacheTopology;
use crate::rpc::commands::{JoinInfo, PolicyAction, TopologyCommand, TopologyResponse};
use crate::rpc::Transport;
use crate::topology::cache_status::{CacheStatus, ConfirmOutcome, RebalanceState};
use crate::types::{CacheName, NodeId};
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Administrative view of the rebalancing policy and cluster composition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PolicySnapshot {
    pub rebalancing_enabled: bool,
    /// True while cache members speak differing protocol versions.
    pub mixed_cluster: bool,
    /// First member of the current view.
    pub oldest_member: Option<NodeId>,
}

#[derive(Debug)]
pub struct ClusterTopologyManager {
    node_id: NodeId,
    min_protocol_version: u16,
    rebalance_config: RebalanceConfig,
    transport: Arc<dyn Transport>,
    caches: DashMap<CacheName, Arc<Mutex<CacheStatus>>>,
    rebalancing_enabled: AtomicBool,
    /// Highest membership view this coordinator has acted on; notifications
    /// from older views are discarded.
    highest_view_id: AtomicU64,
}

impl ClusterTopologyManager {
    pub fn new(
        node_id: NodeId,
        min_protocol_version: u16,
        rebalance_config: RebalanceConfig,
        transport: Arc<dyn Transport>,
    ) -> Arc<Self> {
        let enabled = rebalance_config.enabled;
        Arc::new(Self {
            node_id,
            min_protocol_version,
            rebalance_config,
            transport,
            caches: DashMap::new(),
            rebalancing_enabled: AtomicBool::new(enabled),
            highest_view_id: AtomicU64::new(0),
        })
    }

    pub fn is_rebalancing_enabled(&self) -> bool {
        self.rebalancing_enabled.load(Ordering::SeqCst)
    }

    /// Snapshot the per-cache handles so no map guard is held while waiting
    /// on a cache mutex.
    fn cache_statuses(&self) -> Vec<Arc<Mutex<CacheStatus>>> {
        self.caches.iter().map(|e| e.value().clone()).collect()
    }

    fn status_for(&self, cache: &CacheName, info: &JoinInfo) -> Arc<Mutex<CacheStatus>> {
        self.caches
            .entry(cache.clone())
            .or_insert_with(|| {
                Arc::new(Mutex::new(CacheStatus::new(
                    cache.clone(),
                    info.num_segments,
                    info.num_owners,
                    self.min_protocol_version,
                )))
            })
            .clone()
    }

    /// Admit a joiner and return the topology it should start from.
    ///
    /// The first joiner fixes the cache's segment and owner counts and gets
    /// topology id 1. Later joiners trigger (or queue) a rebalance; they
    /// receive the current topology immediately and the rebalancing one
    /// through the normal broadcast.
    pub async fn handle_join(
        self: &Arc<Self>,
        cache: CacheName,
        info: JoinInfo,
    ) -> Result<CacheTopology> {
        let status = self.status_for(&cache, &info);
        let mut status = status.lock().await;
        info!(cache = %cache, node = info.node, "join request");
        status.add_member(&info)?;

        if status.topology().is_none() {
            return status
                .ensure_initial_topology()
                .cloned()
                .ok_or_else(|| Error::Internal("initial hash computation failed".into()));
        }

        self.maybe_start_rebalance(&mut status).await;
        self.spawn_join_broadcast(cache, info, status.member_nodes());
        status
            .topology()
            .cloned()
            .ok_or_else(|| Error::Internal("cache lost its topology".into()))
    }

    /// Tell existing members about an admitted joiner. Fire-and-forget: the
    /// authoritative change reaches them as a topology update.
    fn spawn_join_broadcast(self: &Arc<Self>, cache: CacheName, info: JoinInfo, members: Vec<NodeId>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            for member in members {
                if member == info.node {
                    continue;
                }
                let cmd = TopologyCommand::JoinBroadcast {
                    cache: cache.clone(),
                    info: info.clone(),
                };
                if let Err(err) = manager.transport.send(member, cmd).await {
                    debug!(member, %err, "join broadcast not delivered");
                }
            }
        });
    }

    /// Tell the remaining members a node is gone. Fire-and-forget; receivers
    /// use it to reroute transfers streaming from the leaver instead of
    /// waiting out their timeouts.
    fn spawn_leave_broadcast(self: &Arc<Self>, node: NodeId, members: Vec<NodeId>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            for member in members {
                let cmd = TopologyCommand::LeaveBroadcast { node };
                if let Err(err) = manager.transport.send(member, cmd).await {
                    debug!(member, %err, "leave broadcast not delivered");
                }
            }
        });
    }

    /// Process a member leaving the cluster view.
    pub async fn handle_leave(self: &Arc<Self>, node: NodeId, view_id: u64) -> Result<()> {
        self.check_view(view_id)?;
        info!(node, view_id, "member left");
        for status in self.cache_statuses() {
            let mut status = status.lock().await;
            if !status.remove_member(node) {
                continue;
            }
            self.spawn_leave_broadcast(node, status.member_nodes());
            match status.state() {
                RebalanceState::RebalanceInProgress => {
                    // The leaver's confirmation is forgiven; if it was the
                    // last one outstanding the rebalance completes now, and
                    // another one follows to route around the leaver.
                    status.queue_rebalance();
                    if status.confirmations_done() {
                        self.finish_and_continue(&mut status).await;
                    }
                }
                RebalanceState::NoRebalance => {
                    self.maybe_start_rebalance(&mut status).await;
                }
            }
        }
        Ok(())
    }

    /// Tally a member's confirmation that it finished receiving state.
    ///
    /// A confirmation carrying a failure is treated as that member leaving
    /// the cache: its data cannot be trusted, so the topology is recomputed
    /// without it.
    pub async fn handle_phase_confirm(
        self: &Arc<Self>,
        cache: CacheName,
        origin: NodeId,
        topology_id: u64,
        failure: Option<String>,
        view_id: u64,
    ) -> Result<()> {
        self.check_view(view_id)?;
        let status = self
            .caches
            .get(&cache)
            .map(|e| e.value().clone())
            .ok_or_else(|| TopologyError::NotInitialized(cache.clone()))?;
        let mut status = status.lock().await;

        if let Some(reason) = failure {
            if !status.expects_confirm(topology_id) {
                debug!(cache = %cache, origin, topology_id, "stale failure report dropped");
                return Ok(());
            }
            warn!(cache = %cache, origin, topology_id, %reason, "member failed its transfer");
            if status.remove_member(origin) {
                status.queue_rebalance();
                self.spawn_leave_broadcast(origin, status.member_nodes());
            }
            if status.confirmations_done() {
                self.finish_and_continue(&mut status).await;
            }
            return Ok(());
        }

        match status.confirm(origin, topology_id) {
            ConfirmOutcome::Stale => {
                debug!(cache = %cache, origin, topology_id, "stale confirmation dropped");
            }
            ConfirmOutcome::Pending => {
                debug!(cache = %cache, origin, topology_id, "confirmation counted");
            }
            ConfirmOutcome::Complete => {
                self.finish_and_continue(&mut status).await;
            }
        }
        Ok(())
    }

    /// Query or flip the cluster-wide rebalancing flag.
    pub async fn handle_policy(self: &Arc<Self>, action: PolicyAction) -> Result<PolicySnapshot> {
        match action {
            PolicyAction::Query => {}
            PolicyAction::Enable => {
                let was = self.rebalancing_enabled.swap(true, Ordering::SeqCst);
                if !was {
                    info!("rebalancing enabled");
                    self.catch_up_queued().await;
                }
            }
            PolicyAction::Disable => {
                // In-flight rebalances run to completion; only new ones stop.
                if self.rebalancing_enabled.swap(false, Ordering::SeqCst) {
                    info!("rebalancing disabled");
                }
            }
        }
        let mut versions: Vec<u16> = Vec::new();
        for status in self.cache_statuses() {
            versions.extend(status.lock().await.member_versions());
        }
        Ok(PolicySnapshot {
            rebalancing_enabled: self.is_rebalancing_enabled(),
            mixed_cluster: versions.iter().min() != versions.iter().max(),
            oldest_member: self.transport.members().first().copied(),
        })
    }

    /// Take over as coordinator: recover every member's view of every cache,
    /// then resume or start whatever rebalances are due.
    pub async fn become_coordinator(self: &Arc<Self>) -> Result<()> {
        let view_id = self.transport.view_id();
        self.highest_view_id.store(view_id, Ordering::SeqCst);
        info!(node = self.node_id, view_id, "recovering cluster state");

        let mut enabled = true;
        for member in self.transport.members() {
            let response = tokio::time::timeout(
                self.rebalance_config.status_timeout,
                self.transport
                    .send(member, TopologyCommand::StatusRequest { view_id }),
            )
            .await;
            let status = match response {
                Ok(Ok(TopologyResponse::NodeStatus(status))) => status,
                Ok(Ok(_)) => {
                    warn!(member, "unexpected status response shape");
                    continue;
                }
                Ok(Err(err)) => {
                    warn!(member, %err, "status request failed, skipping member");
                    continue;
                }
                Err(_) => {
                    warn!(member, "status request timed out, skipping member");
                    continue;
                }
            };
            enabled &= status.rebalancing_enabled;
            for snapshot in status.caches {
                let status_handle = self.status_for(&snapshot.cache, &snapshot.join_info);
                let mut cache_status = status_handle.lock().await;
                if let Err(err) = cache_status.recover(&snapshot.join_info, snapshot.topology) {
                    warn!(member, cache = %cache_status.cache(), %err, "recovery rejected member");
                }
            }
        }
        self.rebalancing_enabled.store(enabled, Ordering::SeqCst);

        for status in self.cache_statuses() {
            let mut status = status.lock().await;
            status.ensure_initial_topology();
            match status.state() {
                RebalanceState::RebalanceInProgress => {
                    // Confirmations sent to the old coordinator are gone;
                    // re-broadcast so members running behind catch up, and
                    // let the watchdog collect the tally again.
                    if let Some(topology) = status.topology().cloned() {
                        self.broadcast(&status, TopologyKind::Rebalancing(&topology))
                            .await;
                        self.spawn_confirm_watchdog(
                            status.cache().clone(),
                            topology.topology_id(),
                        );
                    }
                }
                RebalanceState::NoRebalance => {
                    self.maybe_start_rebalance(&mut status).await;
                }
            }
        }
        Ok(())
    }

    /// Start a rebalance if one is needed and allowed, otherwise queue it.
    async fn maybe_start_rebalance(self: &Arc<Self>, status: &mut CacheStatus) {
        if !status.needs_rebalance() && !status.has_queued_rebalance() {
            return;
        }
        if !self.is_rebalancing_enabled() {
            debug!(cache = %status.cache(), "rebalancing disabled, queueing");
            status.queue_rebalance();
            return;
        }
        let Some(topology) = status.start_rebalance() else {
            return;
        };
        self.broadcast(status, TopologyKind::Rebalancing(&topology))
            .await;
        self.spawn_confirm_watchdog(status.cache().clone(), topology.topology_id());
    }

    /// Commit the finished rebalance, tell everyone, and start the next one
    /// if membership moved on in the meantime.
    async fn finish_and_continue(self: &Arc<Self>, status: &mut CacheStatus) {
        let Some(stable) = status.finish_rebalance() else {
            return;
        };
        self.broadcast(status, TopologyKind::Stable(&stable)).await;
        self.maybe_start_rebalance(status).await;
    }

    async fn broadcast(&self, status: &CacheStatus, kind: TopologyKind<'_>) {
        let view_id = self.transport.view_id();
        let (topology, stable) = match kind {
            TopologyKind::Rebalancing(t) => (t, false),
            TopologyKind::Stable(t) => (t, true),
        };
        for member in topology.actual_members().to_vec() {
            let cmd = if stable {
                TopologyCommand::StableTopologyUpdate {
                    cache: status.cache().clone(),
                    topology: topology.clone(),
                    view_id,
                }
            } else {
                TopologyCommand::TopologyUpdate {
                    cache: status.cache().clone(),
                    topology: topology.clone(),
                    view_id,
                }
            };
            if let Err(err) = self.transport.send(member, cmd).await {
                // A member that cannot be reached is about to generate a
                // leave event; the follow-up rebalance covers it.
                warn!(
                    cache = %status.cache(),
                    member,
                    topology_id = topology.topology_id(),
                    %err,
                    "topology broadcast to member failed"
                );
            }
        }
    }

    /// After the confirmation timeout, members that stayed silent are
    /// treated as failed so one stuck node cannot wedge the rebalance.
    fn spawn_confirm_watchdog(self: &Arc<Self>, cache: CacheName, topology_id: u64) {
        let manager = Arc::clone(self);
        let timeout = self.rebalance_config.confirm_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let Some(status) = manager.caches.get(&cache).map(|e| e.value().clone()) else {
                return;
            };
            let mut status = status.lock().await;
            let watched = status.state() == RebalanceState::RebalanceInProgress
                && status.topology().map(|t| t.topology_id()) == Some(topology_id);
            if !watched {
                return;
            }
            let silent = status.outstanding_confirmations();
            if silent.is_empty() {
                return;
            }
            error!(
                cache = %cache,
                topology_id,
                ?silent,
                "confirmation timeout, treating silent members as failed"
            );
            for &node in &silent {
                status.remove_member(node);
                manager.spawn_leave_broadcast(node, status.member_nodes());
            }
            status.queue_rebalance();
            if status.confirmations_done() {
                manager.finish_and_continue(&mut status).await;
            }
        });
    }

    async fn catch_up_queued(self: &Arc<Self>) {
        for status in self.cache_statuses() {
            let mut status = status.lock().await;
            if status.state() == RebalanceState::NoRebalance {
                self.maybe_start_rebalance(&mut status).await;
            }
        }
    }

    fn check_view(&self, view_id: u64) -> Result<()> {
        let current = self.highest_view_id.fetch_max(view_id, Ordering::SeqCst);
        if view_id < current {
            return Err(Error::Membership(MembershipError::StaleView {
                received: view_id,
                current,
            }));
        }
        Ok(())
    }
}

enum TopologyKind<'a> {
    Rebalancing(&'a CacheTopology),
    Stable(&'a CacheTopology),
}
