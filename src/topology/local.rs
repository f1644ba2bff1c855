//! Node-local topology handling and segment-routed data plane.

use crate::config::GridConfig;
use crate::container::{DataContainer, LockManager};
use crate::error::{Error, Result, TopologyError};
use crate::partitioning::CacheTopology;
use crate::rpc::commands::{
    CacheStatusSnapshot, JoinInfo, NodeStatusResponse, TopologyCommand, TopologyResponse,
};
use crate::rpc::{retry, RetryPolicy, Transport};
use crate::statetransfer::StateTransferConsumer;
use crate::transaction::TransactionTable;
use crate::types::{segment_of, GlobalTransaction, NodeId, SegmentId, WriteOp};
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Runs on every node: installs topologies pushed by the coordinator,
/// triggers inbound state transfer for gained segments, and routes
/// data-plane operations to segment owners.
///
/// Topology installation is atomic and monotonic: an update whose id is not
/// greater than the installed one is ignored, so reordered broadcasts cannot
/// roll a node back.
#[derive(Debug)]
pub struct LocalTopologyManager {
    config: GridConfig,
    persistent_uuid: Uuid,
    transport: Arc<dyn Transport>,
    container: Arc<DataContainer>,
    locks: Arc<dyn LockManager>,
    txs: Arc<TransactionTable>,
    consumer: Arc<StateTransferConsumer>,
    topology: RwLock<Option<CacheTopology>>,
    /// Last rebalancing flag this node heard; reported to a recovering
    /// coordinator so the setting survives handover.
    rebalancing_enabled: AtomicBool,
}

impl LocalTopologyManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: GridConfig,
        transport: Arc<dyn Transport>,
        container: Arc<DataContainer>,
        locks: Arc<dyn LockManager>,
        txs: Arc<TransactionTable>,
        consumer: Arc<StateTransferConsumer>,
    ) -> Arc<Self> {
        let enabled = config.rebalance.enabled;
        Arc::new(Self {
            config,
            persistent_uuid: Uuid::new_v4(),
            transport,
            container,
            locks,
            txs,
            consumer,
            topology: RwLock::new(None),
            rebalancing_enabled: AtomicBool::new(enabled),
        })
    }

    pub fn node_id(&self) -> NodeId {
        self.config.node_id
    }

    pub fn current_topology(&self) -> Option<CacheTopology> {
        self.topology.read().clone()
    }

    fn join_info(&self) -> JoinInfo {
        JoinInfo {
            node: self.config.node_id,
            capacity_factor: self.config.capacity_factor,
            protocol_version: self.config.protocol_version,
            persistent_uuid: self.persistent_uuid,
            num_segments: self.config.num_segments,
            num_owners: self.config.num_owners,
        }
    }

    /// Join the cache through the coordinator, retrying across coordinator
    /// changes, and install the topology it hands back.
    pub async fn join(self: &Arc<Self>) -> Result<CacheTopology> {
        let info = self.join_info();
        let mut backoff = std::time::Duration::from_millis(50);
        let mut last_err = Error::Timeout;
        for _ in 0..8 {
            let coordinator = self.transport.coordinator();
            let cmd = TopologyCommand::JoinRequest {
                cache: self.config.cache_name.clone(),
                info: info.clone(),
            };
            match self.transport.send(coordinator, cmd).await {
                Ok(TopologyResponse::Topology(topology)) => {
                    info!(
                        node = self.config.node_id,
                        cache = %self.config.cache_name,
                        topology_id = topology.topology_id(),
                        "joined"
                    );
                    self.handle_topology_update(&self.config.cache_name, topology.clone())?;
                    return Ok(topology);
                }
                Ok(_) => return Err(Error::Internal("unexpected join response".into())),
                Err(err)
                    if err.is_retryable()
                        || matches!(
                            err,
                            Error::Topology(TopologyError::NotCoordinator)
                        ) =>
                {
                    debug!(coordinator, %err, "join attempt failed, retrying");
                    last_err = err;
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
                Err(err) => return Err(err),
            }
        }
        Err(last_err)
    }

    /// Install a topology pushed by the coordinator. Rebalancing topologies
    /// kick off inbound transfer for gained segments on a background task;
    /// the phase confirmation goes out when that transfer settles.
    pub fn handle_topology_update(
        self: &Arc<Self>,
        cache: &str,
        topology: CacheTopology,
    ) -> Result<()> {
        if cache != self.config.cache_name {
            debug!(cache, "topology update for a cache this node does not host");
            return Ok(());
        }
        let gained;
        {
            let mut guard = self.topology.write();
            if let Some(current) = guard.as_ref() {
                if topology.topology_id() <= current.topology_id() {
                    debug!(
                        received = topology.topology_id(),
                        installed = current.topology_id(),
                        "ignoring stale topology update"
                    );
                    return Ok(());
                }
            }
            gained = self.segments_gained(&topology);
            *guard = Some(topology.clone());
        }
        info!(
            node = self.config.node_id,
            topology_id = topology.topology_id(),
            rebalancing = topology.is_rebalancing(),
            gained = gained.len(),
            "topology installed"
        );
        if topology.is_rebalancing() {
            let manager = Arc::clone(self);
            tokio::spawn(async move {
                manager.transfer_and_confirm(topology, gained).await;
            });
        }
        Ok(())
    }

    /// Install a stable topology and drop segments this node no longer owns.
    pub fn handle_stable_update(&self, cache: &str, topology: CacheTopology) -> Result<()> {
        if cache != self.config.cache_name {
            return Ok(());
        }
        let lost_ownership;
        let owned_now;
        {
            let mut guard = self.topology.write();
            if let Some(current) = guard.as_ref() {
                if topology.topology_id() <= current.topology_id() {
                    return Ok(());
                }
            }
            let owned_before = self.owned_segments(guard.as_ref());
            owned_now = self.owned_segments(Some(&topology));
            lost_ownership = owned_before
                .difference(&owned_now)
                .copied()
                .collect::<Vec<SegmentId>>();
            *guard = Some(topology.clone());
        }
        if !lost_ownership.is_empty() {
            debug!(
                node = self.config.node_id,
                segments = lost_ownership.len(),
                "dropping segments this node no longer owns"
            );
            self.container.remove_segments(&lost_ownership);
        }
        let owned: Vec<SegmentId> = owned_now.into_iter().collect();
        self.consumer.retain_lost(&owned);
        info!(
            node = self.config.node_id,
            topology_id = topology.topology_id(),
            "stable topology installed"
        );
        Ok(())
    }

    /// Segments this node will own under the pending hash but does not own
    /// under the current one.
    fn segments_gained(&self, topology: &CacheTopology) -> Vec<SegmentId> {
        let Some(pending) = topology.pending_ch() else {
            return Vec::new();
        };
        let node = self.config.node_id;
        (0..topology.num_segments())
            .filter(|&s| pending.is_owner(s, node) && !topology.current_ch().is_owner(s, node))
            .collect()
    }

    fn owned_segments(&self, topology: Option<&CacheTopology>) -> BTreeSet<SegmentId> {
        let Some(t) = topology else {
            return BTreeSet::new();
        };
        let node = self.config.node_id;
        (0..t.num_segments())
            .filter(|&s| t.write_owners(s).contains(&node))
            .collect()
    }

    async fn transfer_and_confirm(self: Arc<Self>, topology: CacheTopology, gained: Vec<SegmentId>) {
        let result = async {
            self.consumer
                .request_segments(&topology, gained)
                .await?;
            self.consumer.wait_for_completion().await
        }
        .await;
        let failure = result.as_ref().err().map(|e| e.to_string());
        if let Some(reason) = &failure {
            error!(
                node = self.config.node_id,
                topology_id = topology.topology_id(),
                reason = %reason,
                "state transfer phase failed"
            );
        }
        let cmd = TopologyCommand::RebalancePhaseConfirm {
            cache: self.config.cache_name.clone(),
            origin: self.config.node_id,
            topology_id: topology.topology_id(),
            failure,
            view_id: self.transport.view_id(),
        };
        let transport = Arc::clone(&self.transport);
        let confirm = retry(RetryPolicy::default(), move || {
            let transport = Arc::clone(&transport);
            let cmd = cmd.clone();
            async move {
                let coordinator = transport.coordinator();
                transport.send(coordinator, cmd).await
            }
        })
        .await;
        if let Err(err) = confirm {
            error!(
                node = self.config.node_id,
                topology_id = topology.topology_id(),
                %err,
                "could not deliver phase confirmation"
            );
        }
    }

    /// Answer a recovering coordinator's status request.
    pub fn node_status(&self, _view_id: u64) -> Result<NodeStatusResponse> {
        Ok(NodeStatusResponse {
            rebalancing_enabled: self.rebalancing_enabled.load(Ordering::SeqCst),
            caches: vec![CacheStatusSnapshot {
                cache: self.config.cache_name.clone(),
                join_info: self.join_info(),
                topology: self.current_topology(),
            }],
        })
    }

    /// Informational join notification from the coordinator.
    pub fn note_member_joined(&self, cache: &str, info: &JoinInfo) {
        if cache == self.config.cache_name {
            debug!(node = self.config.node_id, joiner = info.node, "member joined the cache");
        }
    }

    /// A member left the view; inbound transfers it was streaming are
    /// rerouted to the remaining previous owners.
    pub async fn note_member_left(&self, node: NodeId) {
        debug!(node = self.config.node_id, left = node, "member left the cache");
        self.consumer.handle_member_leave(node).await;
    }

    pub fn note_rebalancing_enabled(&self, enabled: bool) {
        self.rebalancing_enabled.store(enabled, Ordering::SeqCst);
    }

    /// Segments this node should own but received no data for.
    pub fn lost_segments(&self) -> Vec<SegmentId> {
        self.consumer.lost_segments()
    }

    /// Operator acknowledgement that a lost segment's data is gone.
    pub fn clear_lost_segment(&self, segment: SegmentId) -> bool {
        let cleared = self.consumer.clear_lost(segment);
        if cleared {
            warn!(
                node = self.config.node_id,
                segment, "lost segment cleared by operator"
            );
        }
        cleared
    }

    fn required_topology(&self) -> Result<CacheTopology> {
        self.current_topology()
            .ok_or_else(|| TopologyError::NotInitialized(self.config.cache_name.clone()).into())
    }

    /// Reject commands tagged with a topology older than ours. A newer tag
    /// is accepted: the sender is ahead and our update is on its way.
    fn check_command_topology(&self, topology_id: u64) -> Result<CacheTopology> {
        let topology = self.required_topology()?;
        if topology_id < topology.topology_id() {
            return Err(Error::outdated(topology_id, topology.topology_id()));
        }
        Ok(topology)
    }

    fn check_segment_intact(&self, segment: SegmentId) -> Result<()> {
        if self.consumer.is_lost(segment) {
            return Err(Error::data_loss(segment));
        }
        Ok(())
    }

    // ---- data plane, origin side ----

    /// Write a key, routing to its first write owner. Retries while the
    /// owner considers our topology outdated or is unreachable.
    pub async fn put(&self, key: &[u8], value: Bytes) -> Result<()> {
        retry(RetryPolicy::default(), || {
            let key = key.to_vec();
            let value = value.clone();
            async move {
                let topology = self.required_topology()?;
                let segment = segment_of(&key, topology.num_segments());
                let target = first_owner(topology.write_owners(segment))?;
                if target == self.config.node_id {
                    self.apply_put(key, value, topology.topology_id(), false)
                        .await
                } else {
                    let cmd = TopologyCommand::Put {
                        cache: self.config.cache_name.clone(),
                        key,
                        value,
                        topology_id: topology.topology_id(),
                        forwarded: false,
                    };
                    self.transport.send(target, cmd).await.map(|_| ())
                }
            }
        })
        .await
    }

    /// Read a key from one of its read owners.
    pub async fn get(&self, key: &[u8]) -> Result<Option<Bytes>> {
        retry(RetryPolicy::default(), || {
            let key = key.to_vec();
            async move {
                let topology = self.required_topology()?;
                let segment = segment_of(&key, topology.num_segments());
                let target = first_owner(topology.read_owners(segment))?;
                if target == self.config.node_id {
                    self.local_get(&key, topology.topology_id())
                } else {
                    let cmd = TopologyCommand::Get {
                        cache: self.config.cache_name.clone(),
                        key,
                        topology_id: topology.topology_id(),
                    };
                    match self.transport.send(target, cmd).await? {
                        TopologyResponse::Value(value) => Ok(value),
                        _ => Err(Error::Internal("unexpected get response".into())),
                    }
                }
            }
        })
        .await
    }

    /// Remove a key on its write owners.
    pub async fn remove(&self, key: &[u8]) -> Result<()> {
        retry(RetryPolicy::default(), || {
            let key = key.to_vec();
            async move {
                let topology = self.required_topology()?;
                let segment = segment_of(&key, topology.num_segments());
                let target = first_owner(topology.write_owners(segment))?;
                if target == self.config.node_id {
                    self.apply_remove(key, topology.topology_id(), false).await
                } else {
                    let cmd = TopologyCommand::Remove {
                        cache: self.config.cache_name.clone(),
                        key,
                        topology_id: topology.topology_id(),
                        forwarded: false,
                    };
                    self.transport.send(target, cmd).await.map(|_| ())
                }
            }
        })
        .await
    }

    // ---- data plane, owner side ----

    pub async fn handle_put(
        &self,
        key: Vec<u8>,
        value: Bytes,
        topology_id: u64,
        forwarded: bool,
    ) -> Result<()> {
        self.apply_put(key, value, topology_id, forwarded).await
    }

    async fn apply_put(
        &self,
        key: Vec<u8>,
        value: Bytes,
        topology_id: u64,
        forwarded: bool,
    ) -> Result<()> {
        let topology = self.check_command_topology(topology_id)?;
        let segment = segment_of(&key, topology.num_segments());
        self.check_segment_intact(segment)?;
        self.container.put(key.clone(), value.clone());
        if !forwarded {
            self.replicate(
                &topology,
                segment,
                TopologyCommand::Put {
                    cache: self.config.cache_name.clone(),
                    key,
                    value,
                    topology_id: topology.topology_id(),
                    forwarded: true,
                },
            )
            .await;
        }
        Ok(())
    }

    pub async fn handle_remove(
        &self,
        key: Vec<u8>,
        topology_id: u64,
        forwarded: bool,
    ) -> Result<()> {
        self.apply_remove(key, topology_id, forwarded).await
    }

    async fn apply_remove(&self, key: Vec<u8>, topology_id: u64, forwarded: bool) -> Result<()> {
        let topology = self.check_command_topology(topology_id)?;
        let segment = segment_of(&key, topology.num_segments());
        self.check_segment_intact(segment)?;
        self.container.remove(&key);
        if !forwarded {
            self.replicate(
                &topology,
                segment,
                TopologyCommand::Remove {
                    cache: self.config.cache_name.clone(),
                    key,
                    topology_id: topology.topology_id(),
                    forwarded: true,
                },
            )
            .await;
        }
        Ok(())
    }

    pub fn handle_get(&self, key: &[u8], topology_id: u64) -> Result<Option<Bytes>> {
        self.local_get(key, topology_id)
    }

    fn local_get(&self, key: &[u8], topology_id: u64) -> Result<Option<Bytes>> {
        let topology = self.check_command_topology(topology_id)?;
        let segment = segment_of(key, topology.num_segments());
        self.check_segment_intact(segment)?;
        Ok(self.container.get(key).map(|e| e.value))
    }

    /// Copy an applied write to the segment's other write owners. Failures
    /// are logged, not propagated: an unreachable backup is about to
    /// generate a leave and a rebalance.
    async fn replicate(&self, topology: &CacheTopology, segment: SegmentId, cmd: TopologyCommand) {
        for owner in topology.write_owners(segment) {
            if *owner == self.config.node_id {
                continue;
            }
            if let Err(err) = self.transport.send(*owner, cmd.clone()).await {
                warn!(
                    node = self.config.node_id,
                    owner, segment, %err, "replication to backup owner failed"
                );
            }
        }
    }

    // ---- transactions ----

    /// Start a transaction under the installed topology.
    pub fn begin_transaction(&self) -> Result<GlobalTransaction> {
        let topology = self.required_topology()?;
        Ok(self.txs.begin(topology.topology_id()))
    }

    /// Acquire key locks for a transaction on this node.
    pub async fn tx_lock(&self, gtx: GlobalTransaction, keys: Vec<Vec<u8>>) -> Result<()> {
        self.locks
            .lock(&keys, gtx, self.config.transfer.chunk_timeout)
            .await?;
        for key in keys {
            self.txs.add_locked_key(&gtx, key);
        }
        Ok(())
    }

    /// Stage a write inside a transaction.
    pub fn tx_write(&self, gtx: GlobalTransaction, op: WriteOp) -> Result<()> {
        let topology = self.required_topology()?;
        let segment = segment_of(op.key(), topology.num_segments());
        self.check_segment_intact(segment)?;
        self.txs.add_modification(&gtx, op);
        Ok(())
    }

    /// Commit a transaction: every write owner of a touched segment applies
    /// the staged writes and releases the locks. After a rebalance the new
    /// owner holds the transferred transaction state, so commits started
    /// before the handoff land on it.
    pub async fn commit_transaction(&self, gtx: GlobalTransaction) -> Result<()> {
        self.end_transaction(gtx, true).await
    }

    /// Release a transaction without applying its writes.
    pub async fn rollback_transaction(&self, gtx: GlobalTransaction) -> Result<()> {
        self.end_transaction(gtx, false).await
    }

    async fn end_transaction(&self, gtx: GlobalTransaction, commit: bool) -> Result<()> {
        let state = self
            .txs
            .get(&gtx)
            .ok_or_else(|| Error::Internal(format!("unknown transaction {gtx}")))?;
        let topology = self.required_topology()?;
        let mut owners: BTreeSet<NodeId> = BTreeSet::new();
        for key in state
            .modifications
            .iter()
            .map(|op| op.key())
            .chain(state.locked_keys.iter().map(|k| k.as_slice()))
        {
            let segment = segment_of(key, topology.num_segments());
            owners.extend(topology.write_owners(segment).iter().copied());
        }
        let mut apply_local = false;
        for owner in owners {
            if owner == self.config.node_id {
                apply_local = true;
                continue;
            }
            let cmd = if commit {
                TopologyCommand::TxCommit {
                    cache: self.config.cache_name.clone(),
                    gtx,
                }
            } else {
                TopologyCommand::TxRollback {
                    cache: self.config.cache_name.clone(),
                    gtx,
                }
            };
            if let Err(err) = self.transport.send(owner, cmd).await {
                warn!(owner, %gtx, %err, "transaction completion not delivered to owner");
            }
        }
        if apply_local {
            if commit {
                self.handle_tx_commit(gtx).await?;
            } else {
                self.handle_tx_rollback(gtx).await?;
            }
        } else if let Some(state) = self.txs.complete(&gtx) {
            // Origin no longer owns any touched segment; just release what
            // it still holds locally.
            self.locks.unlock(&state.locked_keys, &gtx);
        }
        Ok(())
    }

    /// Apply a transaction this node knows about (local or transferred) and
    /// release its locks. Unknown transactions are ignored: this node never
    /// saw the segment while the transaction was live.
    pub async fn handle_tx_commit(&self, gtx: GlobalTransaction) -> Result<()> {
        let Some(state) = self.txs.complete(&gtx) else {
            debug!(%gtx, "commit for unknown transaction ignored");
            return Ok(());
        };
        for op in &state.modifications {
            match op {
                WriteOp::Put { key, value } => {
                    self.container.put(key.clone(), value.clone());
                }
                WriteOp::Remove { key } => {
                    self.container.remove(key);
                }
            }
        }
        self.locks.unlock(&state.locked_keys, &gtx);
        debug!(%gtx, node = self.config.node_id, "transaction committed");
        Ok(())
    }

    /// Discard a transaction and release its locks.
    pub async fn handle_tx_rollback(&self, gtx: GlobalTransaction) -> Result<()> {
        let Some(state) = self.txs.complete(&gtx) else {
            debug!(%gtx, "rollback for unknown transaction ignored");
            return Ok(());
        };
        self.locks.unlock(&state.locked_keys, &gtx);
        debug!(%gtx, node = self.config.node_id, "transaction rolled back");
        Ok(())
    }
}

fn first_owner(owners: &[NodeId]) -> Result<NodeId> {
    owners
        .first()
        .copied()
        .ok_or_else(|| Error::Internal("segment has no owner".into()))
}
