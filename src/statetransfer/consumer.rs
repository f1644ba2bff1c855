//! Inbound side of a segment transfer.

use crate::config::TransferConfig;
use crate::container::{DataContainer, LockManager};
use crate::error::{Error, Result, TransferError};
use crate::partitioning::CacheTopology;
use crate::rpc::{TopologyCommand, Transport};
use crate::statetransfer::chunk::{StateChunk, TransactionInfo};
use crate::transaction::TransactionTable;
use crate::types::{CacheName, NodeId, SegmentId};
use dashmap::{DashMap, DashSet};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

#[derive(Debug)]
struct InboundSegment {
    topology_id: u64,
    /// Owner under the previous topology currently streaming the segment.
    current_provider: NodeId,
    /// Remaining fallback providers, tried in order on failure.
    remaining_providers: Vec<NodeId>,
}

/// Receives segments this node gained in a rebalance.
///
/// Applies chunks idempotently: entries carry per-key versions and an entry
/// older than the stored one is dropped, so a replayed or duplicated chunk
/// cannot roll a key back. Transaction snapshots for a segment are applied
/// before its entries so the locks are held when the segment goes live.
#[derive(Debug)]
pub struct StateTransferConsumer {
    node_id: NodeId,
    cache_name: CacheName,
    config: TransferConfig,
    container: Arc<DataContainer>,
    locks: Arc<dyn LockManager>,
    txs: Arc<TransactionTable>,
    transport: Arc<dyn Transport>,
    inbound: DashMap<SegmentId, InboundSegment>,
    completed: DashSet<SegmentId>,
    lost: DashSet<SegmentId>,
    progress: Notify,
}

impl StateTransferConsumer {
    pub fn new(
        node_id: NodeId,
        cache_name: CacheName,
        config: TransferConfig,
        container: Arc<DataContainer>,
        locks: Arc<dyn LockManager>,
        txs: Arc<TransactionTable>,
        transport: Arc<dyn Transport>,
    ) -> Arc<Self> {
        Arc::new(Self {
            node_id,
            cache_name,
            config,
            container,
            locks,
            txs,
            transport,
            inbound: DashMap::new(),
            completed: DashSet::new(),
            lost: DashSet::new(),
            progress: Notify::new(),
        })
    }

    /// Request the given segments from their previous owners.
    ///
    /// A segment with no surviving previous owner is recorded as lost
    /// immediately; the rebalance still completes, and reads of the segment
    /// fail with a data-loss error until an operator clears it.
    pub async fn request_segments(
        self: &Arc<Self>,
        topology: &CacheTopology,
        gained: Vec<SegmentId>,
    ) -> Result<()> {
        if gained.is_empty() {
            return Ok(());
        }
        self.completed.clear();
        info!(
            cache = %self.cache_name,
            topology_id = topology.topology_id(),
            segments = gained.len(),
            "requesting gained segments"
        );

        let mut by_provider: HashMap<NodeId, Vec<SegmentId>> = HashMap::new();
        for segment in gained {
            // Only owners under the hash being replaced have the data; other
            // gaining nodes are still waiting for it themselves.
            let mut providers: Vec<NodeId> = topology
                .current_ch()
                .owners(segment)
                .iter()
                .copied()
                .filter(|n| *n != self.node_id)
                .collect();
            if providers.is_empty() {
                error!(cache = %self.cache_name, segment, "no provider for segment, data lost");
                self.lost.insert(segment);
                continue;
            }
            let first = providers.remove(0);
            providers.truncate(self.config.max_retries);
            self.inbound.insert(
                segment,
                InboundSegment {
                    topology_id: topology.topology_id(),
                    current_provider: first,
                    remaining_providers: providers,
                },
            );
            by_provider.entry(first).or_default().push(segment);
        }

        for (provider, segments) in by_provider {
            self.send_state_request(provider, segments, topology.topology_id())
                .await;
        }
        Ok(())
    }

    async fn send_state_request(
        self: &Arc<Self>,
        provider: NodeId,
        segments: Vec<SegmentId>,
        topology_id: u64,
    ) {
        let cmd = TopologyCommand::StateRequest {
            cache: self.cache_name.clone(),
            origin: self.node_id,
            segments: segments.clone(),
            topology_id,
        };
        if let Err(err) = self.transport.send(provider, cmd).await {
            warn!(
                cache = %self.cache_name,
                provider,
                %err,
                "state request failed, trying next provider"
            );
            self.handle_provider_failure(provider, &segments, &err.to_string())
                .await;
        }
    }

    /// Re-route inbound segments whose provider left the cluster. Without
    /// this a departed provider stalls its receivers until the completion
    /// timeout and the coordinator ejects them for the provider's crash.
    pub async fn handle_member_leave(self: &Arc<Self>, node: NodeId) {
        let mut stalled = Vec::new();
        for mut entry in self.inbound.iter_mut() {
            entry.value_mut().remaining_providers.retain(|n| *n != node);
            if entry.value().current_provider == node {
                stalled.push(*entry.key());
            }
        }
        if stalled.is_empty() {
            return;
        }
        warn!(
            cache = %self.cache_name,
            node,
            segments = stalled.len(),
            "provider left mid-transfer, rerouting its segments"
        );
        self.handle_provider_failure(node, &stalled, "provider left the view")
            .await;
    }

    /// Re-route segments whose current provider failed to the next previous
    /// owner; segments with no owner left become lost.
    pub async fn handle_provider_failure(
        self: &Arc<Self>,
        failed: NodeId,
        segments: &[SegmentId],
        reason: &str,
    ) {
        let mut retry: HashMap<NodeId, (Vec<SegmentId>, u64)> = HashMap::new();
        for &segment in segments {
            let Some(mut state) = self.inbound.get_mut(&segment) else {
                continue;
            };
            if state.current_provider != failed {
                continue;
            }
            if state.remaining_providers.is_empty() {
                drop(state);
                let err: Error = TransferError::ProviderFailed {
                    node: failed,
                    segment,
                    reason: reason.to_string(),
                }
                .into();
                error!(cache = %self.cache_name, %err, "no provider left for segment, data lost");
                self.inbound.remove(&segment);
                self.lost.insert(segment);
                self.progress.notify_waiters();
                continue;
            }
            let next = state.remaining_providers.remove(0);
            state.current_provider = next;
            let topology_id = state.topology_id;
            drop(state);
            let slot = retry.entry(next).or_insert_with(|| (Vec::new(), topology_id));
            slot.0.push(segment);
        }
        for (provider, (segs, topology_id)) in retry {
            Box::pin(self.send_state_request(provider, segs, topology_id)).await;
        }
    }

    /// Install the transaction snapshot for a segment.
    pub async fn apply_transactions(
        &self,
        topology_id: u64,
        segment: SegmentId,
        transactions: Vec<TransactionInfo>,
    ) -> Result<()> {
        if !self.is_expected(segment, topology_id) {
            // Replays after completion are harmless.
            return Ok(());
        }
        for info in transactions {
            let remote = info.gtx.as_remote();
            let keys = info.state.locked_keys.clone();
            self.txs.register_remote(info.gtx, info.state);
            if !keys.is_empty() {
                self.locks
                    .lock(&keys, remote, self.config.chunk_timeout)
                    .await?;
            }
        }
        Ok(())
    }

    /// Apply one entry chunk; the final chunk completes the segment.
    pub fn apply_chunk(&self, origin: NodeId, topology_id: u64, chunk: StateChunk) -> Result<()> {
        let segment = chunk.segment;
        if !self.is_expected(segment, topology_id) {
            if self.completed.contains(&segment) {
                debug!(cache = %self.cache_name, segment, "ignoring replayed chunk");
                return Ok(());
            }
            return Err(TransferError::UnexpectedSegment(segment).into());
        }
        // Per-key version guard in the container makes this idempotent and
        // safe against a concurrent commit writing the same key.
        for entry in chunk.entries {
            let (key, entry) = entry.into_entry();
            self.container.apply_transferred(key, entry);
        }
        if chunk.is_last_chunk {
            debug!(cache = %self.cache_name, origin, segment, "segment transfer complete");
            self.inbound.remove(&segment);
            self.completed.insert(segment);
            self.progress.notify_waiters();
        }
        Ok(())
    }

    /// Wait until every requested segment has either completed or been
    /// declared lost. Data loss does not fail the wait; it is surfaced per
    /// segment on later reads.
    pub async fn wait_for_completion(&self) -> Result<()> {
        let deadline = Instant::now() + self.config.completion_timeout;
        loop {
            if self.inbound.is_empty() {
                return Ok(());
            }
            if Instant::now() >= deadline {
                warn!(
                    cache = %self.cache_name,
                    pending = self.inbound.len(),
                    "state transfer did not complete in time"
                );
                return Err(Error::Timeout);
            }
            // Bounded wait: a notification registered after the emptiness
            // check would otherwise be missed.
            let wake = deadline.min(Instant::now() + std::time::Duration::from_millis(50));
            let _ = tokio::time::timeout_at(wake, self.progress.notified()).await;
        }
    }

    /// Drop transfer state superseded by a newer topology.
    pub fn cancel_pending(&self) {
        self.inbound.clear();
        self.progress.notify_waiters();
    }

    /// Segments this node should own but holds no data for.
    pub fn lost_segments(&self) -> Vec<SegmentId> {
        let mut segments: Vec<SegmentId> = self.lost.iter().map(|s| *s).collect();
        segments.sort_unstable();
        segments
    }

    pub fn is_lost(&self, segment: SegmentId) -> bool {
        self.lost.contains(&segment)
    }

    /// Operator acknowledgement that a lost segment's data is gone; the
    /// segment serves (empty) reads again afterwards.
    pub fn clear_lost(&self, segment: SegmentId) -> bool {
        self.lost.remove(&segment).is_some()
    }

    /// Forget lost markers for segments this node no longer owns.
    pub fn retain_lost(&self, owned: &[SegmentId]) {
        self.lost.retain(|s| owned.contains(s));
    }

    fn is_expected(&self, segment: SegmentId, topology_id: u64) -> bool {
        self.inbound
            .get(&segment)
            .map(|s| s.topology_id == topology_id)
            .unwrap_or(false)
    }
}
