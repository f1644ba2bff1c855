//! Outbound side of a segment transfer.

use crate::config::TransferConfig;
use crate::container::{DataContainer, SegmentStore};
use crate::error::{Result, TransferError};
use crate::rpc::{TopologyCommand, Transport};
use crate::statetransfer::chunk::{chunk_entries, StateChunk, TransactionInfo, TransferEntry};
use crate::transaction::TransactionTable;
use crate::types::{CacheName, NodeId, SegmentId};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Streams segments this node owns to nodes that gained them.
///
/// Each requested segment is pushed as a transaction snapshot followed by a
/// sequence of entry chunks; the stream for each `(destination, segment)`
/// pair can be cancelled if the destination retries against another owner.
#[derive(Debug)]
pub struct StateTransferProvider {
    node_id: NodeId,
    cache_name: CacheName,
    config: TransferConfig,
    container: Arc<DataContainer>,
    store: Arc<dyn SegmentStore>,
    txs: Arc<TransactionTable>,
    transport: Arc<dyn Transport>,
    outbound: DashMap<(NodeId, SegmentId), Arc<AtomicBool>>,
}

impl StateTransferProvider {
    pub fn new(
        node_id: NodeId,
        cache_name: CacheName,
        config: TransferConfig,
        container: Arc<DataContainer>,
        store: Arc<dyn SegmentStore>,
        txs: Arc<TransactionTable>,
        transport: Arc<dyn Transport>,
    ) -> Arc<Self> {
        Arc::new(Self {
            node_id,
            cache_name,
            config,
            container,
            store,
            txs,
            transport,
            outbound: DashMap::new(),
        })
    }

    /// Handle an incoming state request: start one push stream per segment
    /// and return immediately. The streams run on spawned tasks so the
    /// requesting node's RPC is not held open for the whole transfer.
    pub fn handle_state_request(
        self: &Arc<Self>,
        origin: NodeId,
        segments: Vec<SegmentId>,
        topology_id: u64,
    ) {
        info!(
            cache = %self.cache_name,
            origin,
            topology_id,
            segments = segments.len(),
            "starting outbound state transfer"
        );
        for segment in segments {
            let cancel = Arc::new(AtomicBool::new(false));
            // A newer request for the same pair supersedes the old stream.
            if let Some(old) = self.outbound.insert((origin, segment), cancel.clone()) {
                old.store(true, Ordering::Relaxed);
            }
            let provider = Arc::clone(self);
            tokio::spawn(async move {
                if let Err(err) = provider
                    .push_segment(origin, segment, topology_id, &cancel)
                    .await
                {
                    warn!(
                        cache = %provider.cache_name,
                        origin,
                        segment,
                        %err,
                        "outbound segment transfer failed"
                    );
                }
                provider.outbound.remove(&(origin, segment));
            });
        }
    }

    /// Cancel every in-flight stream towards a destination.
    pub fn cancel_transfers_to(&self, destination: NodeId) {
        for entry in self.outbound.iter() {
            if entry.key().0 == destination {
                entry.value().store(true, Ordering::Relaxed);
            }
        }
    }

    async fn push_segment(
        &self,
        destination: NodeId,
        segment: SegmentId,
        topology_id: u64,
        cancel: &AtomicBool,
    ) -> Result<()> {
        let transactions: Vec<TransactionInfo> = self
            .txs
            .transactions_touching(segment, self.container.num_segments())
            .into_iter()
            .map(|(gtx, state)| TransactionInfo { gtx, state })
            .collect();

        // Lock state must land before any entry does, so the new owner holds
        // the transaction's locks before it starts serving the segment.
        self.send_with_timeout(
            destination,
            TopologyCommand::PushTransactions {
                cache: self.cache_name.clone(),
                origin: self.node_id,
                topology_id,
                segment,
                transactions,
            },
        )
        .await?;

        let entries = self.collect_segment(segment).await?;
        let chunks = chunk_entries(segment, entries, self.config.chunk_size);
        debug!(
            cache = %self.cache_name,
            destination,
            segment,
            chunks = chunks.len(),
            "pushing segment chunks"
        );
        for chunk in chunks {
            if cancel.load(Ordering::Relaxed) {
                return Err(TransferError::Cancelled(segment).into());
            }
            self.send_chunk(destination, topology_id, chunk).await?;
        }
        Ok(())
    }

    async fn send_chunk(
        &self,
        destination: NodeId,
        topology_id: u64,
        chunk: StateChunk,
    ) -> Result<()> {
        self.send_with_timeout(
            destination,
            TopologyCommand::PushChunk {
                cache: self.cache_name.clone(),
                origin: self.node_id,
                topology_id,
                chunk,
            },
        )
        .await
        .map(|_| ())
    }

    async fn send_with_timeout(
        &self,
        destination: NodeId,
        cmd: TopologyCommand,
    ) -> Result<crate::rpc::TopologyResponse> {
        match tokio::time::timeout(
            self.config.chunk_timeout,
            self.transport.send(destination, cmd),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(crate::error::Error::Timeout),
        }
    }

    /// Snapshot a segment's entries from memory and the store. Bulk iteration
    /// runs off the async threads; in-memory entries win over stored ones for
    /// the same key.
    async fn collect_segment(&self, segment: SegmentId) -> Result<Vec<TransferEntry>> {
        let stored = self.store.load_segment_entries(segment).await?;
        let container = Arc::clone(&self.container);
        let in_memory = tokio::task::spawn_blocking(move || container.entries_in_segment(segment))
            .await
            .map_err(|e| crate::error::Error::Internal(format!("segment snapshot task: {e}")))?;

        let mut merged: HashMap<Vec<u8>, TransferEntry> = stored
            .into_iter()
            .map(|(key, entry)| {
                let te = TransferEntry::from_entry(key.clone(), &entry);
                (key, te)
            })
            .collect();
        for (key, entry) in in_memory {
            merged.insert(key.clone(), TransferEntry::from_entry(key, &entry));
        }
        Ok(merged.into_values().collect())
    }
}
