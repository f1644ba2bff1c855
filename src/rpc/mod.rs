//! Command types, dispatch, and transport seams.

pub mod commands;
pub mod retry;
pub mod transport;

pub use commands::{
    decode_command, decode_response, encode_command, encode_response, CacheStatusSnapshot,
    JoinInfo, NodeStatusResponse, PolicyAction, TopologyCommand, TopologyResponse,
};
pub use retry::{retry, RetryPolicy};
pub use transport::{InMemoryTransport, Transport, TransportHub};

use crate::statetransfer::{StateTransferConsumer, StateTransferProvider};
use crate::topology::{ClusterTopologyManager, LocalTopologyManager};
use parking_lot::RwLock;
use std::sync::Arc;

/// Per-node wiring the command dispatcher resolves targets against.
///
/// The cluster manager slot is populated only while this node is the
/// coordinator; coordinator-only commands received elsewhere fail with
/// a not-coordinator error and the sender retries against the real one.
#[derive(Debug)]
pub struct ComponentRegistry {
    local: Arc<LocalTopologyManager>,
    provider: Arc<StateTransferProvider>,
    consumer: Arc<StateTransferConsumer>,
    cluster: RwLock<Option<Arc<ClusterTopologyManager>>>,
}

impl ComponentRegistry {
    pub fn new(
        local: Arc<LocalTopologyManager>,
        provider: Arc<StateTransferProvider>,
        consumer: Arc<StateTransferConsumer>,
    ) -> Arc<Self> {
        Arc::new(Self {
            local,
            provider,
            consumer,
            cluster: RwLock::new(None),
        })
    }

    pub fn local(&self) -> &Arc<LocalTopologyManager> {
        &self.local
    }

    pub fn provider(&self) -> &Arc<StateTransferProvider> {
        &self.provider
    }

    pub fn consumer(&self) -> &Arc<StateTransferConsumer> {
        &self.consumer
    }

    pub fn cluster(&self) -> Option<Arc<ClusterTopologyManager>> {
        self.cluster.read().clone()
    }

    /// Install the coordinator role on this node.
    pub fn set_cluster(&self, cluster: Arc<ClusterTopologyManager>) {
        *self.cluster.write() = Some(cluster);
    }

    /// Drop the coordinator role.
    pub fn clear_cluster(&self) {
        *self.cluster.write() = None;
    }
}
