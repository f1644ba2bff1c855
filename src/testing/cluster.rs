//! In-process cluster fixture for integration tests.

use crate::config::{GridConfig, RebalanceConfig, TransferConfig};
use crate::container::{DataContainer, InMemoryLockManager, LockManager, NoStore, SegmentStore};
use crate::rpc::{ComponentRegistry, TopologyCommand, TopologyResponse, Transport, TransportHub};
use crate::statetransfer::{StateTransferConsumer, StateTransferProvider};
use crate::topology::{ClusterTopologyManager, LocalTopologyManager};
use crate::transaction::TransactionTable;
use crate::types::NodeId;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// One grid node wired through the shared hub, with handles onto its
/// internals for assertions.
pub struct TestNode {
    pub config: GridConfig,
    pub local: Arc<LocalTopologyManager>,
    pub container: Arc<DataContainer>,
    pub locks: Arc<InMemoryLockManager>,
    pub txs: Arc<TransactionTable>,
    pub registry: Arc<ComponentRegistry>,
    pub cluster: Option<Arc<ClusterTopologyManager>>,
}

/// A cluster of in-process nodes. The first node started becomes the
/// coordinator; `promote` moves the role later.
pub struct TestGrid {
    pub hub: Arc<TransportHub>,
    nodes: HashMap<NodeId, TestNode>,
    template: GridConfig,
}

impl TestGrid {
    /// Build an empty grid. Timeouts are shortened so failure paths run in
    /// test time rather than production time.
    pub fn new(num_segments: u32, num_owners: usize) -> Self {
        let template = GridConfig::new(0)
            .with_cache_name("grid-test")
            .with_num_segments(num_segments)
            .with_num_owners(num_owners)
            .with_rebalance_config(RebalanceConfig {
                enabled: true,
                confirm_timeout: Duration::from_secs(2),
                status_timeout: Duration::from_secs(1),
            })
            .with_transfer_config(TransferConfig {
                chunk_size: 16,
                chunk_timeout: Duration::from_secs(2),
                max_retries: 3,
                completion_timeout: Duration::from_secs(5),
            });
        Self {
            hub: TransportHub::new(),
            nodes: HashMap::new(),
            template,
        }
    }

    /// Start a node and join it to the cache. The first node also takes the
    /// coordinator role.
    pub async fn start_node(&mut self, node_id: NodeId) -> &TestNode {
        let config = GridConfig {
            node_id,
            ..self.template.clone()
        };
        config.validate().unwrap();

        let transport: Arc<dyn Transport> = self.hub.transport_for(node_id);
        let container = Arc::new(DataContainer::new(config.num_segments));
        let locks = Arc::new(InMemoryLockManager::new());
        let locks_dyn: Arc<dyn LockManager> = locks.clone();
        let store: Arc<dyn SegmentStore> = Arc::new(NoStore);
        let txs = Arc::new(TransactionTable::new(node_id));

        let provider = StateTransferProvider::new(
            node_id,
            config.cache_name.clone(),
            config.transfer.clone(),
            container.clone(),
            store,
            txs.clone(),
            transport.clone(),
        );
        let consumer = StateTransferConsumer::new(
            node_id,
            config.cache_name.clone(),
            config.transfer.clone(),
            container.clone(),
            locks_dyn.clone(),
            txs.clone(),
            transport.clone(),
        );
        let local = LocalTopologyManager::new(
            config.clone(),
            transport.clone(),
            container.clone(),
            locks_dyn,
            txs.clone(),
            consumer.clone(),
        );
        let registry = ComponentRegistry::new(local.clone(), provider, consumer);
        self.hub.register(node_id, registry.clone());

        let mut node = TestNode {
            config: config.clone(),
            local,
            container,
            locks,
            txs,
            registry,
            cluster: None,
        };

        if self.nodes.is_empty() {
            self.hub.set_coordinator(node_id);
            let cluster = ClusterTopologyManager::new(
                node_id,
                config.min_protocol_version,
                config.rebalance.clone(),
                self.hub.transport_for(node_id),
            );
            node.registry.set_cluster(cluster.clone());
            node.cluster = Some(cluster);
        } else {
            self.hub.advance_view();
        }

        node.local.join().await.expect("join failed");
        self.nodes.insert(node_id, node);
        &self.nodes[&node_id]
    }

    pub fn node(&self, node_id: NodeId) -> &TestNode {
        &self.nodes[&node_id]
    }

    pub fn coordinator_node(&self) -> &TestNode {
        self.node(self.hub.coordinator())
    }

    pub fn live_nodes(&self) -> Vec<NodeId> {
        self.hub.members()
    }

    /// Crash a node and deliver the leave event to the coordinator, the way
    /// a membership layer would.
    pub async fn crash(&mut self, node_id: NodeId) {
        self.hub.crash(node_id);
        let view_id = self.hub.advance_view();
        let coordinator = self.coordinator_node();
        let cluster = coordinator
            .cluster
            .clone()
            .expect("coordinator has no cluster manager");
        cluster.handle_leave(node_id, view_id).await.unwrap();
    }

    /// Move the coordinator role to another live node and run its recovery.
    pub async fn promote(&mut self, node_id: NodeId) {
        let old = self.hub.coordinator();
        if let Some(node) = self.nodes.get_mut(&old) {
            node.registry.clear_cluster();
            node.cluster = None;
        }
        self.hub.set_coordinator(node_id);
        self.hub.advance_view();

        let config = &self.nodes[&node_id].config;
        let cluster = ClusterTopologyManager::new(
            node_id,
            config.min_protocol_version,
            config.rebalance.clone(),
            self.hub.transport_for(node_id),
        );
        let node = self.nodes.get_mut(&node_id).unwrap();
        node.registry.set_cluster(cluster.clone());
        node.cluster = Some(cluster.clone());
        cluster.become_coordinator().await.unwrap();
    }

    /// Send one command from a node, bypassing the routing layer.
    pub async fn send_from(
        &self,
        from: NodeId,
        to: NodeId,
        cmd: TopologyCommand,
    ) -> crate::error::Result<TopologyResponse> {
        let transport: Arc<dyn Transport> = self.hub.transport_for(from);
        transport.send(to, cmd).await
    }

    /// Wait until every live node has installed a stable topology whose
    /// members are exactly `expected`.
    pub async fn wait_for_stable_topology(&self, expected: &[NodeId]) {
        let mut expected = expected.to_vec();
        expected.sort_unstable();
        let settled = wait_for(Duration::from_secs(10), || {
            self.live_nodes().iter().all(|n| {
                match self.node(*n).local.current_topology() {
                    Some(t) => !t.is_rebalancing() && t.actual_members() == expected.as_slice(),
                    None => false,
                }
            })
        })
        .await;
        assert!(
            settled,
            "cluster did not settle on a stable topology for {expected:?}"
        );
    }
}

/// Poll a condition until it holds or the timeout elapses.
pub async fn wait_for<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let start = Instant::now();
    while start.elapsed() < timeout {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    condition()
}
