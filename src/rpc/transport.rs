//! Transport seam between nodes.
//!
//! Production deployments put a real network behind [`Transport`]; tests use
//! [`TransportHub`], which routes commands between in-process nodes through
//! the same encode/decode path a socket would take and can simulate crashes
//! and view changes.

use crate::error::{Error, Result};
use crate::rpc::commands::{decode_command, encode_command, TopologyCommand, TopologyResponse};
use crate::rpc::ComponentRegistry;
use crate::types::NodeId;
use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::trace;

/// How a node reaches the rest of the cluster.
///
/// Membership and view identity come from the same layer as message
/// delivery: a view change and the reachability it implies move together.
#[async_trait]
pub trait Transport: Send + Sync + std::fmt::Debug {
    /// This node's identity.
    fn local_node(&self) -> NodeId;

    /// Monotonic identifier of the current membership view.
    fn view_id(&self) -> u64;

    /// Members of the current view, sorted.
    fn members(&self) -> Vec<NodeId>;

    /// Current coordinator.
    fn coordinator(&self) -> NodeId;

    /// Send a command and wait for the target's response.
    async fn send(&self, target: NodeId, cmd: TopologyCommand) -> Result<TopologyResponse>;
}

/// In-process message router for tests.
#[derive(Debug, Default)]
pub struct TransportHub {
    handlers: DashMap<NodeId, Arc<ComponentRegistry>>,
    view_id: AtomicU64,
    coordinator: AtomicU64,
    crashed: DashSet<NodeId>,
}

impl TransportHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            view_id: AtomicU64::new(1),
            ..Self::default()
        })
    }

    /// Attach a node's dispatch registry to the hub.
    pub fn register(&self, node: NodeId, registry: Arc<ComponentRegistry>) {
        self.handlers.insert(node, registry);
    }

    /// Build the transport handle a node uses to talk through this hub.
    pub fn transport_for(self: &Arc<Self>, node: NodeId) -> Arc<InMemoryTransport> {
        Arc::new(InMemoryTransport {
            node,
            hub: Arc::clone(self),
        })
    }

    pub fn registry(&self, node: NodeId) -> Option<Arc<ComponentRegistry>> {
        self.handlers.get(&node).map(|r| r.clone())
    }

    /// Mark a node unreachable; commands sent to it time out.
    pub fn crash(&self, node: NodeId) {
        self.crashed.insert(node);
    }

    pub fn set_coordinator(&self, node: NodeId) {
        self.coordinator.store(node, Ordering::SeqCst);
    }

    /// Install a new membership view and return its id.
    pub fn advance_view(&self) -> u64 {
        self.view_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn view_id(&self) -> u64 {
        self.view_id.load(Ordering::SeqCst)
    }

    pub fn coordinator(&self) -> NodeId {
        self.coordinator.load(Ordering::SeqCst)
    }

    /// Live members, sorted.
    pub fn members(&self) -> Vec<NodeId> {
        let mut members: Vec<NodeId> = self
            .handlers
            .iter()
            .map(|e| *e.key())
            .filter(|n| !self.crashed.contains(n))
            .collect();
        members.sort_unstable();
        members
    }

    async fn deliver(
        &self,
        from: NodeId,
        target: NodeId,
        cmd: TopologyCommand,
    ) -> Result<TopologyResponse> {
        if self.crashed.contains(&target) || self.crashed.contains(&from) {
            return Err(Error::Timeout);
        }
        let registry = self.registry(target).ok_or(Error::Timeout)?;
        trace!(from, target, cmd = cmd.name(), "delivering command");
        // Same serialization path a socket transport would use, so commands
        // that do not survive the wire fail in tests too.
        let cmd = decode_command(&encode_command(&cmd)?)?;
        cmd.invoke(&registry).await
    }
}

/// A node's handle onto a [`TransportHub`].
#[derive(Debug)]
pub struct InMemoryTransport {
    node: NodeId,
    hub: Arc<TransportHub>,
}

#[async_trait]
impl Transport for InMemoryTransport {
    fn local_node(&self) -> NodeId {
        self.node
    }

    fn view_id(&self) -> u64 {
        self.hub.view_id()
    }

    fn members(&self) -> Vec<NodeId> {
        self.hub.members()
    }

    fn coordinator(&self) -> NodeId {
        self.hub.coordinator()
    }

    async fn send(&self, target: NodeId, cmd: TopologyCommand) -> Result<TopologyResponse> {
        self.hub.deliver(self.node, target, cmd).await
    }
}
