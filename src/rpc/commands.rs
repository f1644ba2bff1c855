//! The closed set of commands nodes exchange, and their dispatch.

use crate::error::{Error, Result, TopologyError};
use crate::partitioning::CacheTopology;
use crate::rpc::ComponentRegistry;
use crate::statetransfer::chunk::{StateChunk, TransactionInfo};
use crate::types::{CacheName, GlobalTransaction, NodeId, SegmentId};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Everything the coordinator needs to know about a joining node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinInfo {
    pub node: NodeId,
    pub capacity_factor: f32,
    pub protocol_version: u16,
    /// Survives restarts; distinguishes a rejoining node from a new one.
    pub persistent_uuid: Uuid,
    pub num_segments: u32,
    pub num_owners: usize,
}

/// Rebalancing policy operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PolicyAction {
    Query,
    Enable,
    Disable,
}

/// Commands exchanged between nodes. Topology control, state transfer, and
/// the data plane all travel through the same dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TopologyCommand {
    /// Node asks the coordinator to join a cache.
    JoinRequest { cache: CacheName, info: JoinInfo },
    /// Coordinator notifies existing members of an admitted joiner.
    /// Informational; the authoritative change arrives as a topology update.
    JoinBroadcast { cache: CacheName, info: JoinInfo },
    /// Coordinator tells everyone a node left.
    LeaveNotification { node: NodeId, view_id: u64 },
    /// Coordinator notifies remaining members of a departed node so they
    /// reroute transfers away from it. Informational and fire-and-forget.
    LeaveBroadcast { node: NodeId },
    /// New coordinator recovers cluster state after a view change.
    StatusRequest { view_id: u64 },
    /// Member confirms it finished receiving state for a topology.
    RebalancePhaseConfirm {
        cache: CacheName,
        origin: NodeId,
        topology_id: u64,
        failure: Option<String>,
        view_id: u64,
    },
    /// Query or flip the rebalancing enabled flag.
    RebalancePolicy { action: PolicyAction },
    /// Coordinator installs a topology on a member.
    TopologyUpdate {
        cache: CacheName,
        topology: CacheTopology,
        view_id: u64,
    },
    /// Coordinator marks a topology stable after all confirmations.
    StableTopologyUpdate {
        cache: CacheName,
        topology: CacheTopology,
        view_id: u64,
    },
    /// Gaining node asks a previous owner to stream segments.
    StateRequest {
        cache: CacheName,
        origin: NodeId,
        segments: Vec<SegmentId>,
        topology_id: u64,
    },
    /// Provider pushes the transaction snapshot for one segment.
    PushTransactions {
        cache: CacheName,
        origin: NodeId,
        topology_id: u64,
        segment: SegmentId,
        transactions: Vec<TransactionInfo>,
    },
    /// Provider pushes one entry chunk.
    PushChunk {
        cache: CacheName,
        origin: NodeId,
        topology_id: u64,
        chunk: StateChunk,
    },
    /// Data plane: write a key on an owner.
    Put {
        cache: CacheName,
        key: Vec<u8>,
        value: Bytes,
        topology_id: u64,
        /// Set on owner-to-owner replication; the receiver applies locally
        /// and must not forward again.
        forwarded: bool,
    },
    /// Data plane: read a key from an owner.
    Get {
        cache: CacheName,
        key: Vec<u8>,
        topology_id: u64,
    },
    /// Data plane: remove a key on an owner.
    Remove {
        cache: CacheName,
        key: Vec<u8>,
        topology_id: u64,
        forwarded: bool,
    },
    /// Apply and release a transaction on a node holding its locks.
    TxCommit {
        cache: CacheName,
        gtx: GlobalTransaction,
    },
    /// Release a transaction without applying it.
    TxRollback {
        cache: CacheName,
        gtx: GlobalTransaction,
    },
}

/// Per-cache slice of a node status response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheStatusSnapshot {
    pub cache: CacheName,
    pub join_info: JoinInfo,
    pub topology: Option<CacheTopology>,
}

/// A member's view of itself, sent to a recovering coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeStatusResponse {
    pub rebalancing_enabled: bool,
    pub caches: Vec<CacheStatusSnapshot>,
}

/// Responses paired with [`TopologyCommand`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TopologyResponse {
    Ack,
    Topology(CacheTopology),
    NodeStatus(NodeStatusResponse),
    PolicyStatus {
        rebalancing_enabled: bool,
        /// True while members speak differing protocol versions.
        mixed_cluster: bool,
        /// First member of the current view.
        oldest_member: Option<NodeId>,
    },
    Value(Option<Bytes>),
}

impl TopologyCommand {
    /// Short name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Self::JoinRequest { .. } => "join-request",
            Self::JoinBroadcast { .. } => "join-broadcast",
            Self::LeaveNotification { .. } => "leave-notification",
            Self::LeaveBroadcast { .. } => "leave-broadcast",
            Self::StatusRequest { .. } => "status-request",
            Self::RebalancePhaseConfirm { .. } => "rebalance-phase-confirm",
            Self::RebalancePolicy { .. } => "rebalance-policy",
            Self::TopologyUpdate { .. } => "topology-update",
            Self::StableTopologyUpdate { .. } => "stable-topology-update",
            Self::StateRequest { .. } => "state-request",
            Self::PushTransactions { .. } => "push-transactions",
            Self::PushChunk { .. } => "push-chunk",
            Self::Put { .. } => "put",
            Self::Get { .. } => "get",
            Self::Remove { .. } => "remove",
            Self::TxCommit { .. } => "tx-commit",
            Self::TxRollback { .. } => "tx-rollback",
        }
    }

    /// Execute this command against a node's components.
    pub async fn invoke(self, registry: &ComponentRegistry) -> Result<TopologyResponse> {
        match self {
            Self::JoinRequest { cache, info } => {
                let cluster = require_coordinator(registry)?;
                let topology = cluster.handle_join(cache, info).await?;
                Ok(TopologyResponse::Topology(topology))
            }
            Self::JoinBroadcast { cache, info } => {
                registry.local().note_member_joined(&cache, &info);
                Ok(TopologyResponse::Ack)
            }
            Self::LeaveNotification { node, view_id } => {
                let cluster = require_coordinator(registry)?;
                cluster.handle_leave(node, view_id).await?;
                Ok(TopologyResponse::Ack)
            }
            Self::LeaveBroadcast { node } => {
                registry.provider().cancel_transfers_to(node);
                registry.local().note_member_left(node).await;
                Ok(TopologyResponse::Ack)
            }
            Self::StatusRequest { view_id } => {
                let status = registry.local().node_status(view_id)?;
                Ok(TopologyResponse::NodeStatus(status))
            }
            Self::RebalancePhaseConfirm {
                cache,
                origin,
                topology_id,
                failure,
                view_id,
            } => {
                let cluster = require_coordinator(registry)?;
                cluster
                    .handle_phase_confirm(cache, origin, topology_id, failure, view_id)
                    .await?;
                Ok(TopologyResponse::Ack)
            }
            Self::RebalancePolicy { action } => {
                let cluster = require_coordinator(registry)?;
                let status = cluster.handle_policy(action).await?;
                registry
                    .local()
                    .note_rebalancing_enabled(status.rebalancing_enabled);
                Ok(TopologyResponse::PolicyStatus {
                    rebalancing_enabled: status.rebalancing_enabled,
                    mixed_cluster: status.mixed_cluster,
                    oldest_member: status.oldest_member,
                })
            }
            Self::TopologyUpdate {
                cache, topology, ..
            } => {
                registry.local().handle_topology_update(&cache, topology)?;
                Ok(TopologyResponse::Ack)
            }
            Self::StableTopologyUpdate {
                cache, topology, ..
            } => {
                registry.local().handle_stable_update(&cache, topology)?;
                Ok(TopologyResponse::Ack)
            }
            Self::StateRequest {
                origin,
                segments,
                topology_id,
                ..
            } => {
                registry
                    .provider()
                    .handle_state_request(origin, segments, topology_id);
                Ok(TopologyResponse::Ack)
            }
            Self::PushTransactions {
                topology_id,
                segment,
                transactions,
                ..
            } => {
                registry
                    .consumer()
                    .apply_transactions(topology_id, segment, transactions)
                    .await?;
                Ok(TopologyResponse::Ack)
            }
            Self::PushChunk {
                origin,
                topology_id,
                chunk,
                ..
            } => {
                registry.consumer().apply_chunk(origin, topology_id, chunk)?;
                Ok(TopologyResponse::Ack)
            }
            Self::Put {
                key,
                value,
                topology_id,
                forwarded,
                ..
            } => {
                registry
                    .local()
                    .handle_put(key, value, topology_id, forwarded)
                    .await?;
                Ok(TopologyResponse::Ack)
            }
            Self::Get {
                key, topology_id, ..
            } => {
                let value = registry.local().handle_get(&key, topology_id)?;
                Ok(TopologyResponse::Value(value))
            }
            Self::Remove {
                key,
                topology_id,
                forwarded,
                ..
            } => {
                registry
                    .local()
                    .handle_remove(key, topology_id, forwarded)
                    .await?;
                Ok(TopologyResponse::Ack)
            }
            Self::TxCommit { gtx, .. } => {
                registry.local().handle_tx_commit(gtx).await?;
                Ok(TopologyResponse::Ack)
            }
            Self::TxRollback { gtx, .. } => {
                registry.local().handle_tx_rollback(gtx).await?;
                Ok(TopologyResponse::Ack)
            }
        }
    }
}

fn require_coordinator(
    registry: &ComponentRegistry,
) -> Result<std::sync::Arc<crate::topology::ClusterTopologyManager>> {
    registry
        .cluster()
        .ok_or(Error::Topology(TopologyError::NotCoordinator))
}

/// Encode a command for the wire.
pub fn encode_command(cmd: &TopologyCommand) -> Result<Vec<u8>> {
    bincode::serialize(cmd).map_err(|e| Error::Serialization(e.to_string()))
}

/// Decode a command received from the wire.
pub fn decode_command(bytes: &[u8]) -> Result<TopologyCommand> {
    bincode::deserialize(bytes).map_err(|e| Error::Serialization(e.to_string()))
}

/// Encode a response for the wire.
pub fn encode_response(resp: &TopologyResponse) -> Result<Vec<u8>> {
    bincode::serialize(resp).map_err(|e| Error::Serialization(e.to_string()))
}

/// Decode a response received from the wire.
pub fn decode_response(bytes: &[u8]) -> Result<TopologyResponse> {
    bincode::deserialize(bytes).map_err(|e| Error::Serialization(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PROTOCOL_VERSION;

    #[test]
    fn test_command_roundtrip() {
        let cmd = TopologyCommand::JoinRequest {
            cache: "users".into(),
            info: JoinInfo {
                node: 3,
                capacity_factor: 1.5,
                protocol_version: PROTOCOL_VERSION,
                persistent_uuid: Uuid::new_v4(),
                num_segments: 256,
                num_owners: 2,
            },
        };
        let bytes = encode_command(&cmd).unwrap();
        match decode_command(&bytes).unwrap() {
            TopologyCommand::JoinRequest { cache, info } => {
                assert_eq!(cache, "users");
                assert_eq!(info.node, 3);
                assert_eq!(info.num_segments, 256);
            }
            other => panic!("decoded wrong variant: {}", other.name()),
        }
    }

    #[test]
    fn test_response_roundtrip() {
        let resp = TopologyResponse::Value(Some(Bytes::from_static(b"v")));
        let bytes = encode_response(&resp).unwrap();
        match decode_response(&bytes).unwrap() {
            TopologyResponse::Value(Some(v)) => assert_eq!(&v[..], b"v"),
            _ => panic!("decoded wrong variant"),
        }
    }

    #[test]
    fn test_decode_garbage_fails() {
        assert!(decode_command(&[0xff; 3]).is_err());
    }
}
