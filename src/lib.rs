//! Partitioned in-memory data grid with coordinated rebalancing.
//!
//! This crate implements the clustering core of a segment-partitioned cache:
//! - **Consistent hashing** over a fixed number of segments, with weighted
//!   owner assignment and minimal data movement on membership changes
//! - **Cluster topology management** on a single coordinator driving joins,
//!   leaves, and rebalances per cache
//! - **State transfer** that streams segments between nodes in bounded
//!   chunks, carrying in-flight transactions ahead of the data
//! - **Segment-routed data plane** where every command is tagged with the
//!   topology it was routed under and stale commands bounce for retry
//!
//! # Example
//!
//! ```rust,ignore
//! use segrid::{GridConfig, LocalTopologyManager};
//!
//! let config = GridConfig::new(1)
//!     .with_cache_name("users")
//!     .with_num_segments(256)
//!     .with_num_owners(2);
//! config.validate()?;
//! // Wire a transport, container, and transfer components, then:
//! // local.join().await?;
//! // local.put(b"user:123", "Alice".into()).await?;
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │               Coordinator node                 │
//! │  ClusterTopologyManager                        │
//! │  • per-cache membership + topology ids         │
//! │  • rebalance state machine + confirmations     │
//! └───────────────────────────────────────────────┘
//!                 │ TopologyUpdate / StableTopologyUpdate
//!                 ▼
//! ┌───────────────────────────────────────────────┐
//! │                 Every node                     │
//! │  LocalTopologyManager ── DataContainer         │
//! │        │                                       │
//! │  StateTransferConsumer ◄── StateTransferProvider
//! │        (gained segments)     (owned segments)  │
//! └───────────────────────────────────────────────┘
//! ```
//!
//! # Consistency model
//!
//! During a rebalance a topology carries two hashes: reads go to owners
//! under the committed hash, writes reach the union of committed and
//! pending owners. Topology ids are strictly monotonic and every command is
//! checked against the receiver's installed topology, so a stale sender is
//! told to retry rather than silently writing to the wrong owner.

pub mod config;
pub mod container;
pub mod error;
pub mod partitioning;
pub mod rpc;
pub mod statetransfer;
pub mod testing;
pub mod topology;
pub mod transaction;
pub mod types;

pub use config::{GridConfig, RebalanceConfig, TransferConfig};
pub use container::{DataContainer, InMemoryLockManager, LockManager, NoStore, SegmentStore};
pub use error::{Error, MembershipError, Result, TopologyError, TransferError};
pub use partitioning::{CacheTopology, ConsistentHash, ConsistentHashFactory, Member};
pub use rpc::{
    ComponentRegistry, InMemoryTransport, JoinInfo, PolicyAction, TopologyCommand,
    TopologyResponse, Transport, TransportHub,
};
pub use statetransfer::{StateChunk, StateTransferConsumer, StateTransferProvider, TransferEntry};
pub use topology::{CacheStatus, ClusterTopologyManager, LocalTopologyManager};
pub use transaction::{TransactionTable, TxState};
pub use types::{
    segment_of, CacheEntry, CacheName, GlobalTransaction, NodeId, SegmentId, WriteOp,
    PROTOCOL_VERSION,
};
