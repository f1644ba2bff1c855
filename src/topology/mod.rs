//! Cluster-wide and node-local topology management.
//!
//! The [`cluster`] module runs on the coordinator only: it owns the
//! authoritative per-cache membership and drives rebalances. Every node runs
//! the [`local`] module, which installs topologies pushed by the coordinator
//! and routes data-plane commands by segment ownership.

pub mod cache_status;
pub mod cluster;
pub mod local;

pub use cache_status::{CacheStatus, ConfirmOutcome, MemberInfo, RebalanceState};
pub use cluster::{ClusterTopologyManager, PolicySnapshot};
pub use local::LocalTopologyManager;
