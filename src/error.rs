//! Error types for the data grid.

use crate::types::{NodeId, SegmentId};
use thiserror::Error;

/// Result type alias for data grid operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the data grid.
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// Topology coordination errors.
    #[error("topology error: {0}")]
    Topology(#[from] TopologyError),

    /// State transfer errors.
    #[error("transfer error: {0}")]
    Transfer(#[from] TransferError),

    /// Cluster membership errors.
    #[error("membership error: {0}")]
    Membership(#[from] MembershipError),

    /// Configuration errors.
    #[error("config error: {0}")]
    Config(String),

    /// The operation timed out.
    #[error("operation timed out")]
    Timeout,

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Generic internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Shorthand for the outdated-topology condition.
    pub fn outdated(command_topology_id: u64, current_topology_id: u64) -> Self {
        Error::Topology(TopologyError::Outdated {
            command_topology_id,
            current_topology_id,
        })
    }

    /// Shorthand for the data-loss condition.
    pub fn data_loss(segment: SegmentId) -> Self {
        Error::Transfer(TransferError::DataLoss { segment })
    }

    /// Whether a caller may retry this error against a fresh topology.
    ///
    /// Outdated-topology and timeout are the two recoverable conditions;
    /// everything else is escalated.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Timeout | Error::Topology(TopologyError::Outdated { .. })
        )
    }

    /// Whether this is the hard data-loss condition.
    pub fn is_data_loss(&self) -> bool {
        matches!(self, Error::Transfer(TransferError::DataLoss { .. }))
    }
}

/// Topology coordination errors.
#[derive(Error, Debug, Clone)]
pub enum TopologyError {
    /// A command was issued against a topology id older than the receiver's.
    /// Always recoverable: the caller retries against the id carried here.
    #[error("outdated topology: command has id {command_topology_id}, receiver at {current_topology_id}")]
    Outdated {
        command_topology_id: u64,
        current_topology_id: u64,
    },

    /// No topology has been installed for the cache yet.
    #[error("no topology installed for cache {0}")]
    NotInitialized(String),

    /// A coordinator-only command reached a node that is not the coordinator.
    #[error("not the coordinator")]
    NotCoordinator,
}

/// State transfer errors.
#[derive(Error, Debug, Clone)]
pub enum TransferError {
    /// All owners of a segment were lost before transfer completed.
    /// Hard, non-retryable: the segment's data is gone.
    #[error("data loss: no remaining owner for segment {segment}")]
    DataLoss { segment: SegmentId },

    /// The provider for a segment failed mid-transfer.
    #[error("provider {node} failed for segment {segment}: {reason}")]
    ProviderFailed {
        node: NodeId,
        segment: SegmentId,
        reason: String,
    },

    /// A chunk arrived for a segment this node never requested.
    #[error("chunk received for unrequested segment {0}")]
    UnexpectedSegment(SegmentId),

    /// An inbound transfer was cancelled by a newer topology.
    #[error("transfer cancelled for segment {0}")]
    Cancelled(SegmentId),
}

/// Cluster membership errors.
#[derive(Error, Debug, Clone)]
pub enum MembershipError {
    /// A joining node's protocol version is below the cluster minimum.
    #[error("protocol version {joiner} below cluster minimum {required}")]
    VersionMismatch { joiner: u16, required: u16 },

    /// A notification referenced an older cluster view than currently known.
    #[error("stale view id {received}, current view is {current}")]
    StaleView { received: u64, current: u64 },
}
