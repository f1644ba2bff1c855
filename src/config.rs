//! Configuration types for the data grid.

use crate::error::{Error, Result};
use crate::types::{CacheName, NodeId, PROTOCOL_VERSION};
use std::time::Duration;

/// Main configuration for a grid node.
#[derive(Debug, Clone)]
pub struct GridConfig {
    /// Unique identifier for this node.
    pub node_id: NodeId,

    /// Name of the cache this node hosts.
    pub cache_name: CacheName,

    /// Number of segments the keyspace is partitioned into.
    /// Fixed for the lifetime of a cache.
    pub num_segments: u32,

    /// Owners per segment (primary + backups). 1 means no replication.
    pub num_owners: usize,

    /// Relative share of segments this node should hold.
    pub capacity_factor: f32,

    /// Protocol version advertised on join.
    pub protocol_version: u16,

    /// Lowest protocol version the coordinator admits.
    pub min_protocol_version: u16,

    /// Rebalance policy configuration.
    pub rebalance: RebalanceConfig,

    /// State transfer configuration.
    pub transfer: TransferConfig,
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            node_id: 1,
            cache_name: "default".to_string(),
            num_segments: 256,
            num_owners: 2,
            capacity_factor: 1.0,
            protocol_version: PROTOCOL_VERSION,
            min_protocol_version: PROTOCOL_VERSION - 1,
            rebalance: RebalanceConfig::default(),
            transfer: TransferConfig::default(),
        }
    }
}

impl GridConfig {
    /// Create a configuration for the given node.
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            ..Default::default()
        }
    }

    /// Set the cache name.
    pub fn with_cache_name(mut self, name: impl Into<CacheName>) -> Self {
        self.cache_name = name.into();
        self
    }

    /// Set the segment count.
    pub fn with_num_segments(mut self, num_segments: u32) -> Self {
        self.num_segments = num_segments;
        self
    }

    /// Set owners per segment.
    pub fn with_num_owners(mut self, num_owners: usize) -> Self {
        self.num_owners = num_owners;
        self
    }

    /// Set this node's capacity factor.
    pub fn with_capacity_factor(mut self, factor: f32) -> Self {
        self.capacity_factor = factor;
        self
    }

    /// Set the rebalance configuration.
    pub fn with_rebalance_config(mut self, rebalance: RebalanceConfig) -> Self {
        self.rebalance = rebalance;
        self
    }

    /// Set the state transfer configuration.
    pub fn with_transfer_config(mut self, transfer: TransferConfig) -> Self {
        self.transfer = transfer;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.num_segments == 0 {
            return Err(Error::Config("num_segments must be positive".into()));
        }
        if self.num_owners == 0 {
            return Err(Error::Config("num_owners must be positive".into()));
        }
        if self.capacity_factor < 0.0 {
            return Err(Error::Config("capacity_factor must be non-negative".into()));
        }
        if self.cache_name.is_empty() {
            return Err(Error::Config("cache_name must not be empty".into()));
        }
        if self.transfer.chunk_size == 0 {
            return Err(Error::Config("transfer.chunk_size must be positive".into()));
        }
        Ok(())
    }
}

/// Rebalance policy configuration.
#[derive(Debug, Clone)]
pub struct RebalanceConfig {
    /// Whether rebalancing starts automatically on membership changes.
    pub enabled: bool,

    /// How long the coordinator waits for phase confirmations before
    /// treating silent members as failed.
    pub confirm_timeout: Duration,

    /// Timeout for status requests during coordinator handover.
    pub status_timeout: Duration,
}

impl Default for RebalanceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            confirm_timeout: Duration::from_secs(60),
            status_timeout: Duration::from_secs(10),
        }
    }
}

/// State transfer configuration.
#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// Maximum entries per state chunk. Segments are always streamed as a
    /// sequence of bounded chunks, never as one unbounded message.
    pub chunk_size: usize,

    /// Timeout for pushing a single chunk.
    pub chunk_timeout: Duration,

    /// How many alternative providers to try for a segment before giving up.
    pub max_retries: usize,

    /// Overall deadline for an inbound transfer phase.
    pub completion_timeout: Duration,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: 512,
            chunk_timeout: Duration::from_secs(30),
            max_retries: 3,
            completion_timeout: Duration::from_secs(120),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(GridConfig::default().validate().is_ok());
    }

    #[test]
    fn test_builder_chain() {
        let config = GridConfig::new(7)
            .with_cache_name("users")
            .with_num_segments(64)
            .with_num_owners(3)
            .with_capacity_factor(2.0);

        assert_eq!(config.node_id, 7);
        assert_eq!(config.cache_name, "users");
        assert_eq!(config.num_segments, 64);
        assert_eq!(config.num_owners, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_configs_rejected() {
        assert!(GridConfig::new(1).with_num_segments(0).validate().is_err());
        assert!(GridConfig::new(1).with_num_owners(0).validate().is_err());
        assert!(GridConfig::new(1)
            .with_capacity_factor(-1.0)
            .validate()
            .is_err());
        assert!(GridConfig::new(1).with_cache_name("").validate().is_err());
    }
}
