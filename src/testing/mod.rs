//! Testing utilities for the data grid.
//!
//! The [`cluster`] module provides an in-process multi-node fixture built on
//! [`crate::rpc::TransportHub`]: nodes exchange real encoded commands, can be
//! crashed, and the coordinator role can be moved between them. The sibling
//! test modules cover the rebalance and topology scenarios end to end.

pub mod cluster;

#[cfg(test)]
mod rebalance_integration_tests;
#[cfg(test)]
mod topology_integration_tests;
