//! Segment state transfer between nodes.
//!
//! When a rebalance starts, nodes that gained segments pull them from nodes
//! that owned them under the previous topology. The [`provider`] streams a
//! segment out as a transaction snapshot followed by bounded entry chunks;
//! the [`consumer`] applies them idempotently and confirms the phase once
//! every requested segment has seen its last chunk.

pub mod chunk;
pub mod consumer;
pub mod provider;

pub use chunk::{chunk_entries, StateChunk, TransactionInfo, TransferEntry};
pub use consumer::StateTransferConsumer;
pub use provider::StateTransferProvider;
