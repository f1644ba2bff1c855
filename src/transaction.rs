//! In-flight transaction bookkeeping.
//!
//! Transactions that touch a segment travel with that segment during a
//! rebalance: the provider snapshots them before streaming entries, and the
//! consumer registers them as remote transactions so locks survive the
//! ownership change.

use crate::types::{segment_of, GlobalTransaction, NodeId, SegmentId, WriteOp};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// State of one in-flight transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxState {
    /// Topology under which the transaction started.
    pub topology_id: u64,
    /// Writes staged but not yet applied.
    pub modifications: Vec<WriteOp>,
    /// Keys the transaction holds locks on.
    pub locked_keys: Vec<Vec<u8>>,
}

/// Table of transactions this node knows about, local and remote.
#[derive(Debug)]
pub struct TransactionTable {
    node_id: NodeId,
    next_id: AtomicU64,
    txs: DashMap<GlobalTransaction, TxState>,
}

impl TransactionTable {
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            next_id: AtomicU64::new(1),
            txs: DashMap::new(),
        }
    }

    /// Start a local transaction under the given topology.
    pub fn begin(&self, topology_id: u64) -> GlobalTransaction {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let gtx = GlobalTransaction::new(self.node_id, id);
        self.txs.insert(
            gtx,
            TxState {
                topology_id,
                modifications: Vec::new(),
                locked_keys: Vec::new(),
            },
        );
        gtx
    }

    /// Register a transaction received from another node.
    ///
    /// Idempotent: a transaction already present keeps its existing state, so
    /// replaying the same transfer cannot erase staged modifications.
    pub fn register_remote(&self, gtx: GlobalTransaction, state: TxState) {
        self.txs.entry(gtx.as_remote()).or_insert(state);
    }

    /// Stage a write inside a transaction.
    pub fn add_modification(&self, gtx: &GlobalTransaction, op: WriteOp) {
        if let Some(mut state) = self.txs.get_mut(gtx) {
            state.modifications.push(op);
        }
    }

    /// Record a key the transaction locked.
    pub fn add_locked_key(&self, gtx: &GlobalTransaction, key: Vec<u8>) {
        if let Some(mut state) = self.txs.get_mut(gtx) {
            if !state.locked_keys.contains(&key) {
                state.locked_keys.push(key);
            }
        }
    }

    /// Look up a transaction's state.
    pub fn get(&self, gtx: &GlobalTransaction) -> Option<TxState> {
        self.txs.get(gtx).map(|s| s.clone())
    }

    /// Remove a finished transaction, returning its final state.
    pub fn complete(&self, gtx: &GlobalTransaction) -> Option<TxState> {
        self.txs.remove(gtx).map(|(_, s)| s)
    }

    /// Transactions whose write set or lock set touches the given segment.
    pub fn transactions_touching(
        &self,
        segment: SegmentId,
        num_segments: u32,
    ) -> Vec<(GlobalTransaction, TxState)> {
        self.txs
            .iter()
            .filter(|e| {
                e.value()
                    .modifications
                    .iter()
                    .any(|op| segment_of(op.key(), num_segments) == segment)
                    || e.value()
                        .locked_keys
                        .iter()
                        .any(|k| segment_of(k, num_segments) == segment)
            })
            .map(|e| (*e.key(), e.value().clone()))
            .collect()
    }

    /// Number of in-flight transactions.
    pub fn len(&self) -> usize {
        self.txs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.txs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_begin_assigns_unique_ids() {
        let table = TransactionTable::new(7);
        let a = table.begin(1);
        let b = table.begin(1);
        assert_ne!(a, b);
        assert_eq!(a.origin, 7);
        assert!(!a.remote);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_modifications_and_locks_accumulate() {
        let table = TransactionTable::new(1);
        let gtx = table.begin(3);
        table.add_modification(&gtx, WriteOp::put(b"a".to_vec(), b"1".to_vec()));
        table.add_modification(&gtx, WriteOp::remove(b"b".to_vec()));
        table.add_locked_key(&gtx, b"a".to_vec());
        table.add_locked_key(&gtx, b"a".to_vec());

        let state = table.get(&gtx).unwrap();
        assert_eq!(state.topology_id, 3);
        assert_eq!(state.modifications.len(), 2);
        assert_eq!(state.locked_keys, vec![b"a".to_vec()]);
    }

    #[test]
    fn test_register_remote_is_idempotent() {
        let table = TransactionTable::new(2);
        let gtx = GlobalTransaction::new(1, 9);
        table.register_remote(
            gtx,
            TxState {
                topology_id: 5,
                modifications: vec![WriteOp::put(b"k".to_vec(), b"v".to_vec())],
                locked_keys: vec![b"k".to_vec()],
            },
        );
        // A replayed transfer must not clobber the registered state.
        table.register_remote(
            gtx,
            TxState {
                topology_id: 5,
                modifications: Vec::new(),
                locked_keys: Vec::new(),
            },
        );
        let state = table.get(&gtx.as_remote()).unwrap();
        assert_eq!(state.modifications.len(), 1);
    }

    #[test]
    fn test_transactions_touching_filters_by_segment() {
        let table = TransactionTable::new(1);
        let gtx = table.begin(1);
        let key = b"some-key".to_vec();
        let seg = segment_of(&key, 8);
        table.add_modification(&gtx, WriteOp::put(key, b"v".to_vec()));

        let hits = table.transactions_touching(seg, 8);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0, gtx);

        let other = (seg + 1) % 8;
        assert!(table.transactions_touching(other, 8).is_empty());
    }

    #[test]
    fn test_complete_removes() {
        let table = TransactionTable::new(1);
        let gtx = table.begin(1);
        assert!(table.complete(&gtx).is_some());
        assert!(table.get(&gtx).is_none());
        assert!(table.complete(&gtx).is_none());
    }
}
