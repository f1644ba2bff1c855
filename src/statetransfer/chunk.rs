//! Wire units of a segment transfer.

use crate::transaction::TxState;
use crate::types::{CacheEntry, GlobalTransaction, SegmentId};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// One entry as it travels inside a chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferEntry {
    pub key: Vec<u8>,
    pub value: Bytes,
    pub version: u64,
}

impl TransferEntry {
    pub fn from_entry(key: Vec<u8>, entry: &CacheEntry) -> Self {
        Self {
            key,
            value: entry.value.clone(),
            version: entry.version,
        }
    }

    pub fn into_entry(self) -> (Vec<u8>, CacheEntry) {
        (self.key, CacheEntry::new(self.value, self.version))
    }
}

/// A bounded batch of entries for one segment.
///
/// Every segment transfer ends with exactly one chunk carrying
/// `is_last_chunk`; an empty segment still produces that final chunk so the
/// receiver can tell completion from silence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateChunk {
    pub segment: SegmentId,
    pub is_last_chunk: bool,
    pub entries: Vec<TransferEntry>,
}

/// Snapshot of one in-flight transaction touching a transferred segment.
///
/// Sent before any entry chunk for the segment, so the receiving node holds
/// the transaction's locks before it starts serving the data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionInfo {
    pub gtx: GlobalTransaction,
    pub state: TxState,
}

/// Split a segment's entries into chunks of at most `chunk_size`, marking the
/// final one. Always yields at least one chunk.
pub fn chunk_entries(
    segment: SegmentId,
    entries: Vec<TransferEntry>,
    chunk_size: usize,
) -> Vec<StateChunk> {
    debug_assert!(chunk_size > 0);
    if entries.is_empty() {
        return vec![StateChunk {
            segment,
            is_last_chunk: true,
            entries: Vec::new(),
        }];
    }
    let mut chunks: Vec<StateChunk> = entries
        .chunks(chunk_size)
        .map(|batch| StateChunk {
            segment,
            is_last_chunk: false,
            entries: batch.to_vec(),
        })
        .collect();
    if let Some(last) = chunks.last_mut() {
        last.is_last_chunk = true;
    }
    chunks
}
