//! The commit record handed to the journal.
//!
//! `prepare_record` turns a validated transaction into a `Record`: the
//! fresh-block data section (whose layout fixes every fresh extent's final
//! address), the mutation deltas, the retirement list, and the
//! back-reference updates. The journal owns the record's outer framing;
//! the cache only guarantees that `fresh_bytes()` is what lands at the
//! record's start address.

use serde::{Deserialize, Serialize};
use silt_types::{ExtentType, LogicalAddr, PhysAddr};

/// A fresh extent's contribution to the record data section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FreshBlock {
    pub ty: ExtentType,
    pub laddr: LogicalAddr,
    pub len: u32,
    /// Byte offset within the record data section; the extent's final
    /// address is `record_start + offset`.
    pub offset: u64,
    pub bytes: Vec<u8>,
}

/// A mutation delta: everything replay needs to patch the target forward.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordDelta {
    /// Address of the mutated extent; `Null` for the root block.
    pub paddr: PhysAddr,
    pub ty: ExtentType,
    pub laddr: LogicalAddr,
    pub len: u32,
    /// Version of the instance the delta was computed against.
    pub prev_version: u64,
    /// CRC32c of the buffer after the delta applies.
    pub final_crc: u32,
    /// Opaque payload; schema owned by the delta codec.
    pub payload: Vec<u8>,
}

/// A retirement staged by the transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Retirement {
    pub paddr: u64,
    pub len: u32,
    pub ty: ExtentType,
}

/// Whether an allocation-info entry adds or drops a back-reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AllocOp {
    Alloc,
    Retire,
}

/// Allocation info carried in the record for back-reference replay.
///
/// Fresh-block addresses are record-relative here; both commit completion
/// and replay resolve them against the record's start address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocEntry {
    pub op: AllocOp,
    pub paddr: PhysAddr,
    pub laddr: LogicalAddr,
    pub len: u32,
    pub ty: ExtentType,
}

/// In-memory commit record, produced by `prepare_record`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Record {
    pub fresh: Vec<FreshBlock>,
    pub mutations: Vec<RecordDelta>,
    pub retirements: Vec<Retirement>,
    pub backref_updates: Vec<AllocEntry>,
}

impl Record {
    /// Concatenated fresh-block data, in list order.
    ///
    /// This is the payload the EPM places at the record's start address.
    #[must_use]
    pub fn fresh_bytes(&self) -> Vec<u8> {
        let total: usize = self.fresh.iter().map(|block| block.bytes.len()).sum();
        let mut out = Vec::with_capacity(total);
        for block in &self.fresh {
            debug_assert_eq!(out.len() as u64, block.offset);
            out.extend_from_slice(&block.bytes);
        }
        out
    }

    /// Total length of the fresh data section.
    #[must_use]
    pub fn fresh_total_len(&self) -> u64 {
        self.fresh.iter().map(|block| u64::from(block.len)).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fresh.is_empty()
            && self.mutations.is_empty()
            && self.retirements.is_empty()
            && self.backref_updates.is_empty()
    }

    /// The record's contribution to startup replay, in application order:
    /// each mutation delta, then one allocation-info batch.
    #[must_use]
    pub fn replay_deltas(&self) -> Vec<ReplayDelta> {
        let mut deltas: Vec<ReplayDelta> = self
            .mutations
            .iter()
            .cloned()
            .map(ReplayDelta::Extent)
            .collect();
        if !self.backref_updates.is_empty() {
            deltas.push(ReplayDelta::Alloc(self.backref_updates.clone()));
        }
        deltas
    }
}

/// One unit of startup replay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplayDelta {
    /// Patch an extent (or the root, when `paddr` is `Null`).
    Extent(RecordDelta),
    /// Rebuild back-reference buffer state.
    Alloc(Vec<AllocEntry>),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_bytes_concatenates_in_order() {
        let record = Record {
            fresh: vec![
                FreshBlock {
                    ty: ExtentType::ObjectData,
                    laddr: LogicalAddr(1),
                    len: 4,
                    offset: 0,
                    bytes: vec![1, 2, 3, 4],
                },
                FreshBlock {
                    ty: ExtentType::ObjectData,
                    laddr: LogicalAddr(2),
                    len: 4,
                    offset: 4,
                    bytes: vec![5, 6, 7, 8],
                },
            ],
            ..Record::default()
        };
        assert_eq!(record.fresh_bytes(), vec![1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(record.fresh_total_len(), 8);
    }

    #[test]
    fn empty_record_is_empty() {
        let record = Record::default();
        assert!(record.is_empty());
        assert!(record.fresh_bytes().is_empty());
        assert!(record.replay_deltas().is_empty());
    }

    #[test]
    fn replay_deltas_order_mutations_before_alloc_batch() {
        let record = Record {
            mutations: vec![RecordDelta {
                paddr: PhysAddr::Absolute(0x1000),
                ty: ExtentType::LaddrLeaf,
                laddr: LogicalAddr::NULL,
                len: 4096,
                prev_version: 0,
                final_crc: 0,
                payload: Vec::new(),
            }],
            backref_updates: vec![AllocEntry {
                op: AllocOp::Alloc,
                paddr: PhysAddr::RecordRelative(0),
                laddr: LogicalAddr(9),
                len: 4096,
                ty: ExtentType::ObjectData,
            }],
            ..Record::default()
        };
        let deltas = record.replay_deltas();
        assert_eq!(deltas.len(), 2);
        assert!(matches!(deltas[0], ReplayDelta::Extent(_)));
        assert!(matches!(deltas[1], ReplayDelta::Alloc(_)));
    }
}
