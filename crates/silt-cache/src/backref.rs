//! Back-reference buffering.
//!
//! Committed allocations and retirements produce back-reference updates
//! that the back-reference tree manager absorbs asynchronously. Until then
//! they live here: an ordered log of batches keyed by journal sequence,
//! with two address-ordered side indices serving the cleaner's range
//! queries. A separate set records which resident addresses hold
//! back-reference tree nodes.

use serde::{Deserialize, Serialize};
use silt_types::{ExtentType, JournalSeq, LogicalAddr};
use std::collections::BTreeMap;
use tracing::debug;

/// A single pending back-reference update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackrefEntry {
    /// Absolute physical address of the extent.
    pub paddr: u64,
    pub laddr: LogicalAddr,
    pub len: u32,
    pub ty: ExtentType,
    /// Journal sequence the update was committed under.
    pub seq: JournalSeq,
}

/// Whether an entry inserts into or removes from the back-reference tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackrefOp {
    Insert(BackrefEntry),
    Remove(BackrefEntry),
}

impl BackrefOp {
    #[must_use]
    pub fn entry(&self) -> &BackrefEntry {
        match self {
            Self::Insert(entry) | Self::Remove(entry) => entry,
        }
    }
}

/// Ordered log of pending back-reference updates.
#[derive(Debug, Default)]
pub(crate) struct BackrefBuffer {
    by_seq: BTreeMap<JournalSeq, Vec<BackrefOp>>,
    inserted: BTreeMap<(u64, JournalSeq), BackrefEntry>,
    removed: BTreeMap<(u64, JournalSeq), BackrefEntry>,
    backref_extents: BTreeMap<u64, ExtentType>,
}

impl BackrefBuffer {
    /// Append a batch under `seq` and index each entry by address.
    pub(crate) fn batch_update(&mut self, ops: Vec<BackrefOp>, seq: JournalSeq) {
        if ops.is_empty() {
            return;
        }
        debug!(
            target: "silt::cache",
            event = "backref_batch_update",
            seq = seq.0,
            entries = ops.len()
        );
        for op in &ops {
            let entry = *op.entry();
            match op {
                BackrefOp::Insert(_) => {
                    self.inserted.insert((entry.paddr, entry.seq), entry);
                }
                BackrefOp::Remove(_) => {
                    self.removed.insert((entry.paddr, entry.seq), entry);
                }
            }
        }
        self.by_seq.entry(seq).or_default().extend(ops);
    }

    /// Drop batches with sequence <= `up_to`, unlinking their entries from
    /// the side indices.
    pub(crate) fn trim(&mut self, up_to: JournalSeq) {
        let keep = self.by_seq.split_off(&up_to.next());
        let drained = std::mem::replace(&mut self.by_seq, keep);
        let mut dropped = 0_usize;
        for ops in drained.values() {
            for op in ops {
                let entry = op.entry();
                let key = (entry.paddr, entry.seq);
                match op {
                    BackrefOp::Insert(_) => {
                        self.inserted.remove(&key);
                    }
                    BackrefOp::Remove(_) => {
                        self.removed.remove(&key);
                    }
                }
                dropped += 1;
            }
        }
        debug!(
            target: "silt::cache",
            event = "trim_backref_bufs",
            up_to = up_to.0,
            dropped
        );
    }

    /// Oldest buffered sequence, if any updates are pending.
    pub(crate) fn oldest_seq(&self) -> Option<JournalSeq> {
        self.by_seq.keys().next().copied()
    }

    /// Pending insertions with address in `[start, end)`, address order.
    pub(crate) fn backrefs_in_range(&self, start: u64, end: u64) -> Vec<BackrefEntry> {
        self.inserted
            .range((start, JournalSeq::MIN)..(end, JournalSeq::MIN))
            .map(|(_, entry)| *entry)
            .collect()
    }

    /// Pending removals with address in `[start, end)`, address order.
    pub(crate) fn del_backrefs_in_range(&self, start: u64, end: u64) -> Vec<BackrefEntry> {
        self.removed
            .range((start, JournalSeq::MIN)..(end, JournalSeq::MIN))
            .map(|(_, entry)| *entry)
            .collect()
    }

    pub(crate) fn pending_batches(&self) -> usize {
        self.by_seq.len()
    }

    // ── back-reference tree node tracking ───────────────────────────────

    pub(crate) fn add_backref_extent(&mut self, paddr: u64, ty: ExtentType) {
        assert!(ty.is_backref_node(), "{ty} is not a backref tree node type");
        let prev = self.backref_extents.insert(paddr, ty);
        // Re-registration happens when a journal prefix is replayed twice.
        assert!(
            prev.is_none() || prev == Some(ty),
            "backref extent {paddr:#x} registered as two types"
        );
    }

    pub(crate) fn remove_backref_extent(&mut self, paddr: u64) {
        self.backref_extents.remove(&paddr);
    }

    pub(crate) fn backref_extents_in_range(&self, start: u64, end: u64) -> Vec<(u64, ExtentType)> {
        self.backref_extents
            .range(start..end)
            .map(|(paddr, ty)| (*paddr, *ty))
            .collect()
    }
}
