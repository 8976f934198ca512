//! Extent registry storage: id-keyed slab, address-ordered index, and the
//! dirty list.
//!
//! The slab owns every resident extent and hands out `ExtentId` handles;
//! reference cycles are impossible because everything else (the address
//! index, the LRU, transaction sets) stores handles. The address index
//! enforces the at-most-one-resident-instance invariant; the dirty list
//! orders extents by their `dirty_from` journal sequence for the cleaner.

use crate::extent::Extent;
use silt_types::{ExtentId, JournalSeq};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Owner of all resident extents, keyed by handle.
#[derive(Debug, Default)]
pub(crate) struct ExtentSlab {
    entries: HashMap<ExtentId, Extent>,
    next_id: u64,
}

impl ExtentSlab {
    pub(crate) fn allocate_id(&mut self) -> ExtentId {
        let id = ExtentId(self.next_id);
        self.next_id += 1;
        id
    }

    pub(crate) fn insert(&mut self, extent: Extent) -> ExtentId {
        let id = extent.id;
        let prev = self.entries.insert(id, extent);
        assert!(prev.is_none(), "extent id {id} reused");
        id
    }

    pub(crate) fn get(&self, id: ExtentId) -> Option<&Extent> {
        self.entries.get(&id)
    }

    pub(crate) fn get_mut(&mut self, id: ExtentId) -> Option<&mut Extent> {
        self.entries.get_mut(&id)
    }

    pub(crate) fn remove(&mut self, id: ExtentId) -> Option<Extent> {
        self.entries.remove(&id)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Ordered mapping from absolute physical address to the unique resident
/// extent.
#[derive(Debug, Default)]
pub(crate) struct ExtentIndex {
    by_addr: BTreeMap<u64, ExtentId>,
}

impl ExtentIndex {
    pub(crate) fn get(&self, addr: u64) -> Option<ExtentId> {
        self.by_addr.get(&addr).copied()
    }

    /// Install an extent at a vacant address.
    ///
    /// A collision means two resident instances at one address, which is a
    /// cache invariant violation.
    pub(crate) fn insert(&mut self, addr: u64, id: ExtentId) {
        let prev = self.by_addr.insert(addr, id);
        assert!(
            prev.is_none(),
            "extent index collision at {addr:#x}: {prev:?} vs {id}"
        );
    }

    /// Replace the occupant of `addr` in place, returning the old handle.
    pub(crate) fn replace(&mut self, addr: u64, id: ExtentId) -> ExtentId {
        self.by_addr
            .insert(addr, id)
            .unwrap_or_else(|| panic!("index replace at vacant address {addr:#x}"))
    }

    pub(crate) fn remove(&mut self, addr: u64) -> Option<ExtentId> {
        self.by_addr.remove(&addr)
    }

    /// Handles for every resident extent whose address falls in
    /// `[start, end)`, in address order.
    pub(crate) fn range(&self, start: u64, end: u64) -> impl Iterator<Item = (u64, ExtentId)> + '_ {
        self.by_addr.range(start..end).map(|(addr, id)| (*addr, *id))
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (u64, ExtentId)> + '_ {
        self.by_addr.iter().map(|(addr, id)| (*addr, *id))
    }

    pub(crate) fn len(&self) -> usize {
        self.by_addr.len()
    }
}

/// Dirty extents ordered ascending by `dirty_from`, with byte accounting.
#[derive(Debug, Default)]
pub(crate) struct DirtyList {
    by_seq: BTreeSet<(JournalSeq, ExtentId)>,
    bytes: u64,
}

impl DirtyList {
    pub(crate) fn insert(&mut self, seq: JournalSeq, id: ExtentId, len: u32) {
        let inserted = self.by_seq.insert((seq, id));
        assert!(inserted, "extent {id} already on the dirty list");
        self.bytes = self.bytes.saturating_add(u64::from(len));
    }

    pub(crate) fn remove(&mut self, seq: JournalSeq, id: ExtentId, len: u32) {
        if self.by_seq.remove(&(seq, id)) {
            self.bytes = self.bytes.saturating_sub(u64::from(len));
        }
    }

    pub(crate) fn oldest(&self) -> Option<JournalSeq> {
        self.by_seq.iter().next().map(|(seq, _)| *seq)
    }

    /// Ascending (seq, id) iteration.
    pub(crate) fn iter(&self) -> impl Iterator<Item = (JournalSeq, ExtentId)> + '_ {
        self.by_seq.iter().copied()
    }

    pub(crate) fn len(&self) -> usize {
        self.by_seq.len()
    }

    pub(crate) fn bytes(&self) -> u64 {
        self.bytes
    }
}
