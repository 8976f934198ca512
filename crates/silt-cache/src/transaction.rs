//! The transaction: a short-lived scratchpad over the cache.
//!
//! A transaction collects the extents it has read (with the version
//! observed), the fresh extents it has allocated, the writable shadows it
//! has produced, and the extents it retires. A per-address overlay gives
//! read-your-writes: reads consult the overlay before the shared registry.
//!
//! Transactions are created by the cache and consumed by `prepare_record` /
//! `complete_commit` or `abort_transaction`; dropping one on the floor
//! leaks its pins until the owning cache is dropped.

use silt_types::{ExtentId, JournalSeq, PhysAddr, TxnId, TxnSource};
use std::collections::BTreeMap;
use tracing::trace;

/// What a transaction's overlay knows about an address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnView {
    /// Written (fresh or shadowed) in this transaction.
    Present(ExtentId),
    /// Retired in this transaction.
    Retired(ExtentId),
}

/// A read-set entry: the handle observed at an address and the extent
/// version seen at first read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadSetEntry {
    pub extent: ExtentId,
    pub version: u64,
}

/// A mutation staged by `duplicate_for_write`: the committed instance and
/// its writable shadow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MutatedPair {
    pub prev: ExtentId,
    pub next: ExtentId,
}

#[derive(Debug)]
pub struct Transaction {
    id: TxnId,
    source: TxnSource,
    weak: bool,
    created_at: JournalSeq,
    read_set: BTreeMap<PhysAddr, ReadSetEntry>,
    fresh_block_list: Vec<ExtentId>,
    mutated_block_list: Vec<MutatedPair>,
    retired_set: Vec<ExtentId>,
    overlay: BTreeMap<PhysAddr, TxnView>,
    root: Option<ExtentId>,
    conflicted: bool,
}

impl Transaction {
    pub(crate) fn new(id: TxnId, source: TxnSource, weak: bool, created_at: JournalSeq) -> Self {
        Self {
            id,
            source,
            weak,
            created_at,
            read_set: BTreeMap::new(),
            fresh_block_list: Vec::new(),
            mutated_block_list: Vec::new(),
            retired_set: Vec::new(),
            overlay: BTreeMap::new(),
            root: None,
            conflicted: false,
        }
    }

    #[must_use]
    pub fn id(&self) -> TxnId {
        self.id
    }

    #[must_use]
    pub fn source(&self) -> TxnSource {
        self.source
    }

    #[must_use]
    pub fn is_weak(&self) -> bool {
        self.weak
    }

    /// The `last_commit` watermark at creation (or last reset).
    #[must_use]
    pub fn created_at(&self) -> JournalSeq {
        self.created_at
    }

    /// Whether the cache has invalidated this transaction's read set.
    ///
    /// Refreshed whenever a cache operation observes the cache-side flag;
    /// conflicted transactions must be retried from scratch.
    #[must_use]
    pub fn is_conflicted(&self) -> bool {
        self.conflicted
    }

    #[must_use]
    pub fn read_set(&self) -> &BTreeMap<PhysAddr, ReadSetEntry> {
        &self.read_set
    }

    #[must_use]
    pub fn fresh_blocks(&self) -> &[ExtentId] {
        &self.fresh_block_list
    }

    #[must_use]
    pub fn mutated_pairs(&self) -> &[MutatedPair] {
        &self.mutated_block_list
    }

    #[must_use]
    pub fn retired(&self) -> &[ExtentId] {
        &self.retired_set
    }

    #[must_use]
    pub fn root(&self) -> Option<ExtentId> {
        self.root
    }

    /// The overlay's view of `addr`, if any.
    #[must_use]
    pub fn view(&self, addr: PhysAddr) -> Option<TxnView> {
        self.overlay.get(&addr).copied()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fresh_block_list.is_empty()
            && self.mutated_block_list.is_empty()
            && self.retired_set.is_empty()
    }

    // ── crate-internal mutators ─────────────────────────────────────────

    pub(crate) fn mark_conflicted(&mut self) {
        self.conflicted = true;
    }

    pub(crate) fn set_root(&mut self, root: ExtentId) {
        self.root = Some(root);
    }

    /// Record a read observation; only the first read of an address is
    /// recorded. Returns true if the entry was inserted.
    pub(crate) fn add_to_read_set(&mut self, addr: PhysAddr, entry: ReadSetEntry) -> bool {
        use std::collections::btree_map::Entry;
        match self.read_set.entry(addr) {
            Entry::Vacant(vacant) => {
                vacant.insert(entry);
                trace!(
                    target: "silt::cache",
                    event = "read_set_add",
                    txn = self.id.0,
                    addr = %addr,
                    extent = entry.extent.0,
                    version = entry.version
                );
                true
            }
            Entry::Occupied(_) => false,
        }
    }

    pub(crate) fn add_fresh(&mut self, addr: PhysAddr, id: ExtentId) {
        self.fresh_block_list.push(id);
        let prev = self.overlay.insert(addr, TxnView::Present(id));
        assert!(prev.is_none(), "fresh extent address {addr} already in overlay");
    }

    pub(crate) fn add_mutated(&mut self, addr: PhysAddr, pair: MutatedPair) {
        self.mutated_block_list.push(pair);
        self.overlay.insert(addr, TxnView::Present(pair.next));
    }

    pub(crate) fn add_retired(&mut self, addr: PhysAddr, id: ExtentId) {
        assert!(
            !matches!(self.overlay.get(&addr), Some(TxnView::Retired(_))),
            "address {addr} retired twice in transaction {}",
            self.id
        );
        self.retired_set.push(id);
        self.overlay.insert(addr, TxnView::Retired(id));
    }

    /// Whether `id` is a pending extent owned by this transaction (fresh,
    /// shadow, or root shadow) and therefore writable through it.
    #[must_use]
    pub(crate) fn owns_pending(&self, id: ExtentId) -> bool {
        self.fresh_block_list.contains(&id)
            || self.mutated_block_list.iter().any(|pair| pair.next == id)
    }

    /// Re-arm the transaction in place after an abort or conflict, keeping
    /// the caller's handle. All staged state is dropped.
    pub(crate) fn reset(&mut self, created_at: JournalSeq) {
        self.read_set.clear();
        self.fresh_block_list.clear();
        self.mutated_block_list.clear();
        self.retired_set.clear();
        self.overlay.clear();
        self.root = None;
        self.conflicted = false;
        self.created_at = created_at;
    }
}
