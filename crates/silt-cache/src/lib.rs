#![forbid(unsafe_code)]
//! Transactional extent cache for SiltStore.
//!
//! The cache mediates all access to on-disk extents through short-lived
//! transactions. It keeps the single coherent in-memory view of clean,
//! dirty, and pending extents, detects conflicts between concurrent
//! transactions, turns a validated transaction into a journal record, and
//! rebuilds itself at startup by replaying per-extent deltas.
//!
//! A transaction moves through three phases:
//! 1) construction: the caller obtains a [`Transaction`] from
//!    [`Cache::create_transaction`] and populates it through cache reads,
//!    [`Cache::duplicate_for_write`], [`Cache::alloc_new_extent`], and
//!    [`Cache::retire_extent`];
//! 2) submission: [`Cache::prepare_record`] validates the read set and
//!    builds the [`Record`] the caller hands to the journal;
//! 3) completion: once the journal reports the record durable,
//!    [`Cache::complete_commit`] resolves fresh addresses, promotes the
//!    write set into the registry, invalidates dependent transactions, and
//!    buffers back-reference updates.
//!
//! Log levels follow the usual discipline: INFO for major initiation and
//! closing operations, DEBUG for major extent-related operations, TRACE
//! for details.

mod backref;
mod delta;
mod extent;
mod index;
mod lru;
mod record;
mod stats;
mod transaction;

pub use backref::{BackrefEntry, BackrefOp};
pub use delta::{DeltaPayload, PatchRun};
pub use extent::{ExtentInfo, ExtentState, IoFailure, IoTicket};
pub use record::{AllocEntry, AllocOp, FreshBlock, Record, RecordDelta, ReplayDelta, Retirement};
pub use stats::{src_pair_index, CacheStats, SRC_PAIR_COUNT};
pub use transaction::{MutatedPair, ReadSetEntry, Transaction, TxnView};

use asupersync::Cx;
use backref::BackrefBuffer;
use extent::Extent;
use index::{DirtyList, ExtentIndex, ExtentSlab};
use lru::Lru;
use silt_epm::{AlignedBuf, ExtentPlacementManager};
use silt_error::{Result, SiltError};
use silt_types::{
    ExtentId, ExtentType, JournalSeq, LogicalAddr, PhysAddr, PlacementHint, TxnId, TxnSource,
    BLOCK_ALIGN,
};
use stats::CacheCounters;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

/// Length of the distinguished root block.
pub const ROOT_BLOCK_LEN: u32 = 4096;

#[inline]
fn cx_checkpoint(cx: &Cx) -> Result<()> {
    cx.checkpoint().map_err(|_| SiltError::Cancelled)
}

/// Construction parameters.
///
/// The LRU byte capacity is the cache's only knob; everything else belongs
/// to collaborators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheConfig {
    pub lru_capacity_bytes: u64,
}

/// Summary of one flush pass over the dirty list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FlushOutcome {
    pub extents: usize,
    pub bytes: u64,
}

#[derive(Debug, Clone, Copy)]
struct TxnMeta {
    source: TxnSource,
}

/// The transactional extent cache.
///
/// One instance per shard; all shared structures (registry, LRU, dirty
/// list, back-reference buffer) are owned here and mutated only through
/// cache operations.
pub struct Cache {
    epm: Arc<dyn ExtentPlacementManager>,
    slab: ExtentSlab,
    index: ExtentIndex,
    dirty: DirtyList,
    lru: Lru,
    backrefs: BackrefBuffer,
    root: Option<ExtentId>,
    last_commit: JournalSeq,
    next_txn: u64,
    live_txns: HashMap<TxnId, TxnMeta>,
    /// External index of extent readers, replacing intrusive back-pointers:
    /// which live transactions hold each extent in their read set.
    reads: HashMap<ExtentId, BTreeSet<TxnId>>,
    conflicted: HashSet<TxnId>,
    /// The transaction between `prepare_record` and `complete_commit`, if
    /// any. The journal serializes submissions, so at most one exists.
    commit_in_flight: Option<TxnId>,
    counters: CacheCounters,
    resident_bytes: u64,
}

impl Cache {
    #[must_use]
    pub fn new(epm: Arc<dyn ExtentPlacementManager>, config: CacheConfig) -> Self {
        Self {
            epm,
            slab: ExtentSlab::default(),
            index: ExtentIndex::default(),
            dirty: DirtyList::default(),
            lru: Lru::new(config.lru_capacity_bytes),
            backrefs: BackrefBuffer::default(),
            root: None,
            last_commit: JournalSeq::MIN,
            next_txn: 1,
            live_txns: HashMap::new(),
            reads: HashMap::new(),
            conflicted: HashSet::new(),
            commit_in_flight: None,
            counters: CacheCounters::default(),
            resident_bytes: 0,
        }
    }

    /// Establish the resident root block. Must run before any transaction,
    /// and before replay.
    pub fn init(&mut self) {
        assert!(self.root.is_none(), "cache initialized twice");
        let id = self.slab.allocate_id();
        self.slab.insert(Extent::new(
            id,
            ExtentType::Root,
            ExtentState::Clean,
            PhysAddr::Null,
            LogicalAddr::NULL,
            ROOT_BLOCK_LEN,
            AlignedBuf::zeroed(ROOT_BLOCK_LEN as usize),
        ));
        self.pin(id);
        self.root = Some(id);
        info!(target: "silt::cache", event = "init", root = id.0);
    }

    /// Release cached state at shutdown. Dirty extents are the journal's
    /// problem; live transactions are the caller's bug.
    pub fn close(&mut self) {
        assert!(
            self.live_txns.is_empty(),
            "cache closed with {} live transactions",
            self.live_txns.len()
        );
        let drained = self.lru.clear();
        for id in drained {
            self.release_pin(id);
        }
        info!(
            target: "silt::cache",
            event = "close",
            resident = self.index.len(),
            dirty = self.dirty.len()
        );
    }

    // ── transaction lifecycle ───────────────────────────────────────────

    /// Create an empty transaction tagged with its source.
    ///
    /// Weak transactions are read-only observers: they may populate a read
    /// set but can never commit.
    pub fn create_transaction(&mut self, source: TxnSource, weak: bool) -> Transaction {
        let id = TxnId(self.next_txn);
        self.next_txn += 1;
        self.live_txns.insert(id, TxnMeta { source });
        self.counters.created_by_src[source.index()] += 1;
        debug!(
            target: "silt::cache",
            event = "create_transaction",
            txn = id.0,
            source = %source,
            weak
        );
        Transaction::new(id, source, weak, self.last_commit)
    }

    /// Re-arm a conflicted or finished transaction in place, preserving the
    /// caller's handle. All staged state is dropped and the watermark moves
    /// to the current `last_commit`.
    pub fn reset_transaction_preserve_handle(&mut self, t: &mut Transaction) {
        assert!(
            self.commit_in_flight != Some(t.id()),
            "reset of transaction {} with a commit in flight",
            t.id()
        );
        self.release_txn_refs(t);
        self.conflicted.remove(&t.id());
        t.reset(self.last_commit);
        self.counters.created_by_src[t.source().index()] += 1;
        trace!(target: "silt::cache", event = "reset_transaction", txn = t.id().0);
    }

    /// Abort a transaction, releasing everything it staged.
    pub fn abort_transaction(&mut self, t: Transaction) {
        if self.commit_in_flight == Some(t.id()) {
            // A prepared record was dropped before completion; fail the
            // waiters armed on its write set.
            self.commit_in_flight = None;
            for &id in t.fresh_blocks() {
                self.fail_armed_waiters(id, "commit abandoned before completion");
            }
            let pairs: Vec<MutatedPair> = t.mutated_pairs().to_vec();
            for pair in pairs {
                self.fail_armed_waiters(pair.next, "commit abandoned before completion");
            }
        }
        debug!(
            target: "silt::cache",
            event = "abort_transaction",
            txn = t.id().0,
            reads = t.read_set().len(),
            fresh = t.fresh_blocks().len(),
            mutated = t.mutated_pairs().len(),
            retired = t.retired().len()
        );
        self.release_txn_refs(&t);
        self.live_txns.remove(&t.id());
        self.conflicted.remove(&t.id());
    }

    /// Whether the cache has invalidated this transaction since its last
    /// operation.
    #[must_use]
    pub fn is_transaction_conflicted(&self, t: &Transaction) -> bool {
        self.conflicted.contains(&t.id())
    }

    // ── typed reads ─────────────────────────────────────────────────────

    /// Registry read: the unique resident extent of `ty` at `addr`,
    /// reading it from the EPM if absent.
    ///
    /// No transaction is involved; replay and init paths use this
    /// directly.
    pub fn get_extent(
        &mut self,
        cx: &Cx,
        ty: ExtentType,
        addr: u64,
        len: u32,
    ) -> Result<ExtentId> {
        self.get_extent_inner(cx, ty, addr, len, LogicalAddr::NULL, None)
    }

    /// Transactional read: overlay first (read-your-writes), then the
    /// registry. The extent joins `t`'s read set and is touched in the
    /// LRU.
    ///
    /// Fails with `NotFound` if `t` has retired the address.
    pub fn get_extent_in_txn(
        &mut self,
        cx: &Cx,
        t: &mut Transaction,
        ty: ExtentType,
        addr: PhysAddr,
        len: u32,
    ) -> Result<ExtentId> {
        self.check_conflict(t)?;
        if let Some(view) = t.view(addr) {
            return match view {
                TxnView::Retired(_) => Err(SiltError::NotFound(format!(
                    "{addr} retired in transaction {}",
                    t.id()
                ))),
                TxnView::Present(id) => {
                    trace!(
                        target: "silt::cache",
                        event = "read_from_overlay",
                        txn = t.id().0,
                        addr = %addr,
                        extent = id.0
                    );
                    Ok(self.resolve_id(id))
                }
            };
        }
        let abs = addr
            .as_absolute()
            .expect("transactional read of an unresolved address");
        let id = self.get_extent_inner(cx, ty, abs, len, LogicalAddr::NULL, Some(t.source()))?;
        self.add_to_read_set_of(t, PhysAddr::Absolute(abs), id);
        self.touch_extent(id);
        Ok(id)
    }

    /// Returns the extent at `addr` only if it is already resident.
    ///
    /// Placeholders are not really cached yet; they and absent addresses
    /// produce `None`, as does an address `t` has retired.
    pub fn get_extent_if_cached(
        &mut self,
        t: &mut Transaction,
        addr: u64,
        ty: ExtentType,
    ) -> Result<Option<ExtentId>> {
        self.check_conflict(t)?;
        let key = PhysAddr::Absolute(addr);
        match t.view(key) {
            Some(TxnView::Retired(_)) => return Ok(None),
            Some(TxnView::Present(id)) => return Ok(Some(self.resolve_id(id))),
            None => {}
        }
        let Some(id) = self.query_cache(addr, Some((t.source(), ty))) else {
            return Ok(None);
        };
        let placeholder = self
            .slab
            .get(id)
            .is_some_and(|extent| extent.is_placeholder());
        if placeholder {
            return Ok(None);
        }
        self.add_to_read_set_of(t, key, id);
        self.touch_extent(id);
        Ok(Some(id))
    }

    /// Dynamic-type read: dispatch on an `ExtentType` value, carrying the
    /// logical address for logical extents. Returns `None` if `t` retired
    /// the address.
    pub fn get_extent_by_type(
        &mut self,
        cx: &Cx,
        t: &mut Transaction,
        ty: ExtentType,
        addr: u64,
        laddr: LogicalAddr,
        len: u32,
    ) -> Result<Option<ExtentId>> {
        self.check_conflict(t)?;
        let key = PhysAddr::Absolute(addr);
        match t.view(key) {
            Some(TxnView::Retired(_)) => return Ok(None),
            Some(TxnView::Present(id)) => return Ok(Some(self.resolve_id(id))),
            None => {}
        }
        let id = self.get_extent_inner(cx, ty, addr, len, laddr, Some(t.source()))?;
        self.add_to_read_set_of(t, key, id);
        self.touch_extent(id);
        Ok(Some(id))
    }

    /// Splice `t`'s view over a registry extent: the root goes through
    /// `t.root`, everything else through the overlay. `None` means `t`
    /// retired it.
    pub fn update_extent_from_transaction(
        &mut self,
        t: &mut Transaction,
        id: ExtentId,
    ) -> Option<ExtentId> {
        let id = self.resolve_id(id);
        let (ty, paddr) = {
            let extent = self.slab.get(id).expect("update of released extent");
            (extent.ty, extent.paddr)
        };
        if ty.is_root() {
            if let Some(root) = t.root() {
                return Some(root);
            }
            self.add_to_read_set_of(t, PhysAddr::Null, id);
            t.set_root(id);
            return Some(id);
        }
        match t.view(paddr) {
            Some(TxnView::Retired(_)) => None,
            Some(TxnView::Present(next)) => Some(next),
            None => {
                self.add_to_read_set_of(t, paddr, id);
                Some(id)
            }
        }
    }

    // ── root ────────────────────────────────────────────────────────────

    /// The current root, captured into `t`'s read set on first access.
    pub fn get_root(&mut self, t: &mut Transaction) -> Result<ExtentId> {
        self.check_conflict(t)?;
        if let Some(root) = t.root() {
            trace!(target: "silt::cache", event = "root_from_txn", txn = t.id().0);
            return Ok(root);
        }
        let root = self.root.expect("cache initialized with a root block");
        self.add_to_read_set_of(t, PhysAddr::Null, root);
        t.set_root(root);
        Ok(root)
    }

    /// No-fetch root access for call sites that already called
    /// [`Cache::get_root`].
    #[must_use]
    pub fn get_root_fast(&self, t: &Transaction) -> ExtentId {
        t.root().expect("get_root_fast before get_root")
    }

    /// Stage the initial root mutation for a fresh filesystem; the caller
    /// adjusts the returned writable root before committing.
    pub fn mkfs(&mut self, t: &mut Transaction) -> Result<ExtentId> {
        let root = self.get_root(t)?;
        self.duplicate_for_write(t, root)
    }

    // ── mutation, allocation, retirement ────────────────────────────────

    /// Produce the writable shadow of `id` for `t`.
    ///
    /// The shadow is what subsequent in-transaction reads at the address
    /// observe; the original stays in the read set for commit validation.
    /// Duplicating an extent already writable in `t` returns the existing
    /// shadow.
    pub fn duplicate_for_write(&mut self, t: &mut Transaction, id: ExtentId) -> Result<ExtentId> {
        self.check_conflict(t)?;
        assert!(
            !t.is_weak(),
            "weak transaction {} attempted a mutation",
            t.id()
        );
        let id = self.resolve_id(id);
        if t.owns_pending(id) {
            return Ok(id);
        }
        let (ty, paddr, laddr, len, version, buf) = {
            let extent = self
                .slab
                .get(id)
                .expect("duplicate_for_write of released extent");
            assert!(
                extent.state.is_clean() || extent.state.is_dirty(),
                "duplicate_for_write of {} extent",
                extent.state
            );
            (
                extent.ty,
                extent.paddr,
                extent.laddr,
                extent.length,
                extent.version,
                extent.buf.clone(),
            )
        };
        if ty.is_root() {
            if let Some(root) = t.root() {
                if t.owns_pending(root) {
                    return Ok(root);
                }
            }
        } else {
            match t.view(paddr) {
                Some(TxnView::Present(existing)) => return Ok(existing),
                Some(TxnView::Retired(_)) => {
                    panic!("duplicate_for_write of an address retired in transaction {}", t.id())
                }
                None => {}
            }
        }

        let shadow_id = self.slab.allocate_id();
        let mut shadow = Extent::new(
            shadow_id,
            ty,
            ExtentState::MutationPending,
            paddr,
            laddr,
            len,
            buf,
        );
        shadow.version = version;
        self.slab.insert(shadow);
        self.pin(shadow_id);

        let key = if ty.is_root() { PhysAddr::Null } else { paddr };
        self.add_to_read_set_of(t, key, id);
        t.add_mutated(
            key,
            MutatedPair {
                prev: id,
                next: shadow_id,
            },
        );
        if ty.is_root() {
            t.set_root(shadow_id);
        }
        debug!(
            target: "silt::cache",
            event = "duplicate_for_write",
            txn = t.id().0,
            ty = %ty,
            addr = %paddr,
            prev = id.0,
            next = shadow_id.0
        );
        Ok(shadow_id)
    }

    /// Allocate a fresh extent through the EPM.
    ///
    /// Its address stays tentative (possibly record-relative) until commit
    /// completion; in-transaction reads reach it through `t`'s overlay.
    pub fn alloc_new_extent(
        &mut self,
        cx: &Cx,
        t: &mut Transaction,
        ty: ExtentType,
        len: u32,
        hint: PlacementHint,
    ) -> Result<ExtentId> {
        self.check_conflict(t)?;
        assert!(
            !t.is_weak(),
            "weak transaction {} attempted an allocation",
            t.id()
        );
        assert!(
            !ty.is_placeholder() && !ty.is_root(),
            "cannot allocate {ty} extents"
        );
        let allocated = self.epm.alloc_new_extent(cx, ty, len, hint)?;
        let id = self.slab.allocate_id();
        self.slab.insert(Extent::new(
            id,
            ty,
            ExtentState::InitialWritePending,
            allocated.paddr,
            LogicalAddr::NULL,
            len,
            allocated.buf,
        ));
        self.pin(id);
        t.add_fresh(allocated.paddr, id);
        debug!(
            target: "silt::cache",
            event = "alloc_new_extent",
            txn = t.id().0,
            ty = %ty,
            len,
            tentative = %allocated.paddr,
            extent = id.0
        );
        Ok(id)
    }

    /// Dynamic-type allocation variant.
    pub fn alloc_new_extent_by_type(
        &mut self,
        cx: &Cx,
        t: &mut Transaction,
        ty: ExtentType,
        len: u32,
        hint: PlacementHint,
    ) -> Result<ExtentId> {
        self.alloc_new_extent(cx, t, ty, len, hint)
    }

    /// Declare `id` retired in `t`.
    pub fn retire_extent(&mut self, t: &mut Transaction, id: ExtentId) -> Result<()> {
        self.check_conflict(t)?;
        assert!(
            !t.is_weak(),
            "weak transaction {} attempted a retirement",
            t.id()
        );
        let id = self.resolve_id(id);
        let (paddr, state) = {
            let extent = self.slab.get(id).expect("retire of released extent");
            (extent.paddr, extent.state)
        };
        assert!(
            !state.is_pending() && state.is_valid(),
            "retire of {state} extent"
        );
        assert!(
            !matches!(t.view(paddr), Some(TxnView::Present(_))),
            "retiring an address mutated in transaction {}",
            t.id()
        );
        self.add_to_read_set_of(t, paddr, id);
        t.add_retired(paddr, id);
        debug!(
            target: "silt::cache",
            event = "retire_extent",
            txn = t.id().0,
            addr = %paddr,
            extent = id.0
        );
        Ok(())
    }

    /// Declare the block at `addr` retired in `t`, whether or not it is
    /// resident. An absent block gets a RETIRED_PLACEHOLDER occupying its
    /// index slot until the retirement commits or a real read replaces it.
    pub fn retire_extent_addr(&mut self, t: &mut Transaction, addr: u64, len: u32) -> Result<()> {
        self.check_conflict(t)?;
        assert!(
            !t.is_weak(),
            "weak transaction {} attempted a retirement",
            t.id()
        );
        let key = PhysAddr::Absolute(addr);
        assert!(
            t.view(key).is_none(),
            "retire_extent_addr at {addr:#x} already staged in transaction {}",
            t.id()
        );
        if let Some(id) = self.index.get(addr) {
            let length = self
                .slab
                .get(id)
                .expect("indexed extent resident")
                .length;
            assert_eq!(length, len, "retire length mismatch at {addr:#x}");
            return self.retire_extent(t, id);
        }

        let id = self.slab.allocate_id();
        self.slab.insert(Extent::placeholder(id, addr, len));
        self.attach_to_index(addr, id);
        self.add_to_read_set_of(t, key, id);
        t.add_retired(key, id);
        debug!(
            target: "silt::cache",
            event = "retire_extent_addr",
            txn = t.id().0,
            addr,
            len,
            placeholder = id.0
        );
        Ok(())
    }

    // ── commit pipeline ─────────────────────────────────────────────────

    /// Phase 1 + 2 of commit: validate `t`'s read set, then build the
    /// journal record. On success the write set is armed for I/O-wait and
    /// the caller must follow up with [`Cache::complete_commit`] (or
    /// abort).
    ///
    /// A conflicted transaction gets an eager `Conflict` error; the caller
    /// retries with a fresh transaction.
    pub fn prepare_record(&mut self, t: &mut Transaction) -> Result<Record> {
        assert!(!t.is_weak(), "weak transaction {} cannot commit", t.id());
        assert!(
            self.commit_in_flight.is_none(),
            "prepare_record while transaction {:?} is between prepare and complete",
            self.commit_in_flight
        );
        self.check_conflict(t)?;

        // Phase 1: every read observation must still hold.
        let observations: Vec<(PhysAddr, ReadSetEntry)> = t
            .read_set()
            .iter()
            .map(|(addr, entry)| (*addr, *entry))
            .collect();
        for (addr, entry) in observations {
            let resolved = self.resolve_id(entry.extent);
            let valid = self
                .slab
                .get(resolved)
                .is_some_and(|extent| extent.state.is_valid() && extent.version == entry.version);
            if !valid {
                warn!(
                    target: "silt::cache::commit",
                    event = "validation_failed",
                    txn = t.id().0,
                    addr = %addr,
                    extent = entry.extent.0,
                    observed_version = entry.version
                );
                self.conflicted.insert(t.id());
                t.mark_conflicted();
                self.counters.invalidated_by_src[t.source().index()] += 1;
                return Err(SiltError::Conflict { txn: t.id().0 });
            }
        }

        // Phase 2: record construction.
        let mut record = Record::default();
        let mut offset = 0_u64;
        for &id in t.fresh_blocks() {
            let extent = self.slab.get_mut(id).expect("fresh extent resident");
            assert_eq!(extent.state, ExtentState::InitialWritePending);
            assert!(
                !extent.buf.is_empty(),
                "fresh extent {id} committed without a buffer"
            );
            record.fresh.push(FreshBlock {
                ty: extent.ty,
                laddr: extent.laddr,
                len: extent.length,
                offset,
                bytes: extent.buf.to_vec(),
            });
            record.backref_updates.push(AllocEntry {
                op: AllocOp::Alloc,
                paddr: PhysAddr::RecordRelative(offset),
                laddr: extent.laddr,
                len: extent.length,
                ty: extent.ty,
            });
            extent.waiters.arm();
            offset += u64::from(extent.length);
        }

        let pairs: Vec<MutatedPair> = t.mutated_pairs().to_vec();
        for pair in pairs {
            let (paddr, ty, laddr, len, prev_version, payload, final_crc) = {
                let prev = self.slab.get(pair.prev).expect("mutated prev resident");
                let next = self.slab.get(pair.next).expect("mutated next resident");
                assert_eq!(next.state, ExtentState::MutationPending);
                let delta = DeltaPayload::compute(prev.buf.as_slice(), next.buf.as_slice());
                (
                    prev.paddr,
                    next.ty,
                    next.laddr,
                    next.length,
                    prev.version,
                    delta.encode()?,
                    next.compute_crc(),
                )
            };
            self.counters.mutation_delta_bytes += payload.len() as u64;
            record.mutations.push(RecordDelta {
                paddr,
                ty,
                laddr,
                len,
                prev_version,
                final_crc,
                payload,
            });
            self.slab
                .get_mut(pair.next)
                .expect("mutated next resident")
                .waiters
                .arm();
        }

        for &id in t.retired() {
            let resolved = self.resolve_id(id);
            let extent = self.slab.get(resolved).expect("retired extent resident");
            let addr = extent
                .paddr
                .as_absolute()
                .expect("retired extent has an absolute address");
            record.retirements.push(Retirement {
                paddr: addr,
                len: extent.length,
                ty: extent.ty,
            });
            record.backref_updates.push(AllocEntry {
                op: AllocOp::Retire,
                paddr: PhysAddr::Absolute(addr),
                laddr: extent.laddr,
                len: extent.length,
                ty: extent.ty,
            });
        }

        self.commit_in_flight = Some(t.id());
        debug!(
            target: "silt::cache::commit",
            event = "prepare_record",
            txn = t.id().0,
            fresh = record.fresh.len(),
            mutations = record.mutations.len(),
            retirements = record.retirements.len(),
            fresh_bytes = record.fresh_total_len()
        );
        Ok(record)
    }

    /// Phase 3 of commit: the journal has reported the record durable at
    /// `record_start` under `seq`.
    ///
    /// Fresh extents get their final addresses and enter the registry
    /// dirty; mutated extents replace their previous instances, whose
    /// readers are invalidated; retirements leave the registry; all
    /// back-reference updates are buffered under `seq`.
    pub fn complete_commit(&mut self, t: Transaction, record_start: u64, seq: JournalSeq) {
        assert_eq!(
            self.commit_in_flight,
            Some(t.id()),
            "complete_commit without a matching prepare_record"
        );
        assert_eq!(
            record_start % u64::from(BLOCK_ALIGN),
            0,
            "record start {record_start:#x} not block aligned"
        );
        assert!(
            seq >= self.last_commit,
            "journal sequence moved backwards: {seq} < {}",
            self.last_commit
        );
        self.commit_in_flight = None;
        let src = t.source();
        let mut backref_ops: Vec<BackrefOp> = Vec::new();

        // Fresh extents: resolve addresses, promote into the registry.
        let mut offset = 0_u64;
        for &id in t.fresh_blocks() {
            let (ty, laddr, len, final_addr) = {
                let extent = self.slab.get_mut(id).expect("fresh extent resident");
                let final_addr = record_start
                    .checked_add(offset)
                    .expect("fresh extent address overflow");
                extent.complete_initial_write(final_addr);
                extent.state = ExtentState::Dirty;
                extent.dirty_from = Some(seq);
                extent.last_committed_crc = extent.compute_crc();
                extent.waiters.complete(Ok(()));
                (extent.ty, extent.laddr, extent.length, final_addr)
            };
            self.attach_to_index(final_addr, id);
            self.dirty.insert(seq, id, len);
            backref_ops.push(BackrefOp::Insert(BackrefEntry {
                paddr: final_addr,
                laddr,
                len,
                ty,
                seq,
            }));
            if ty.is_backref_node() {
                self.backrefs.add_backref_extent(final_addr, ty);
            }
            self.counters.fresh_committed_by_type[ty.index()] += 1;
            offset += u64::from(len);
            trace!(
                target: "silt::cache::commit",
                event = "fresh_committed",
                txn = t.id().0,
                extent = id.0,
                addr = final_addr,
                seq = seq.0
            );
        }

        // Mutated extents: replace prev with next, invalidate readers.
        let pairs: Vec<MutatedPair> = t.mutated_pairs().to_vec();
        for pair in pairs {
            let (ty, prev_paddr, prev_version, prev_dirty, len) = {
                let prev = self.slab.get(pair.prev).expect("mutated prev resident");
                (
                    prev.ty,
                    prev.paddr,
                    prev.version,
                    prev.dirty_from,
                    prev.length,
                )
            };
            if ty.is_root() {
                {
                    let prev = self.slab.get_mut(pair.prev).expect("root resident");
                    prev.state = ExtentState::Invalid;
                }
                if let Some(dirty_from) = prev_dirty {
                    self.dirty.remove(dirty_from, pair.prev, len);
                }
                {
                    let next = self.slab.get_mut(pair.next).expect("root shadow resident");
                    next.state = ExtentState::Dirty;
                    next.dirty_from = Some(seq);
                    next.version = prev_version + 1;
                    next.last_committed_crc = next.compute_crc();
                    next.waiters.complete(Ok(()));
                }
                self.dirty.insert(seq, pair.next, len);
                self.invalidate_dependents(pair.prev, t.id(), src, ty);
                // Hand the cache's own root pin over to the new instance.
                self.pin(pair.next);
                self.root = Some(pair.next);
                self.release_pin(pair.prev);
            } else {
                let addr = prev_paddr
                    .as_absolute()
                    .expect("mutated extent has an absolute address");
                let displaced = self.index.replace(addr, pair.next);
                assert_eq!(displaced, pair.prev, "index occupant changed during commit");
                {
                    let prev = self.slab.get_mut(pair.prev).expect("mutated prev resident");
                    prev.in_index = false;
                    prev.state = ExtentState::Invalid;
                }
                if let Some(dirty_from) = prev_dirty {
                    self.dirty.remove(dirty_from, pair.prev, len);
                }
                if self.lru.remove(pair.prev) {
                    self.release_pin(pair.prev);
                }
                {
                    let next = self.slab.get_mut(pair.next).expect("mutated next resident");
                    next.in_index = true;
                    next.state = ExtentState::Dirty;
                    next.dirty_from = Some(seq);
                    next.version = prev_version + 1;
                    next.last_committed_crc = next.compute_crc();
                    next.waiters.complete(Ok(()));
                }
                self.dirty.insert(seq, pair.next, len);
                self.invalidate_dependents(pair.prev, t.id(), src, ty);
            }
            self.counters.mutations_committed_by_type[ty.index()] += 1;
            trace!(
                target: "silt::cache::commit",
                event = "mutation_committed",
                txn = t.id().0,
                prev = pair.prev.0,
                next = pair.next.0,
                seq = seq.0
            );
        }

        // Retirements: leave the registry, buffer back-reference removals.
        let retired: Vec<ExtentId> = t.retired().to_vec();
        for id in retired {
            let resolved = self.resolve_id(id);
            let (ty, paddr, laddr, len, dirty_from, in_index) = {
                let extent = self.slab.get(resolved).expect("retired extent resident");
                (
                    extent.ty,
                    extent.paddr,
                    extent.laddr,
                    extent.length,
                    extent.dirty_from,
                    extent.in_index,
                )
            };
            let addr = paddr
                .as_absolute()
                .expect("retired extent has an absolute address");
            if in_index {
                self.detach_from_index(resolved);
            }
            if let Some(dirty_from) = dirty_from {
                self.dirty.remove(dirty_from, resolved, len);
            }
            if self.lru.remove(resolved) {
                self.release_pin(resolved);
            }
            self.slab
                .get_mut(resolved)
                .expect("retired extent resident")
                .state = ExtentState::Invalid;
            self.invalidate_dependents(resolved, t.id(), src, ty);
            // A replaced placeholder's successor is reachable only through
            // the forwarding link; nothing unpins it later.
            let pins = self.slab.get(resolved).map_or(0, |extent| extent.pins);
            if pins == 0 {
                self.drop_extent(resolved);
            }
            backref_ops.push(BackrefOp::Remove(BackrefEntry {
                paddr: addr,
                laddr,
                len,
                ty,
                seq,
            }));
            if ty.is_backref_node() {
                self.backrefs.remove_backref_extent(addr);
            }
            self.counters.retired_committed_by_type[ty.index()] += 1;
            trace!(
                target: "silt::cache::commit",
                event = "retire_committed",
                txn = t.id().0,
                extent = resolved.0,
                addr,
                seq = seq.0
            );
        }

        self.backrefs.batch_update(backref_ops, seq);
        self.last_commit = seq;
        self.counters.committed_by_src[src.index()] += 1;
        self.release_txn_refs(&t);
        self.live_txns.remove(&t.id());
        self.conflicted.remove(&t.id());
        info!(
            target: "silt::cache::commit",
            event = "complete_commit",
            txn = t.id().0,
            seq = seq.0,
            record_start,
            last_commit = self.last_commit.0
        );
    }

    // ── replay ──────────────────────────────────────────────────────────

    /// Reconstruct state from one journal delta during startup.
    ///
    /// Extent deltas patch their target (read through the registry,
    /// materializing placeholders) and mark it dirty from `seq`; root
    /// deltas patch the root block; allocation-info deltas rebuild the
    /// back-reference buffer under `alloc_seq`, which may trail `seq` when
    /// an allocation straddles segments. Stale deltas (version already
    /// advanced) are skipped, which makes replay idempotent.
    ///
    /// Returns whether the delta was applied. Errors are fatal to startup.
    pub fn replay_delta(
        &mut self,
        cx: &Cx,
        seq: JournalSeq,
        record_base: u64,
        delta: &ReplayDelta,
        alloc_seq: JournalSeq,
    ) -> Result<bool> {
        cx_checkpoint(cx)?;
        match delta {
            ReplayDelta::Alloc(entries) => {
                let mut ops = Vec::with_capacity(entries.len());
                for entry in entries {
                    let addr = entry.paddr.resolve(record_base).map_err(|err| {
                        SiltError::Replay(format!("alloc delta at seq {seq}: {err}"))
                    })?;
                    let buffered = BackrefEntry {
                        paddr: addr,
                        laddr: entry.laddr,
                        len: entry.len,
                        ty: entry.ty,
                        seq: alloc_seq,
                    };
                    match entry.op {
                        AllocOp::Alloc => {
                            ops.push(BackrefOp::Insert(buffered));
                            if entry.ty.is_backref_node() {
                                self.backrefs.add_backref_extent(addr, entry.ty);
                            }
                        }
                        AllocOp::Retire => {
                            ops.push(BackrefOp::Remove(buffered));
                            if entry.ty.is_backref_node() {
                                self.backrefs.remove_backref_extent(addr);
                            }
                        }
                    }
                }
                self.backrefs.batch_update(ops, alloc_seq);
                Ok(true)
            }
            ReplayDelta::Extent(d) if d.ty.is_root() => {
                let root = self.root.expect("replay before init");
                self.apply_extent_delta(root, d, seq)
            }
            ReplayDelta::Extent(d) => {
                let addr = d.paddr.as_absolute().ok_or_else(|| {
                    SiltError::Replay(format!("unresolved delta address at seq {seq}"))
                })?;
                let id = self.get_extent_inner(cx, d.ty, addr, d.len, d.laddr, None)?;
                self.apply_extent_delta(id, d, seq)
            }
        }
    }

    fn apply_extent_delta(&mut self, id: ExtentId, d: &RecordDelta, seq: JournalSeq) -> Result<bool> {
        let decoded = DeltaPayload::decode(&d.payload)
            .map_err(|err| SiltError::Replay(format!("delta at seq {seq}: {err}")))?;
        let (applied, len, newly_dirty) = {
            let extent = self.slab.get_mut(id).expect("replay target resident");
            if extent.version != d.prev_version {
                trace!(
                    target: "silt::cache::replay",
                    event = "delta_skipped",
                    extent = id.0,
                    seq = seq.0,
                    extent_version = extent.version,
                    delta_prev_version = d.prev_version
                );
                return Ok(false);
            }
            decoded
                .apply(extent.buf.as_mut_slice())
                .map_err(|err| SiltError::Replay(format!("delta at seq {seq}: {err}")))?;
            extent.version += 1;
            let crc = extent.compute_crc();
            if crc != d.final_crc {
                return Err(SiltError::Replay(format!(
                    "CRC mismatch after delta at seq {seq}: stored={:#010x} computed={crc:#010x}",
                    d.final_crc
                )));
            }
            extent.last_committed_crc = crc;
            let newly_dirty = extent.dirty_from.is_none();
            if newly_dirty {
                extent.state = ExtentState::Dirty;
                extent.dirty_from = Some(seq);
            }
            (true, extent.length, newly_dirty)
        };
        if newly_dirty {
            if self.lru.remove(id) {
                self.release_pin(id);
            }
            self.dirty.insert(seq, id, len);
        }
        debug!(
            target: "silt::cache::replay",
            event = "delta_applied",
            extent = id.0,
            seq = seq.0
        );
        Ok(applied)
    }

    /// Post-replay sweep: ask `f` whether each resident extent is still
    /// alive; dead extents leave the registry.
    pub fn init_cached_extents<F>(&mut self, t: &mut Transaction, mut f: F) -> Result<()>
    where
        F: FnMut(&mut Transaction, &ExtentInfo) -> Result<bool>,
    {
        self.check_conflict(t)?;
        info!(
            target: "silt::cache::replay",
            event = "init_cached_extents_start",
            resident = self.index.len(),
            dirty = self.dirty.len()
        );
        let ids: Vec<ExtentId> = self.index.iter().map(|(_, id)| id).collect();
        let mut removed = 0_usize;
        for id in ids {
            let Some(info) = self.extent_info(id) else {
                continue;
            };
            if !f(t, &info)? {
                self.remove_extent(id);
                removed += 1;
            }
        }
        info!(
            target: "silt::cache::replay",
            event = "init_cached_extents_done",
            resident = self.index.len(),
            removed
        );
        Ok(())
    }

    // ── cleaner surface ─────────────────────────────────────────────────

    /// Dirty extents with `dirty_from < seq`, oldest first, bounded by
    /// `max_bytes`; each joins `t`'s read set.
    pub fn get_next_dirty_extents(
        &mut self,
        t: &mut Transaction,
        seq: JournalSeq,
        max_bytes: u64,
    ) -> Result<Vec<ExtentId>> {
        self.check_conflict(t)?;
        let candidates: Vec<(JournalSeq, ExtentId)> = self
            .dirty
            .iter()
            .take_while(|(dirty_from, _)| *dirty_from < seq)
            .collect();
        let mut out = Vec::new();
        let mut bytes = 0_u64;
        for (_, id) in candidates {
            if bytes >= max_bytes {
                break;
            }
            let (paddr, len) = {
                let extent = self.slab.get(id).expect("dirty extent resident");
                (extent.paddr, extent.length)
            };
            self.add_to_read_set_of(t, paddr, id);
            bytes += u64::from(len);
            out.push(id);
        }
        Ok(out)
    }

    /// Write back and clean every dirty extent whose `dirty_from` is at or
    /// below the journal flush watermark. Cleaned extents enter the LRU;
    /// the root stays dirty (it is carried by journal deltas alone).
    pub fn flush_dirty_through(&mut self, cx: &Cx, up_to: JournalSeq) -> Result<FlushOutcome> {
        let victims: Vec<(JournalSeq, ExtentId)> = self
            .dirty
            .iter()
            .take_while(|(dirty_from, _)| *dirty_from <= up_to)
            .collect();
        let epm = Arc::clone(&self.epm);
        let mut outcome = FlushOutcome::default();
        for (dirty_from, id) in victims {
            let (ty, paddr, len) = {
                let extent = self.slab.get(id).expect("dirty extent resident");
                (extent.ty, extent.paddr, extent.length)
            };
            if ty.is_root() {
                continue;
            }
            let addr = paddr
                .as_absolute()
                .expect("dirty extent has an absolute address");
            {
                let extent = self.slab.get(id).expect("dirty extent resident");
                epm.write_at(cx, addr, extent.buf.as_slice())?;
            }
            {
                let extent = self.slab.get_mut(id).expect("dirty extent resident");
                extent.state = ExtentState::Clean;
                extent.dirty_from = None;
            }
            self.dirty.remove(dirty_from, id, len);
            self.touch_extent(id);
            outcome.extents += 1;
            outcome.bytes += u64::from(len);
        }
        info!(
            target: "silt::cache",
            event = "flush_dirty_through",
            up_to = up_to.0,
            extents = outcome.extents,
            bytes = outcome.bytes
        );
        Ok(outcome)
    }

    /// `dirty_from` of the oldest dirty extent, if any.
    #[must_use]
    pub fn get_oldest_dirty_from(&self) -> Option<JournalSeq> {
        self.dirty.oldest()
    }

    /// Oldest buffered back-reference sequence, if any.
    #[must_use]
    pub fn get_oldest_backref_dirty_from(&self) -> Option<JournalSeq> {
        self.backrefs.oldest_seq()
    }

    // ── back-reference surface ──────────────────────────────────────────

    /// Append a back-reference batch under `seq`; the back-reference tree
    /// manager uses this during its own replay paths.
    pub fn backref_batch_update(&mut self, ops: Vec<BackrefOp>, seq: JournalSeq) {
        self.backrefs.batch_update(ops, seq);
    }

    /// Drop buffered batches with sequence <= `up_to`; called once the
    /// back-reference tree has absorbed them.
    pub fn trim_backref_bufs(&mut self, up_to: JournalSeq) {
        self.backrefs.trim(up_to);
    }

    /// Pending back-reference insertions intersecting `[start, end)`.
    #[must_use]
    pub fn get_backrefs_in_range(&self, start: u64, end: u64) -> Vec<BackrefEntry> {
        self.backrefs.backrefs_in_range(start, end)
    }

    /// Pending back-reference removals intersecting `[start, end)`.
    #[must_use]
    pub fn get_del_backrefs_in_range(&self, start: u64, end: u64) -> Vec<BackrefEntry> {
        self.backrefs.del_backrefs_in_range(start, end)
    }

    /// Resident back-reference tree nodes with addresses in `[start, end)`.
    #[must_use]
    pub fn get_backref_extents_in_range(&self, start: u64, end: u64) -> Vec<(u64, ExtentType)> {
        self.backrefs.backref_extents_in_range(start, end)
    }

    // ── introspection ───────────────────────────────────────────────────

    /// Snapshot of an extent's identity and state, if still resident in
    /// the slab.
    #[must_use]
    pub fn extent_info(&self, id: ExtentId) -> Option<ExtentInfo> {
        self.slab.get(id).map(Extent::info)
    }

    /// The extent's buffer contents.
    #[must_use]
    pub fn extent_bytes(&self, id: ExtentId) -> Option<&[u8]> {
        self.slab.get(id).map(|extent| extent.buf.as_slice())
    }

    /// Writable view of a pending extent owned by `t`.
    ///
    /// Only fresh extents and mutation shadows are writable, and only
    /// before the transaction is prepared.
    pub fn extent_bytes_mut(&mut self, t: &Transaction, id: ExtentId) -> &mut [u8] {
        assert!(
            t.owns_pending(id),
            "extent {id} is not writable in transaction {}",
            t.id()
        );
        assert!(
            self.commit_in_flight != Some(t.id()),
            "extent {id} mutated after prepare_record"
        );
        self.slab
            .get_mut(id)
            .expect("pending extent resident")
            .buf
            .as_mut_slice()
    }

    /// Assign the logical address of a fresh logical extent before commit.
    pub fn set_extent_laddr(&mut self, t: &Transaction, id: ExtentId, laddr: LogicalAddr) {
        assert!(
            t.owns_pending(id),
            "extent {id} is not writable in transaction {}",
            t.id()
        );
        assert!(
            self.commit_in_flight != Some(t.id()),
            "extent {id} relabeled after prepare_record"
        );
        let extent = self.slab.get_mut(id).expect("pending extent resident");
        assert!(
            extent.ty.is_logical(),
            "laddr assigned to physical extent of type {}",
            extent.ty
        );
        extent.laddr = laddr;
    }

    /// The resident occupant of `addr`, placeholders included. No counters.
    #[must_use]
    pub fn extent_at(&self, addr: u64) -> Option<ExtentId> {
        self.index.get(addr)
    }

    /// Resident extents with addresses in `[start, end)`, address order.
    #[must_use]
    pub fn extents_in_range(&self, start: u64, end: u64) -> Vec<ExtentId> {
        self.index.range(start, end).map(|(_, id)| id).collect()
    }

    /// Subscribe to an extent's I/O-wait signal.
    ///
    /// If no I/O is in flight the ticket is already complete. Waiters
    /// resume in FIFO order, exactly once.
    pub fn subscribe_io(&mut self, id: ExtentId) -> Option<IoTicket> {
        self.slab.get_mut(id).map(|extent| extent.waiters.subscribe())
    }

    /// The journal sequence of the most recent completed commit.
    #[must_use]
    pub fn last_commit(&self) -> JournalSeq {
        self.last_commit
    }

    /// Accounting snapshot.
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        let c = &self.counters;
        CacheStats {
            created_by_src: c.created_by_src,
            committed_by_src: c.committed_by_src,
            invalidated_by_src: c.invalidated_by_src,
            access_by_src_ext: c.access_by_src_ext,
            hit_by_src_ext: c.hit_by_src_ext,
            conflict_matrix: c.conflict_matrix,
            invalidated_extents_by_type: c.invalidated_extents_by_type,
            fresh_committed_by_type: c.fresh_committed_by_type,
            mutations_committed_by_type: c.mutations_committed_by_type,
            retired_committed_by_type: c.retired_committed_by_type,
            mutation_delta_bytes: c.mutation_delta_bytes,
            resident_extents: self.index.len(),
            resident_bytes: self.resident_bytes,
            dirty_extents: self.dirty.len(),
            dirty_bytes: self.dirty.bytes(),
            lru_extents: self.lru.contents_extents(),
            lru_bytes: self.lru.contents_bytes(),
        }
    }

    // ── internals ───────────────────────────────────────────────────────

    fn check_conflict(&self, t: &mut Transaction) -> Result<()> {
        if self.conflicted.contains(&t.id()) {
            t.mark_conflicted();
            return Err(SiltError::Conflict { txn: t.id().0 });
        }
        Ok(())
    }

    /// Follow placeholder-replacement forwarding links.
    fn resolve_id(&self, mut id: ExtentId) -> ExtentId {
        while let Some(successor) = self.slab.get(id).and_then(|extent| extent.successor) {
            id = successor;
        }
        id
    }

    fn pin(&mut self, id: ExtentId) {
        self.slab
            .get_mut(id)
            .expect("pin of released extent")
            .pins += 1;
    }

    /// Release one pin; at zero the extent is dropped if detached, or
    /// detached and dropped if it was shed from the LRU while pinned.
    fn release_pin(&mut self, id: ExtentId) {
        let Some(extent) = self.slab.get_mut(id) else {
            return;
        };
        assert!(extent.pins > 0, "pin underflow on extent {id}");
        extent.pins -= 1;
        if extent.pins > 0 {
            return;
        }
        let in_index = extent.in_index;
        let clean = extent.state.is_clean();
        let placeholder = extent.is_placeholder();
        if !in_index {
            // The current root is permanently pinned by the cache itself,
            // so a zero pin count here is always a superseded instance.
            assert_ne!(self.root, Some(id), "root pin dropped");
            self.drop_extent(id);
            return;
        }
        if clean && !placeholder {
            debug_assert!(!self.lru.contains(id));
            self.detach_from_index(id);
            self.drop_extent(id);
        }
    }

    fn drop_extent(&mut self, id: ExtentId) {
        let extent = self.slab.remove(id).expect("drop of released extent");
        assert!(
            !extent.waiters.is_armed(),
            "extent {id} released with I/O in flight"
        );
        assert!(!extent.in_index, "extent {id} released while indexed");
        trace!(target: "silt::cache", event = "extent_released", extent = id.0);
    }

    fn attach_to_index(&mut self, addr: u64, id: ExtentId) {
        let extent = self.slab.get_mut(id).expect("attach of released extent");
        assert!(!extent.in_index);
        debug_assert_eq!(extent.paddr, PhysAddr::Absolute(addr));
        extent.in_index = true;
        let len = extent.length;
        self.index.insert(addr, id);
        self.resident_bytes = self.resident_bytes.saturating_add(u64::from(len));
    }

    fn detach_from_index(&mut self, id: ExtentId) {
        let Some(extent) = self.slab.get_mut(id) else {
            return;
        };
        if !extent.in_index {
            return;
        }
        extent.in_index = false;
        let addr = extent
            .paddr
            .as_absolute()
            .expect("indexed extent has an absolute address");
        let len = extent.length;
        let removed = self.index.remove(addr);
        assert_eq!(removed, Some(id), "index out of sync at {addr:#x}");
        self.resident_bytes = self.resident_bytes.saturating_sub(u64::from(len));
    }

    /// Full detach: index, dirty list, LRU; the extent becomes invalid and
    /// is dropped once unpinned.
    fn remove_extent(&mut self, id: ExtentId) {
        let (dirty_from, len) = {
            let Some(extent) = self.slab.get(id) else {
                return;
            };
            (extent.dirty_from, extent.length)
        };
        self.detach_from_index(id);
        if let Some(dirty_from) = dirty_from {
            self.dirty.remove(dirty_from, id, len);
        }
        if self.lru.remove(id) {
            self.release_pin(id);
        }
        let extent = self.slab.get_mut(id).expect("remove of released extent");
        extent.state = ExtentState::Invalid;
        if extent.pins == 0 {
            self.drop_extent(id);
        }
    }

    fn query_cache(
        &mut self,
        addr: u64,
        metric: Option<(TxnSource, ExtentType)>,
    ) -> Option<ExtentId> {
        let cached = self.index.get(addr);
        if let Some((src, ty)) = metric {
            let hit = cached.is_some_and(|id| {
                self.slab
                    .get(id)
                    .is_some_and(|extent| !extent.is_placeholder())
            });
            self.counters.record_access(src, ty, hit);
        }
        cached
    }

    fn get_extent_inner(
        &mut self,
        cx: &Cx,
        ty: ExtentType,
        addr: u64,
        len: u32,
        laddr: LogicalAddr,
        metric: Option<TxnSource>,
    ) -> Result<ExtentId> {
        assert!(
            !ty.is_placeholder() && !ty.is_root(),
            "typed read of {ty} extents"
        );
        assert!(len > 0, "typed read of zero length");
        let metric_key = metric.map(|src| (src, ty));
        match self.query_cache(addr, metric_key) {
            None => {
                debug!(
                    target: "silt::cache",
                    event = "extent_absent",
                    ty = %ty,
                    addr,
                    len
                );
                let id = self.install_pending_extent(ty, addr, len, laddr);
                self.read_extent(cx, id)
            }
            Some(cached) => {
                let (cached_ty, cached_len) = {
                    let extent = self.slab.get(cached).expect("indexed extent resident");
                    (extent.ty, extent.length)
                };
                if cached_ty.is_placeholder() {
                    debug!(
                        target: "silt::cache",
                        event = "extent_absent_placeholder",
                        ty = %ty,
                        addr,
                        len
                    );
                    let id = self.replace_placeholder(cached, ty, addr, len, laddr);
                    self.read_extent(cx, id)
                } else {
                    assert_eq!(
                        cached_ty, ty,
                        "type mismatch at {addr:#x}: cached {cached_ty}, requested {ty}"
                    );
                    assert_eq!(cached_len, len, "length mismatch at {addr:#x}");
                    trace!(
                        target: "silt::cache",
                        event = "extent_present",
                        ty = %ty,
                        addr
                    );
                    Ok(cached)
                }
            }
        }
    }

    fn install_pending_extent(
        &mut self,
        ty: ExtentType,
        addr: u64,
        len: u32,
        laddr: LogicalAddr,
    ) -> ExtentId {
        let id = self.slab.allocate_id();
        let mut extent = Extent::new(
            id,
            ty,
            ExtentState::CleanPending,
            PhysAddr::Absolute(addr),
            laddr,
            len,
            AlignedBuf::zeroed(len as usize),
        );
        extent.waiters.arm();
        self.slab.insert(extent);
        self.attach_to_index(addr, id);
        id
    }

    /// Replace a placeholder in place with a real extent of `ty`.
    ///
    /// Transactions that referenced the placeholder keep their handles;
    /// a forwarding link and a copy of the reader index migrate them onto
    /// the replacement.
    fn replace_placeholder(
        &mut self,
        old: ExtentId,
        ty: ExtentType,
        addr: u64,
        len: u32,
        laddr: LogicalAddr,
    ) -> ExtentId {
        let old_len = self.slab.get(old).expect("placeholder resident").length;
        assert_eq!(old_len, len, "placeholder length mismatch at {addr:#x}");

        let new_id = self.slab.allocate_id();
        let mut extent = Extent::new(
            new_id,
            ty,
            ExtentState::CleanPending,
            PhysAddr::Absolute(addr),
            laddr,
            len,
            AlignedBuf::zeroed(len as usize),
        );
        extent.waiters.arm();
        extent.in_index = true;
        self.slab.insert(extent);
        let displaced = self.index.replace(addr, new_id);
        assert_eq!(displaced, old);

        if let Some(readers) = self.reads.get(&old).cloned() {
            self.reads.entry(new_id).or_default().extend(readers);
        }
        let old_extent = self.slab.get_mut(old).expect("placeholder resident");
        old_extent.in_index = false;
        old_extent.state = ExtentState::Invalid;
        old_extent.successor = Some(new_id);
        debug!(
            target: "silt::cache",
            event = "placeholder_replaced",
            addr,
            old = old.0,
            new = new_id.0
        );
        new_id
    }

    /// Issue the device read for a CLEAN_PENDING extent and deliver its
    /// waiters. On failure the extent leaves the index and the error
    /// propagates.
    fn read_extent(&mut self, cx: &Cx, id: ExtentId) -> Result<ExtentId> {
        let epm = Arc::clone(&self.epm);
        let addr = {
            let extent = self.slab.get(id).expect("pending extent resident");
            assert_eq!(extent.state, ExtentState::CleanPending);
            extent
                .paddr
                .as_absolute()
                .expect("pending extent has an absolute address")
        };
        let read_result = {
            let extent = self.slab.get_mut(id).expect("pending extent resident");
            epm.read(cx, addr, extent.buf.as_mut_slice())
        };
        match read_result {
            Ok(()) => {
                let extent = self.slab.get_mut(id).expect("pending extent resident");
                extent.state = ExtentState::Clean;
                extent.last_committed_crc = extent.compute_crc();
                extent.waiters.complete(Ok(()));
                debug!(
                    target: "silt::cache",
                    event = "read_extent_done",
                    extent = id.0,
                    addr
                );
                Ok(id)
            }
            Err(err) => {
                warn!(
                    target: "silt::cache",
                    event = "read_extent_failed",
                    extent = id.0,
                    addr,
                    error = %err
                );
                {
                    let extent = self.slab.get_mut(id).expect("pending extent resident");
                    extent.waiters.complete(Err(IoFailure {
                        detail: err.to_string(),
                    }));
                    extent.state = ExtentState::Invalid;
                }
                self.detach_from_index(id);
                let pins = self.slab.get(id).map_or(0, |extent| extent.pins);
                if pins == 0 {
                    self.drop_extent(id);
                }
                Err(err)
            }
        }
    }

    fn add_to_read_set_of(&mut self, t: &mut Transaction, addr: PhysAddr, id: ExtentId) {
        let version = self.slab.get(id).map_or(0, |extent| extent.version);
        if t.add_to_read_set(
            addr,
            ReadSetEntry {
                extent: id,
                version,
            },
        ) {
            self.pin(id);
            self.reads.entry(id).or_default().insert(t.id());
        }
    }

    /// LRU touch: clean, non-placeholder, non-root extents only.
    fn touch_extent(&mut self, id: ExtentId) {
        let (eligible, len) = {
            let Some(extent) = self.slab.get(id) else {
                return;
            };
            (
                extent.state.is_clean() && !extent.is_placeholder() && !extent.ty.is_root(),
                extent.length,
            )
        };
        if !eligible {
            return;
        }
        if !self.lru.contains(id) {
            self.pin(id);
        }
        let shed = self.lru.move_to_top(id, len);
        for victim in shed {
            self.release_pin(victim);
        }
    }

    /// Mark every live reader of `extent_id` (except the committer)
    /// conflicted, with conflict-matrix accounting.
    fn invalidate_dependents(
        &mut self,
        extent_id: ExtentId,
        committing: TxnId,
        committing_src: TxnSource,
        ty: ExtentType,
    ) {
        let Some(readers) = self.reads.get(&extent_id) else {
            return;
        };
        let readers: Vec<TxnId> = readers.iter().copied().collect();
        for tid in readers {
            if tid == committing {
                continue;
            }
            let Some(meta) = self.live_txns.get(&tid) else {
                continue;
            };
            let victim_src = meta.source;
            if self.conflicted.insert(tid) {
                self.counters.account_conflict(committing_src, victim_src);
                self.counters.invalidated_by_src[victim_src.index()] += 1;
                self.counters.invalidated_extents_by_type[ty.index()] += 1;
                debug!(
                    target: "silt::cache::commit",
                    event = "mark_transaction_conflicted",
                    txn = tid.0,
                    by = committing.0,
                    extent = extent_id.0
                );
            }
        }
    }

    fn fail_armed_waiters(&mut self, id: ExtentId, detail: &str) {
        if let Some(extent) = self.slab.get_mut(id) {
            if extent.waiters.is_armed() {
                extent.waiters.complete(Err(IoFailure {
                    detail: detail.to_owned(),
                }));
            }
        }
    }

    /// Drop the bookkeeping a transaction holds on the cache: reader-index
    /// entries and pins for its read set, fresh list, and shadows.
    fn release_txn_refs(&mut self, t: &Transaction) {
        let tid = t.id();
        let read_ids: Vec<ExtentId> = t.read_set().values().map(|entry| entry.extent).collect();
        for id in read_ids {
            if let Some(set) = self.reads.get_mut(&id) {
                set.remove(&tid);
                if set.is_empty() {
                    self.reads.remove(&id);
                }
            }
            let resolved = self.resolve_id(id);
            if resolved != id {
                if let Some(set) = self.reads.get_mut(&resolved) {
                    set.remove(&tid);
                    if set.is_empty() {
                        self.reads.remove(&resolved);
                    }
                }
            }
            self.release_pin(id);
        }
        let fresh: Vec<ExtentId> = t.fresh_blocks().to_vec();
        for id in fresh {
            self.release_pin(id);
        }
        let pairs: Vec<MutatedPair> = t.mutated_pairs().to_vec();
        for pair in pairs {
            self.release_pin(pair.next);
        }
    }
}

impl std::fmt::Debug for Cache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cache")
            .field("resident", &self.index.len())
            .field("slab", &self.slab.len())
            .field("dirty", &self.dirty.len())
            .field("lru_bytes", &self.lru.contents_bytes())
            .field("last_commit", &self.last_commit)
            .field("live_txns", &self.live_txns.len())
            .finish_non_exhaustive()
    }
}
