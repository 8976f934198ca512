//! The extent record: identity, state machine, buffer, and I/O-wait signal.
//!
//! An extent is the cache's unit of residency: an owned page-aligned buffer
//! at a physical address, tagged with a type and a lifecycle state. Retired
//! placeholders are extents of type `RETIRED_PLACEHOLDER` carrying only an
//! address and a length; they occupy an index slot without contents.

use parking_lot::Mutex;
use silt_epm::AlignedBuf;
use silt_types::{ExtentId, ExtentType, JournalSeq, LogicalAddr, PhysAddr};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

/// Lifecycle state of a resident extent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtentState {
    /// Fresh allocation, address unresolved until commit completion.
    InitialWritePending,
    /// Writable shadow of an existing extent, commit pending.
    MutationPending,
    /// Installed in the index, device read in flight.
    CleanPending,
    /// Buffer matches what was last durably written at the address.
    Clean,
    /// Mutated since the last flush; `dirty_from` bounds the journal replay.
    Dirty,
    /// Superseded or retired; unreachable from the index.
    Invalid,
}

impl ExtentState {
    #[must_use]
    pub fn is_clean(self) -> bool {
        matches!(self, Self::Clean)
    }

    #[must_use]
    pub fn is_dirty(self) -> bool {
        matches!(self, Self::Dirty)
    }

    #[must_use]
    pub fn is_pending(self) -> bool {
        matches!(
            self,
            Self::InitialWritePending | Self::MutationPending | Self::CleanPending
        )
    }

    #[must_use]
    pub fn is_valid(self) -> bool {
        !matches!(self, Self::Invalid)
    }
}

impl fmt::Display for ExtentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::InitialWritePending => "INITIAL_WRITE_PENDING",
            Self::MutationPending => "MUTATION_PENDING",
            Self::CleanPending => "CLEAN_PENDING",
            Self::Clean => "CLEAN",
            Self::Dirty => "DIRTY",
            Self::Invalid => "INVALID",
        };
        f.write_str(name)
    }
}

// ── I/O-wait signal ─────────────────────────────────────────────────────────

/// Failure payload delivered to I/O waiters.
///
/// Kept separate from `SiltError` so it can be cloned into every waiter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IoFailure {
    pub detail: String,
}

#[derive(Debug)]
enum TicketState {
    Waiting,
    Done {
        order: u64,
        result: Result<(), IoFailure>,
    },
}

/// One-shot completion handle obtained while an extent has I/O in flight.
///
/// Tickets are fulfilled exactly once, in FIFO subscription order; the
/// completion order is observable for waiters that care about resume
/// sequencing.
#[derive(Debug, Clone)]
pub struct IoTicket {
    state: Arc<Mutex<TicketState>>,
}

impl IoTicket {
    fn ready(order: u64) -> Self {
        Self {
            state: Arc::new(Mutex::new(TicketState::Done {
                order,
                result: Ok(()),
            })),
        }
    }

    #[must_use]
    pub fn is_complete(&self) -> bool {
        matches!(&*self.state.lock(), TicketState::Done { .. })
    }

    /// The completion result, if delivered.
    #[must_use]
    pub fn result(&self) -> Option<Result<(), IoFailure>> {
        match &*self.state.lock() {
            TicketState::Waiting => None,
            TicketState::Done { result, .. } => Some(result.clone()),
        }
    }

    /// Position in the global completion sequence, if delivered.
    #[must_use]
    pub fn completion_order(&self) -> Option<u64> {
        match &*self.state.lock() {
            TicketState::Waiting => None,
            TicketState::Done { order, .. } => Some(*order),
        }
    }
}

/// Per-extent I/O-wait queue: one-shot, multi-waiter, FIFO delivery.
///
/// Armed on entering a pending state, completed exactly once regardless of
/// which path finishes the I/O.
#[derive(Debug, Default)]
pub struct IoWaiters {
    armed: bool,
    queue: VecDeque<Arc<Mutex<TicketState>>>,
    next_order: u64,
}

impl IoWaiters {
    pub(crate) fn arm(&mut self) {
        assert!(!self.armed, "io-wait armed twice");
        self.armed = true;
    }

    #[must_use]
    pub(crate) fn is_armed(&self) -> bool {
        self.armed
    }

    pub(crate) fn subscribe(&mut self) -> IoTicket {
        if !self.armed {
            let order = self.next_order;
            self.next_order += 1;
            return IoTicket::ready(order);
        }
        let state = Arc::new(Mutex::new(TicketState::Waiting));
        self.queue.push_back(Arc::clone(&state));
        IoTicket { state }
    }

    /// Deliver completion to every waiter, FIFO, exactly once.
    pub(crate) fn complete(&mut self, result: Result<(), IoFailure>) {
        assert!(self.armed, "io-wait completed while not armed");
        self.armed = false;
        while let Some(state) = self.queue.pop_front() {
            let order = self.next_order;
            self.next_order += 1;
            *state.lock() = TicketState::Done {
                order,
                result: result.clone(),
            };
        }
    }
}

// ── Extent record ───────────────────────────────────────────────────────────

/// A resident extent.
///
/// Fields are crate-internal; the facade hands out `ExtentId` handles and
/// `ExtentInfo` snapshots.
#[derive(Debug)]
pub(crate) struct Extent {
    pub(crate) id: ExtentId,
    pub(crate) ty: ExtentType,
    pub(crate) state: ExtentState,
    pub(crate) paddr: PhysAddr,
    pub(crate) laddr: LogicalAddr,
    pub(crate) length: u32,
    pub(crate) buf: AlignedBuf,
    /// Committed mutation counter; read sets record the observed value.
    pub(crate) version: u64,
    pub(crate) dirty_from: Option<JournalSeq>,
    pub(crate) last_committed_crc: u32,
    pub(crate) waiters: IoWaiters,
    /// Transaction and LRU references; the extent is released when this
    /// reaches zero off-index.
    pub(crate) pins: u32,
    pub(crate) in_index: bool,
    /// Set when a placeholder is replaced in place; handles held by
    /// transactions forward through this link.
    pub(crate) successor: Option<ExtentId>,
}

impl Extent {
    pub(crate) fn new(
        id: ExtentId,
        ty: ExtentType,
        state: ExtentState,
        paddr: PhysAddr,
        laddr: LogicalAddr,
        length: u32,
        buf: AlignedBuf,
    ) -> Self {
        Self {
            id,
            ty,
            state,
            paddr,
            laddr,
            length,
            buf,
            version: 0,
            dirty_from: None,
            last_committed_crc: 0,
            waiters: IoWaiters::default(),
            pins: 0,
            in_index: false,
            successor: None,
        }
    }

    /// Sentinel occupying an address slot during retire, without contents.
    pub(crate) fn placeholder(id: ExtentId, addr: u64, length: u32) -> Self {
        Self::new(
            id,
            ExtentType::RetiredPlaceholder,
            ExtentState::Clean,
            PhysAddr::Absolute(addr),
            LogicalAddr::NULL,
            length,
            AlignedBuf::zeroed(0),
        )
    }

    #[must_use]
    pub(crate) fn is_placeholder(&self) -> bool {
        self.ty.is_placeholder()
    }

    #[must_use]
    pub(crate) fn compute_crc(&self) -> u32 {
        crc32c::crc32c(self.buf.as_slice())
    }

    /// Resolve a fresh extent's final address once its record is durable.
    pub(crate) fn complete_initial_write(&mut self, addr: u64) {
        assert_eq!(
            self.state,
            ExtentState::InitialWritePending,
            "complete_initial_write on {} extent",
            self.state
        );
        self.paddr = PhysAddr::Absolute(addr);
    }

    pub(crate) fn info(&self) -> ExtentInfo {
        ExtentInfo {
            id: self.id,
            ty: self.ty,
            state: self.state,
            paddr: self.paddr,
            laddr: self.laddr,
            length: self.length,
            version: self.version,
            dirty_from: self.dirty_from,
            last_committed_crc: self.last_committed_crc,
        }
    }
}

/// Public snapshot of an extent's identity and state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtentInfo {
    pub id: ExtentId,
    pub ty: ExtentType,
    pub state: ExtentState,
    pub paddr: PhysAddr,
    pub laddr: LogicalAddr,
    pub length: u32,
    pub version: u64,
    pub dirty_from: Option<JournalSeq>,
    pub last_committed_crc: u32,
}
