#![forbid(unsafe_code)]
//! Extent placement manager (EPM) interface and test backend.
//!
//! The cache consumes exactly three operations from the EPM: allocate a
//! fresh extent (buffer plus tentative address), read a range at an absolute
//! address, and place a serialized record. Physical layout policy lives
//! entirely behind this trait.

use asupersync::Cx;
use parking_lot::Mutex;
use silt_error::{Result, SiltError};
use silt_types::{align_up, u64_to_usize, ExtentType, PhysAddr, PlacementHint, BLOCK_ALIGN};
use std::sync::Arc;
use tracing::{debug, trace};

#[inline]
fn cx_checkpoint(cx: &Cx) -> Result<()> {
    cx.checkpoint().map_err(|_| SiltError::Cancelled)
}

// ── Aligned buffers ──────────────────────────────────────────────────────────

/// Owned byte buffer whose exposed slice starts on a 4096-byte boundary.
///
/// Fully safe: the original backing allocation is retained and an aligned
/// subslice is exposed.
#[derive(Debug, Clone)]
pub struct AlignedBuf {
    storage: Vec<u8>,
    start: usize,
    len: usize,
}

impl AlignedBuf {
    /// Allocate a zero-filled buffer of `len` bytes.
    #[must_use]
    pub fn zeroed(len: usize) -> Self {
        if len == 0 {
            return Self {
                storage: Vec::new(),
                start: 0,
                len: 0,
            };
        }
        let align = BLOCK_ALIGN as usize;
        let storage = vec![0_u8; len + align - 1];
        let base = storage.as_ptr() as usize;
        let misalignment = base & (align - 1);
        let start = if misalignment == 0 { 0 } else { align - misalignment };
        debug_assert!(start + len <= storage.len());
        Self { storage, start, len }
    }

    /// Build an aligned buffer holding a copy of `bytes`.
    #[must_use]
    pub fn from_slice(bytes: &[u8]) -> Self {
        let mut buf = Self::zeroed(bytes.len());
        buf.as_mut_slice().copy_from_slice(bytes);
        buf
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.storage[self.start..self.start + self.len]
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        let start = self.start;
        let end = start + self.len;
        &mut self.storage[start..end]
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[must_use]
    pub fn to_vec(&self) -> Vec<u8> {
        self.as_slice().to_vec()
    }
}

impl PartialEq for AlignedBuf {
    fn eq(&self, other: &Self) -> bool {
        self.as_slice() == other.as_slice()
    }
}

impl Eq for AlignedBuf {}

// ── EPM interface ────────────────────────────────────────────────────────────

/// Result of a fresh allocation.
#[derive(Debug)]
pub struct AllocatedExtent {
    /// Zero-filled, page-aligned buffer for the caller to fill.
    pub buf: AlignedBuf,
    /// Tentative address; may be `RecordRelative` until commit completion.
    pub paddr: PhysAddr,
}

/// Interface the cache consumes for placement and block I/O.
///
/// Implementations take `&self`; shared state lives behind interior
/// mutability so that callers can retain a handle across the cache boundary.
pub trait ExtentPlacementManager: Send + Sync {
    /// Allocate a buffer and a tentative physical address for a fresh extent.
    fn alloc_new_extent(
        &self,
        cx: &Cx,
        ty: ExtentType,
        len: u32,
        hint: PlacementHint,
    ) -> Result<AllocatedExtent>;

    /// Read exactly `buf.len()` bytes from absolute address `addr`.
    fn read(&self, cx: &Cx, addr: u64, buf: &mut [u8]) -> Result<()>;

    /// Durably place a serialized record, returning its start address.
    fn write_record(&self, cx: &Cx, bytes: &[u8]) -> Result<u64>;

    /// Write dirty extent contents back to its resolved address.
    ///
    /// Used by the flush path after the journal watermark passes the
    /// extent's dirty mark.
    fn write_at(&self, cx: &Cx, addr: u64, bytes: &[u8]) -> Result<()>;
}

// ── In-memory backend ────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct MemoryEpmInner {
    space: Vec<u8>,
    /// Next record placement offset; never moves backwards past a touched
    /// region.
    cursor: u64,
    next_relative: u64,
    reads_issued: u64,
    records_written: u64,
    allocs: u64,
}

impl MemoryEpmInner {
    fn ensure_len(&mut self, len: usize) {
        if self.space.len() < len {
            self.space.resize(len, 0);
            // Keep record placement clear of any region a caller has touched.
            let end = align_up(len as u64, u64::from(BLOCK_ALIGN)).unwrap_or(u64::MAX);
            self.cursor = self.cursor.max(end);
        }
    }
}

/// Flat in-memory placement manager for tests and development.
///
/// Records are bump-allocated at 4096-byte boundaries; reads of untouched
/// space observe zeros. Cloning shares the underlying space.
#[derive(Debug, Clone, Default)]
pub struct MemoryEpm {
    inner: Arc<Mutex<MemoryEpmInner>>,
}

impl MemoryEpm {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of device reads issued so far.
    #[must_use]
    pub fn reads_issued(&self) -> u64 {
        self.inner.lock().reads_issued
    }

    /// Number of records placed so far.
    #[must_use]
    pub fn records_written(&self) -> u64 {
        self.inner.lock().records_written
    }

    /// Number of fresh allocations served so far.
    #[must_use]
    pub fn allocs(&self) -> u64 {
        self.inner.lock().allocs
    }

    /// Copy of the bytes at `addr..addr + len`, for test assertions.
    #[must_use]
    pub fn contents(&self, addr: u64, len: usize) -> Vec<u8> {
        let mut inner = self.inner.lock();
        let start = usize::try_from(addr).expect("addr fits usize");
        inner.ensure_len(start + len);
        inner.space[start..start + len].to_vec()
    }

    /// Seed device contents directly, bypassing record placement.
    pub fn seed(&self, addr: u64, bytes: &[u8]) {
        let mut inner = self.inner.lock();
        let start = usize::try_from(addr).expect("addr fits usize");
        inner.ensure_len(start + bytes.len());
        inner.space[start..start + bytes.len()].copy_from_slice(bytes);
    }
}

impl ExtentPlacementManager for MemoryEpm {
    fn alloc_new_extent(
        &self,
        cx: &Cx,
        ty: ExtentType,
        len: u32,
        hint: PlacementHint,
    ) -> Result<AllocatedExtent> {
        cx_checkpoint(cx)?;
        assert!(len > 0 && len % BLOCK_ALIGN == 0, "extent length {len} not block aligned");
        let mut inner = self.inner.lock();
        let offset = inner.next_relative;
        inner.next_relative = inner.next_relative.saturating_add(u64::from(len));
        inner.allocs = inner.allocs.saturating_add(1);
        trace!(
            target: "silt::epm",
            event = "alloc_new_extent",
            ty = %ty,
            len,
            hint = ?hint,
            tentative = offset
        );
        Ok(AllocatedExtent {
            buf: AlignedBuf::zeroed(len as usize),
            paddr: PhysAddr::RecordRelative(offset),
        })
    }

    fn read(&self, cx: &Cx, addr: u64, buf: &mut [u8]) -> Result<()> {
        cx_checkpoint(cx)?;
        let mut inner = self.inner.lock();
        let start = u64_to_usize(addr, "read_addr")
            .map_err(|err| SiltError::Format(err.to_string()))?;
        let end = start
            .checked_add(buf.len())
            .ok_or_else(|| SiltError::Format("read range overflows usize".to_owned()))?;
        inner.ensure_len(end);
        buf.copy_from_slice(&inner.space[start..end]);
        inner.reads_issued = inner.reads_issued.saturating_add(1);
        trace!(target: "silt::epm", event = "read", addr, len = buf.len());
        cx_checkpoint(cx)?;
        Ok(())
    }

    fn write_record(&self, cx: &Cx, bytes: &[u8]) -> Result<u64> {
        cx_checkpoint(cx)?;
        let mut inner = self.inner.lock();
        let start = align_up(inner.cursor, u64::from(BLOCK_ALIGN))
            .ok_or_else(|| SiltError::Format("record cursor overflow".to_owned()))?;
        let start_usize = u64_to_usize(start, "record_start")
            .map_err(|err| SiltError::Format(err.to_string()))?;
        let end = start_usize
            .checked_add(bytes.len())
            .ok_or_else(|| SiltError::Format("record range overflows usize".to_owned()))?;
        inner.ensure_len(end);
        inner.space[start_usize..end].copy_from_slice(bytes);
        inner.cursor = end as u64;
        inner.records_written = inner.records_written.saturating_add(1);
        debug!(
            target: "silt::epm",
            event = "write_record",
            start,
            len = bytes.len()
        );
        cx_checkpoint(cx)?;
        Ok(start)
    }

    fn write_at(&self, cx: &Cx, addr: u64, bytes: &[u8]) -> Result<()> {
        cx_checkpoint(cx)?;
        let mut inner = self.inner.lock();
        let start = u64_to_usize(addr, "write_addr")
            .map_err(|err| SiltError::Format(err.to_string()))?;
        let end = start
            .checked_add(bytes.len())
            .ok_or_else(|| SiltError::Format("write range overflows usize".to_owned()))?;
        inner.ensure_len(end);
        inner.space[start..end].copy_from_slice(bytes);
        trace!(target: "silt::epm", event = "write_at", addr, len = bytes.len());
        cx_checkpoint(cx)?;
        Ok(())
    }
}
