#![forbid(unsafe_code)]
//! Core identifier and address types for SiltStore.
//!
//! Everything here is a unit-carrying wrapper: physical and logical
//! addresses, journal sequences, transaction and extent handles, plus the
//! closed extent-type and transaction-source enumerations shared by the
//! cache, the extent placement manager, and the record codec.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Alignment of every extent buffer and record placement, in bytes.
pub const BLOCK_ALIGN: u32 = 4096;

/// Physical address of an extent on the backing device.
///
/// Fresh extents carry a `RecordRelative` address from allocation until
/// commit completion, at which point the address is resolved against the
/// record's durable start offset. `Null` is reserved for extents that are
/// never placed directly (the root block).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub enum PhysAddr {
    #[default]
    Null,
    /// Final device offset.
    Absolute(u64),
    /// Offset within a not-yet-durable record.
    RecordRelative(u64),
}

impl PhysAddr {
    #[must_use]
    pub fn is_null(self) -> bool {
        matches!(self, Self::Null)
    }

    #[must_use]
    pub fn is_absolute(self) -> bool {
        matches!(self, Self::Absolute(_))
    }

    #[must_use]
    pub fn is_relative(self) -> bool {
        matches!(self, Self::RecordRelative(_))
    }

    /// The device offset, if already resolved.
    #[must_use]
    pub fn as_absolute(self) -> Option<u64> {
        match self {
            Self::Absolute(addr) => Some(addr),
            _ => None,
        }
    }

    /// Resolve against a durable record start offset.
    ///
    /// Absolute addresses pass through unchanged; a relative address becomes
    /// `record_start + offset`. Resolving `Null` or overflowing is an error.
    pub fn resolve(self, record_start: u64) -> Result<u64, AddrError> {
        match self {
            Self::Absolute(addr) => Ok(addr),
            Self::RecordRelative(offset) => record_start
                .checked_add(offset)
                .ok_or(AddrError::Overflow { record_start, offset }),
            Self::Null => Err(AddrError::NullResolve),
        }
    }
}

impl fmt::Display for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "null"),
            Self::Absolute(addr) => write!(f, "{addr:#x}"),
            Self::RecordRelative(offset) => write!(f, "rel+{offset:#x}"),
        }
    }
}

/// Logical address assigned by the logical-address tree manager.
///
/// `NULL` marks physical extents (tree nodes) that have no logical identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LogicalAddr(pub u64);

impl LogicalAddr {
    pub const NULL: Self = Self(u64::MAX);

    #[must_use]
    pub fn is_null(self) -> bool {
        self == Self::NULL
    }
}

impl fmt::Display for LogicalAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            write!(f, "laddr=null")
        } else {
            write!(f, "{:#x}", self.0)
        }
    }
}

/// Monotonically increasing tag identifying a durable journal record.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct JournalSeq(pub u64);

impl JournalSeq {
    pub const MIN: Self = Self(0);

    #[must_use]
    pub fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl fmt::Display for JournalSeq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque transaction identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TxnId(pub u64);

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque handle to a resident extent.
///
/// Handles are stable for the lifetime of the extent instance; dereferencing
/// a handle whose extent was invalidated and released is a well-defined
/// lookup miss, never a dangling pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ExtentId(pub u64);

impl fmt::Display for ExtentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Extent types ─────────────────────────────────────────────────────────────

/// Closed enumeration of extent types known to the engine.
///
/// The discriminant doubles as an index into per-type counter arrays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ExtentType {
    Root = 0,
    LaddrInternal = 1,
    LaddrLeaf = 2,
    OmapInner = 3,
    OmapLeaf = 4,
    OnodeBlockStaged = 5,
    BackrefInternal = 6,
    BackrefLeaf = 7,
    ObjectData = 8,
    TestBlock = 9,
    RetiredPlaceholder = 10,
}

/// Number of extent types, for counter arrays.
pub const EXTENT_TYPE_COUNT: usize = 11;

impl ExtentType {
    pub const ALL: [Self; EXTENT_TYPE_COUNT] = [
        Self::Root,
        Self::LaddrInternal,
        Self::LaddrLeaf,
        Self::OmapInner,
        Self::OmapLeaf,
        Self::OnodeBlockStaged,
        Self::BackrefInternal,
        Self::BackrefLeaf,
        Self::ObjectData,
        Self::TestBlock,
        Self::RetiredPlaceholder,
    ];

    /// Index into per-type counter arrays.
    #[must_use]
    pub fn index(self) -> usize {
        self as usize
    }

    /// Whether extents of this type carry a logical address.
    #[must_use]
    pub fn is_logical(self) -> bool {
        matches!(
            self,
            Self::OmapInner
                | Self::OmapLeaf
                | Self::OnodeBlockStaged
                | Self::ObjectData
                | Self::TestBlock
        )
    }

    /// Whether extents of this type are back-reference tree nodes.
    #[must_use]
    pub fn is_backref_node(self) -> bool {
        matches!(self, Self::BackrefInternal | Self::BackrefLeaf)
    }

    #[must_use]
    pub fn is_placeholder(self) -> bool {
        matches!(self, Self::RetiredPlaceholder)
    }

    #[must_use]
    pub fn is_root(self) -> bool {
        matches!(self, Self::Root)
    }
}

impl fmt::Display for ExtentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Root => "ROOT",
            Self::LaddrInternal => "LADDR_INTERNAL",
            Self::LaddrLeaf => "LADDR_LEAF",
            Self::OmapInner => "OMAP_INNER",
            Self::OmapLeaf => "OMAP_LEAF",
            Self::OnodeBlockStaged => "ONODE_BLOCK_STAGED",
            Self::BackrefInternal => "BACKREF_INTERNAL",
            Self::BackrefLeaf => "BACKREF_LEAF",
            Self::ObjectData => "OBJECT_DATA",
            Self::TestBlock => "TEST_BLOCK",
            Self::RetiredPlaceholder => "RETIRED_PLACEHOLDER",
        };
        f.write_str(name)
    }
}

// ── Transaction sources ──────────────────────────────────────────────────────

/// Categorical origin of a transaction, for accounting and conflict matrices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum TxnSource {
    Read = 0,
    Mutate = 1,
    CleanerTrim = 2,
    CleanerReclaim = 3,
    TrimBackref = 4,
}

/// Number of transaction sources, for counter arrays.
pub const TXN_SOURCE_COUNT: usize = 5;

impl TxnSource {
    pub const ALL: [Self; TXN_SOURCE_COUNT] = [
        Self::Read,
        Self::Mutate,
        Self::CleanerTrim,
        Self::CleanerReclaim,
        Self::TrimBackref,
    ];

    #[must_use]
    pub fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for TxnSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Read => "READ",
            Self::Mutate => "MUTATE",
            Self::CleanerTrim => "CLEANER_TRIM",
            Self::CleanerReclaim => "CLEANER_RECLAIM",
            Self::TrimBackref => "TRIM_BACKREF",
        };
        f.write_str(name)
    }
}

/// Placement hint passed through to the extent placement manager.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub enum PlacementHint {
    #[default]
    Hot,
    Cold,
    Rewrite,
}

// ── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AddrError {
    #[error("cannot resolve a null physical address")]
    NullResolve,
    #[error("address resolution overflow: record_start={record_start:#x} offset={offset:#x}")]
    Overflow { record_start: u64, offset: u64 },
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WireError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    Truncated {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
    #[error("integer conversion failed: {field}")]
    IntegerConversion { field: &'static str },
}

// ── Little-endian read helpers ───────────────────────────────────────────────

#[inline]
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], WireError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(WireError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };
    if end > data.len() {
        return Err(WireError::Truncated {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }
    Ok(&data[offset..end])
}

#[inline]
pub fn read_le_u16(data: &[u8], offset: usize) -> Result<u16, WireError> {
    let bytes = ensure_slice(data, offset, 2)?;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

#[inline]
pub fn read_le_u32(data: &[u8], offset: usize) -> Result<u32, WireError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[inline]
pub fn read_le_u64(data: &[u8], offset: usize) -> Result<u64, WireError> {
    let bytes = ensure_slice(data, offset, 8)?;
    Ok(u64::from_le_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ]))
}

// ── Checked arithmetic helpers ───────────────────────────────────────────────

/// Round `value` up to the nearest multiple of `alignment`.
///
/// `alignment` must be a non-zero power of two; returns `None` on overflow
/// or if `alignment` is invalid.
#[must_use]
pub fn align_up(value: u64, alignment: u64) -> Option<u64> {
    if alignment == 0 || !alignment.is_power_of_two() {
        return None;
    }
    let mask = alignment - 1;
    value.checked_add(mask).map(|v| v & !mask)
}

/// Narrow a `u64` to `usize` with an explicit error path.
pub fn u64_to_usize(value: u64, field: &'static str) -> Result<usize, WireError> {
    usize::try_from(value).map_err(|_| WireError::IntegerConversion { field })
}

/// Narrow a `usize` to `u32` with an explicit error path.
pub fn usize_to_u32(value: usize, field: &'static str) -> Result<u32, WireError> {
    u32::try_from(value).map_err(|_| WireError::IntegerConversion { field })
}
