//! Cache accounting: monotonic counters and the snapshot type.
//!
//! Counters are keyed the way operators ask questions: by transaction
//! source, by extent type, and (for conflicts) by the unordered pair of
//! sources involved. The pair matrix uses triangular indexing so each
//! combination gets exactly one cell.

use silt_types::{ExtentType, TxnSource, EXTENT_TYPE_COUNT, TXN_SOURCE_COUNT};

/// Number of unordered source pairs.
pub const SRC_PAIR_COUNT: usize = TXN_SOURCE_COUNT * (TXN_SOURCE_COUNT + 1) / 2;

/// Cell index for an unordered source pair.
#[must_use]
pub fn src_pair_index(a: TxnSource, b: TxnSource) -> usize {
    let (lo, hi) = if a.index() <= b.index() {
        (a.index(), b.index())
    } else {
        (b.index(), a.index())
    };
    let index = TXN_SOURCE_COUNT * lo + hi - lo * (lo + 1) / 2;
    debug_assert!(index < SRC_PAIR_COUNT);
    index
}

#[derive(Debug, Clone)]
pub(crate) struct CacheCounters {
    pub(crate) created_by_src: [u64; TXN_SOURCE_COUNT],
    pub(crate) committed_by_src: [u64; TXN_SOURCE_COUNT],
    pub(crate) invalidated_by_src: [u64; TXN_SOURCE_COUNT],
    pub(crate) access_by_src_ext: [[u64; EXTENT_TYPE_COUNT]; TXN_SOURCE_COUNT],
    pub(crate) hit_by_src_ext: [[u64; EXTENT_TYPE_COUNT]; TXN_SOURCE_COUNT],
    pub(crate) conflict_matrix: [u64; SRC_PAIR_COUNT],
    pub(crate) invalidated_extents_by_type: [u64; EXTENT_TYPE_COUNT],
    pub(crate) fresh_committed_by_type: [u64; EXTENT_TYPE_COUNT],
    pub(crate) mutations_committed_by_type: [u64; EXTENT_TYPE_COUNT],
    pub(crate) retired_committed_by_type: [u64; EXTENT_TYPE_COUNT],
    pub(crate) mutation_delta_bytes: u64,
}

impl Default for CacheCounters {
    fn default() -> Self {
        Self {
            created_by_src: [0; TXN_SOURCE_COUNT],
            committed_by_src: [0; TXN_SOURCE_COUNT],
            invalidated_by_src: [0; TXN_SOURCE_COUNT],
            access_by_src_ext: [[0; EXTENT_TYPE_COUNT]; TXN_SOURCE_COUNT],
            hit_by_src_ext: [[0; EXTENT_TYPE_COUNT]; TXN_SOURCE_COUNT],
            conflict_matrix: [0; SRC_PAIR_COUNT],
            invalidated_extents_by_type: [0; EXTENT_TYPE_COUNT],
            fresh_committed_by_type: [0; EXTENT_TYPE_COUNT],
            mutations_committed_by_type: [0; EXTENT_TYPE_COUNT],
            retired_committed_by_type: [0; EXTENT_TYPE_COUNT],
            mutation_delta_bytes: 0,
        }
    }
}

impl CacheCounters {
    pub(crate) fn record_access(&mut self, src: TxnSource, ty: ExtentType, hit: bool) {
        self.access_by_src_ext[src.index()][ty.index()] += 1;
        if hit {
            self.hit_by_src_ext[src.index()][ty.index()] += 1;
        }
    }

    pub(crate) fn account_conflict(&mut self, committing: TxnSource, victim: TxnSource) {
        self.conflict_matrix[src_pair_index(committing, victim)] += 1;
    }
}

/// Point-in-time snapshot of cache accounting.
///
/// Counter fields are monotonic for the lifetime of the cache; occupancy
/// fields reflect the moment of the snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheStats {
    pub created_by_src: [u64; TXN_SOURCE_COUNT],
    pub committed_by_src: [u64; TXN_SOURCE_COUNT],
    pub invalidated_by_src: [u64; TXN_SOURCE_COUNT],
    pub access_by_src_ext: [[u64; EXTENT_TYPE_COUNT]; TXN_SOURCE_COUNT],
    pub hit_by_src_ext: [[u64; EXTENT_TYPE_COUNT]; TXN_SOURCE_COUNT],
    pub conflict_matrix: [u64; SRC_PAIR_COUNT],
    pub invalidated_extents_by_type: [u64; EXTENT_TYPE_COUNT],
    pub fresh_committed_by_type: [u64; EXTENT_TYPE_COUNT],
    pub mutations_committed_by_type: [u64; EXTENT_TYPE_COUNT],
    pub retired_committed_by_type: [u64; EXTENT_TYPE_COUNT],
    pub mutation_delta_bytes: u64,

    pub resident_extents: usize,
    pub resident_bytes: u64,
    pub dirty_extents: usize,
    pub dirty_bytes: u64,
    pub lru_extents: usize,
    pub lru_bytes: u64,
}

impl CacheStats {
    /// Total typed-read accesses across all sources and types.
    #[must_use]
    pub fn total_accesses(&self) -> u64 {
        self.access_by_src_ext.iter().flatten().sum()
    }

    /// Total typed-read hits across all sources and types.
    #[must_use]
    pub fn total_hits(&self) -> u64 {
        self.hit_by_src_ext.iter().flatten().sum()
    }

    /// Cache hit ratio in [0.0, 1.0]; 0.0 when no accesses were made.
    #[must_use]
    pub fn hit_ratio(&self) -> f64 {
        let total = self.total_accesses();
        if total == 0 {
            0.0
        } else {
            self.total_hits() as f64 / total as f64
        }
    }

    /// Conflicts recorded for the unordered pair of sources.
    #[must_use]
    pub fn conflicts_between(&self, a: TxnSource, b: TxnSource) -> u64 {
        self.conflict_matrix[src_pair_index(a, b)]
    }
}
