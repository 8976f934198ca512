//! Startup replay: delta application, idempotence, placeholder
//! materialization, and back-reference buffer reconstruction, plus
//! randomized coverage of the isolation and replay-equivalence properties.

use asupersync::Cx;
use proptest::prelude::*;
use silt_cache::{Cache, CacheConfig, ExtentState, Record, ReplayDelta, Transaction};
use silt_epm::{ExtentPlacementManager, MemoryEpm};
use silt_error::{Result, SiltError};
use silt_types::{ExtentType, JournalSeq, PhysAddr, PlacementHint, TxnSource};
use std::collections::BTreeMap;
use std::sync::Arc;

const EXTENT_LEN: u32 = 4096;
const LRU_CAP: u64 = 1 << 20;

struct Harness {
    cx: Cx,
    epm: MemoryEpm,
    cache: Cache,
    next_seq: u64,
    journal: Vec<(JournalSeq, u64, Record)>,
}

impl Harness {
    fn new() -> Self {
        let epm = MemoryEpm::new();
        let mut cache = Cache::new(
            Arc::new(epm.clone()),
            CacheConfig {
                lru_capacity_bytes: LRU_CAP,
            },
        );
        cache.init();
        Self {
            cx: Cx::for_testing(),
            epm,
            cache,
            next_seq: 1,
            journal: Vec::new(),
        }
    }

    fn commit(&mut self, mut t: Transaction) -> Result<(JournalSeq, u64)> {
        let record = match self.cache.prepare_record(&mut t) {
            Ok(record) => record,
            Err(err) => {
                self.cache.abort_transaction(t);
                return Err(err);
            }
        };
        let start = self
            .epm
            .write_record(&self.cx, &record.fresh_bytes())
            .expect("journal write");
        let seq = JournalSeq(self.next_seq);
        self.next_seq += 1;
        self.cache.complete_commit(t, start, seq);
        self.journal.push((seq, start, record));
        Ok((seq, start))
    }

    fn commit_fresh(&mut self, ty: ExtentType, fill: u8) -> (JournalSeq, u64) {
        let mut t = self.cache.create_transaction(TxnSource::Mutate, false);
        let id = self
            .cache
            .alloc_new_extent(&self.cx, &mut t, ty, EXTENT_LEN, PlacementHint::Hot)
            .expect("alloc");
        self.cache.extent_bytes_mut(&t, id).fill(fill);
        let (seq, start) = self.commit(t).expect("commit");
        (seq, start)
    }

    fn commit_mutation(&mut self, ty: ExtentType, addr: u64, fill: u8) -> JournalSeq {
        let mut t = self.cache.create_transaction(TxnSource::Mutate, false);
        let id = self
            .cache
            .get_extent_in_txn(&self.cx, &mut t, ty, PhysAddr::Absolute(addr), EXTENT_LEN)
            .expect("read");
        let shadow = self.cache.duplicate_for_write(&mut t, id).expect("dup");
        self.cache.extent_bytes_mut(&t, shadow).fill(fill);
        let (seq, _) = self.commit(t).expect("commit");
        seq
    }

    /// A cold cache over the same device, with the journal replayed once.
    fn replayed_cache(&self) -> Cache {
        let mut cache = Cache::new(
            Arc::new(self.epm.clone()),
            CacheConfig {
                lru_capacity_bytes: LRU_CAP,
            },
        );
        cache.init();
        replay_journal(&self.cx, &mut cache, &self.journal);
        cache
    }
}

fn replay_journal(cx: &Cx, cache: &mut Cache, journal: &[(JournalSeq, u64, Record)]) {
    for (seq, start, record) in journal {
        for delta in record.replay_deltas() {
            cache
                .replay_delta(cx, *seq, *start, &delta, *seq)
                .expect("replay");
        }
    }
}

/// Contents, version, and dirty mark of every extent in an address set.
fn observe(
    cx: &Cx,
    cache: &mut Cache,
    addrs: &[u64],
    ty: ExtentType,
) -> BTreeMap<u64, (Vec<u8>, u64, Option<JournalSeq>)> {
    let mut out = BTreeMap::new();
    for &addr in addrs {
        let id = cache.get_extent(cx, ty, addr, EXTENT_LEN).expect("read");
        let info = cache.extent_info(id).expect("resident");
        out.insert(
            addr,
            (
                cache.extent_bytes(id).expect("bytes").to_vec(),
                info.version,
                info.dirty_from,
            ),
        );
    }
    out
}

// ── S5: replay of a mutation chain ──────────────────────────────────────────

#[test]
fn s5_replay_reapplies_deltas_in_order() {
    let mut h = Harness::new();
    let (_, addr) = h.commit_fresh(ExtentType::ObjectData, 0x01);
    let first_delta_seq = h.commit_mutation(ExtentType::ObjectData, addr, 0x02);
    let _ = h.commit_mutation(ExtentType::ObjectData, addr, 0x03);
    let _ = h.commit_mutation(ExtentType::ObjectData, addr, 0x04);

    let live = h
        .cache
        .extent_bytes(h.cache.extent_at(addr).expect("resident"))
        .expect("bytes")
        .to_vec();

    let mut cold = h.replayed_cache();
    let id = cold
        .get_extent(&h.cx, ExtentType::ObjectData, addr, EXTENT_LEN)
        .expect("read");
    let info = cold.extent_info(id).expect("resident");
    assert_eq!(cold.extent_bytes(id).expect("bytes"), live.as_slice());
    assert_eq!(cold.extent_bytes(id).expect("bytes"), &[0x04_u8; EXTENT_LEN as usize][..]);
    assert_eq!(info.version, 3);
    assert_eq!(info.state, ExtentState::Dirty);
    assert_eq!(
        info.dirty_from,
        Some(first_delta_seq),
        "dirty mark is the first replayed delta"
    );
    assert_eq!(cold.get_oldest_dirty_from(), Some(first_delta_seq));
}

#[test]
fn replay_twice_is_idempotent() {
    let mut h = Harness::new();
    let (_, a) = h.commit_fresh(ExtentType::ObjectData, 0x10);
    let (_, b) = h.commit_fresh(ExtentType::LaddrLeaf, 0x20);
    let _ = h.commit_mutation(ExtentType::ObjectData, a, 0x11);
    let _ = h.commit_mutation(ExtentType::LaddrLeaf, b, 0x21);
    let _ = h.commit_mutation(ExtentType::ObjectData, a, 0x12);

    let mut once = h.replayed_cache();
    let mut twice = h.replayed_cache();
    replay_journal(&h.cx, &mut twice, &h.journal);

    let seen_once = observe(&h.cx, &mut once, &[a], ExtentType::ObjectData);
    let seen_twice = observe(&h.cx, &mut twice, &[a], ExtentType::ObjectData);
    assert_eq!(seen_once, seen_twice);
    let seen_once = observe(&h.cx, &mut once, &[b], ExtentType::LaddrLeaf);
    let seen_twice = observe(&h.cx, &mut twice, &[b], ExtentType::LaddrLeaf);
    assert_eq!(seen_once, seen_twice);

    // The second pass applied nothing.
    let (seq, start, record) = h.journal.last().cloned().expect("journal entry");
    for delta in record.replay_deltas() {
        if let ReplayDelta::Extent(_) = delta {
            let applied = twice
                .replay_delta(&h.cx, seq, start, &delta, seq)
                .expect("replay");
            assert!(!applied, "stale delta must be skipped");
        }
    }
}

#[test]
fn replay_materializes_through_a_placeholder() {
    let mut h = Harness::new();
    let (_, addr) = h.commit_fresh(ExtentType::ObjectData, 0x30);
    let delta_seq = h.commit_mutation(ExtentType::ObjectData, addr, 0x31);

    // Cold cache with a retire staged against the not-yet-read address.
    let mut cold = Harness {
        cx: Cx::for_testing(),
        epm: h.epm.clone(),
        cache: {
            let mut cache = Cache::new(
                Arc::new(h.epm.clone()),
                CacheConfig {
                    lru_capacity_bytes: LRU_CAP,
                },
            );
            cache.init();
            cache
        },
        next_seq: h.next_seq,
        journal: h.journal.clone(),
    };
    let mut retirer = cold.cache.create_transaction(TxnSource::CleanerReclaim, false);
    cold.cache
        .retire_extent_addr(&mut retirer, addr, EXTENT_LEN)
        .expect("retire");
    let placeholder = cold.cache.extent_at(addr).expect("placeholder");

    replay_journal(&cold.cx, &mut cold.cache, &cold.journal);
    let real = cold.cache.extent_at(addr).expect("materialized");
    assert_ne!(real, placeholder);
    let info = cold.cache.extent_info(real).expect("resident");
    assert_eq!(info.ty, ExtentType::ObjectData);
    assert_eq!(info.dirty_from, Some(delta_seq));
    assert_eq!(
        cold.cache.extent_bytes(real).expect("bytes"),
        &[0x31_u8; EXTENT_LEN as usize][..]
    );
    cold.cache.abort_transaction(retirer);
}

#[test]
fn replay_rejects_corrupted_delta_payloads() {
    let mut h = Harness::new();
    let (_, addr) = h.commit_fresh(ExtentType::ObjectData, 0x40);
    let _ = h.commit_mutation(ExtentType::ObjectData, addr, 0x41);

    let (seq, start, record) = h.journal.last().cloned().expect("journal entry");
    let mut tampered = record.mutations[0].clone();
    let mid = tampered.payload.len() / 2;
    tampered.payload[mid] ^= 0x01;

    let mut cold = Cache::new(
        Arc::new(h.epm.clone()),
        CacheConfig {
            lru_capacity_bytes: LRU_CAP,
        },
    );
    cold.init();
    let err = cold
        .replay_delta(&h.cx, seq, start, &ReplayDelta::Extent(tampered), seq)
        .expect_err("corrupted payload");
    assert!(matches!(err, SiltError::Replay(_)), "got {err}");
}

#[test]
fn replay_restores_the_root() {
    let mut h = Harness::new();
    let mut t = h.cache.create_transaction(TxnSource::Mutate, false);
    let writable_root = h.cache.mkfs(&mut t).expect("mkfs");
    h.cache.extent_bytes_mut(&t, writable_root)[..4].copy_from_slice(b"tree");
    let (seq, _) = h.commit(t).expect("commit");

    let mut cold = h.replayed_cache();
    let mut reader = cold.create_transaction(TxnSource::Read, false);
    let root = cold.get_root(&mut reader).expect("root");
    let info = cold.extent_info(root).expect("resident");
    assert_eq!(&cold.extent_bytes(root).expect("bytes")[..4], b"tree");
    assert_eq!(info.state, ExtentState::Dirty);
    assert_eq!(info.dirty_from, Some(seq));
    assert_eq!(info.version, 1);
    cold.abort_transaction(reader);
}

#[test]
fn replay_rebuilds_the_backref_buffer() {
    let mut h = Harness::new();
    let (_, a) = h.commit_fresh(ExtentType::ObjectData, 1);
    let (_, b) = h.commit_fresh(ExtentType::ObjectData, 2);
    let mut retirer = h.cache.create_transaction(TxnSource::CleanerTrim, false);
    h.cache
        .retire_extent_addr(&mut retirer, a, EXTENT_LEN)
        .expect("retire");
    h.commit(retirer).expect("commit");

    let cold = h.replayed_cache();
    let lo = a.min(b);
    let hi = a.max(b) + u64::from(EXTENT_LEN);
    assert_eq!(
        cold.get_backrefs_in_range(lo, hi)
            .iter()
            .map(|e| e.paddr)
            .collect::<Vec<_>>(),
        h.cache
            .get_backrefs_in_range(lo, hi)
            .iter()
            .map(|e| e.paddr)
            .collect::<Vec<_>>()
    );
    assert_eq!(
        cold.get_del_backrefs_in_range(lo, hi).len(),
        1
    );
    assert_eq!(cold.get_oldest_backref_dirty_from(), h.cache.get_oldest_backref_dirty_from());
}

#[test]
fn alloc_deltas_buffer_under_the_allocation_sequence() {
    let mut h = Harness::new();
    let (seq, start) = h.commit_fresh(ExtentType::ObjectData, 3);
    let (_, _, record) = h
        .journal
        .iter()
        .find(|(journal_seq, _, _)| *journal_seq == seq)
        .cloned()
        .expect("journal entry");

    // An allocation that straddles segments replays under its original
    // allocation sequence, not the delta's.
    let alloc_seq = JournalSeq(seq.0 + 7);
    let mut cold = Cache::new(
        Arc::new(h.epm.clone()),
        CacheConfig {
            lru_capacity_bytes: LRU_CAP,
        },
    );
    cold.init();
    for delta in record.replay_deltas() {
        cold.replay_delta(&h.cx, seq, start, &delta, alloc_seq)
            .expect("replay");
    }
    let entries = cold.get_backrefs_in_range(start, start + u64::from(EXTENT_LEN));
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].seq, alloc_seq);
    assert_eq!(cold.get_oldest_backref_dirty_from(), Some(alloc_seq));
}

#[test]
fn init_cached_extents_drops_dead_extents() {
    let mut h = Harness::new();
    let (_, a) = h.commit_fresh(ExtentType::ObjectData, 1);
    let (_, b) = h.commit_fresh(ExtentType::LaddrLeaf, 2);

    let mut cold = h.replayed_cache();
    // Materialize both extents in the cold cache.
    let _ = cold
        .get_extent(&h.cx, ExtentType::ObjectData, a, EXTENT_LEN)
        .expect("read");
    let _ = cold
        .get_extent(&h.cx, ExtentType::LaddrLeaf, b, EXTENT_LEN)
        .expect("read");

    let mut sweep = cold.create_transaction(TxnSource::Read, false);
    cold.init_cached_extents(&mut sweep, |_, info| Ok(info.ty != ExtentType::LaddrLeaf))
        .expect("sweep");
    assert!(cold.extent_at(a).is_some());
    assert_eq!(cold.extent_at(b), None, "dead extent removed");
    cold.abort_transaction(sweep);
}

// ── Randomized properties ───────────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// Replaying the journal once or twice yields the same extent contents,
    /// versions, and dirty marks.
    #[test]
    fn replay_equivalence_under_random_mutations(
        ops in proptest::collection::vec((0_usize..3, any::<u8>()), 1..10)
    ) {
        let mut h = Harness::new();
        let mut addrs = Vec::new();
        for i in 0..3_u8 {
            let (_, addr) = h.commit_fresh(ExtentType::ObjectData, i);
            addrs.push(addr);
        }
        for (slot, fill) in ops {
            let _ = h.commit_mutation(ExtentType::ObjectData, addrs[slot], fill);
        }

        let live = observe(&h.cx, &mut h.cache, &addrs, ExtentType::ObjectData);
        let mut once = h.replayed_cache();
        let mut twice = h.replayed_cache();
        replay_journal(&h.cx, &mut twice, &h.journal);

        let seen_once = observe(&h.cx, &mut once, &addrs, ExtentType::ObjectData);
        let seen_twice = observe(&h.cx, &mut twice, &addrs, ExtentType::ObjectData);
        prop_assert_eq!(&seen_once, &seen_twice);
        for (addr, (bytes, version, _)) in &live {
            let (cold_bytes, cold_version, _) = &seen_once[addr];
            prop_assert_eq!(bytes, cold_bytes);
            prop_assert_eq!(version, cold_version);
        }
    }

    /// Of two transactions over overlapping addresses, at most one commits;
    /// the loser reports Conflict exactly when the winner wrote something
    /// the loser read.
    #[test]
    fn conflicts_arise_exactly_on_overlap(
        writes_a in proptest::collection::btree_set(0_usize..5, 1..4),
        reads_b in proptest::collection::btree_set(0_usize..5, 1..5),
    ) {
        let mut h = Harness::new();
        let mut addrs = Vec::new();
        for i in 0..5_u8 {
            let (_, addr) = h.commit_fresh(ExtentType::ObjectData, i);
            addrs.push(addr);
        }

        let mut a = h.cache.create_transaction(TxnSource::Mutate, false);
        let mut b = h.cache.create_transaction(TxnSource::Read, false);
        for &slot in &reads_b {
            let _ = h.cache.get_extent_in_txn(
                &h.cx,
                &mut b,
                ExtentType::ObjectData,
                PhysAddr::Absolute(addrs[slot]),
                EXTENT_LEN,
            ).expect("b reads");
        }
        for &slot in &writes_a {
            let id = h.cache.get_extent_in_txn(
                &h.cx,
                &mut a,
                ExtentType::ObjectData,
                PhysAddr::Absolute(addrs[slot]),
                EXTENT_LEN,
            ).expect("a reads");
            let shadow = h.cache.duplicate_for_write(&mut a, id).expect("dup");
            h.cache.extent_bytes_mut(&a, shadow).fill(0xEE);
        }
        h.commit(a).expect("a commits");

        let overlap = writes_a.intersection(&reads_b).next().is_some();
        let outcome = h.cache.prepare_record(&mut b);
        match outcome {
            Ok(_) => {
                prop_assert!(!overlap, "b validated despite overlap");
                h.cache.abort_transaction(b);
            }
            Err(err) => {
                prop_assert!(overlap, "b conflicted without overlap: {err}");
                prop_assert!(err.is_conflict());
                h.cache.abort_transaction(b);
            }
        }
    }

    /// The LRU byte bound holds under arbitrary read workloads.
    #[test]
    fn lru_byte_bound_is_invariant(
        reads in proptest::collection::vec(0_u64..24, 1..40)
    ) {
        let capacity = 16 * 1024;
        let epm = MemoryEpm::new();
        let mut cache = Cache::new(
            Arc::new(epm.clone()),
            CacheConfig { lru_capacity_bytes: capacity },
        );
        cache.init();
        let cx = Cx::for_testing();
        for slot in reads {
            let mut t = cache.create_transaction(TxnSource::Read, false);
            let _ = cache.get_extent_in_txn(
                &cx,
                &mut t,
                ExtentType::ObjectData,
                PhysAddr::Absolute(0x1000 * (slot + 1)),
                EXTENT_LEN,
            ).expect("read");
            cache.abort_transaction(t);
            prop_assert!(cache.stats().lru_bytes <= capacity);
        }
    }
}
