//! Unordered, duplicate-free set for massively parallel insertion and
//! erasure.
//!
//! The set is an open-addressing hash index over a [`SlotArena`]: buckets are
//! single `AtomicU64` words packing `{version | state | slot}`, keys live in
//! arena slots, and every mutation is a small state machine driven by
//! compare-exchange on the bucket word. Thousands of callers may insert and
//! erase concurrently with no external locking; the only waiting is a
//! bounded spin on a bucket whose writer is mid-publish.
//!
//! ## Bucket protocol
//!
//! ```text
//!   EMPTY --claim--> BUSY --publish--> FULL --claim--> BUSY --retire--> TOMB
//! ```
//!
//! Inserters claim only EMPTY buckets. A probe never skips a BUSY bucket (it
//! waits for the in-flight writer to resolve it), so two concurrent inserts
//! of the same key funnel through the same first-EMPTY position and exactly
//! one survives. Tombstones stay probe-transparent so that other keys placed
//! beyond them remain reachable.
//!
//! Every transition bumps a 30-bit version stored in the same word, which
//! lets readers validate a racy key read: load word, copy key, re-load word;
//! identical words mean the key was stable for the whole read.

use std::collections::hash_map::RandomState;
use std::hash::{BuildHasher, Hash};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use rayon::prelude::*;

use crate::arena::SlotArena;
use crate::error::Error;

const STATE_EMPTY: u64 = 0;
const STATE_BUSY: u64 = 1;
const STATE_FULL: u64 = 2;
const STATE_TOMB: u64 = 3;

const VERSION_MASK: u64 = (1 << 30) - 1;

fn pack(state: u64, version: u64, slot: u32) -> u64 {
    (version << 34) | (state << 32) | slot as u64
}

fn state_of(word: u64) -> u64 {
    (word >> 32) & 0b11
}

fn slot_of(word: u64) -> u32 {
    word as u32
}

/// Same bucket, next version, new state and slot.
fn advance(word: u64, state: u64, slot: u32) -> u64 {
    let version = ((word >> 34).wrapping_add(1)) & VERSION_MASK;
    pack(state, version, slot)
}

/// Fixed-capacity concurrent set.
///
/// Holds at most `capacity` distinct keys, all storage allocated up front.
/// `insert` and `erase` may be called from any number of threads at once;
/// [`iter`](FlatSet::iter) takes `&mut self`, so the borrow checker itself
/// enforces that traversal only happens once mutation has quiesced.
///
/// ```
/// use flatcoll::FlatSet;
///
/// let set: FlatSet<i32> = FlatSet::with_capacity(100).unwrap();
/// assert!(set.insert(7).unwrap());
/// assert!(!set.insert(7).unwrap()); // duplicate: no-op
/// assert!(set.contains(&7));
/// assert!(set.erase(&7));
/// assert_eq!(set.len(), 0);
/// ```
pub struct FlatSet<K: Copy + Eq + Hash, S: BuildHasher = RandomState> {
    buckets: Box<[AtomicU64]>,
    mask: usize,
    arena: SlotArena<K>,
    len: AtomicUsize,
    hasher: S,
}

impl<K: Copy + Eq + Hash> FlatSet<K> {
    /// Create a set that can hold up to `capacity` distinct keys.
    ///
    /// The set never grows; size it for the worst case (observed callers
    /// over-provision generously). Fails with [`Error::InvalidCapacity`] when
    /// `capacity` is zero.
    pub fn with_capacity(capacity: usize) -> Result<Self, Error> {
        Self::with_capacity_and_hasher(capacity, RandomState::new())
    }
}

impl<K: Copy + Eq + Hash, S: BuildHasher> FlatSet<K, S> {
    /// Like [`with_capacity`](FlatSet::with_capacity) with an explicit hash
    /// builder.
    pub fn with_capacity_and_hasher(capacity: usize, hasher: S) -> Result<Self, Error> {
        if capacity == 0 {
            return Err(Error::InvalidCapacity);
        }
        // Twice the element capacity, rounded to a power of two: headroom
        // for probe chains and for tombstones left behind by erase phases.
        let bucket_count = capacity.saturating_mul(2).next_power_of_two();
        Ok(Self {
            buckets: (0..bucket_count).map(|_| AtomicU64::new(0)).collect(),
            mask: bucket_count - 1,
            arena: SlotArena::with_capacity(capacity),
            len: AtomicUsize::new(0),
            hasher,
        })
    }

    /// Maximum number of distinct keys the set can hold.
    pub fn capacity(&self) -> usize {
        self.arena.capacity()
    }

    /// Number of keys currently in the set.
    ///
    /// Exact whenever no mutation is in flight; during concurrent mutation it
    /// lags by at most the number of in-flight operations.
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    /// `true` when the set holds no keys.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn probe_start(&self, key: &K) -> usize {
        self.hasher.hash_one(key) as usize & self.mask
    }

    /// Insert `key`, returning `Ok(true)` if it was newly added and
    /// `Ok(false)` if an equal key was already present.
    ///
    /// Fails with [`Error::CapacityExhausted`] when no arena slot or probe
    /// position is available; the failure is always surfaced, never a silent
    /// drop.
    pub fn insert(&self, key: K) -> Result<bool, Error> {
        let mut idx = self.probe_start(&key);
        for _ in 0..self.buckets.len() {
            let bucket = &self.buckets[idx];
            loop {
                let word = bucket.load(Ordering::Acquire);
                match state_of(word) {
                    STATE_EMPTY => {
                        let claim = advance(word, STATE_BUSY, 0);
                        if bucket
                            .compare_exchange_weak(
                                word,
                                claim,
                                Ordering::AcqRel,
                                Ordering::Relaxed,
                            )
                            .is_err()
                        {
                            continue;
                        }
                        let Some(slot) = self.arena.acquire() else {
                            // Roll the claim back so waiters see EMPTY again.
                            bucket.store(advance(claim, STATE_EMPTY, 0), Ordering::Release);
                            return Err(Error::exhausted_one());
                        };
                        // The slot is ours until the publish below.
                        unsafe { self.arena.write(slot, key) };
                        self.len.fetch_add(1, Ordering::AcqRel);
                        bucket.store(advance(claim, STATE_FULL, slot), Ordering::Release);
                        return Ok(true);
                    }
                    STATE_BUSY => {
                        // In-flight writer on this bucket; it resolves within
                        // a bounded number of its own steps.
                        std::hint::spin_loop();
                    }
                    STATE_FULL => {
                        let candidate = unsafe { self.arena.read(slot_of(word)) };
                        if bucket.load(Ordering::Acquire) != word {
                            continue;
                        }
                        if candidate == key {
                            return Ok(false);
                        }
                        break;
                    }
                    _ => break, // tombstone: probe past it
                }
            }
            idx = (idx + 1) & self.mask;
        }
        Err(Error::exhausted_one())
    }

    /// `true` if an equal key is currently in the set.
    pub fn contains(&self, key: &K) -> bool {
        let mut idx = self.probe_start(key);
        for _ in 0..self.buckets.len() {
            let bucket = &self.buckets[idx];
            loop {
                let word = bucket.load(Ordering::Acquire);
                match state_of(word) {
                    STATE_EMPTY => return false,
                    STATE_BUSY => std::hint::spin_loop(),
                    STATE_FULL => {
                        let candidate = unsafe { self.arena.read(slot_of(word)) };
                        if bucket.load(Ordering::Acquire) != word {
                            continue;
                        }
                        if candidate == *key {
                            return true;
                        }
                        break;
                    }
                    _ => break,
                }
            }
            idx = (idx + 1) & self.mask;
        }
        false
    }

    /// Remove `key` if present. Returns whether a key was removed; erasing an
    /// absent key is a normal `false` outcome, not an error.
    pub fn erase(&self, key: &K) -> bool {
        let mut idx = self.probe_start(key);
        for _ in 0..self.buckets.len() {
            let bucket = &self.buckets[idx];
            loop {
                let word = bucket.load(Ordering::Acquire);
                match state_of(word) {
                    STATE_EMPTY => return false,
                    STATE_BUSY => std::hint::spin_loop(),
                    STATE_FULL => {
                        let slot = slot_of(word);
                        let candidate = unsafe { self.arena.read(slot) };
                        if bucket.load(Ordering::Acquire) != word {
                            continue;
                        }
                        if candidate != *key {
                            break;
                        }
                        let claim = advance(word, STATE_BUSY, slot);
                        if bucket
                            .compare_exchange(word, claim, Ordering::AcqRel, Ordering::Relaxed)
                            .is_err()
                        {
                            // Someone got here first; re-examine the bucket.
                            continue;
                        }
                        self.len.fetch_sub(1, Ordering::AcqRel);
                        // Tombstone, not EMPTY: keys placed beyond this
                        // bucket must stay reachable.
                        bucket.store(advance(claim, STATE_TOMB, 0), Ordering::Release);
                        unsafe { self.arena.release(slot) };
                        return true;
                    }
                    _ => break,
                }
            }
            idx = (idx + 1) & self.mask;
        }
        false
    }

    /// Iterate over all keys, in arena (bucket) order.
    ///
    /// Taking `&mut self` is the quiescence barrier: holding the exclusive
    /// borrow proves no insert or erase is in flight, so the walk needs no
    /// synchronization. The iterator is `Clone`, so the range can be
    /// restarted or handed to several consumers.
    pub fn iter(&mut self) -> SetIter<'_, K> {
        SetIter {
            buckets: &self.buckets,
            arena: &self.arena,
            next: 0,
        }
    }

    /// Insert every key of `keys` from parallel lanes.
    ///
    /// Returns the number of newly inserted keys. If any lane exhausts
    /// capacity the whole batch reports a single aggregated
    /// [`Error::CapacityExhausted`] with applied/rejected tallies, rather
    /// than one error per lane.
    pub fn par_insert(&self, keys: &[K]) -> Result<usize, Error>
    where
        K: Send + Sync,
        S: Sync,
    {
        let (applied, rejected) = keys
            .par_iter()
            .map(|key| match self.insert(*key) {
                Ok(true) => (1usize, 0usize),
                Ok(false) => (0, 0),
                Err(_) => (0, 1),
            })
            .reduce(|| (0, 0), |a, b| (a.0 + b.0, a.1 + b.1));
        if rejected > 0 {
            Err(Error::CapacityExhausted { applied, rejected })
        } else {
            Ok(applied)
        }
    }

    /// Erase every key of `keys` from parallel lanes; returns how many were
    /// actually removed.
    pub fn par_erase(&self, keys: &[K]) -> usize
    where
        K: Send + Sync,
        S: Sync,
    {
        keys.par_iter()
            .map(|key| usize::from(self.erase(key)))
            .sum()
    }
}

/// Lazy, restartable walk over a quiescent [`FlatSet`].
pub struct SetIter<'a, K: Copy> {
    buckets: &'a [AtomicU64],
    arena: &'a SlotArena<K>,
    next: usize,
}

impl<K: Copy> Clone for SetIter<'_, K> {
    fn clone(&self) -> Self {
        Self {
            buckets: self.buckets,
            arena: self.arena,
            next: self.next,
        }
    }
}

impl<K: Copy> Iterator for SetIter<'_, K> {
    type Item = K;

    fn next(&mut self) -> Option<K> {
        while let Some(bucket) = self.buckets.get(self.next) {
            self.next += 1;
            let word = bucket.load(Ordering::Relaxed);
            if state_of(word) == STATE_FULL {
                // Quiescent by construction (`iter` borrows exclusively).
                return Some(unsafe { self.arena.read(slot_of(word)) });
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::hash::Hasher;

    #[test]
    fn rejects_zero_capacity() {
        assert!(matches!(
            FlatSet::<u32>::with_capacity(0),
            Err(Error::InvalidCapacity)
        ));
    }

    #[test]
    fn insert_contains_erase() {
        let set: FlatSet<i32> = FlatSet::with_capacity(32).unwrap();
        assert!(set.insert(1).unwrap());
        assert!(set.insert(2).unwrap());
        assert!(set.contains(&1));
        assert!(set.contains(&2));
        assert!(!set.contains(&3));
        assert_eq!(set.len(), 2);

        assert!(set.erase(&1));
        assert!(!set.contains(&1));
        assert!(!set.erase(&1), "second erase of the same key is a no-op");
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn duplicate_insert_is_idempotent() {
        let set: FlatSet<u64> = FlatSet::with_capacity(8).unwrap();
        assert!(set.insert(42).unwrap());
        assert!(!set.insert(42).unwrap());
        assert!(!set.insert(42).unwrap());
        assert_eq!(set.len(), 1);
        assert!(set.contains(&42));
    }

    #[test]
    fn capacity_boundary_is_loud() {
        const CAP: usize = 16;
        let set: FlatSet<u32> = FlatSet::with_capacity(CAP).unwrap();
        let mut applied = 0;
        let mut rejected = 0;
        for key in 0..(CAP as u32 + 1) {
            match set.insert(key) {
                Ok(true) => applied += 1,
                Ok(false) => unreachable!("keys are distinct"),
                Err(Error::CapacityExhausted { .. }) => rejected += 1,
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        assert_eq!(applied, CAP);
        assert_eq!(rejected, 1);
        assert_eq!(applied + rejected, CAP + 1, "no insert went missing");
    }

    #[test]
    fn slots_are_recycled_after_erase() {
        let set: FlatSet<u32> = FlatSet::with_capacity(4).unwrap();
        for key in 0..4 {
            assert!(set.insert(key).unwrap());
        }
        for key in 0..4 {
            assert!(set.erase(&key));
        }
        assert_eq!(set.len(), 0);
        // A full second generation fits: the arena reissued every slot.
        for key in 10..14 {
            assert!(set.insert(key).unwrap());
        }
        assert_eq!(set.len(), 4);
    }

    #[test]
    fn churn_past_bucket_headroom_fails_loudly() {
        // Tombstones are never converted back to probe-terminating EMPTY
        // buckets, so sustained erase/insert churn eventually consumes the
        // 2x bucket headroom. The contract is that this surfaces as
        // CapacityExhausted, never as a silently dropped key.
        let set: FlatSet<u32> = FlatSet::with_capacity(4).unwrap();
        let mut inserted = 0usize;
        let mut rejected = 0usize;
        for key in 0..64u32 {
            match set.insert(key) {
                Ok(true) => {
                    inserted += 1;
                    assert!(set.erase(&key));
                }
                Ok(false) => unreachable!("keys are distinct"),
                Err(Error::CapacityExhausted { .. }) => rejected += 1,
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        assert_eq!(inserted + rejected, 64, "every attempt is accounted for");
        assert!(rejected > 0, "headroom is finite under churn");
        assert_eq!(set.len(), 0);
    }

    /// Hash builder that sends every key to the same bucket.
    #[derive(Clone, Default)]
    struct Collide;

    struct CollideHasher;

    impl Hasher for CollideHasher {
        fn finish(&self) -> u64 {
            0
        }
        fn write(&mut self, _bytes: &[u8]) {}
    }

    impl BuildHasher for Collide {
        type Hasher = CollideHasher;
        fn build_hasher(&self) -> CollideHasher {
            CollideHasher
        }
    }

    #[test]
    fn tombstone_keeps_probe_chain_intact() {
        let set: FlatSet<u32, Collide> =
            FlatSet::with_capacity_and_hasher(8, Collide).unwrap();
        // All three land on one probe chain.
        for key in [10, 20, 30] {
            assert!(set.insert(key).unwrap());
        }
        // Erasing the middle of the chain must not hide the tail.
        assert!(set.erase(&20));
        assert!(set.contains(&10));
        assert!(set.contains(&30));
        assert!(!set.contains(&20));
        // And the tombstone is still probed past on re-insert.
        assert!(set.insert(20).unwrap());
        assert!(set.contains(&20));
    }

    #[test]
    fn iter_yields_each_key_once() {
        let mut set: FlatSet<u32> = FlatSet::with_capacity(64).unwrap();
        for key in 0..50 {
            set.insert(key).unwrap();
        }
        let mut seen: Vec<u32> = set.iter().collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..50).collect::<Vec<_>>());

        // Restartable: a fresh walk sees the same range.
        let again = set.iter().count();
        assert_eq!(again, 50);
    }

    #[test]
    fn sum_round_trip() {
        let n: i64 = 1000;
        let mut set: FlatSet<i64> = FlatSet::with_capacity(n as usize).unwrap();
        let keys: Vec<i64> = (1..=n).collect();
        assert_eq!(set.par_insert(&keys).unwrap(), n as usize);

        let sum: i64 = set.iter().sum();
        assert_eq!(sum, n * (n + 1) / 2);

        assert_eq!(set.par_erase(&keys), n as usize);
        assert_eq!(set.len(), 0);
        assert_eq!(set.iter().count(), 0);
    }

    #[test]
    fn bulk_exhaustion_is_aggregated() {
        let set: FlatSet<u32> = FlatSet::with_capacity(100).unwrap();
        let keys: Vec<u32> = (0..150).collect();
        match set.par_insert(&keys) {
            Err(Error::CapacityExhausted { applied, rejected }) => {
                assert_eq!(applied, 100);
                assert_eq!(rejected, 50);
            }
            other => panic!("expected aggregated exhaustion, got {other:?}"),
        }
        assert_eq!(set.len(), 100);
    }
}
