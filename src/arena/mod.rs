//! Fixed-capacity slot arena with lock-free index recycling.
//!
//! All element and node storage in this crate lives in one of these pools.
//! Structural links between slots are `u32` indices rather than pointers,
//! which keeps the whole container in one flat allocation and lets it be
//! torn down in a single drop with no per-slot teardown.
//!
//! Allocation is two-tier: a bump watermark hands out never-used slots until
//! the pool has been touched end to end, and a Treiber free list recycles
//! released indices. The free-list head carries a generation tag in its upper
//! bits so a pop that raced with a release/re-release of the same index fails
//! its compare-exchange instead of corrupting the list.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Sentinel index: "no slot".
pub const NIL: u32 = u32::MAX;

fn pack(tag: u32, idx: u32) -> u64 {
    ((tag as u64) << 32) | idx as u64
}

fn unpack(word: u64) -> (u32, u32) {
    ((word >> 32) as u32, word as u32)
}

/// A pre-sized pool of slots handing out stable `u32` indices.
///
/// `T: Copy` is required: slots are plain data cells, values are read out by
/// copy, and dropping the arena never runs per-slot destructors.
pub struct SlotArena<T: Copy> {
    slots: Box<[UnsafeCell<MaybeUninit<T>>]>,
    /// Free-list links; `links[i]` is only meaningful while `i` is on the list.
    links: Box<[AtomicU32]>,
    /// Tagged head of the recycling free list.
    free_head: AtomicU64,
    /// First-fill watermark; slots `>= bump` have never been issued.
    bump: AtomicU32,
}

// Slots hold plain `Copy` data and all cross-thread hand-off goes through
// the atomic head/links, so the usual auto-trait reasoning applies.
unsafe impl<T: Copy + Send> Send for SlotArena<T> {}
unsafe impl<T: Copy + Send + Sync> Sync for SlotArena<T> {}

impl<T: Copy> SlotArena<T> {
    /// Create a pool of exactly `capacity` slots.
    ///
    /// The capacity is fixed for the arena's lifetime; callers validate it
    /// before construction.
    pub fn with_capacity(capacity: usize) -> Self {
        assert!(capacity > 0, "arena capacity must be positive");
        assert!(capacity < NIL as usize, "arena capacity must fit in u32");
        Self {
            slots: (0..capacity)
                .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
                .collect(),
            links: (0..capacity).map(|_| AtomicU32::new(NIL)).collect(),
            free_head: AtomicU64::new(pack(0, NIL)),
            bump: AtomicU32::new(0),
        }
    }

    /// Total number of slots.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Claim a free slot index, or `None` if the pool is exhausted.
    ///
    /// Never double-issues an index: recycled indices come off the tagged
    /// free list, fresh ones from a bounded bump counter.
    pub fn acquire(&self) -> Option<u32> {
        let mut head = self.free_head.load(Ordering::Acquire);
        loop {
            let (tag, idx) = unpack(head);
            if idx == NIL {
                break;
            }
            // The link may be stale if another thread pops/releases this
            // index concurrently; the tag makes the CAS fail in that case.
            let next = self.links[idx as usize].load(Ordering::Relaxed);
            match self.free_head.compare_exchange_weak(
                head,
                pack(tag.wrapping_add(1), next),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(idx),
                Err(current) => head = current,
            }
        }
        let capacity = self.slots.len() as u32;
        self.bump
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |issued| {
                (issued < capacity).then_some(issued + 1)
            })
            .ok()
    }

    /// Return a slot to the free pool.
    ///
    /// # Safety
    /// `idx` must have been obtained from [`acquire`](Self::acquire) on this
    /// arena and not yet released; the caller must no longer touch the slot.
    pub unsafe fn release(&self, idx: u32) {
        debug_assert!((idx as usize) < self.slots.len());
        let mut head = self.free_head.load(Ordering::Relaxed);
        loop {
            let (tag, top) = unpack(head);
            self.links[idx as usize].store(top, Ordering::Relaxed);
            match self.free_head.compare_exchange_weak(
                head,
                pack(tag.wrapping_add(1), idx),
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(current) => head = current,
            }
        }
    }

    /// Store a value into an acquired slot.
    ///
    /// # Safety
    /// `idx` must be currently acquired by the caller and no other thread may
    /// access the slot until the caller publishes it.
    pub unsafe fn write(&self, idx: u32, value: T) {
        unsafe { (*self.slots[idx as usize].get()).write(value) };
    }

    /// Read a slot's value by copy.
    ///
    /// The read is volatile: it may race with a concurrent rewrite of a
    /// recycled slot, in which case the returned bytes are garbage of type
    /// `T`'s layout. Callers that read without holding exclusive access must
    /// revalidate whatever published the index before trusting the value.
    ///
    /// # Safety
    /// The slot must have been initialized via [`write`](Self::write) at
    /// least once.
    pub unsafe fn read(&self, idx: u32) -> T {
        unsafe { std::ptr::read_volatile((*self.slots[idx as usize].get()).as_ptr()) }
    }

    /// Shared access to an acquired slot's value.
    ///
    /// # Safety
    /// `idx` must be acquired and initialized, and no exclusive reference to
    /// the slot may be live for the returned borrow's duration.
    pub unsafe fn get(&self, idx: u32) -> &T {
        unsafe { (*self.slots[idx as usize].get()).assume_init_ref() }
    }

    /// Exclusive access to an acquired slot's value.
    ///
    /// # Safety
    /// `idx` must be acquired and initialized, and the caller must hold
    /// whatever lock makes its access exclusive (no other reference to the
    /// slot may be live).
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn get_mut(&self, idx: u32) -> &mut T {
        unsafe { (*self.slots[idx as usize].get()).assume_init_mut() }
    }
}
