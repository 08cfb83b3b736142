//! # flatcoll
//!
//! Fixed-capacity concurrent containers in flat preallocated storage, built
//! for data-parallel workloads where thousands of independent lanes each
//! perform one insert or erase with no coordination of their own.
//!
//! Two variants are provided:
//!
//! - [`FlatSet`]: an unordered, duplicate-free set (open-addressing hash
//!   index, lock-free bucket state machine).
//! - [`FlatBtree`]: an ordered multiset (B-tree with lock-coupled descent;
//!   duplicates admitted and counted individually).
//!
//! Both sit on the same [`arena::SlotArena`]: every element and node lives
//! in a slot of a pool sized once at construction, all structural links are
//! slot indices, and nothing is heap-allocated per operation. Capacity never
//! grows: an insert that finds no room fails loudly with
//! [`Error::CapacityExhausted`] instead of silently dropping the key, so
//! callers size (and typically over-provision) up front.
//!
//! ## Example
//!
//! ```rust
//! use flatcoll::FlatSet;
//!
//! let n = 1_000i64;
//! let mut set: FlatSet<i64> = FlatSet::with_capacity(n as usize).unwrap();
//!
//! let keys: Vec<i64> = (1..=n).collect();
//! set.par_insert(&keys).unwrap(); // parallel lanes via rayon
//!
//! let sum: i64 = set.iter().sum();
//! assert_eq!(sum, n * (n + 1) / 2);
//!
//! set.par_erase(&keys);
//! assert!(set.is_empty());
//! ```
//!
//! ## Quiescence
//!
//! Mutation needs no external locking; traversal needs quiescence, and the
//! API encodes that in the borrow checker: `insert`/`erase` take `&self`,
//! `iter` takes `&mut self`. Code that can call `iter` provably has no
//! mutation in flight.

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod arena;
pub mod btree;
pub mod error;
pub mod set;

pub use btree::FlatBtree;
pub use error::Error;
pub use set::FlatSet;

#[cfg(test)]
mod proptests;
