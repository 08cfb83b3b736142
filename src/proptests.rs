use proptest::prelude::*;
use std::collections::HashSet;

use crate::{Error, FlatBtree, FlatSet};

// Key ranges and op counts are sized so that bucket headroom is never the
// limiting factor: exhaustion is exercised separately and deterministically.

proptest! {
    #[test]
    fn set_tracks_hashset_model(
        ops in proptest::collection::vec((any::<bool>(), 0u16..200), 1..400),
    ) {
        let mut set: FlatSet<u16> = FlatSet::with_capacity(256).unwrap();
        let mut model: HashSet<u16> = HashSet::new();

        for (insert, key) in ops {
            if insert {
                let newly = set.insert(key).unwrap();
                prop_assert_eq!(newly, model.insert(key));
            } else {
                let removed = set.erase(&key);
                prop_assert_eq!(removed, model.remove(&key));
            }
            prop_assert_eq!(set.len(), model.len());
            prop_assert_eq!(set.contains(&key), model.contains(&key));
        }

        let mut walked: Vec<u16> = set.iter().collect();
        walked.sort_unstable();
        let mut expected: Vec<u16> = model.into_iter().collect();
        expected.sort_unstable();
        prop_assert_eq!(walked, expected);
    }

    #[test]
    fn btree_tracks_multiset_model(
        ops in proptest::collection::vec((any::<bool>(), 0u8..50), 1..400),
    ) {
        let mut tree: FlatBtree<u8> = FlatBtree::with_capacity(512).unwrap();
        let mut model: Vec<u8> = Vec::new();

        for (insert, key) in ops {
            if insert {
                tree.insert(key).unwrap();
                model.push(key);
            } else {
                let removed = tree.erase(&key);
                match model.iter().position(|&k| k == key) {
                    Some(at) => {
                        prop_assert!(removed);
                        model.swap_remove(at);
                    }
                    None => prop_assert!(!removed),
                }
            }
            prop_assert_eq!(tree.len(), model.len());
        }

        let walked: Vec<u8> = tree.iter().collect();
        let mut expected = model;
        expected.sort_unstable();
        prop_assert_eq!(walked, expected);
    }

    #[test]
    fn set_never_loses_an_insert_silently(
        capacity in 1usize..50,
        extra in 0usize..20,
    ) {
        let set: FlatSet<u32> = FlatSet::with_capacity(capacity).unwrap();
        let attempts = capacity + extra;
        let mut applied = 0usize;
        let mut rejected = 0usize;

        for key in 0..attempts as u32 {
            match set.insert(key) {
                Ok(true) => applied += 1,
                Ok(false) => prop_assert!(false, "distinct keys cannot collide"),
                Err(Error::CapacityExhausted { .. }) => rejected += 1,
                Err(err) => prop_assert!(false, "unexpected error: {}", err),
            }
        }

        prop_assert_eq!(applied, capacity.min(attempts));
        prop_assert_eq!(applied + rejected, attempts);
        prop_assert_eq!(set.len(), applied);
    }

    #[test]
    fn btree_capacity_is_exact(
        capacity in 1usize..40,
        extra in 0usize..10,
    ) {
        let tree: FlatBtree<u32> = FlatBtree::with_capacity(capacity).unwrap();
        let mut applied = 0usize;
        let mut rejected = 0usize;

        // Duplicates on purpose: the multiset counts every copy.
        for key in 0..(capacity + extra) as u32 {
            match tree.insert(key % 7) {
                Ok(()) => applied += 1,
                Err(Error::CapacityExhausted { .. }) => rejected += 1,
                Err(err) => prop_assert!(false, "unexpected error: {}", err),
            }
        }

        prop_assert_eq!(applied, capacity);
        prop_assert_eq!(applied + rejected, capacity + extra);
        prop_assert_eq!(tree.len(), capacity);
    }
}
