mod hashset {
    use std::collections::BTreeSet;
    use std::hash::{BuildHasher, Hasher};
    use std::rc::Rc;

    use crate::{CapacityError, Guard, HashSet};

    static_assertions::assert_impl_all!(HashSet<String>: Send, Sync);
    static_assertions::assert_not_impl_any!(HashSet<Rc<String>>: Send, Sync);

    /// Hashes a `u64` key to itself, so the mixed hash and therefore
    /// the bucket and tag of every key can be chosen exactly.
    #[derive(Clone, Copy, Default)]
    pub(super) struct Identity;

    pub(super) struct IdentityHasher(u64);

    impl Hasher for IdentityHasher {
        fn finish(&self) -> u64 {
            self.0
        }

        fn write(&mut self, bytes: &[u8]) {
            for &byte in bytes {
                self.0 = (self.0 << 8) | u64::from(byte);
            }
        }

        fn write_u64(&mut self, n: u64) {
            self.0 = n;
        }
    }

    impl BuildHasher for Identity {
        type Hasher = IdentityHasher;

        fn build_hasher(&self) -> IdentityHasher {
            IdentityHasher(0)
        }
    }

    /// The multiplicative hashing constant and its modular inverse,
    /// used to craft keys whose mixed hash is a chosen value.
    const PHI: u32 = 0x9e37_79b9;
    const INVPHI: u32 = 0x144c_bc89;

    pub(super) fn key_with_mixed_hash(mixed: u32) -> u64 {
        let key = mixed.wrapping_mul(INVPHI);
        assert_eq!(key.wrapping_mul(PHI), mixed);
        u64::from(key)
    }

    #[test]
    fn insert_contains_remove() {
        let set: HashSet<u64> = HashSet::default();
        assert!(set.insert(17).unwrap());
        assert!(!set.insert(17).unwrap());
        assert_eq!(set.len(), 1);
        assert!(set.contains(&17));
        assert!(!set.contains(&18));
        assert!(set.remove(&17));
        assert!(!set.contains(&17));
        assert_eq!(set.len(), 0);
    }

    #[test]
    fn remove_is_idempotent() {
        let set: HashSet<u64> = HashSet::default();
        assert!(set.insert(5).unwrap());
        assert!(set.remove(&5));
        let before: BTreeSet<u64> = {
            let guard = Guard::new();
            set.iter(&guard).copied().collect()
        };
        assert!(!set.remove(&5));
        let after: BTreeSet<u64> = {
            let guard = Guard::new();
            set.iter(&guard).copied().collect()
        };
        assert_eq!(before, after);
        assert_eq!(set.len(), 0);
    }

    #[test]
    fn borrowed_key_lookup() {
        let set: HashSet<String> = HashSet::default();
        assert!(set.insert("alpha".to_string()).unwrap());
        assert!(set.contains("alpha"));
        assert!(set.remove("alpha"));
        assert!(!set.contains("alpha"));
    }

    #[test]
    fn round_trip_through_iteration() {
        let set: HashSet<u64> = HashSet::default();
        for k in 0..1000 {
            assert!(set.insert(k).unwrap());
        }
        let guard = Guard::new();
        let keys: BTreeSet<u64> = set.iter(&guard).copied().collect();
        assert_eq!(keys, (0..1000).collect::<BTreeSet<u64>>());
        assert_eq!(set.len(), 1000);
    }

    #[test]
    fn zero_capacity_grows() {
        let set: HashSet<u64> = HashSet::with_capacity(0).unwrap();
        let initial = set.capacity();
        for k in 0..100 {
            assert!(set.insert(k).unwrap());
        }
        assert!(set.capacity() > initial);
        assert_eq!(set.len(), 100);
        for k in 0..100 {
            assert!(set.contains(&k));
        }
    }

    #[test]
    fn capacity_limit() {
        assert_eq!(
            HashSet::<u64>::with_capacity(1_usize << 31).err(),
            Some(CapacityError)
        );
    }

    #[test]
    fn clear_empties() {
        let set: HashSet<u64> = HashSet::default();
        for k in 0..64 {
            assert!(set.insert(k).unwrap());
        }
        set.clear();
        assert!(set.is_empty());
        assert!(!set.contains(&1));
        assert!(set.insert(1).unwrap());
    }

    /// Eight keys whose mixed hashes all select bucket 3 of a
    /// minimum-size table form a single chain; the chain stays ordered
    /// by stored tag through out-of-order insertion and removal.
    #[test]
    fn collision_chain_stays_ordered() {
        let set: HashSet<u64, Identity> =
            HashSet::with_capacity_and_hasher(0, Identity).unwrap();
        let mixed: Vec<u32> = (0..8_u32).map(|i| 0x3000_0000 | (i << 8)).collect();
        let keys: Vec<u64> = mixed.iter().map(|&m| key_with_mixed_hash(m)).collect();

        // Insert out of order.
        for &key in keys.iter().rev().step_by(2) {
            assert!(set.insert(key).unwrap());
        }
        for &key in keys.iter().step_by(2) {
            assert!(set.insert(key).unwrap());
        }

        let chain_tags = |set: &HashSet<u64, Identity>| -> Vec<u32> {
            let guard = Guard::new();
            set.iter(&guard)
                .map(|&k| {
                    #[allow(clippy::cast_possible_truncation)]
                    let mixed = (k as u32).wrapping_mul(PHI);
                    assert_eq!(mixed >> 28, 3, "key must land in bucket 3");
                    mixed & 0x0fff_ffff
                })
                .collect()
        };

        let tags = chain_tags(&set);
        assert_eq!(tags.len(), 8);
        assert!(tags.windows(2).all(|w| w[0] <= w[1]), "chain out of order");

        // Removing a middle entry keeps the remaining chain ordered.
        assert!(set.remove(&keys[4]));
        let tags = chain_tags(&set);
        assert_eq!(tags.len(), 7);
        assert!(tags.windows(2).all(|w| w[0] <= w[1]), "chain out of order");
    }

    #[test]
    fn debug_format() {
        let set: HashSet<u64> = HashSet::default();
        assert!(set.insert(3).unwrap());
        assert_eq!(format!("{set:?}"), "{3}");
    }
}

mod hashmap {
    use std::collections::BTreeMap;
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering::Relaxed;

    use proptest::prelude::*;

    use super::hashset::{key_with_mixed_hash, Identity};
    use crate::{Guard, HashMap};

    static_assertions::assert_impl_all!(HashMap<String, String>: Send, Sync);
    static_assertions::assert_not_impl_any!(HashMap<String, *const String>: Send, Sync);

    /// Counts live instances across clones and drops.
    struct R(&'static AtomicUsize);

    impl R {
        fn new(cnt: &'static AtomicUsize) -> R {
            cnt.fetch_add(1, Relaxed);
            R(cnt)
        }
    }

    impl Drop for R {
        fn drop(&mut self) {
            self.0.fetch_sub(1, Relaxed);
        }
    }

    #[test]
    fn lookup_returns_inserted_payload() {
        let map: HashMap<u64, char, Identity> =
            HashMap::with_capacity_and_hasher(0, Identity).unwrap();
        let key = key_with_mixed_hash(0x1234_5678);
        assert!(map.insert(key, 'A').unwrap().is_none());
        assert_eq!(map.read(&key, |_, v| *v), Some('A'));
    }

    #[test]
    fn upsert_replaces() {
        let map: HashMap<u64, u32> = HashMap::default();
        assert!(map.upsert(1, 10).unwrap().is_none());
        assert_eq!(map.upsert(1, 11).unwrap().map(|v| *v), Some(10));
        assert_eq!(map.get(&1).map(|v| *v), Some(11));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn insert_keeps_existing() {
        let map: HashMap<u64, u32> = HashMap::default();
        assert!(map.insert(1, 10).unwrap().is_none());
        assert_eq!(map.insert(1, 11).unwrap().map(|v| *v), Some(10));
        assert_eq!(map.get(&1).map(|v| *v), Some(10));
    }

    #[test]
    fn update_requires_presence() {
        let map: HashMap<u64, u32> = HashMap::default();
        assert!(map.update(&1, 10).unwrap().is_none());
        assert!(!map.contains(&1));
        assert!(map.insert(1, 10).unwrap().is_none());
        assert_eq!(map.update(&1, 11).unwrap().map(|v| *v), Some(10));
        assert_eq!(map.get(&1).map(|v| *v), Some(11));
    }

    #[test]
    fn remove_if_checks_value() {
        let map: HashMap<u64, u32> = HashMap::default();
        assert!(map.insert(1, 10).unwrap().is_none());
        assert!(map.remove_if(&1, |v| *v == 11).is_none());
        assert!(map.contains(&1));
        assert_eq!(map.remove_if(&1, |v| *v == 10).map(|v| *v), Some(10));
        assert!(!map.contains(&1));
    }

    #[test]
    fn replace_is_size_neutral() {
        let map: HashMap<u64, u32> = HashMap::default();
        assert!(map.insert(7, 0).unwrap().is_none());
        for round in 1..1000 {
            assert_eq!(map.upsert(7, round).unwrap().map(|v| *v), Some(round - 1));
        }
        assert_eq!(map.len(), 1);
        assert_eq!(map.get(&7).map(|v| *v), Some(999));
    }

    #[test]
    fn value_handle_outlives_removal() {
        let map: HashMap<u64, String> = HashMap::default();
        assert!(map.insert(1, "keep".to_string()).unwrap().is_none());
        let handle = map.get(&1).unwrap();
        assert!(map.remove(&1).is_some());
        assert_eq!(*handle, "keep");
    }

    #[test]
    fn deferred_reclamation() {
        static INST_CNT: AtomicUsize = AtomicUsize::new(0);

        let map: HashMap<u64, R> = HashMap::default();
        for k in 0..256 {
            assert!(map.insert(k, R::new(&INST_CNT)).unwrap().is_none());
        }
        assert_eq!(INST_CNT.load(Relaxed), 256);
        for k in 0..128 {
            assert!(map.remove(&k).is_some());
        }
        drop(map);

        for _ in 0..65536 {
            if INST_CNT.load(Relaxed) == 0 {
                break;
            }
            drop(Guard::new());
            std::thread::yield_now();
        }
        assert_eq!(INST_CNT.load(Relaxed), 0);
    }

    #[test]
    fn iteration_round_trip() {
        let map: HashMap<u64, u64> = HashMap::default();
        for k in 0..500 {
            assert!(map.insert(k, !k).unwrap().is_none());
        }
        let guard = Guard::new();
        let entries: BTreeMap<u64, u64> = map.iter(&guard).map(|(k, v)| (*k, *v)).collect();
        assert_eq!(entries.len(), 500);
        for (k, v) in entries {
            assert_eq!(v, !k);
        }
    }

    proptest! {
        #[test]
        fn model_matches_btreemap(
            ops in proptest::collection::vec((0_u8..5, 0_u64..64, any::<u32>()), 0..256),
        ) {
            let map: HashMap<u64, u32> = HashMap::default();
            let mut model: BTreeMap<u64, u32> = BTreeMap::new();
            for (op, key, value) in ops {
                match op {
                    0 => {
                        let actual = map.upsert(key, value).unwrap().map(|v| *v);
                        prop_assert_eq!(actual, model.insert(key, value));
                    }
                    1 => {
                        let actual = map.insert(key, value).unwrap().map(|v| *v);
                        let expected = model.get(&key).copied();
                        if expected.is_none() {
                            model.insert(key, value);
                        }
                        prop_assert_eq!(actual, expected);
                    }
                    2 => {
                        let actual = map.remove(&key).map(|v| *v);
                        prop_assert_eq!(actual, model.remove(&key));
                    }
                    3 => {
                        let actual = map.get(&key).map(|v| *v);
                        prop_assert_eq!(actual, model.get(&key).copied());
                    }
                    _ => {
                        let actual = map.update(&key, value).unwrap().map(|v| *v);
                        let expected = model.get(&key).copied();
                        if expected.is_some() {
                            model.insert(key, value);
                        }
                        prop_assert_eq!(actual, expected);
                    }
                }
            }

            prop_assert_eq!(map.len(), model.len());
            let guard = Guard::new();
            let mut entries: Vec<(u64, u32)> = map.iter(&guard).map(|(k, v)| (*k, *v)).collect();
            entries.sort_unstable();
            let expected: Vec<(u64, u32)> = model.into_iter().collect();
            prop_assert_eq!(entries, expected);
        }
    }
}
