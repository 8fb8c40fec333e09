mod concurrency {
    use std::collections::BTreeSet;
    use std::sync::atomic::AtomicBool;
    use std::sync::atomic::Ordering::{Acquire, Release};
    use std::sync::Barrier;
    use std::thread;

    use crate::{Guard, HashMap, HashSet};

    const NUM_THREADS: usize = 8;

    #[test]
    fn disjoint_inserts() {
        let per_thread = 4096_u64;
        let map: HashMap<u64, u64> = HashMap::default();
        let barrier = Barrier::new(NUM_THREADS);
        thread::scope(|s| {
            for t in 0..NUM_THREADS as u64 {
                let map = &map;
                let barrier = &barrier;
                s.spawn(move || {
                    barrier.wait();
                    let base = t * per_thread;
                    for k in base..base + per_thread {
                        assert!(map.insert(k, !k).unwrap().is_none());
                    }
                });
            }
        });

        let total = NUM_THREADS as u64 * per_thread;
        assert_eq!(map.len(), total as usize);
        for k in 0..total {
            assert_eq!(*map.get(&k).unwrap(), !k);
        }
    }

    #[test]
    fn insert_remove_pairs_cancel_out() {
        let per_thread = 4096_u64;
        let map: HashMap<u64, u64> = HashMap::default();
        let barrier = Barrier::new(NUM_THREADS);
        thread::scope(|s| {
            for t in 0..NUM_THREADS as u64 {
                let map = &map;
                let barrier = &barrier;
                s.spawn(move || {
                    barrier.wait();
                    let base = t * per_thread;
                    for k in base..base + per_thread {
                        assert!(map.insert(k, k).unwrap().is_none());
                        assert!(map.remove(&k).is_some());
                    }
                });
            }
        });

        assert_eq!(map.len(), 0);
        for t in 0..NUM_THREADS as u64 {
            assert!(!map.contains(&(t * per_thread)));
        }
    }

    #[test]
    fn readers_and_writers() {
        let preloaded = 4096_u64;
        let set: HashSet<u64> = HashSet::default();
        for k in 0..preloaded {
            assert!(set.insert(k).unwrap());
        }

        let done = AtomicBool::new(false);
        let barrier = Barrier::new(NUM_THREADS);
        thread::scope(|s| {
            // Four writer threads churn disjoint keys far above the
            // preloaded range, forcing growth and compaction.
            let writers: Vec<_> = (0..4_u64)
                .map(|t| {
                    let set = &set;
                    let barrier = &barrier;
                    s.spawn(move || {
                        barrier.wait();
                        let base = (1 << 20) + t * 4096;
                        for round in 0..4_u64 {
                            for k in base..base + 4096 {
                                assert!(set.insert(k + (round << 40)).unwrap());
                            }
                            for k in base..base + 4096 {
                                assert!(set.remove(&(k + (round << 40))));
                            }
                        }
                    })
                })
                .collect();
            // Four reader threads scan the preloaded keys while the
            // table is migrating underneath them.
            for _ in 0..4 {
                let set = &set;
                let barrier = &barrier;
                let done = &done;
                s.spawn(move || {
                    barrier.wait();
                    let mut hits = 0_u64;
                    loop {
                        for k in (0..preloaded).step_by(64) {
                            if set.contains(&k) {
                                hits += 1;
                            }
                        }
                        if done.load(Acquire) {
                            break;
                        }
                    }
                    assert!(hits > 0);
                });
            }

            for writer in writers {
                writer.join().unwrap();
            }
            done.store(true, Release);
        });

        assert_eq!(set.len(), preloaded as usize);
        for k in 0..preloaded {
            assert!(set.contains(&k));
        }
    }

    #[test]
    fn resize_under_concurrent_inserts() {
        // A minimum-size table populated to the brink, then hammered by
        // eight threads; every insert must survive into the successors.
        let per_thread = 1000_u64;
        let set: HashSet<u64> = HashSet::with_capacity(0).unwrap();
        let preload = set.capacity() as u64;
        for k in 0..preload {
            assert!(set.insert(u64::MAX - k).unwrap());
        }

        let barrier = Barrier::new(NUM_THREADS);
        thread::scope(|s| {
            for t in 0..NUM_THREADS as u64 {
                let set = &set;
                let barrier = &barrier;
                s.spawn(move || {
                    barrier.wait();
                    let base = t * per_thread;
                    for k in base..base + per_thread {
                        assert!(set.insert(k).unwrap());
                    }
                });
            }
        });

        let total = NUM_THREADS as u64 * per_thread;
        assert_eq!(set.len(), (preload + total) as usize);
        for k in 0..total {
            assert!(set.contains(&k));
        }
        for k in 0..preload {
            assert!(set.contains(&(u64::MAX - k)));
        }

        let guard = Guard::new();
        let keys: BTreeSet<u64> = set.iter(&guard).copied().collect();
        assert_eq!(keys.len(), (preload + total) as usize);
    }

    #[test]
    fn contended_upserts_converge() {
        let keys = 512_u64;
        let map: HashMap<u64, u64> = HashMap::default();
        let barrier = Barrier::new(NUM_THREADS);
        thread::scope(|s| {
            for t in 0..NUM_THREADS as u64 {
                let map = &map;
                let barrier = &barrier;
                s.spawn(move || {
                    barrier.wait();
                    for round in 0..16_u64 {
                        for k in 0..keys {
                            let stamp = (t << 32) | (round << 16) | k;
                            map.upsert(k, stamp).unwrap();
                        }
                    }
                });
            }
        });

        // Every replace is size-neutral, so the count must converge to
        // the number of distinct keys, and each key must hold one of
        // the stamps written for it.
        assert_eq!(map.len(), keys as usize);
        for k in 0..keys {
            let stamp = *map.get(&k).unwrap();
            assert_eq!(stamp & 0xffff, k);
        }
    }

    #[test]
    fn contended_insert_remove_on_shared_keys() {
        let keys = 256_u64;
        let set: HashSet<u64> = HashSet::default();
        let barrier = Barrier::new(NUM_THREADS);
        thread::scope(|s| {
            for _ in 0..NUM_THREADS {
                let set = &set;
                let barrier = &barrier;
                s.spawn(move || {
                    barrier.wait();
                    for round in 0..64_u64 {
                        for k in 0..keys {
                            if round % 2 == 0 {
                                set.insert(k).unwrap();
                            } else {
                                set.remove(&k);
                            }
                        }
                    }
                });
            }
        });

        // The table survives the contention with its accounting intact:
        // iteration and membership agree with each other.
        let guard = Guard::new();
        let remaining: BTreeSet<u64> = set.iter(&guard).copied().collect();
        for k in &remaining {
            assert!(set.contains(k));
        }
        assert!(remaining.len() <= keys as usize);
    }
}
