//! [`HashSet`] is a lock-free concurrent hash set.

use std::collections::hash_map::RandomState;
use std::fmt::{self, Debug};
use std::hash::{BuildHasher, Hash};
use std::sync::atomic::Ordering::{AcqRel, Acquire, Release};

use sdd::{AtomicShared, Guard, Ptr, Shared, Tag};

use super::hash_table::{fold, CapacityError, EntryStore, Retired, Scan, Table};
use super::Equivalent;

/// A lock-free concurrent hash set.
///
/// Membership tests and iteration are wait-free and never block or
/// assist writers; insertion and removal are lock-free. The set grows
/// cooperatively: every thread that observes a full or frozen table
/// helps migrate it to its successor.
///
/// # Examples
///
/// ```
/// use braided::HashSet;
///
/// let set: HashSet<u64> = HashSet::default();
///
/// assert!(set.insert(1).unwrap());
/// assert!(!set.insert(1).unwrap());
/// assert!(set.contains(&1));
/// assert!(set.remove(&1));
/// assert!(!set.contains(&1));
/// ```
pub struct HashSet<K, H = RandomState>
where
    K: 'static,
    H: BuildHasher,
{
    table: AtomicShared<Table<Keys<K>>>,
    build_hasher: H,
}

/// One [`AtomicShared`] key cell per table slot.
struct Keys<K: 'static> {
    cells: Box<[AtomicShared<K>]>,
}

impl<K: 'static> EntryStore for Keys<K> {
    fn new(capacity: usize) -> Keys<K> {
        Keys {
            cells: (0..capacity).map(|_| AtomicShared::null()).collect(),
        }
    }

    fn copy(&self, src: &Keys<K>, src_index: u32, dst_index: u32, guard: &Guard) {
        let key = src.cells[src_index as usize].get_shared(Acquire, guard);
        self.cells[dst_index as usize].swap((key, Tag::None), Release);
    }

    fn reset(&self, index: u32) {
        self.cells[index as usize].swap((None, Tag::None), Release);
    }
}

impl<K: 'static> Keys<K> {
    fn key<'g>(&self, index: u32, guard: &'g Guard) -> Option<&'g K> {
        self.cells[index as usize].load(Acquire, guard).as_ref()
    }

    fn set(&self, index: u32, key: Shared<K>) {
        self.cells[index as usize].swap((Some(key), Tag::None), Release);
    }
}

/// An iterator over the keys of a [`HashSet`], pinned to the table
/// incarnation current at creation time.
///
/// Iteration is weakly consistent: it observes a subset of the keys
/// that were present at some point between creation and exhaustion.
pub struct Iter<'g, K: 'static> {
    table: &'g Table<Keys<K>>,
    scan: Scan<'g, Keys<K>>,
    guard: &'g Guard,
}

impl<K, H> HashSet<K, H>
where
    K: 'static + Eq + Hash,
    H: BuildHasher,
{
    /// Creates an empty [`HashSet`] with the given [`BuildHasher`].
    ///
    /// # Examples
    ///
    /// ```
    /// use braided::HashSet;
    /// use std::collections::hash_map::RandomState;
    ///
    /// let set: HashSet<u64, RandomState> = HashSet::with_hasher(RandomState::new());
    /// assert!(set.is_empty());
    /// ```
    #[inline]
    pub fn with_hasher(build_hasher: H) -> HashSet<K, H> {
        HashSet {
            table: AtomicShared::from(Shared::new(Table::with_minimum_capacity())),
            build_hasher,
        }
    }

    /// Creates an empty [`HashSet`] able to hold `capacity` entries
    /// before it has to grow.
    ///
    /// # Errors
    ///
    /// Returns [`CapacityError`] if `capacity` exceeds the maximum
    /// capacity of 2^30 entries.
    ///
    /// # Examples
    ///
    /// ```
    /// use braided::HashSet;
    /// use std::collections::hash_map::RandomState;
    ///
    /// let set: HashSet<u64, RandomState> =
    ///     HashSet::with_capacity_and_hasher(100, RandomState::new()).unwrap();
    /// assert!(set.capacity() >= 100);
    /// ```
    #[inline]
    pub fn with_capacity_and_hasher(
        capacity: usize,
        build_hasher: H,
    ) -> Result<HashSet<K, H>, CapacityError> {
        Ok(HashSet {
            table: AtomicShared::from(Shared::new(Table::with_capacity(capacity)?)),
            build_hasher,
        })
    }

    /// Inserts a key into the set. Returns `false` if an equal key was
    /// already present.
    ///
    /// # Errors
    ///
    /// Returns [`CapacityError`] if the set would have to grow beyond
    /// the maximum capacity.
    ///
    /// # Examples
    ///
    /// ```
    /// use braided::HashSet;
    ///
    /// let set: HashSet<u64> = HashSet::default();
    /// assert!(set.insert(11).unwrap());
    /// assert!(!set.insert(11).unwrap());
    /// ```
    pub fn insert(&self, key: K) -> Result<bool, CapacityError> {
        let hash = self.hash(&key);
        let key = Shared::new(key);
        let guard = Guard::new();
        loop {
            let table_ptr = self.table.load(Acquire, &guard);
            let table = current(table_ptr);
            {
                let mut updater = table.updater(hash);
                loop {
                    match updater.next() {
                        Err(Retired) => break,
                        Ok(Some(index)) => {
                            if let Some(stored) = table.data().key(index, &guard) {
                                if stored == &*key {
                                    return Ok(false);
                                }
                            }
                            // A vanished or different key with the same
                            // tag: keep walking the chain.
                        }
                        Ok(None) => match updater.alloc() {
                            Err(Retired) => break,
                            Ok(new_index) => {
                                table.data().set(new_index, key.clone());
                                if updater.insert() {
                                    return Ok(true);
                                }
                                updater.restart();
                            }
                        },
                    }
                }
            }
            self.migrate(table_ptr, &guard)?;
        }
    }

    /// Removes a key from the set. Returns `false` if no equal key was
    /// present.
    ///
    /// # Examples
    ///
    /// ```
    /// use braided::HashSet;
    ///
    /// let set: HashSet<u64> = HashSet::default();
    /// assert!(set.insert(11).unwrap());
    /// assert!(set.remove(&11));
    /// assert!(!set.remove(&11));
    /// ```
    pub fn remove<Q>(&self, key: &Q) -> bool
    where
        Q: Equivalent<K> + Hash + ?Sized,
    {
        let hash = self.hash(key);
        let guard = Guard::new();
        loop {
            let table_ptr = self.table.load(Acquire, &guard);
            let table = current(table_ptr);
            {
                let mut updater = table.updater(hash);
                loop {
                    match updater.next() {
                        Err(Retired) => break,
                        Ok(None) => return false,
                        Ok(Some(index)) => {
                            let found = table
                                .data()
                                .key(index, &guard)
                                .map_or(false, |stored| key.equivalent(stored));
                            if found {
                                if updater.remove() {
                                    table.data().reset(index);
                                    return true;
                                }
                                updater.restart();
                            }
                        }
                    }
                }
            }
            // A join of an installed migration cannot fail; retry on
            // the successor either way.
            let _ = self.migrate(table_ptr, &guard);
        }
    }

    /// Returns `true` if an equal key is present. Wait-free.
    ///
    /// # Examples
    ///
    /// ```
    /// use braided::HashSet;
    ///
    /// let set: HashSet<String> = HashSet::default();
    /// assert!(set.insert("braid".to_string()).unwrap());
    /// assert!(set.contains("braid"));
    /// assert!(!set.contains("rope"));
    /// ```
    pub fn contains<Q>(&self, key: &Q) -> bool
    where
        Q: Equivalent<K> + Hash + ?Sized,
    {
        let guard = Guard::new();
        let table = current(self.table.load(Acquire, &guard));
        let mut finder = table.finder(self.hash(key));
        while let Some(index) = finder.next() {
            if let Some(stored) = table.data().key(index, &guard) {
                if key.equivalent(stored) {
                    return true;
                }
            }
        }
        false
    }

    /// Returns an iterator over the keys, pinned to the current table
    /// incarnation for the lifetime of `guard`.
    ///
    /// # Examples
    ///
    /// ```
    /// use braided::{Guard, HashSet};
    ///
    /// let set: HashSet<u64> = HashSet::default();
    /// for k in 0..8 {
    ///     assert!(set.insert(k).unwrap());
    /// }
    ///
    /// let guard = Guard::new();
    /// let mut keys: Vec<u64> = set.iter(&guard).copied().collect();
    /// keys.sort_unstable();
    /// assert_eq!(keys, (0..8).collect::<Vec<u64>>());
    /// ```
    pub fn iter<'g>(&self, guard: &'g Guard) -> Iter<'g, K> {
        let table = current(self.table.load(Acquire, guard));
        Iter {
            table,
            scan: table.scan(),
            guard,
        }
    }

    /// Returns the number of keys in the set.
    ///
    /// The value is eventually consistent: concurrent mutations may or
    /// may not be reflected.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        let guard = Guard::new();
        current(self.table.load(Acquire, &guard)).len() as usize
    }

    /// Returns `true` if the set holds no keys.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the number of entries the current table can hold.
    #[inline]
    #[must_use]
    pub fn capacity(&self) -> usize {
        let guard = Guard::new();
        current(self.table.load(Acquire, &guard)).capacity() as usize
    }

    /// Removes all keys by installing a fresh minimum-size table.
    ///
    /// # Examples
    ///
    /// ```
    /// use braided::HashSet;
    ///
    /// let set: HashSet<u64> = HashSet::default();
    /// assert!(set.insert(1).unwrap());
    /// set.clear();
    /// assert!(set.is_empty());
    /// ```
    pub fn clear(&self) {
        self.table.swap(
            (Some(Shared::new(Table::with_minimum_capacity())), Tag::None),
            AcqRel,
        );
    }

    fn hash<Q: Hash + ?Sized>(&self, key: &Q) -> u32 {
        fold(self.build_hasher.hash_one(key))
    }

    /// Joins the migration of the observed table and installs its
    /// successor as the current table.
    fn migrate<'g>(
        &self,
        table_ptr: Ptr<'g, Table<Keys<K>>>,
        guard: &'g Guard,
    ) -> Result<(), CapacityError> {
        let table = current(table_ptr);
        let new_table = table.resize(guard)?;
        let _ = self.table.compare_exchange(
            table_ptr,
            (Some(new_table), Tag::None),
            AcqRel,
            Acquire,
            guard,
        );
        Ok(())
    }
}

impl<K> HashSet<K, RandomState>
where
    K: 'static + Eq + Hash,
{
    /// Creates an empty [`HashSet`].
    ///
    /// # Examples
    ///
    /// ```
    /// use braided::HashSet;
    ///
    /// let set: HashSet<u64> = HashSet::new();
    /// assert!(set.is_empty());
    /// ```
    #[inline]
    #[must_use]
    pub fn new() -> HashSet<K, RandomState> {
        Self::with_hasher(RandomState::new())
    }

    /// Creates an empty [`HashSet`] able to hold `capacity` entries
    /// before it has to grow.
    ///
    /// # Errors
    ///
    /// Returns [`CapacityError`] if `capacity` exceeds the maximum
    /// capacity of 2^30 entries.
    #[inline]
    pub fn with_capacity(capacity: usize) -> Result<HashSet<K, RandomState>, CapacityError> {
        Self::with_capacity_and_hasher(capacity, RandomState::new())
    }
}

impl<K> Default for HashSet<K, RandomState>
where
    K: 'static + Eq + Hash,
{
    #[inline]
    fn default() -> HashSet<K, RandomState> {
        Self::new()
    }
}

impl<K, H> Debug for HashSet<K, H>
where
    K: 'static + Debug + Eq + Hash,
    H: BuildHasher,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let guard = Guard::new();
        f.debug_set().entries(self.iter(&guard)).finish()
    }
}

impl<'g, K> Iterator for Iter<'g, K>
where
    K: 'static,
{
    type Item = &'g K;

    #[inline]
    fn next(&mut self) -> Option<&'g K> {
        while let Some(index) = self.scan.next() {
            if let Some(key) = self.table.data().key(index, self.guard) {
                return Some(key);
            }
        }
        None
    }
}

impl<K: 'static> Debug for Iter<'_, K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Iter").finish_non_exhaustive()
    }
}

/// The facade's table pointer is never null.
fn current<'g, K: 'static>(table_ptr: Ptr<'g, Table<Keys<K>>>) -> &'g Table<Keys<K>> {
    unsafe { table_ptr.as_ref().unwrap_unchecked() }
}
