//! [`HashMap`] is a lock-free concurrent hash map.

use std::collections::hash_map::RandomState;
use std::fmt::{self, Debug};
use std::hash::{BuildHasher, Hash};
use std::sync::atomic::Ordering::{AcqRel, Acquire, Release};

use sdd::{AtomicShared, Guard, Ptr, Shared, Tag};

use super::hash_table::{fold, CapacityError, EntryStore, Retired, Scan, Table};
use super::Equivalent;

/// A lock-free concurrent hash map.
///
/// Lookups and iteration are wait-free and never block or assist
/// writers; insertion, replacement, and removal are lock-free. Values
/// are handed out as reference-counted [`Shared`] handles, so a reader
/// can keep a value alive past the entry's removal. Stored values are
/// never mutated in place: every replacement installs a fresh entry and
/// redirects readers of the old one.
///
/// # Examples
///
/// ```
/// use braided::HashMap;
///
/// let map: HashMap<u64, String> = HashMap::default();
///
/// assert!(map.insert(1, "one".to_string()).unwrap().is_none());
/// assert_eq!(map.read(&1, |_, v| v.clone()).unwrap(), "one");
/// assert_eq!(*map.remove(&1).unwrap(), "one");
/// assert!(map.read(&1, |_, v| v.clone()).is_none());
/// ```
pub struct HashMap<K, V, H = RandomState>
where
    K: 'static,
    V: 'static,
    H: BuildHasher,
{
    table: AtomicShared<Table<Pairs<K, V>>>,
    build_hasher: H,
}

/// One [`AtomicShared`] key cell and one value cell per table slot.
struct Pairs<K: 'static, V: 'static> {
    keys: Box<[AtomicShared<K>]>,
    values: Box<[AtomicShared<V>]>,
}

impl<K: 'static, V: 'static> EntryStore for Pairs<K, V> {
    fn new(capacity: usize) -> Pairs<K, V> {
        Pairs {
            keys: (0..capacity).map(|_| AtomicShared::null()).collect(),
            values: (0..capacity).map(|_| AtomicShared::null()).collect(),
        }
    }

    fn copy(&self, src: &Pairs<K, V>, src_index: u32, dst_index: u32, guard: &Guard) {
        let key = src.keys[src_index as usize].get_shared(Acquire, guard);
        self.keys[dst_index as usize].swap((key, Tag::None), Release);
        let value = src.values[src_index as usize].get_shared(Acquire, guard);
        self.values[dst_index as usize].swap((value, Tag::None), Release);
    }

    fn reset(&self, index: u32) {
        self.keys[index as usize].swap((None, Tag::None), Release);
        self.values[index as usize].swap((None, Tag::None), Release);
    }
}

impl<K: 'static, V: 'static> Pairs<K, V> {
    fn key<'g>(&self, index: u32, guard: &'g Guard) -> Option<&'g K> {
        self.keys[index as usize].load(Acquire, guard).as_ref()
    }

    fn key_shared(&self, index: u32, guard: &Guard) -> Option<Shared<K>> {
        self.keys[index as usize].get_shared(Acquire, guard)
    }

    fn value<'g>(&self, index: u32, guard: &'g Guard) -> Option<&'g V> {
        self.values[index as usize].load(Acquire, guard).as_ref()
    }

    fn value_shared(&self, index: u32, guard: &Guard) -> Option<Shared<V>> {
        self.values[index as usize].get_shared(Acquire, guard)
    }

    fn write(&self, index: u32, key: Shared<K>, value: Shared<V>) {
        self.keys[index as usize].swap((Some(key), Tag::None), Release);
        self.values[index as usize].swap((Some(value), Tag::None), Release);
    }
}

/// An iterator over the entries of a [`HashMap`], pinned to the table
/// incarnation current at creation time.
///
/// Iteration is weakly consistent: it observes a subset of the entries
/// that were present at some point between creation and exhaustion.
pub struct Iter<'g, K: 'static, V: 'static> {
    table: &'g Table<Pairs<K, V>>,
    scan: Scan<'g, Pairs<K, V>>,
    guard: &'g Guard,
}

impl<K, V, H> HashMap<K, V, H>
where
    K: 'static + Eq + Hash,
    V: 'static,
    H: BuildHasher,
{
    /// Creates an empty [`HashMap`] with the given [`BuildHasher`].
    ///
    /// # Examples
    ///
    /// ```
    /// use braided::HashMap;
    /// use std::collections::hash_map::RandomState;
    ///
    /// let map: HashMap<u64, u32, RandomState> = HashMap::with_hasher(RandomState::new());
    /// assert!(map.is_empty());
    /// ```
    #[inline]
    pub fn with_hasher(build_hasher: H) -> HashMap<K, V, H> {
        HashMap {
            table: AtomicShared::from(Shared::new(Table::with_minimum_capacity())),
            build_hasher,
        }
    }

    /// Creates an empty [`HashMap`] able to hold `capacity` entries
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
    /// use braided::HashMap;
    /// use std::collections::hash_map::RandomState;
    ///
    /// let map: HashMap<u64, u32, RandomState> =
    ///     HashMap::with_capacity_and_hasher(1000, RandomState::new()).unwrap();
    /// assert!(map.capacity() >= 1000);
    /// ```
    #[inline]
    pub fn with_capacity_and_hasher(
        capacity: usize,
        build_hasher: H,
    ) -> Result<HashMap<K, V, H>, CapacityError> {
        Ok(HashMap {
            table: AtomicShared::from(Shared::new(Table::with_capacity(capacity)?)),
            build_hasher,
        })
    }

    /// Inserts a key-value pair, replacing and returning the previous
    /// value if the key was present.
    ///
    /// # Errors
    ///
    /// Returns [`CapacityError`] if the map would have to grow beyond
    /// the maximum capacity.
    ///
    /// # Examples
    ///
    /// ```
    /// use braided::HashMap;
    ///
    /// let map: HashMap<u64, u32> = HashMap::default();
    /// assert!(map.upsert(1, 10).unwrap().is_none());
    /// assert_eq!(*map.upsert(1, 11).unwrap().unwrap(), 10);
    /// assert_eq!(*map.get(&1).unwrap(), 11);
    /// ```
    #[inline]
    pub fn upsert(&self, key: K, value: V) -> Result<Option<Shared<V>>, CapacityError> {
        self.put(key, value, false)
    }

    /// Inserts a key-value pair unless the key is present; returns the
    /// current value without inserting if it is.
    ///
    /// # Errors
    ///
    /// Returns [`CapacityError`] if the map would have to grow beyond
    /// the maximum capacity.
    ///
    /// # Examples
    ///
    /// ```
    /// use braided::HashMap;
    ///
    /// let map: HashMap<u64, u32> = HashMap::default();
    /// assert!(map.insert(1, 10).unwrap().is_none());
    /// assert_eq!(*map.insert(1, 11).unwrap().unwrap(), 10);
    /// assert_eq!(*map.get(&1).unwrap(), 10);
    /// ```
    #[inline]
    pub fn insert(&self, key: K, value: V) -> Result<Option<Shared<V>>, CapacityError> {
        self.put(key, value, true)
    }

    /// Replaces the value of an existing key and returns the previous
    /// value; does nothing if the key is absent. The stored key is
    /// reused, so no owned key is needed.
    ///
    /// # Errors
    ///
    /// Returns [`CapacityError`] if the map would have to grow beyond
    /// the maximum capacity.
    ///
    /// # Examples
    ///
    /// ```
    /// use braided::HashMap;
    ///
    /// let map: HashMap<u64, u32> = HashMap::default();
    /// assert!(map.update(&1, 10).unwrap().is_none());
    /// assert!(map.insert(1, 10).unwrap().is_none());
    /// assert_eq!(*map.update(&1, 11).unwrap().unwrap(), 10);
    /// assert_eq!(*map.get(&1).unwrap(), 11);
    /// ```
    pub fn update<Q>(&self, key: &Q, value: V) -> Result<Option<Shared<V>>, CapacityError>
    where
        Q: Equivalent<K> + Hash + ?Sized,
    {
        let hash = self.hash(key);
        let value = Shared::new(value);
        let guard = Guard::new();
        loop {
            let table_ptr = self.table.load(Acquire, &guard);
            let table = current(table_ptr);
            {
                let mut updater = table.updater(hash);
                loop {
                    match updater.next() {
                        Err(Retired) => break,
                        Ok(None) => return Ok(None),
                        Ok(Some(index)) => {
                            let (Some(stored_key), Some(previous)) = (
                                table.data().key_shared(index, &guard),
                                table.data().value_shared(index, &guard),
                            ) else {
                                continue;
                            };
                            if !key.equivalent(&stored_key) {
                                continue;
                            }
                            match updater.alloc() {
                                Err(Retired) => break,
                                Ok(new_index) => {
                                    table.data().write(new_index, stored_key, value.clone());
                                    if updater.replace() {
                                        return Ok(Some(previous));
                                    }
                                    updater.restart();
                                }
                            }
                        }
                    }
                }
            }
            self.migrate(table_ptr, &guard)?;
        }
    }

    /// Removes a key and returns its value.
    ///
    /// # Examples
    ///
    /// ```
    /// use braided::HashMap;
    ///
    /// let map: HashMap<u64, u32> = HashMap::default();
    /// assert!(map.insert(1, 10).unwrap().is_none());
    /// assert_eq!(*map.remove(&1).unwrap(), 10);
    /// assert!(map.remove(&1).is_none());
    /// ```
    #[inline]
    pub fn remove<Q>(&self, key: &Q) -> Option<Shared<V>>
    where
        Q: Equivalent<K> + Hash + ?Sized,
    {
        self.remove_if(key, |_| true)
    }

    /// Removes a key and returns its value if the condition holds for
    /// the current value.
    ///
    /// # Examples
    ///
    /// ```
    /// use braided::HashMap;
    ///
    /// let map: HashMap<u64, u32> = HashMap::default();
    /// assert!(map.insert(1, 10).unwrap().is_none());
    /// assert!(map.remove_if(&1, |v| *v == 11).is_none());
    /// assert_eq!(*map.remove_if(&1, |v| *v == 10).unwrap(), 10);
    /// ```
    pub fn remove_if<Q, F>(&self, key: &Q, mut condition: F) -> Option<Shared<V>>
    where
        Q: Equivalent<K> + Hash + ?Sized,
        F: FnMut(&V) -> bool,
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
                        Ok(None) => return None,
                        Ok(Some(index)) => {
                            let (Some(stored), Some(value)) = (
                                table.data().key(index, &guard),
                                table.data().value_shared(index, &guard),
                            ) else {
                                continue;
                            };
                            if !key.equivalent(stored) {
                                continue;
                            }
                            if !condition(&value) {
                                return None;
                            }
                            if updater.remove() {
                                table.data().reset(index);
                                return Some(value);
                            }
                            updater.restart();
                        }
                    }
                }
            }
            // A join of an installed migration cannot fail; retry on
            // the successor either way.
            let _ = self.migrate(table_ptr, &guard);
        }
    }

    /// Applies the reader to the entry matching the key. Wait-free.
    ///
    /// # Examples
    ///
    /// ```
    /// use braided::HashMap;
    ///
    /// let map: HashMap<u64, String> = HashMap::default();
    /// assert!(map.insert(1, "one".to_string()).unwrap().is_none());
    /// assert_eq!(map.read(&1, |_, v| v.len()), Some(3));
    /// assert_eq!(map.read(&2, |_, v| v.len()), None);
    /// ```
    #[inline]
    pub fn read<Q, R, F>(&self, key: &Q, reader: F) -> Option<R>
    where
        Q: Equivalent<K> + Hash + ?Sized,
        F: FnOnce(&K, &V) -> R,
    {
        let guard = Guard::new();
        let (k, v) = self.entry_refs(key, &guard)?;
        Some(reader(k, v))
    }

    /// Returns a handle to the value matching the key. Wait-free.
    ///
    /// # Examples
    ///
    /// ```
    /// use braided::HashMap;
    ///
    /// let map: HashMap<u64, u32> = HashMap::default();
    /// assert!(map.insert(1, 10).unwrap().is_none());
    ///
    /// let value = map.get(&1).unwrap();
    /// assert_eq!(*value, 10);
    ///
    /// // The handle keeps the value alive past removal.
    /// map.remove(&1);
    /// assert_eq!(*value, 10);
    /// ```
    pub fn get<Q>(&self, key: &Q) -> Option<Shared<V>>
    where
        Q: Equivalent<K> + Hash + ?Sized,
    {
        let guard = Guard::new();
        let table = current(self.table.load(Acquire, &guard));
        let mut finder = table.finder(self.hash(key));
        while let Some(index) = finder.next() {
            let k = table.data().key(index, &guard);
            let v = table.data().value_shared(index, &guard);
            match (k, v) {
                (Some(k), Some(v)) if key.equivalent(k) => return Some(v),
                (Some(_), Some(_)) => {}
                _ => finder.reload(),
            }
        }
        None
    }

    /// Returns `true` if the key is present. Wait-free.
    ///
    /// # Examples
    ///
    /// ```
    /// use braided::HashMap;
    ///
    /// let map: HashMap<String, u32> = HashMap::default();
    /// assert!(map.insert("one".to_string(), 1).unwrap().is_none());
    /// assert!(map.contains("one"));
    /// assert!(!map.contains("two"));
    /// ```
    #[inline]
    pub fn contains<Q>(&self, key: &Q) -> bool
    where
        Q: Equivalent<K> + Hash + ?Sized,
    {
        let guard = Guard::new();
        self.entry_refs(key, &guard).is_some()
    }

    /// Returns an iterator over the entries, pinned to the current
    /// table incarnation for the lifetime of `guard`.
    ///
    /// # Examples
    ///
    /// ```
    /// use braided::{Guard, HashMap};
    ///
    /// let map: HashMap<u64, u32> = HashMap::default();
    /// for k in 0..4 {
    ///     assert!(map.insert(k, 100 + k as u32).unwrap().is_none());
    /// }
    ///
    /// let guard = Guard::new();
    /// let mut entries: Vec<(u64, u32)> = map.iter(&guard).map(|(k, v)| (*k, *v)).collect();
    /// entries.sort_unstable();
    /// assert_eq!(entries, vec![(0, 100), (1, 101), (2, 102), (3, 103)]);
    /// ```
    pub fn iter<'g>(&self, guard: &'g Guard) -> Iter<'g, K, V> {
        let table = current(self.table.load(Acquire, guard));
        Iter {
            table,
            scan: table.scan(),
            guard,
        }
    }

    /// Returns the number of entries in the map.
    ///
    /// The value is eventually consistent: concurrent mutations may or
    /// may not be reflected.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        let guard = Guard::new();
        current(self.table.load(Acquire, &guard)).len() as usize
    }

    /// Returns `true` if the map holds no entries.
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

    /// Removes all entries by installing a fresh minimum-size table.
    pub fn clear(&self) {
        self.table.swap(
            (Some(Shared::new(Table::with_minimum_capacity())), Tag::None),
            AcqRel,
        );
    }

    /// The insert/replace loop shared by [`upsert`](Self::upsert) and
    /// [`insert`](Self::insert).
    fn put(&self, key: K, value: V, if_absent: bool) -> Result<Option<Shared<V>>, CapacityError> {
        let hash = self.hash(&key);
        let key = Shared::new(key);
        let value = Shared::new(value);
        let guard = Guard::new();
        loop {
            let table_ptr = self.table.load(Acquire, &guard);
            let table = current(table_ptr);
            {
                let mut updater = table.updater(hash);
                loop {
                    match updater.next() {
                        Err(Retired) => break,
                        Ok(found) => {
                            let mut previous = None;
                            if let Some(index) = found {
                                // A tag match: check the key.
                                let (Some(stored), Some(existing)) = (
                                    table.data().key(index, &guard),
                                    table.data().value_shared(index, &guard),
                                ) else {
                                    continue;
                                };
                                if stored != &*key {
                                    continue;
                                }
                                if if_absent {
                                    return Ok(Some(existing));
                                }
                                previous = Some(existing);
                            }
                            match updater.alloc() {
                                Err(Retired) => break,
                                Ok(new_index) => {
                                    table.data().write(new_index, key.clone(), value.clone());
                                    let committed = if found.is_some() {
                                        updater.replace()
                                    } else {
                                        updater.insert()
                                    };
                                    if committed {
                                        return Ok(previous);
                                    }
                                    updater.restart();
                                }
                            }
                        }
                    }
                }
            }
            self.migrate(table_ptr, &guard)?;
        }
    }

    /// Wait-free lookup yielding guard-bound references.
    fn entry_refs<'g, Q>(&self, key: &Q, guard: &'g Guard) -> Option<(&'g K, &'g V)>
    where
        Q: Equivalent<K> + Hash + ?Sized,
    {
        let table = current(self.table.load(Acquire, guard));
        let mut finder = table.finder(self.hash(key));
        while let Some(index) = finder.next() {
            let k = table.data().key(index, guard);
            let v = table.data().value(index, guard);
            match (k, v) {
                (Some(k), Some(v)) if key.equivalent(k) => return Some((k, v)),
                (Some(_), Some(_)) => {}
                _ => finder.reload(),
            }
        }
        None
    }

    fn hash<Q: Hash + ?Sized>(&self, key: &Q) -> u32 {
        fold(self.build_hasher.hash_one(key))
    }

    /// Joins the migration of the observed table and installs its
    /// successor as the current table.
    fn migrate<'g>(
        &self,
        table_ptr: Ptr<'g, Table<Pairs<K, V>>>,
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

impl<K, V> HashMap<K, V, RandomState>
where
    K: 'static + Eq + Hash,
    V: 'static,
{
    /// Creates an empty [`HashMap`].
    ///
    /// # Examples
    ///
    /// ```
    /// use braided::HashMap;
    ///
    /// let map: HashMap<u64, u32> = HashMap::new();
    /// assert!(map.is_empty());
    /// ```
    #[inline]
    #[must_use]
    pub fn new() -> HashMap<K, V, RandomState> {
        Self::with_hasher(RandomState::new())
    }

    /// Creates an empty [`HashMap`] able to hold `capacity` entries
    /// before it has to grow.
    ///
    /// # Errors
    ///
    /// Returns [`CapacityError`] if `capacity` exceeds the maximum
    /// capacity of 2^30 entries.
    #[inline]
    pub fn with_capacity(capacity: usize) -> Result<HashMap<K, V, RandomState>, CapacityError> {
        Self::with_capacity_and_hasher(capacity, RandomState::new())
    }
}

impl<K, V> Default for HashMap<K, V, RandomState>
where
    K: 'static + Eq + Hash,
    V: 'static,
{
    #[inline]
    fn default() -> HashMap<K, V, RandomState> {
        Self::new()
    }
}

impl<K, V, H> Debug for HashMap<K, V, H>
where
    K: 'static + Debug + Eq + Hash,
    V: 'static + Debug,
    H: BuildHasher,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let guard = Guard::new();
        f.debug_map().entries(self.iter(&guard)).finish()
    }
}

impl<'g, K, V> Iterator for Iter<'g, K, V>
where
    K: 'static,
    V: 'static,
{
    type Item = (&'g K, &'g V);

    #[inline]
    fn next(&mut self) -> Option<(&'g K, &'g V)> {
        while let Some(index) = self.scan.next() {
            let k = self.table.data().key(index, self.guard);
            let v = self.table.data().value(index, self.guard);
            if let (Some(k), Some(v)) = (k, v) {
                return Some((k, v));
            }
        }
        None
    }
}

impl<K: 'static, V: 'static> Debug for Iter<'_, K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Iter").finish_non_exhaustive()
    }
}

/// The facade's table pointer is never null.
fn current<'g, K: 'static, V: 'static>(
    table_ptr: Ptr<'g, Table<Pairs<K, V>>>,
) -> &'g Table<Pairs<K, V>> {
    unsafe { table_ptr.as_ref().unwrap_unchecked() }
}
