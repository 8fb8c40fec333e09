//! The lock-free table core shared by [`HashSet`](crate::HashSet) and
//! [`HashMap`](crate::HashMap).
//!
//! A table is a power-of-two array of packed 64-bit slot words
//! ([`state::Layout`]) plus the facade-owned entry storage. Bucket
//! chains are ordered by stored hash tag and are braided through the
//! same array that holds the bucket heads; all coordination is
//! compare-and-swap on single words. Lookup cursors are wait-free,
//! update cursors are lock-free, and growth is a cooperative migration
//! driven by [`resizer::Resizer`].

mod counter;
mod cursor;
mod resizer;
mod state;

use std::fmt;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering::{AcqRel, Acquire};

use sdd::{AtomicShared, Guard, Shared, Tag};

use counter::SizeCounter;
pub(crate) use cursor::{Finder, Retired, Scan, Updater};
use resizer::Resizer;
use state::{Layout, MAX_TABLE_SIZE, MIN_TABLE_SIZE, PHI, RESERVED, RESERVED_STAMP};

/// Error returned when a table would have to grow beyond the maximum
/// capacity of 2^30 slots.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct CapacityError;

impl fmt::Display for CapacityError {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("exceeds the maximum capacity of 2^30 entries")
    }
}

impl std::error::Error for CapacityError {}

/// Folds a 64-bit hash into the 32-bit domain the table works in.
#[allow(clippy::cast_possible_truncation)]
#[inline]
pub(crate) fn fold(hash: u64) -> u32 {
    (hash ^ (hash >> 32)) as u32
}

/// Entry storage owned by a facade, indexed by logical entry index
/// (`0..capacity`).
///
/// The table core owns the slot-word array and the chain topology; the
/// storage owns whatever per-entry data the facade keeps. `copy` is
/// called by the migration after a slot in the successor table has been
/// reserved and before it is linked; it may run concurrently for
/// distinct `dst_index` values. `reset` clears an index whose
/// reservation was abandoned or whose entry was removed.
pub(crate) trait EntryStore: 'static + Sized {
    /// Allocates storage for `capacity` entries.
    fn new(capacity: usize) -> Self;

    /// Copies the entry at `src_index` in `src` to `dst_index` in
    /// `self`.
    fn copy(&self, src: &Self, src_index: u32, dst_index: u32, guard: &Guard);

    /// Clears the entry at `index`.
    fn reset(&self, index: u32);
}

/// One incarnation of the lock-free table.
pub(crate) struct Table<D: EntryStore> {
    layout: Layout,
    states: Box<[AtomicU64]>,
    size: SizeCounter,
    resizer: AtomicShared<Resizer<D>>,
    data: D,
}

impl<D: EntryStore> Table<D> {
    /// Creates a table able to hold roughly `capacity` entries before
    /// its first growth, including the original headroom of 1/16.
    pub(crate) fn with_capacity(capacity: usize) -> Result<Table<D>, CapacityError> {
        let padded = capacity.saturating_add(capacity / 16);
        let table_size = u32::try_from(padded).map_err(|_| CapacityError)?;
        Self::try_new(table_size)
    }

    /// Creates a table of at least `table_size` slots.
    pub(crate) fn try_new(table_size: u32) -> Result<Table<D>, CapacityError> {
        if table_size > MAX_TABLE_SIZE {
            return Err(CapacityError);
        }
        Ok(Self::with_table_size(
            table_size.max(MIN_TABLE_SIZE).next_power_of_two(),
        ))
    }

    /// Creates a minimum-size table.
    pub(crate) fn with_minimum_capacity() -> Table<D> {
        Self::with_table_size(MIN_TABLE_SIZE)
    }

    /// Creates a table of exactly `table_size` slots; the size must be
    /// a valid power of two.
    fn with_table_size(table_size: u32) -> Table<D> {
        debug_assert!(table_size.is_power_of_two());
        debug_assert!((MIN_TABLE_SIZE..=MAX_TABLE_SIZE).contains(&table_size));
        let states: Box<[AtomicU64]> = (0..table_size).map(|_| AtomicU64::new(0)).collect();
        for reserved in &states[..RESERVED as usize] {
            reserved.store(RESERVED_STAMP, std::sync::atomic::Ordering::Relaxed);
        }
        Table {
            layout: Layout::new(table_size),
            states,
            size: SizeCounter::new(),
            resizer: AtomicShared::null(),
            data: D::new((table_size - RESERVED) as usize),
        }
    }

    /// The facade-owned entry storage.
    #[inline]
    pub(crate) fn data(&self) -> &D {
        &self.data
    }

    /// Number of slots, always a power of two.
    #[allow(clippy::cast_possible_truncation)]
    #[inline]
    pub(crate) fn tab_size(&self) -> u32 {
        self.states.len() as u32
    }

    /// Number of entries the table can hold; two slots are reserved.
    #[inline]
    pub(crate) fn capacity(&self) -> u32 {
        self.tab_size() - RESERVED
    }

    /// Eventually-consistent number of live entries.
    #[inline]
    pub(crate) fn len(&self) -> u32 {
        SizeCounter::live(self.size.sum())
    }

    /// Records a committed size delta.
    #[inline]
    fn add_size(&self, delta: u64) {
        self.size.add(delta);
    }

    #[inline]
    fn layout(&self) -> Layout {
        self.layout
    }

    #[inline]
    fn state(&self, index: u32) -> u64 {
        self.states[index as usize].load(Acquire)
    }

    #[inline]
    fn cas_state(&self, index: u32, state: u64, new_state: u64) -> bool {
        self.states[index as usize]
            .compare_exchange(state, new_state, AcqRel, Acquire)
            .is_ok()
    }

    /// Reserves a currently-free slot near `start`, stamping its entry
    /// body in the same step. Returns `0` when the table needs to grow
    /// instead.
    ///
    /// The first eight probes are linear so that they stay on the
    /// caller's cache lines; after that the step widens triangularly
    /// until every slot has been visited once.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn alloc(&self, start: u32, hash: u32, next: u32) -> u32 {
        let slot_mask = self.layout.slot_mask();
        let mut index = start;
        let mut i = -state::LINEAR_PROBES;
        while i <= slot_mask as i32 {
            index = index.wrapping_add(i.max(1) as u32) & slot_mask;
            let state = self.state(index);
            if Layout::is_free(state) {
                let claimed = self.layout.occupy(state, hash, next);
                if self.cas_state(index, state, claimed) {
                    return index;
                }
            } else if i == 0 {
                let sum = self.size.sum();
                if self.should_resize(sum as u32) {
                    return 0;
                }
            } else if !self.resizer.is_null(Acquire) {
                return 0;
            }
            i += 1;
        }
        0
    }

    /// Releases a reserved slot that was never linked into a chain.
    fn free(&self, index: u32) {
        self.data.reset(index - RESERVED);
        loop {
            let state = self.state(index);
            if self.cas_state(index, state, Layout::release(state)) {
                return;
            }
        }
    }

    /// Points the previous link (the bucket head when `prev_index` is
    /// `0`, the `next` field of `prev_index` otherwise) at `index`.
    fn link(&self, slot: u32, prev_index: u32, prev_state: u64, index: u32) -> bool {
        if prev_index == 0 {
            self.cas_state(slot, prev_state, self.layout.with_head(prev_state, index))
        } else {
            self.cas_state(
                prev_index,
                prev_state,
                self.layout.with_next(prev_state, index),
            )
        }
    }

    /// `true` once the cumulative insert count crosses 15/16 of the
    /// capacity; accumulated removed bodies count against it, which is
    /// what eventually forces a compacting migration.
    fn should_resize(&self, added: u32) -> bool {
        let cap = self.capacity();
        added >= cap - (cap >> 4)
    }

    /// Capacity of the successor table: doubled while at least half of
    /// the capacity is live, kept for a compacting migration otherwise.
    ///
    /// A striped-counter snapshot can put `removed` above the capacity;
    /// signed arithmetic keeps that case in the compacting branch.
    fn next_capacity(&self, removed: u32) -> u32 {
        let cap = self.capacity();
        if (i64::from(cap) - i64::from(removed)) << 1 >= i64::from(cap) {
            cap << 1
        } else {
            cap
        }
    }

    /// Returns a wait-free cursor over the chain matching `hash`.
    pub(crate) fn finder(&self, hash: u32) -> Finder<'_, D> {
        Finder::new(self, hash.wrapping_mul(PHI))
    }

    /// Returns a mutating cursor over the chain matching `hash`.
    pub(crate) fn updater(&self, hash: u32) -> Updater<'_, D> {
        Updater::new(self, hash.wrapping_mul(PHI))
    }

    /// Returns a cursor yielding every live entry index, bucket by
    /// bucket. Weakly consistent.
    pub(crate) fn scan(&self) -> Scan<'_, D> {
        Scan::new(self)
    }

    /// Joins or starts the migration to the successor table and returns
    /// it. Idempotent: every caller receives the same successor.
    #[allow(clippy::cast_possible_truncation)]
    pub(crate) fn resize(&self, guard: &Guard) -> Result<Shared<Table<D>>, CapacityError> {
        let mut resizer_ptr = self.resizer.load(Acquire, guard);
        if resizer_ptr.is_null() {
            let sum = self.size.sum();
            let target = self
                .tab_size()
                .max(self.next_capacity((sum >> 32) as u32))
                .next_power_of_two();
            if target > MAX_TABLE_SIZE {
                return Err(CapacityError);
            }
            let resizer = Shared::new(Resizer::new(self.tab_size(), target));
            let installed = self
                .resizer
                .compare_exchange(
                    resizer_ptr,
                    (Some(resizer), Tag::None),
                    AcqRel,
                    Acquire,
                    guard,
                )
                .is_ok();
            resizer_ptr = self.resizer.load(Acquire, guard);
            if installed {
                if let Some(resizer) = resizer_ptr.as_ref() {
                    resizer.install(guard);
                }
            }
        }

        // The handle is installed exactly once per incarnation and is
        // necessarily present here.
        let resizer = unsafe { resizer_ptr.as_ref().unwrap_unchecked() };
        Ok(resizer.complete(self, guard))
    }
}

impl<D: EntryStore> fmt::Debug for Table<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Table")
            .field("tab_size", &self.tab_size())
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}
