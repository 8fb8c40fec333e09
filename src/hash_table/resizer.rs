//! Cooperative migration of a table into a larger (or compacted)
//! successor.
//!
//! The first thread to install the [`Resizer`] allocates the successor
//! array; latecomers spend their wait usefully by freezing batches of
//! old-table slots, and take over the allocation if the installer
//! stalls past their timeout. The buckets are then drained in batches
//! of 16 slots distributed by a [`RangeSplitter`]; the splitter hands
//! the same batch to several threads near the end, which is safe
//! because every step of the bucket copy is idempotent.

use std::sync::atomic::Ordering::{Acquire, Relaxed, Release};
use std::sync::atomic::{AtomicBool, AtomicUsize};
use std::time::{Duration, Instant};

use sdd::{AtomicShared, Guard, Shared, Tag};

use super::counter::INSERTED;
use super::state::{Layout, RESERVED};
use super::{EntryStore, Table};
use crate::range_splitter::RangeSplitter;

/// Time a helper spends freezing slots before it tries to allocate the
/// successor array itself; scaled by the helper's arrival rank.
const ALLOC_WAIT: Duration = Duration::from_secs(10);

/// Number of consecutive slots migrated as one unit of work.
const BATCH: u32 = 16;

/// The migration state machine owned by the table being retired.
pub(super) struct Resizer<D: EntryStore> {
    new_table: AtomicShared<Table<D>>,
    splitter: RangeSplitter,
    started_at: Instant,
    helpers: AtomicUsize,
    new_table_size: u32,
    factor: u32,
    done: AtomicBool,
}

impl<D: EntryStore> Resizer<D> {
    /// Creates the migration towards a table of `new_table_size` slots;
    /// the size must already be validated.
    pub(super) fn new(old_table_size: u32, new_table_size: u32) -> Resizer<D> {
        Resizer {
            new_table: AtomicShared::null(),
            splitter: RangeSplitter::new(old_table_size / BATCH),
            started_at: Instant::now(),
            helpers: AtomicUsize::new(0),
            new_table_size,
            factor: new_table_size / old_table_size,
            done: AtomicBool::new(false),
        }
    }

    /// Allocates and publishes the successor table unless another
    /// helper already has.
    pub(super) fn install(&self, guard: &Guard) {
        let current = self.new_table.load(Relaxed, guard);
        if current.is_null() {
            let table = Shared::new(Table::with_table_size(self.new_table_size));
            let _ = self.new_table.compare_exchange(
                current,
                (Some(table), Tag::None),
                Release,
                Relaxed,
                guard,
            );
        }
    }

    /// Joins the migration: waits for the successor, drains bucket
    /// batches until no work remains, and returns the successor. Every
    /// caller receives the same table.
    pub(super) fn complete(&self, old: &Table<D>, guard: &Guard) -> Shared<Table<D>> {
        let new = self.wait_ready(old, guard);
        self.migrate(old, &new, guard);
        self.done.store(true, Release);
        new
    }

    /// Waits until the successor table is published, freezing old-table
    /// slots in the meantime and taking over the allocation once the
    /// timeout for this helper's arrival rank has passed.
    #[allow(clippy::cast_possible_truncation)]
    fn wait_ready(&self, old: &Table<D>, guard: &Guard) -> Shared<Table<D>> {
        if let Some(table) = self.new_table.get_shared(Acquire, guard) {
            return table;
        }

        let rank = self.helpers.fetch_add(1, Relaxed) + 1;
        let deadline = self.started_at + ALLOC_WAIT.saturating_mul(rank.min(1 << 16) as u32);

        let batches = old.tab_size() / BATCH;
        for batch in 0..batches {
            if !self.new_table.is_null(Acquire) || Instant::now() >= deadline {
                break;
            }
            let start = batch * BATCH;
            for slot in start..start + BATCH {
                let state = old.state(slot);
                let frozen = Layout::freeze(state);
                if state == frozen || !old.cas_state(slot, state, frozen) {
                    break;
                }
            }
        }

        loop {
            if let Some(table) = self.new_table.get_shared(Acquire, guard) {
                return table;
            }
            if Instant::now() >= deadline {
                self.install(guard);
            } else {
                std::thread::yield_now();
            }
        }
    }

    /// Drains bucket batches handed out by the splitter, highest slot
    /// first within each batch.
    fn migrate(&self, old: &Table<D>, new: &Table<D>, guard: &Guard) {
        let mut tails = vec![0_u32; self.factor as usize];
        for batch in self.splitter.split() {
            let start = batch * BATCH;
            for slot in (start..start + BATCH).rev() {
                if !self.copy_bucket(old, new, &mut tails, slot, guard) {
                    break;
                }
            }
        }
    }

    /// Freezes a slot of the old table, idempotently.
    fn mark_resizing(old: &Table<D>, slot: u32) -> u64 {
        loop {
            let state = old.state(slot);
            let frozen = Layout::freeze(state);
            if state == frozen || old.cas_state(slot, state, frozen) {
                return frozen;
            }
        }
    }

    /// Copies one old bucket into its `factor` child buckets of the
    /// successor. Returns `false` when the migration completed under
    /// this helper, whose remaining work is then necessarily redundant.
    #[allow(clippy::cast_possible_truncation)]
    fn copy_bucket(
        &self,
        old: &Table<D>,
        new: &Table<D>,
        tails: &mut [u32],
        old_slot: u32,
        guard: &Guard,
    ) -> bool {
        tails.fill(0);
        let layout = old.layout();
        let mut old_state = Self::mark_resizing(old, old_slot);
        let mut old_index = Layout::head(old_state);
        while old_index >= RESERVED {
            old_state = Self::mark_resizing(old, old_index);
            if Layout::is_used(old_state) {
                let hash = layout.full_hash(old_state, old_slot);
                let slot = new.layout().slot_of(hash);
                let child = (slot & (self.factor - 1)) as usize;
                match self.copy_entry(old, new, old_index, hash, slot, tails[child], guard) {
                    Some(tail) => tails[child] = tail,
                    None => return false,
                }
            }
            old_index = layout.next(old_state);
        }
        true
    }

    /// Appends one live old entry to the tail of its child bucket.
    /// Returns the new tail index, or `None` to abort.
    fn copy_entry(
        &self,
        old: &Table<D>,
        new: &Table<D>,
        old_index: u32,
        hash: u32,
        slot: u32,
        tail: u32,
        guard: &Guard,
    ) -> Option<u32> {
        let layout = new.layout();
        let head = tail == 0;
        if head {
            // Fast path: the first entry of the child bucket usually
            // lands in its home slot.
            let target = layout.compose(true, slot, hash, 0);
            let mut state = new.state(slot);
            if state == 0 {
                if new.cas_state(slot, 0, target) {
                    state = target;
                    new.add_size(INSERTED);
                } else {
                    state = new.state(slot);
                }
            }
            if state == target {
                new.data()
                    .copy(old.data(), old_index - RESERVED, slot - RESERVED, guard);
                return Some(slot);
            }
        }

        // Contended: the child bucket already has a competing append.
        loop {
            let state = new.state(if head { slot } else { tail });
            // Check for completion *after* reading the state, so a
            // competitor entry observed below implies `done` is visible.
            if self.done.load(Acquire) {
                return None;
            }

            let index = if head {
                Layout::head(state)
            } else {
                layout.next(state)
            };
            if index != 0 {
                // Another helper appended this entry first; adopt its
                // slot as the new tail.
                return Some(index);
            }

            let new_index = new.alloc(if head { slot } else { tail }, hash, 0);
            if new_index < RESERVED {
                continue;
            }
            new.data()
                .copy(old.data(), old_index - RESERVED, new_index - RESERVED, guard);

            if new.link(slot, tail, state, new_index) {
                new.add_size(INSERTED);
                return Some(new_index);
            }
            new.free(new_index);
        }
    }
}
