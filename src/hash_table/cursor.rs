//! Cursors over bucket chains: the wait-free [`Finder`], the lock-free
//! [`Updater`], and the whole-table [`Scan`].

use super::counter::{INSERTED, REMOVED, REPLACED};
use super::state::{Layout, RESERVED};
use super::{EntryStore, Table};

/// Signal that a touched slot is frozen for migration: the caller must
/// obtain the successor table and retry there.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct Retired;

/// Chain pointers written by the write path are never zero: `1` encodes
/// "end of chain", so the migration can tell writer-written links apart
/// from the pristine all-zero state.
#[inline]
fn ptr(index: u32) -> u32 {
    index.max(1)
}

/// A wait-free read cursor over the chain matching one hash code.
///
/// The finder never mutates the table and never assists removals; it
/// skips logically-removed bodies through their retained `next` fields.
pub(crate) struct Finder<'t, D: EntryStore> {
    table: &'t Table<D>,
    slot: u32,
    tag: u32,
    index: u32,
    state: u64,
}

impl<'t, D: EntryStore> Finder<'t, D> {
    pub(super) fn new(table: &'t Table<D>, mixed: u32) -> Finder<'t, D> {
        let layout = table.layout();
        Finder {
            table,
            slot: layout.slot_of(mixed),
            tag: layout.tag(mixed),
            index: 0,
            state: 0,
        }
    }

    /// Advances to the next live entry with a matching tag and returns
    /// its logical index.
    pub(crate) fn next(&mut self) -> Option<u32> {
        let layout = self.table.layout();
        let mut last = self.index;
        if last == 0 {
            last = self.slot;
            self.state = self.table.state(last);
            self.index = Layout::head(self.state);
        } else {
            self.index = layout.next(self.state);
        }

        while self.index >= RESERVED {
            if self.index != last {
                last = self.index;
                self.state = self.table.state(last);
            }
            if Layout::is_used(self.state) {
                let tag = layout.tag_of(self.state);
                if tag == self.tag {
                    return Some(self.index - RESERVED);
                }
                if tag > self.tag {
                    return None;
                }
            }
            self.index = layout.next(self.state);
        }
        None
    }

    /// Re-reads the current slot word in place. Necessary after the
    /// entry the cursor reported was replaced under it: the re-read
    /// state carries the redirect to the replacement.
    pub(crate) fn reload(&mut self) {
        self.state = self.table.state(self.index);
    }
}

/// A lock-free write cursor over the chain matching one hash code.
///
/// The cursor keeps the previous link as an index/state snapshot pair;
/// the initial previous index `0` stands for the bucket-head field of
/// the home slot. Dropping the cursor releases any reserved slot that
/// was never committed, so abandoned reservations cannot leak capacity.
pub(crate) struct Updater<'t, D: EntryStore> {
    table: &'t Table<D>,
    slot: u32,
    tag: u32,
    index: u32,
    prev_index: u32,
    new_index: u32,
    state: u64,
    prev_state: u64,
}

impl<'t, D: EntryStore> Updater<'t, D> {
    pub(super) fn new(table: &'t Table<D>, mixed: u32) -> Updater<'t, D> {
        let layout = table.layout();
        Updater {
            table,
            slot: layout.slot_of(mixed),
            tag: layout.tag(mixed),
            index: 0,
            prev_index: 0,
            new_index: 0,
            state: 0,
            prev_state: 0,
        }
    }

    /// Restarts the walk from the bucket head, keeping any reservation.
    pub(crate) fn restart(&mut self) {
        self.index = 0;
        self.prev_index = 0;
        self.state = 0;
        self.prev_state = 0;
    }

    /// Advances to the next live entry whose tag is at least the
    /// searched tag; `Ok(Some(_))` on an exact match, `Ok(None)` when
    /// the chain holds no match, `Err(Retired)` when any touched slot
    /// is frozen for migration.
    pub(crate) fn next(&mut self) -> Result<Option<u32>, Retired> {
        let layout = self.table.layout();
        self.state = self
            .table
            .state(if self.index == 0 { self.slot } else { self.index });
        if Layout::is_resizing(self.state) {
            return Err(Retired);
        }

        loop {
            self.prev_index = self.index;
            self.prev_state = self.state;

            self.index = if self.index == 0 {
                Layout::head(self.state)
            } else {
                layout.next(self.state)
            };
            if self.index < RESERVED {
                return Ok(None);
            }

            self.state = self.table.state(self.index);
            if Layout::is_resizing(self.state) {
                return Err(Retired);
            }

            if !Layout::is_used(self.state) {
                // A logically-removed body: assist the removing thread
                // by pointing the previous link past it, then continue
                // from the previous entry, or start over on failure.
                // Retired bodies are never recycled within a table
                // incarnation, so a chain can only reach this state.
                debug_assert!(Layout::is_removed(self.state));
                self.index = if self.link_prev_to(layout.next(self.state)) {
                    self.prev_index
                } else {
                    0
                };
                self.state = self
                    .table
                    .state(if self.index == 0 { self.slot } else { self.index });
                continue;
            }

            let tag = layout.tag_of(self.state);
            if tag == self.tag {
                return Ok(Some(self.index - RESERVED));
            }
            if tag > self.tag {
                return Ok(None);
            }
        }
    }

    /// Reserves a slot for a subsequent [`insert`](Self::insert) or
    /// [`replace`](Self::replace) and returns its logical index. The
    /// reservation survives [`restart`](Self::restart) and is released
    /// on drop if never committed.
    pub(crate) fn alloc(&mut self) -> Result<u32, Retired> {
        if self.new_index < RESERVED {
            if self.prev_index == 0 && Layout::is_free(self.prev_state) {
                // The cursor sits at the home slot and its body is
                // free: claim it in place with a single CAS.
                let layout = self.table.layout();
                let claimed = layout.occupy(self.prev_state, self.tag, ptr(self.index));
                if self.set_state(self.slot, self.prev_state, claimed) {
                    self.new_index = self.slot;
                    return Ok(self.new_index - RESERVED);
                }
            }

            self.new_index = self
                .table
                .alloc(self.prev_index.max(self.slot), self.tag, ptr(self.index));
            if self.new_index < RESERVED {
                return Err(Retired);
            }
        }
        Ok(self.new_index - RESERVED)
    }

    /// Links the reserved entry in front of the current position.
    /// Returns `false` if the previous link changed; the caller should
    /// [`restart`](Self::restart) and retry.
    pub(crate) fn insert(&mut self) -> bool {
        self.set_new_next(self.index);
        if !self.link_prev_to(self.new_index) {
            return false;
        }
        self.new_index = 0;
        self.table.add_size(INSERTED);
        true
    }

    /// Replaces the current entry with the reserved one: a single CAS
    /// retires the current body and redirects its `next` field to the
    /// replacement, so readers holding the old index are forwarded.
    pub(crate) fn replace(&mut self) -> bool {
        let layout = self.table.layout();
        self.set_new_next(layout.next(self.state));
        let new_index = self.new_index;
        if !self.remove_current(new_index) {
            return false;
        }
        self.new_index = 0;
        self.table.add_size(REPLACED);
        true
    }

    /// Logically removes the current entry.
    pub(crate) fn remove(&mut self) -> bool {
        let layout = self.table.layout();
        if !self.remove_current(layout.next(self.state)) {
            return false;
        }
        self.table.add_size(REMOVED);
        true
    }

    /// Retires the current body, leaving `next` pointing at the given
    /// successor, and best-effort fixes the previous link.
    fn remove_current(&mut self, next: u32) -> bool {
        debug_assert!(self.index >= RESERVED, "no current entry");
        let layout = self.table.layout();
        let next = ptr(next);
        let mut new_state = layout.with_next(Layout::retire(self.state), next);

        // When the current entry is the head entry stored in its own
        // home slot, fold the head update into the same CAS.
        let head = self.prev_index == 0 && self.index == self.slot;
        if head {
            new_state = layout.with_head(new_state, next);
        }

        if !self.set_state(self.index, self.state, new_state) {
            return false;
        }

        if !head {
            self.link_prev_to(next);
        }
        true
    }

    /// Points the previous link at `index`.
    fn link_prev_to(&mut self, index: u32) -> bool {
        self.table
            .link(self.slot, self.prev_index, self.prev_state, ptr(index))
    }

    /// Stamps the `next` field of the reserved entry.
    fn set_new_next(&mut self, next: u32) {
        debug_assert!(self.new_index >= RESERVED, "alloc before insert / replace");
        let layout = self.table.layout();
        let next = ptr(next);
        loop {
            let state = self.table.state(self.new_index);
            let new_state = layout.with_next(state, next);
            if state == new_state || self.set_state(self.new_index, state, new_state) {
                return;
            }
        }
    }

    /// CAS wrapper that keeps the previous-state snapshot in sync when
    /// the CAS lands on the slot the snapshot mirrors.
    fn set_state(&mut self, index: u32, state: u64, new_state: u64) -> bool {
        if !self.table.cas_state(index, state, new_state) {
            return false;
        }
        if index == self.prev_index || (self.prev_index == 0 && index == self.slot) {
            self.prev_state = new_state;
        }
        true
    }
}

impl<D: EntryStore> Drop for Updater<'_, D> {
    fn drop(&mut self) {
        if self.new_index >= RESERVED {
            self.table.free(self.new_index);
        }
    }
}

/// A cursor yielding the logical index of every live entry, bucket by
/// bucket. Weakly consistent: it observes a subset of the entries that
/// existed at some point between its creation and exhaustion.
pub(crate) struct Scan<'t, D: EntryStore> {
    table: &'t Table<D>,
    next_slot: u32,
    index: u32,
}

impl<'t, D: EntryStore> Scan<'t, D> {
    pub(super) fn new(table: &'t Table<D>) -> Scan<'t, D> {
        Scan {
            table,
            next_slot: 0,
            index: 0,
        }
    }

    /// Advances to the next live entry.
    pub(crate) fn next(&mut self) -> Option<u32> {
        let layout = self.table.layout();
        if self.index >= RESERVED {
            self.index = layout.next(self.table.state(self.index));
        }
        loop {
            if self.index < RESERVED {
                if self.next_slot > layout.slot_mask() {
                    return None;
                }
                self.index = Layout::head(self.table.state(self.next_slot));
                self.next_slot += 1;
            } else {
                let state = self.table.state(self.index);
                if Layout::is_used(state) {
                    return Some(self.index - RESERVED);
                }
                self.index = layout.next(state);
            }
        }
    }
}
