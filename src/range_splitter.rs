//! [`RangeSplitter`] lets multiple threads drain an integer range in parallel.

use std::sync::atomic::Ordering::SeqCst;
use std::sync::atomic::{AtomicBool, AtomicU64};

/// Sentinel token: the iteration is exhausted.
const NONE: u64 = u64::MAX;

const PARALLEL_BITS: u32 = 8;
const PARALLEL_MASK: u64 = (1 << PARALLEL_BITS) - 1;
const VALUE_BITS: u32 = (64 - PARALLEL_BITS) / 2;
const VALUE_MASK: u64 = (1 << VALUE_BITS) - 1;
const RESULT_MASK: u64 = PARALLEL_MASK << (2 * VALUE_BITS) | VALUE_MASK;

/// The largest number of threads that can hold disjoint ranges at once.
pub const MAX_PARALLELISM: usize = 1 << PARALLEL_BITS;

/// The exclusive upper bound on range values.
pub const MAX_VALUE: u32 = 1 << VALUE_BITS;

/// A work-stealing iterator over a range of integers.
///
/// Threads draining the same [`RangeSplitter`] receive values that are as
/// far apart from each other as possible: the range is recursively
/// bisected on demand, so each thread mostly walks a private sub-range
/// and only synchronizes when its sub-range runs dry.
///
/// Near the end of the iteration, when fewer sub-ranges remain than
/// there are threads, the *same* value may be handed to several threads
/// so that they can assist each other with the corresponding unit of
/// work. Consumers must therefore be idempotent per value. A value is
/// guaranteed to stop being handed out only once some thread that
/// received it asked for the next one, which is what makes "iteration
/// exhausted" imply "every value was fully processed by somebody".
///
/// # Examples
///
/// ```
/// use braided::RangeSplitter;
///
/// let splitter = RangeSplitter::new(64);
/// let mut values: Vec<u32> = splitter.split().collect();
/// values.sort_unstable();
/// assert_eq!(values, (0..64).collect::<Vec<u32>>());
///
/// // The range is drained; later participants see nothing.
/// assert_eq!(splitter.split().next(), None);
/// ```
#[derive(Debug)]
pub struct RangeSplitter {
    ranges: Box<[AtomicU64]>,
    first: AtomicBool,
}

/// A per-thread handle draining a [`RangeSplitter`].
///
/// Created by [`RangeSplitter::split`]; every participating thread uses
/// its own handle.
#[derive(Debug)]
pub struct Splits<'s> {
    splitter: &'s RangeSplitter,
    token: u64,
}

impl RangeSplitter {
    /// Creates a splitter over `0..len`.
    ///
    /// # Panics
    ///
    /// Panics if `len` exceeds [`MAX_VALUE`].
    #[must_use]
    pub fn new(len: u32) -> RangeSplitter {
        Self::with_bounds(0, len)
    }

    /// Creates a splitter over `start..end`.
    ///
    /// # Panics
    ///
    /// Panics if `start > end` or `end` exceeds [`MAX_VALUE`].
    #[must_use]
    pub fn with_bounds(start: u32, end: u32) -> RangeSplitter {
        Self::with_parallelism(start, end, MAX_PARALLELISM)
    }

    /// Creates a splitter over `start..end` for at most `max_parallel`
    /// concurrently held sub-ranges.
    ///
    /// # Panics
    ///
    /// Panics if the bounds are invalid or `max_parallel` is `0` or
    /// greater than [`MAX_PARALLELISM`].
    #[must_use]
    pub fn with_parallelism(start: u32, end: u32, max_parallel: usize) -> RangeSplitter {
        assert!(start <= end, "invalid range bounds");
        assert!(end < MAX_VALUE, "range end out of bounds");
        assert!(
            (1..=MAX_PARALLELISM).contains(&max_parallel),
            "invalid parallelism"
        );
        let ranges: Box<[AtomicU64]> = (0..max_parallel).map(|_| AtomicU64::new(0)).collect();
        if start < end {
            ranges[0].store(pack(0, start, end), SeqCst);
        }
        RangeSplitter {
            ranges,
            first: AtomicBool::new(true),
        }
    }

    /// Returns a draining handle for the calling thread.
    #[must_use]
    pub fn split(&self) -> Splits<'_> {
        Splits {
            splitter: self,
            token: NONE,
        }
    }

    fn raw(&self, index: usize) -> u64 {
        self.ranges[index].load(SeqCst)
    }

    fn cas(&self, index: usize, current: u64, new: u64) -> bool {
        self.ranges[index]
            .compare_exchange(current, new, SeqCst, SeqCst)
            .is_ok()
    }

    /// Reads the range at `index`, resolving any split that is in
    /// progress towards another slot.
    fn get(&self, index: usize) -> u64 {
        loop {
            let range = self.raw(index);
            let to_index = index_of(range);
            if range == 0 || to_index == index {
                return range;
            }

            let start = start_of(range);
            let end = end_of(range);
            debug_assert!(end - start >= 2);
            let mid = (start + end + 1) >> 1;
            let to_range = self.raw(to_index);
            if to_range == 0 {
                if !self.cas(to_index, 0, pack(to_index, mid, end)) {
                    continue;
                }
            } else if !(start_of(to_range) >= mid && end_of(to_range) <= end) {
                // Some other range claimed the target slot first; mark
                // the split failed and retry.
                self.cas(index, range, pack(index, start, end));
                continue;
            }

            let new_range = pack(index, start, mid);
            if self.cas(index, range, new_range) {
                return new_range;
            }
        }
    }

    /// Picks the largest remaining range, bisecting it into a free slot
    /// when one exists. Returns `NONE` when no work remains anywhere.
    fn steal(&self) -> u64 {
        loop {
            let mut free_index = None;
            let mut max: Option<(usize, u64, u32)> = None;
            for index in 0..self.ranges.len() {
                let range = self.get(index);
                if range == 0 {
                    if free_index.is_none() {
                        free_index = Some(index);
                    }
                } else {
                    let size = end_of(range) - start_of(range);
                    if max.map_or(true, |(_, _, max_size)| size > max_size) {
                        max = Some((index, range, size));
                    }
                }
            }

            let Some((max_index, max_range, max_size)) = max else {
                return NONE;
            };
            let Some(free_index) = free_index else {
                return max_range;
            };
            if max_size < 2 {
                return max_range;
            }

            let new_range = pack(free_index, start_of(max_range), end_of(max_range));
            if self.cas(max_index, max_range, new_range) {
                self.get(max_index);
                let to_range = self.get(free_index);
                if start_of(to_range) > start_of(max_range)
                    && end_of(to_range) <= end_of(max_range)
                {
                    return to_range;
                }
            }
        }
    }

    /// Advances a handle: consumes `previous` and hands out the next
    /// value token, or `NONE` when the iteration is exhausted.
    fn step(&self, previous: u64) -> u64 {
        if previous == NONE {
            if self.first.load(SeqCst) {
                let seed = self.raw(0);
                if self
                    .first
                    .compare_exchange(true, false, SeqCst, SeqCst)
                    .is_ok()
                {
                    return if seed == 0 { NONE } else { result(seed) };
                }
            }
        } else {
            let index = index_of(previous);
            loop {
                let range = self.get(index);
                if range == 0 {
                    break;
                }
                let start = start_of(range);
                if start != start_of(previous) {
                    // Someone else advanced this range past our value;
                    // share its current value and assist.
                    return result(range);
                }

                let end = end_of(range);
                if start + 1 < end {
                    let new_range = pack(index, start + 1, end);
                    if self.cas(index, range, new_range) {
                        return result(new_range);
                    }
                } else if self.cas(index, range, 0) {
                    break;
                }
            }
        }

        let range = self.steal();
        if range == NONE {
            NONE
        } else {
            result(range)
        }
    }
}

impl Iterator for Splits<'_> {
    type Item = u32;

    #[inline]
    fn next(&mut self) -> Option<u32> {
        self.token = self.splitter.step(self.token);
        if self.token == NONE {
            None
        } else {
            Some(start_of(self.token))
        }
    }
}

fn pack(index: usize, start: u32, end: u32) -> u64 {
    (index as u64) << (2 * VALUE_BITS) | u64::from(end) << VALUE_BITS | u64::from(start)
}

#[allow(clippy::cast_possible_truncation)]
fn index_of(range: u64) -> usize {
    (range >> (2 * VALUE_BITS) & PARALLEL_MASK) as usize
}

#[allow(clippy::cast_possible_truncation)]
fn start_of(range: u64) -> u32 {
    (range & VALUE_MASK) as u32
}

#[allow(clippy::cast_possible_truncation)]
fn end_of(range: u64) -> u32 {
    (range >> VALUE_BITS & VALUE_MASK) as u32
}

fn result(range: u64) -> u64 {
    range & RESULT_MASK
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use std::sync::Barrier;

    #[test]
    fn empty_range() {
        let splitter = RangeSplitter::new(0);
        assert_eq!(splitter.split().next(), None);
    }

    #[test]
    fn single_thread_covers_range() {
        let splitter = RangeSplitter::with_bounds(3, 217);
        let mut values: Vec<u32> = splitter.split().collect();
        values.sort_unstable();
        assert_eq!(values, (3..217).collect::<Vec<u32>>());
    }

    #[test]
    fn small_parallelism_covers_range() {
        let splitter = RangeSplitter::with_parallelism(0, 100, 2);
        let values: BTreeSet<u32> = splitter.split().collect();
        assert_eq!(values.len(), 100);
    }

    #[test]
    fn concurrent_split_covers_range() {
        let num_threads = 8;
        let len = 4096_u32;
        let splitter = RangeSplitter::new(len);
        let barrier = Barrier::new(num_threads);
        let seen: Vec<BTreeSet<u32>> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..num_threads)
                .map(|_| {
                    scope.spawn(|| {
                        barrier.wait();
                        splitter.split().collect::<BTreeSet<u32>>()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        // Values may be shared between threads near the end, but the
        // union must cover the whole range.
        let mut union = BTreeSet::new();
        for thread_values in seen {
            union.extend(thread_values);
        }
        assert_eq!(union, (0..len).collect::<BTreeSet<u32>>());
    }
}
