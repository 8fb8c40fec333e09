//! Striped insert/remove accumulator.
//!
//! The low 32 bits of the accumulated value count committed inserts,
//! the high 32 bits count committed removes; the live entry count is
//! their difference. Reads are eventually consistent: each shard is
//! updated atomically but the sum is not a snapshot.

use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering::{Relaxed, SeqCst};
use std::sync::atomic::AtomicUsize;

use crossbeam_utils::CachePadded;

/// Delta recording one committed insert.
pub(super) const INSERTED: u64 = 1;

/// Delta recording one committed remove.
pub(super) const REMOVED: u64 = 1 << 32;

/// Delta recording one committed replace: one insert and one remove.
pub(super) const REPLACED: u64 = REMOVED | INSERTED;

/// Hands out a stripe id to each thread that ever updates a counter.
static NEXT_STRIPE: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    static STRIPE: usize = NEXT_STRIPE.fetch_add(1, Relaxed);
}

/// A cache-line-padded striped counter in the style of a long adder.
#[derive(Debug)]
pub(super) struct SizeCounter {
    shards: Box<[CachePadded<AtomicU64>]>,
}

impl SizeCounter {
    /// Creates a counter with one shard per hardware thread, rounded up
    /// to a power of two and capped at 64.
    pub(super) fn new() -> SizeCounter {
        let parallelism = std::thread::available_parallelism().map_or(1, usize::from);
        let num_shards = parallelism.next_power_of_two().min(64);
        SizeCounter {
            shards: (0..num_shards)
                .map(|_| CachePadded::new(AtomicU64::new(0)))
                .collect(),
        }
    }

    /// Adds a delta (one of [`INSERTED`], [`REMOVED`], [`REPLACED`]) to
    /// the calling thread's shard.
    #[inline]
    pub(super) fn add(&self, delta: u64) {
        let stripe = STRIPE.with(|stripe| *stripe);
        self.shards[stripe & (self.shards.len() - 1)].fetch_add(delta, SeqCst);
    }

    /// Sums all shards: committed inserts in the low word, committed
    /// removes in the high word.
    #[inline]
    pub(super) fn sum(&self) -> u64 {
        self.shards
            .iter()
            .fold(0_u64, |sum, shard| sum.wrapping_add(shard.load(SeqCst)))
    }

    /// The live entry count implied by a [`sum`](Self::sum) value. A
    /// torn snapshot can order the two halves either way; saturate
    /// instead of wrapping.
    #[allow(clippy::cast_possible_truncation)]
    #[inline]
    pub(super) fn live(sum: u64) -> u32 {
        (sum as u32).saturating_sub((sum >> 32) as u32)
    }
}
