//! Vendors the lookup trait of the
//! [`equivalent`](https://crates.io/crates/equivalent) crate so that the
//! dependency stays optional.

use std::borrow::Borrow;

/// Key equivalence trait for borrowed lookups.
///
/// A `Q: Equivalent<K>` can be used to look up an entry keyed by `K`
/// without constructing a `K`. Implementations must agree with the
/// [`Hash`](std::hash::Hash) implementations of both types: equivalent
/// values must hash identically.
///
/// The blanket implementation covers the standard
/// [`Borrow`](std::borrow::Borrow) relationships, e.g. looking up a
/// `String` key with a `&str`.
pub trait Equivalent<K: ?Sized> {
    /// Compares `self` to `key` and returns `true` if they are equal.
    fn equivalent(&self, key: &K) -> bool;
}

impl<Q: ?Sized, K: ?Sized> Equivalent<K> for Q
where
    Q: Eq,
    K: Borrow<Q>,
{
    #[inline]
    fn equivalent(&self, key: &K) -> bool {
        PartialEq::eq(self, key.borrow())
    }
}
