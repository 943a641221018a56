//! Key equality and hashing strategies
//!
//! The map never calls `Hash` or `Eq` directly. It goes through a
//! [`KeyComparer`] chosen at construction, so callers can plug in
//! case-insensitive keys, seeded hashers or domain-specific equality without
//! wrapping their key type.

use core::fmt;
use core::hash::{BuildHasher, Hash};

/// Hashing and equality used by [`ConcurrentHashMap`](super::ConcurrentHashMap)
///
/// Implementations must be consistent: keys that compare equal must produce
/// the same hash. A comparer that panics unwinds into the caller of the map
/// operation; the map stays consistent because nothing is published until
/// the comparison loop has finished.
pub trait KeyComparer<K: ?Sized> {
    /// Hash a key
    fn hash_key(&self, key: &K) -> u64;

    /// Compare two keys for equality
    fn keys_equal(&self, left: &K, right: &K) -> bool;
}

/// Comparer backed by the key's own `Hash` and `Eq` implementations
///
/// # Examples
///
/// ```rust
/// use strata::{HashComparer, KeyComparer};
///
/// let comparer = HashComparer::new();
/// assert_eq!(comparer.hash_key(&"a"), comparer.hash_key(&"a"));
/// assert!(comparer.keys_equal(&"a", &"a"));
/// ```
#[derive(Clone, Default)]
pub struct HashComparer<S = fxhash::FxBuildHasher> {
    build_hasher: S,
}

impl HashComparer {
    /// Comparer using `FxHasher`
    pub fn new() -> Self {
        Self::default()
    }
}

impl<S> HashComparer<S> {
    /// Comparer using the given hasher builder
    pub fn with_hasher(build_hasher: S) -> Self {
        Self { build_hasher }
    }
}

impl<K, S> KeyComparer<K> for HashComparer<S>
where
    K: Hash + Eq + ?Sized,
    S: BuildHasher,
{
    #[inline]
    fn hash_key(&self, key: &K) -> u64 {
        self.build_hasher.hash_one(key)
    }

    #[inline]
    fn keys_equal(&self, left: &K, right: &K) -> bool {
        left == right
    }
}

impl<S> fmt::Debug for HashComparer<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HashComparer").finish_non_exhaustive()
    }
}
