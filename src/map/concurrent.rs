//! Striped-Lock Concurrent HashMap
//!
//! This module implements a chained hash map whose buckets are partitioned
//! across a fixed set of stripe locks. Writers serialize per stripe; readers
//! never lock.
//!
//! ## Design
//!
//! The map holds one atomic pointer to its current `Tables`: the bucket array,
//! the stripe locks and one live-count per stripe. Every operation captures
//! that pointer once and works against the snapshot it saw.
//!
//! ```text
//! bucket = hash % buckets.len()
//! stripe = bucket % locks.len()
//! ```
//!
//! - A node in bucket `b` is only ever mutated under stripe `b % locks.len()`.
//! - Writers re-check the table pointer after taking their stripe. If a
//!   resize or clear published new tables in the meantime they retry against
//!   the fresh snapshot.
//! - Nodes are fully built before being linked with a `Release` store, so a
//!   lock-free reader sees either the whole node or nothing.
//! - Updates never write a value in place: a replacement node carrying the
//!   new value is spliced over the old one.
//! - Resizing builds a complete new `Tables` under every stripe lock and
//!   publishes it with one store. Readers still walking the old snapshot see a
//!   stale but intact view; the old nodes are reclaimed once no reader is left
//!   (epoch-based reclamation).
//!
//! ## Lock Ordering
//!
//! Stripe 0 is always taken first by anything that needs more than one
//! stripe. Stripe 0 is shared by every generation of tables, so holding it
//! pins the current snapshot: nothing can resize or clear until it is
//! released. Growers take stripe 0, re-validate, and only then take the rest.
//! Locks are released in reverse order.
//!
//! ## Performance Characteristics
//!
//! - **Get**: O(1) average case, lock-free
//! - **Insert / Remove / Update**: O(1) average case, one stripe lock
//! - **len / to_vec / clear**: take every stripe, keep them rare
//! - **Resize**: O(n) under all stripes, triggered after the insert that
//!   pushed a stripe past its budget, outside that insert's critical section
//!
//! ## Example
//!
//! ```rust
//! use strata::map::ConcurrentHashMap;
//! use std::sync::Arc;
//! use std::thread;
//!
//! let map = Arc::new(ConcurrentHashMap::new());
//!
//! let writer = thread::spawn({
//!     let map = Arc::clone(&map);
//!     move || {
//!         for i in 0..1000 {
//!             map.insert(i, i * 2);
//!         }
//!     }
//! });
//! writer.join().unwrap();
//!
//! let sum: i32 = (0..1000).filter_map(|i| map.get(&i)).sum();
//! assert_eq!(sum, 999000);
//! ```

use core::fmt;
use core::marker::PhantomData;
use core::ptr;
use core::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_epoch::{self as epoch, Atomic, Guard, Owned, Shared};
use parking_lot::{Mutex, MutexGuard};

use super::comparer::{HashComparer, KeyComparer};
use super::config::{MapConfig, DEFAULT_CAPACITY, MAX_LOCK_COUNT};
use crate::metrics::{delegate_metrics, AtomicMetrics};
use crate::util::CachePadded;
use crate::{Error, Result};

/// Largest bucket array the platform can address.
const MAX_BUCKET_COUNT: usize = isize::MAX as usize / core::mem::size_of::<usize>();

type StripeLock = Arc<CachePadded<Mutex<()>>>;

fn new_stripe_lock() -> StripeLock {
    Arc::new(CachePadded::new(Mutex::new(())))
}

/// Next bucket count after `current`: roughly double, odd, and free of the
/// factors 3, 5 and 7. `None` on overflow.
fn next_bucket_count(current: usize) -> Option<usize> {
    let mut candidate = current.checked_mul(2)?.checked_add(1)?;
    while candidate % 3 == 0 || candidate % 5 == 0 || candidate % 7 == 0 {
        candidate = candidate.checked_add(2)?;
    }
    Some(candidate)
}

struct Node<K, V> {
    key: K,
    value: V,
    hash: u64,
    next: Atomic<Node<K, V>>,
}

impl<K, V> Node<K, V> {
    fn new(key: K, value: V, hash: u64, next: Shared<'_, Node<K, V>>) -> Owned<Self> {
        Owned::new(Self {
            key,
            value,
            hash,
            next: Atomic::from(next),
        })
    }
}

struct Tables<K, V> {
    buckets: Box<[Atomic<Node<K, V>>]>,
    locks: Box<[StripeLock]>,
    counts: Box<[CachePadded<AtomicUsize>]>,
}

impl<K, V> Tables<K, V> {
    fn new(bucket_count: usize, locks: Box<[StripeLock]>) -> Self {
        let buckets = (0..bucket_count).map(|_| Atomic::null()).collect();
        let counts = (0..locks.len())
            .map(|_| CachePadded::new(AtomicUsize::new(0)))
            .collect();
        Self {
            buckets,
            locks,
            counts,
        }
    }

    #[inline]
    fn bucket_and_lock(&self, hash: u64) -> (usize, usize) {
        let bucket = (hash % self.buckets.len() as u64) as usize;
        (bucket, bucket % self.locks.len())
    }

    /// Exact while every stripe is held, an estimate otherwise.
    fn approximate_len(&self) -> usize {
        self.counts
            .iter()
            .map(|count| count.load(Ordering::Relaxed))
            .sum()
    }

    fn budget(&self) -> usize {
        (self.buckets.len() / self.locks.len()).max(1)
    }
}

impl<K, V> Drop for Tables<K, V> {
    fn drop(&mut self) {
        // Tables are dropped either by the map itself or after every reader
        // of this snapshot has unpinned, so the chains are exclusively ours.
        let guard = unsafe { epoch::unprotected() };
        for bucket in self.buckets.iter() {
            let mut current = bucket.load(Ordering::Relaxed, guard);
            while !current.is_null() {
                let node = unsafe { current.into_owned() };
                current = node.next.load(Ordering::Relaxed, guard);
            }
        }
    }
}

/// Stripe locks held by a bulk operation; released in reverse order.
struct StripeGuards<'g> {
    held: Vec<MutexGuard<'g, ()>>,
}

impl<'g> StripeGuards<'g> {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            held: Vec::with_capacity(capacity),
        }
    }

    fn push(&mut self, guard: MutexGuard<'g, ()>) {
        self.held.push(guard);
    }
}

impl Drop for StripeGuards<'_> {
    fn drop(&mut self) {
        while let Some(held) = self.held.pop() {
            drop(held);
        }
    }
}

enum Insertion<'g, V> {
    Inserted(&'g V),
    Present(&'g V),
    Replaced(&'g V),
}

/// A concurrent hash map with lock-free reads and striped-lock writes
///
/// # Type Parameters
///
/// * `K` - The key type
/// * `V` - The value type; reads hand out clones
/// * `C` - The [`KeyComparer`] used to hash and compare keys
///
/// Keys and values are cloned when the table is resized, since readers of the
/// previous snapshot may still be looking at the originals.
///
/// # Examples
///
/// ```rust
/// use strata::map::ConcurrentHashMap;
///
/// let map: ConcurrentHashMap<i32, String> = ConcurrentHashMap::new();
/// assert!(map.try_insert(1, "hello".to_string()));
/// assert!(!map.try_insert(1, "again".to_string()));
/// assert_eq!(map.get(&1), Some("hello".to_string()));
/// ```
pub struct ConcurrentHashMap<K, V, C = HashComparer> {
    tables: CachePadded<Atomic<Tables<K, V>>>,
    comparer: C,
    // Per-stripe element count past which an insert asks for a resize.
    budget: AtomicUsize,
    grow_lock_array: bool,
    metrics: AtomicMetrics,
}

impl<K, V> ConcurrentHashMap<K, V> {
    /// Create a map with the default stripe count and capacity
    ///
    /// The stripe count follows the machine's available parallelism and may
    /// double as the map grows.
    pub fn new() -> Self {
        Self::from_config(MapConfig::default(), HashComparer::new())
    }

    /// Create a map with at least `capacity` buckets
    ///
    /// # Examples
    ///
    /// ```rust
    /// use strata::map::ConcurrentHashMap;
    ///
    /// let map: ConcurrentHashMap<i32, i32> = ConcurrentHashMap::with_capacity(100);
    /// assert!(map.capacity() >= 100);
    /// ```
    pub fn with_capacity(capacity: usize) -> Self {
        Self::from_config(MapConfig::new().capacity(capacity), HashComparer::new())
    }

    /// Create a map with a fixed number of stripe locks
    ///
    /// # Errors
    ///
    /// `Error::InvalidArgument` if `concurrency_level` is zero.
    pub fn with_concurrency_level(concurrency_level: usize, capacity: usize) -> Result<Self> {
        Self::with_config(
            MapConfig::new()
                .concurrency_level(concurrency_level)
                .capacity(capacity),
        )
    }

    /// Create a map from an explicit configuration
    ///
    /// # Errors
    ///
    /// `Error::InvalidArgument` if the configuration does not validate.
    pub fn with_config(config: MapConfig) -> Result<Self> {
        Self::with_config_and_comparer(config, HashComparer::new())
    }
}

impl<K, V, C> ConcurrentHashMap<K, V, C> {
    /// Create a map with the default layout and a custom key comparer
    pub fn with_comparer(comparer: C) -> Self {
        Self::from_config(MapConfig::default(), comparer)
    }

    /// Create a map from an explicit configuration and key comparer
    ///
    /// # Errors
    ///
    /// `Error::InvalidArgument` if the configuration does not validate.
    pub fn with_config_and_comparer(config: MapConfig, comparer: C) -> Result<Self> {
        config.validate()?;
        Ok(Self::from_config(config, comparer))
    }

    fn from_config(config: MapConfig, comparer: C) -> Self {
        let locks = (0..config.lock_count()).map(|_| new_stripe_lock()).collect();
        let tables = Tables::new(config.bucket_count(), locks);

        Self {
            budget: AtomicUsize::new(tables.budget()),
            tables: CachePadded::new(Atomic::new(tables)),
            comparer,
            grow_lock_array: config.grows_lock_array(),
            metrics: AtomicMetrics::default(),
        }
    }

    /// The comparer this map hashes and compares keys with
    pub fn comparer(&self) -> &C {
        &self.comparer
    }

    /// Current number of buckets
    pub fn capacity(&self) -> usize {
        let guard = &epoch::pin();
        unsafe { self.tables.load(Ordering::Acquire, guard).deref() }
            .buckets
            .len()
    }

    /// Current number of stripe locks
    pub fn stripe_count(&self) -> usize {
        let guard = &epoch::pin();
        unsafe { self.tables.load(Ordering::Acquire, guard).deref() }
            .locks
            .len()
    }

    #[cfg(test)]
    fn budget(&self) -> usize {
        self.budget.load(Ordering::Relaxed)
    }
}

impl<K, V, C> ConcurrentHashMap<K, V, C>
where
    K: Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    C: KeyComparer<K>,
{
    /// Insert `key` if it is not already present
    ///
    /// # Returns
    ///
    /// `true` if the pair was added, `false` if the key already existed (the
    /// stored value is left untouched).
    pub fn try_insert(&self, key: K, value: V) -> bool {
        let guard = &epoch::pin();
        let hash = self.comparer.hash_key(&key);

        match self.insert_node(key, hash, value, false, guard) {
            Insertion::Inserted(_) => {
                self.metrics.record_success();
                true
            }
            Insertion::Present(_) | Insertion::Replaced(_) => {
                self.metrics.record_failure();
                false
            }
        }
    }

    /// Insert or overwrite the value for `key`
    ///
    /// # Returns
    ///
    /// * `Some(old_value)` if the key existed and was updated
    /// * `None` if the key was newly inserted
    ///
    /// # Examples
    ///
    /// ```rust
    /// use strata::map::ConcurrentHashMap;
    ///
    /// let map: ConcurrentHashMap<i32, String> = ConcurrentHashMap::new();
    /// assert_eq!(map.insert(1, "hello".to_string()), None);
    /// assert_eq!(map.insert(1, "world".to_string()), Some("hello".to_string()));
    /// ```
    pub fn insert(&self, key: K, value: V) -> Option<V> {
        let guard = &epoch::pin();
        let hash = self.comparer.hash_key(&key);

        let previous = match self.insert_node(key, hash, value, true, guard) {
            Insertion::Inserted(_) => None,
            Insertion::Replaced(previous) | Insertion::Present(previous) => Some(previous.clone()),
        };
        self.metrics.record_success();
        previous
    }

    /// Look up the value for `key` without taking any lock
    ///
    /// # Examples
    ///
    /// ```rust
    /// use strata::map::ConcurrentHashMap;
    ///
    /// let map: ConcurrentHashMap<i32, String> = ConcurrentHashMap::new();
    /// map.insert(1, "hello".to_string());
    /// assert_eq!(map.get(&1), Some("hello".to_string()));
    /// assert_eq!(map.get(&2), None);
    /// ```
    pub fn get(&self, key: &K) -> Option<V> {
        let guard = &epoch::pin();
        let found = self
            .find(key, self.comparer.hash_key(key), guard)
            .map(|node| node.value.clone());

        if found.is_some() {
            self.metrics.record_success();
        } else {
            self.metrics.record_failure();
        }
        found
    }

    /// Look up the value for `key`, treating absence as an error
    ///
    /// # Errors
    ///
    /// `Error::KeyNotFound` if the key is not present.
    pub fn get_required(&self, key: &K) -> Result<V> {
        self.get(key).ok_or(Error::KeyNotFound)
    }

    /// Whether `key` is present
    pub fn contains_key(&self, key: &K) -> bool {
        let guard = &epoch::pin();
        self.find(key, self.comparer.hash_key(key), guard).is_some()
    }

    /// Remove `key` and return its value
    pub fn remove(&self, key: &K) -> Option<V> {
        let guard = &epoch::pin();
        let removed = self
            .remove_node(key, self.comparer.hash_key(key), |_| true, guard)
            .cloned();

        if removed.is_some() {
            self.metrics.record_success();
        } else {
            self.metrics.record_failure();
        }
        removed
    }

    /// Remove `key` only if its current value equals `expected`
    pub fn remove_if(&self, key: &K, expected: &V) -> bool
    where
        V: PartialEq,
    {
        let guard = &epoch::pin();
        let removed = self
            .remove_node(key, self.comparer.hash_key(key), |value| value == expected, guard)
            .is_some();

        if removed {
            self.metrics.record_success();
        } else {
            self.metrics.record_failure();
        }
        removed
    }

    /// Replace the value for `key` with `new_value` if it currently equals
    /// `comparison`
    ///
    /// # Examples
    ///
    /// ```rust
    /// use strata::map::ConcurrentHashMap;
    ///
    /// let map = ConcurrentHashMap::new();
    /// map.insert("hits", 1);
    /// assert!(map.try_update(&"hits", 2, &1));
    /// assert!(!map.try_update(&"hits", 3, &1));
    /// assert_eq!(map.get(&"hits"), Some(2));
    /// ```
    pub fn try_update(&self, key: &K, new_value: V, comparison: &V) -> bool
    where
        V: PartialEq,
    {
        let guard = &epoch::pin();
        let updated = self.replace_node(
            key,
            self.comparer.hash_key(key),
            new_value,
            |node| node.value == *comparison,
            guard,
        );

        if updated {
            self.metrics.record_success();
        } else {
            self.metrics.record_failure();
        }
        updated
    }

    /// Return the value for `key`, inserting `factory(&key)` if absent
    ///
    /// The factory runs outside any lock and may run even when another thread
    /// wins the race to insert; the winner's value is returned in that case.
    pub fn get_or_insert_with<F>(&self, key: K, factory: F) -> V
    where
        F: FnOnce(&K) -> V,
    {
        let guard = &epoch::pin();
        let hash = self.comparer.hash_key(&key);

        if let Some(node) = self.find(&key, hash, guard) {
            self.metrics.record_success();
            return node.value.clone();
        }

        let value = factory(&key);
        let stored = match self.insert_node(key, hash, value, false, guard) {
            Insertion::Inserted(value) | Insertion::Present(value) | Insertion::Replaced(value) => {
                value.clone()
            }
        };
        self.metrics.record_success();
        stored
    }

    /// Return the value for `key`, inserting `value` if absent
    pub fn get_or_insert(&self, key: K, value: V) -> V {
        self.get_or_insert_with(key, |_| value)
    }

    /// Insert `add(&key)` if absent, otherwise replace the current value with
    /// `update(&key, &current)`
    ///
    /// Both closures may run more than once when other writers race on the
    /// same key. The value that ended up stored is returned.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use strata::map::ConcurrentHashMap;
    ///
    /// let map = ConcurrentHashMap::new();
    /// assert_eq!(map.insert_or_update_with("k", |_| 1, |_, v| v + 1), 1);
    /// assert_eq!(map.insert_or_update_with("k", |_| 1, |_, v| v + 1), 2);
    /// ```
    pub fn insert_or_update_with<A, U>(&self, key: K, mut add: A, mut update: U) -> V
    where
        A: FnMut(&K) -> V,
        U: FnMut(&K, &V) -> V,
    {
        let guard = &epoch::pin();
        let hash = self.comparer.hash_key(&key);

        loop {
            if let Some(current) = self.find(&key, hash, guard) {
                let updated = update(&key, &current.value);
                if self.replace_node(
                    &key,
                    hash,
                    updated.clone(),
                    |node| ptr::eq(node, current),
                    guard,
                ) {
                    self.metrics.record_success();
                    return updated;
                }
            } else if let Insertion::Inserted(value) =
                self.insert_node(key.clone(), hash, add(&key), false, guard)
            {
                let value = value.clone();
                self.metrics.record_success();
                return value;
            }

            self.metrics.record_contention();
        }
    }

    /// Number of entries, counted with every stripe held
    pub fn len(&self) -> usize {
        let guard = &epoch::pin();
        let (tables, _, _held) = self.lock_all(guard);
        tables.approximate_len()
    }

    /// Whether the map has no entries, checked with every stripe held
    pub fn is_empty(&self) -> bool {
        let guard = &epoch::pin();
        let (tables, _, _held) = self.lock_all(guard);
        tables
            .counts
            .iter()
            .all(|count| count.load(Ordering::Relaxed) == 0)
    }

    /// Remove every entry
    ///
    /// Publishes fresh, default-sized tables while holding every stripe.
    pub fn clear(&self) {
        let guard = &epoch::pin();
        let (tables, current, _held) = self.lock_all(guard);

        let fresh = Tables::new(DEFAULT_CAPACITY.max(tables.locks.len()), tables.locks.clone());
        self.budget.store(fresh.budget(), Ordering::Relaxed);
        let dropped = tables.approximate_len();

        self.tables.store(Owned::new(fresh), Ordering::Release);
        unsafe { guard.defer_destroy(current) };

        self.metrics.record_structural_change();
        tracing::debug!(dropped, "striped map cleared");
    }

    /// Consistent copy of every entry, taken with every stripe held
    pub fn to_vec(&self) -> Vec<(K, V)> {
        let guard = &epoch::pin();
        let (tables, _, _held) = self.lock_all(guard);

        let mut entries = Vec::with_capacity(tables.approximate_len());
        Self::for_each_node(tables, guard, |node| {
            entries.push((node.key.clone(), node.value.clone()));
        });
        entries
    }

    /// Consistent copy of every key
    pub fn keys(&self) -> Vec<K> {
        let guard = &epoch::pin();
        let (tables, _, _held) = self.lock_all(guard);

        let mut keys = Vec::with_capacity(tables.approximate_len());
        Self::for_each_node(tables, guard, |node| keys.push(node.key.clone()));
        keys
    }

    /// Consistent copy of every value
    pub fn values(&self) -> Vec<V> {
        let guard = &epoch::pin();
        let (tables, _, _held) = self.lock_all(guard);

        let mut values = Vec::with_capacity(tables.approximate_len());
        Self::for_each_node(tables, guard, |node| values.push(node.value.clone()));
        values
    }

    /// Weakly consistent iterator over clones of the entries
    ///
    /// Takes no locks. Entries added or removed while iterating may or may not
    /// be observed; a resize midway leaves the iterator on the snapshot it
    /// started from.
    pub fn iter(&self) -> Iter<'_, K, V> {
        let guard = epoch::pin();
        let tables = self.tables.load(Ordering::Acquire, &guard).as_raw();
        Iter {
            guard,
            tables,
            bucket: 0,
            node: ptr::null(),
            _map: PhantomData,
        }
    }

    fn find<'g>(&self, key: &K, hash: u64, guard: &'g Guard) -> Option<&'g Node<K, V>> {
        let tables = unsafe { self.tables.load(Ordering::Acquire, guard).deref() };
        let (bucket, _) = tables.bucket_and_lock(hash);

        let mut current = tables.buckets[bucket].load(Ordering::Acquire, guard);
        while let Some(node) = unsafe { current.as_ref() } {
            if node.hash == hash && self.comparer.keys_equal(&node.key, key) {
                return Some(node);
            }
            current = node.next.load(Ordering::Acquire, guard);
        }
        None
    }

    /// Walks a chain and returns the link pointing at the matching node (or
    /// the trailing null link) together with the node itself.
    fn locate<'g>(
        &self,
        bucket: &'g Atomic<Node<K, V>>,
        key: &K,
        hash: u64,
        guard: &'g Guard,
    ) -> (&'g Atomic<Node<K, V>>, Shared<'g, Node<K, V>>) {
        let mut link = bucket;
        let mut current = link.load(Ordering::Acquire, guard);
        while let Some(node) = unsafe { current.as_ref() } {
            if node.hash == hash && self.comparer.keys_equal(&node.key, key) {
                break;
            }
            link = &node.next;
            current = link.load(Ordering::Acquire, guard);
        }
        (link, current)
    }

    fn insert_node<'g>(
        &self,
        key: K,
        hash: u64,
        value: V,
        overwrite: bool,
        guard: &'g Guard,
    ) -> Insertion<'g, V> {
        loop {
            let current = self.tables.load(Ordering::Acquire, guard);
            let tables = unsafe { current.deref() };
            let (bucket_no, lock_no) = tables.bucket_and_lock(hash);

            let (inserted, grow) = {
                let _stripe = tables.locks[lock_no].lock();
                if self.tables.load(Ordering::Acquire, guard) != current {
                    self.metrics.record_contention();
                    continue;
                }

                let bucket = &tables.buckets[bucket_no];
                let (link, existing) = self.locate(bucket, &key, hash, guard);
                if let Some(node) = unsafe { existing.as_ref() } {
                    if !overwrite {
                        return Insertion::Present(&node.value);
                    }
                    let next = node.next.load(Ordering::Relaxed, guard);
                    link.store(Node::new(key, value, hash, next), Ordering::Release);
                    unsafe { guard.defer_destroy(existing) };
                    return Insertion::Replaced(&node.value);
                }

                let head = bucket.load(Ordering::Relaxed, guard);
                let node = Node::new(key, value, hash, head).into_shared(guard);
                bucket.store(node, Ordering::Release);

                let count = tables.counts[lock_no].fetch_add(1, Ordering::Relaxed) + 1;
                let inserted = unsafe { &node.deref().value };
                (inserted, count > self.budget.load(Ordering::Relaxed))
            };

            if grow {
                self.grow_table(current, guard);
            }
            return Insertion::Inserted(inserted);
        }
    }

    fn remove_node<'g, F>(&self, key: &K, hash: u64, matches: F, guard: &'g Guard) -> Option<&'g V>
    where
        F: Fn(&V) -> bool,
    {
        loop {
            let current = self.tables.load(Ordering::Acquire, guard);
            let tables = unsafe { current.deref() };
            let (bucket_no, lock_no) = tables.bucket_and_lock(hash);

            let _stripe = tables.locks[lock_no].lock();
            if self.tables.load(Ordering::Acquire, guard) != current {
                self.metrics.record_contention();
                continue;
            }

            let (link, existing) = self.locate(&tables.buckets[bucket_no], key, hash, guard);
            let node = unsafe { existing.as_ref() }?;
            if !matches(&node.value) {
                return None;
            }

            link.store(node.next.load(Ordering::Relaxed, guard), Ordering::Release);
            tables.counts[lock_no].fetch_sub(1, Ordering::Relaxed);
            unsafe { guard.defer_destroy(existing) };
            return Some(&node.value);
        }
    }

    fn replace_node<F>(&self, key: &K, hash: u64, value: V, matches: F, guard: &Guard) -> bool
    where
        F: Fn(&Node<K, V>) -> bool,
    {
        loop {
            let current = self.tables.load(Ordering::Acquire, guard);
            let tables = unsafe { current.deref() };
            let (bucket_no, lock_no) = tables.bucket_and_lock(hash);

            let _stripe = tables.locks[lock_no].lock();
            if self.tables.load(Ordering::Acquire, guard) != current {
                self.metrics.record_contention();
                continue;
            }

            let (link, existing) = self.locate(&tables.buckets[bucket_no], key, hash, guard);
            let Some(node) = (unsafe { existing.as_ref() }) else {
                return false;
            };
            if !matches(node) {
                return false;
            }

            let next = node.next.load(Ordering::Relaxed, guard);
            link.store(
                Node::new(node.key.clone(), value, hash, next),
                Ordering::Release,
            );
            unsafe { guard.defer_destroy(existing) };
            return true;
        }
    }

    /// Takes stripe 0, then every other stripe of the tables current at that
    /// point. Holding stripe 0 keeps those tables current.
    fn lock_all<'g>(
        &self,
        guard: &'g Guard,
    ) -> (&'g Tables<K, V>, Shared<'g, Tables<K, V>>, StripeGuards<'g>) {
        let observed = unsafe { self.tables.load(Ordering::Acquire, guard).deref() };
        let first = observed.locks[0].lock();

        let current = self.tables.load(Ordering::Acquire, guard);
        let tables = unsafe { current.deref() };

        let mut held = StripeGuards::with_capacity(tables.locks.len());
        held.push(first);
        for lock in tables.locks[1..].iter() {
            held.push(lock.lock());
        }
        (tables, current, held)
    }

    fn grow_table<'g>(&self, observed: Shared<'g, Tables<K, V>>, guard: &'g Guard) {
        let tables = unsafe { observed.deref() };

        let mut held = StripeGuards::with_capacity(tables.locks.len());
        held.push(tables.locks[0].lock());
        if self.tables.load(Ordering::Acquire, guard) != observed {
            // Someone else already grew or cleared the map.
            return;
        }

        let approx_len = tables.approximate_len();
        if approx_len < tables.buckets.len() / 4 {
            // The stripe that triggered us is crowded but the table is not:
            // tolerate longer chains instead of resizing.
            let budget = self.budget.load(Ordering::Relaxed).saturating_mul(2);
            self.budget.store(budget, Ordering::Relaxed);
            tracing::trace!(approx_len, budget, "striped map widened stripe budget");
            return;
        }

        let (bucket_count, maximized) = match next_bucket_count(tables.buckets.len()) {
            Some(count) if count <= MAX_BUCKET_COUNT => (count, false),
            _ => (MAX_BUCKET_COUNT, true),
        };

        for lock in tables.locks[1..].iter() {
            held.push(lock.lock());
        }

        let lock_count = tables.locks.len();
        let locks: Box<[StripeLock]> = if self.grow_lock_array && lock_count < MAX_LOCK_COUNT {
            let mut locks = tables.locks.to_vec();
            locks.resize_with((lock_count * 2).min(MAX_LOCK_COUNT), new_stripe_lock);
            locks.into_boxed_slice()
        } else {
            tables.locks.clone()
        };

        let grown = Tables::new(bucket_count, locks);
        Self::for_each_node(tables, guard, |node| {
            let (bucket_no, lock_no) = grown.bucket_and_lock(node.hash);
            let bucket = &grown.buckets[bucket_no];
            let head = bucket.load(Ordering::Relaxed, guard);
            bucket.store(
                Node::new(node.key.clone(), node.value.clone(), node.hash, head),
                Ordering::Relaxed,
            );
            grown.counts[lock_no].fetch_add(1, Ordering::Relaxed);
        });

        let budget = if maximized { usize::MAX } else { grown.budget() };
        self.budget.store(budget, Ordering::Relaxed);

        tracing::debug!(
            old_buckets = tables.buckets.len(),
            new_buckets = bucket_count,
            stripes = grown.locks.len(),
            budget,
            "striped map grew"
        );

        self.tables.store(Owned::new(grown), Ordering::Release);
        unsafe { guard.defer_destroy(observed) };
        self.metrics.record_structural_change();
    }

    fn for_each_node<'g, F>(tables: &'g Tables<K, V>, guard: &'g Guard, mut visit: F)
    where
        F: FnMut(&'g Node<K, V>),
    {
        for bucket in tables.buckets.iter() {
            let mut current = bucket.load(Ordering::Acquire, guard);
            while let Some(node) = unsafe { current.as_ref() } {
                visit(node);
                current = node.next.load(Ordering::Acquire, guard);
            }
        }
    }
}

impl<K, V> Default for ConcurrentHashMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> FromIterator<(K, V)> for ConcurrentHashMap<K, V>
where
    K: core::hash::Hash + Eq + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let map = Self::new();
        for (key, value) in iter {
            map.insert(key, value);
        }
        map
    }
}

impl<K, V, C> Drop for ConcurrentHashMap<K, V, C> {
    fn drop(&mut self) {
        unsafe {
            let tables = self.tables.load(Ordering::Relaxed, epoch::unprotected());
            drop(tables.into_owned());
        }
    }
}

impl<K, V, C: fmt::Debug> fmt::Debug for ConcurrentHashMap<K, V, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let guard = &epoch::pin();
        let tables = unsafe { self.tables.load(Ordering::Acquire, guard).deref() };
        f.debug_struct("ConcurrentHashMap")
            .field("buckets", &tables.buckets.len())
            .field("stripes", &tables.locks.len())
            .field("approximate_len", &tables.approximate_len())
            .field("comparer", &self.comparer)
            .finish()
    }
}

delegate_metrics!(ConcurrentHashMap<K, V, C>);

/// Weakly consistent iterator returned by [`ConcurrentHashMap::iter`]
pub struct Iter<'a, K, V> {
    guard: Guard,
    tables: *const Tables<K, V>,
    bucket: usize,
    node: *const Node<K, V>,
    _map: PhantomData<&'a Tables<K, V>>,
}

impl<K: Clone, V: Clone> Iterator for Iter<'_, K, V> {
    type Item = (K, V);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            // The pinned guard keeps the snapshot and every node reachable
            // from it alive for as long as the iterator exists.
            if let Some(node) = unsafe { self.node.as_ref() } {
                self.node = node.next.load(Ordering::Acquire, &self.guard).as_raw();
                return Some((node.key.clone(), node.value.clone()));
            }

            let tables = unsafe { &*self.tables };
            let bucket = tables.buckets.get(self.bucket)?;
            self.node = bucket.load(Ordering::Acquire, &self.guard).as_raw();
            self.bucket += 1;
        }
    }
}

impl<K, V> fmt::Debug for Iter<'_, K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Iter")
            .field("bucket", &self.bucket)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::panic::{self, AssertUnwindSafe};
    use std::sync::Arc;
    use std::thread;

    /// Sends every key to bucket 0.
    #[derive(Debug)]
    struct ConstantHash;

    impl KeyComparer<u32> for ConstantHash {
        fn hash_key(&self, _key: &u32) -> u64 {
            0
        }

        fn keys_equal(&self, left: &u32, right: &u32) -> bool {
            left == right
        }
    }

    /// Panics when asked to compare key 13.
    #[derive(Debug)]
    struct Superstitious;

    impl KeyComparer<u32> for Superstitious {
        fn hash_key(&self, _key: &u32) -> u64 {
            7
        }

        fn keys_equal(&self, left: &u32, right: &u32) -> bool {
            if *left == 13 || *right == 13 {
                panic!("refusing to compare 13");
            }
            left == right
        }
    }

    #[test]
    fn test_basic_operations() {
        let map: ConcurrentHashMap<i32, String> = ConcurrentHashMap::new();

        assert_eq!(map.len(), 0);
        assert!(map.is_empty());
        assert_eq!(map.get(&1), None);

        assert!(map.try_insert(1, "hello".to_string()));
        assert!(!map.try_insert(1, "ignored".to_string()));
        assert_eq!(map.len(), 1);
        assert!(!map.is_empty());
        assert_eq!(map.get(&1), Some("hello".to_string()));

        assert_eq!(map.insert(1, "world".to_string()), Some("hello".to_string()));
        assert_eq!(map.get(&1), Some("world".to_string()));
        assert_eq!(map.len(), 1);

        assert_eq!(map.remove(&1), Some("world".to_string()));
        assert_eq!(map.remove(&1), None);
        assert_eq!(map.len(), 0);
        assert_eq!(map.get(&1), None);
    }

    #[test]
    fn test_get_required_reports_missing_key() {
        let map: ConcurrentHashMap<&str, i32> = ConcurrentHashMap::new();
        map.insert("present", 1);
        assert_eq!(map.get_required(&"present"), Ok(1));
        assert_eq!(map.get_required(&"absent"), Err(Error::KeyNotFound));
    }

    #[test]
    fn test_conditional_update_and_remove() {
        let map = ConcurrentHashMap::new();
        map.insert("k", 10);

        assert!(!map.try_update(&"k", 11, &9));
        assert!(map.try_update(&"k", 11, &10));
        assert!(!map.try_update(&"missing", 1, &0));

        assert!(!map.remove_if(&"k", &10));
        assert_eq!(map.get(&"k"), Some(11));
        assert!(map.remove_if(&"k", &11));
        assert!(!map.contains_key(&"k"));
    }

    #[test]
    fn test_get_or_insert_runs_factory_once_when_absent() {
        let map = ConcurrentHashMap::new();
        let mut calls = 0;
        assert_eq!(
            map.get_or_insert_with(5, |k| {
                calls += 1;
                k * 10
            }),
            50
        );
        assert_eq!(map.get_or_insert_with(5, |_| unreachable!()), 50);
        assert_eq!(map.get_or_insert(5, 0), 50);
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_resize_behavior() {
        let map: ConcurrentHashMap<i32, i32> =
            ConcurrentHashMap::with_concurrency_level(2, 4).unwrap();
        let initial_capacity = map.capacity();

        for i in 0..1000 {
            assert!(map.try_insert(i, i * 2));
        }

        assert!(map.capacity() > initial_capacity);
        // An explicit concurrency level pins the stripe count.
        assert_eq!(map.stripe_count(), 2);
        assert_eq!(map.len(), 1000);
        for i in 0..1000 {
            assert_eq!(map.get(&i), Some(i * 2));
        }
    }

    #[test]
    fn test_lock_array_grows_without_explicit_concurrency() {
        let map: ConcurrentHashMap<u32, u32> = ConcurrentHashMap::with_capacity(1);
        let initial_stripes = map.stripe_count();

        for i in 0..10_000 {
            map.insert(i, i);
        }

        if initial_stripes < MAX_LOCK_COUNT {
            assert!(map.stripe_count() > initial_stripes);
        }
        assert!(map.stripe_count() <= MAX_LOCK_COUNT);
        assert_eq!(map.len(), 10_000);
    }

    #[test]
    fn test_bucket_counts_avoid_small_factors() {
        assert_eq!(next_bucket_count(31), Some(67));
        let mut count = 31;
        for _ in 0..20 {
            count = next_bucket_count(count).unwrap();
            assert_eq!(count % 2, 1);
            assert!(count % 3 != 0 && count % 5 != 0 && count % 7 != 0);
        }
        assert_eq!(next_bucket_count(usize::MAX / 2 + 1), None);
    }

    #[test]
    fn test_skewed_stripe_widens_budget_instead_of_resizing() {
        let map: ConcurrentHashMap<u32, u32, ConstantHash> =
            ConcurrentHashMap::with_config_and_comparer(
                MapConfig::new().concurrency_level(8).capacity(800),
                ConstantHash,
            )
            .unwrap();
        assert_eq!(map.budget(), 100);

        for i in 0..101 {
            assert!(map.try_insert(i, i));
        }

        assert_eq!(map.capacity(), 800);
        assert_eq!(map.budget(), 200);
        for i in 0..101 {
            assert_eq!(map.get(&i), Some(i));
        }
    }

    #[test]
    fn test_panicking_comparer_leaves_map_usable() {
        let map: ConcurrentHashMap<u32, &str, Superstitious> =
            ConcurrentHashMap::with_comparer(Superstitious);
        assert!(map.try_insert(1, "one"));

        let result = panic::catch_unwind(AssertUnwindSafe(|| map.try_insert(13, "thirteen")));
        assert!(result.is_err());

        // Same stripe as the panicking insert: the lock must have been released.
        assert!(map.try_insert(2, "two"));
        assert_eq!(map.get(&1), Some("one"));
        assert_eq!(map.get(&2), Some("two"));
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn test_insert_or_update_with() {
        let map = ConcurrentHashMap::new();
        assert_eq!(map.insert_or_update_with("a", |_| 1, |_, v| v * 10), 1);
        assert_eq!(map.insert_or_update_with("a", |_| 1, |_, v| v * 10), 10);
        assert_eq!(map.get(&"a"), Some(10));
    }

    #[test]
    fn test_clear() {
        let map: ConcurrentHashMap<i32, String> = ConcurrentHashMap::new();

        for i in 0..100 {
            map.insert(i, format!("value_{}", i));
        }
        assert_eq!(map.len(), 100);

        map.clear();

        assert_eq!(map.len(), 0);
        assert!(map.is_empty());
        for i in 0..100 {
            assert_eq!(map.get(&i), None);
        }

        map.insert(1, "again".to_string());
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_snapshots() {
        let map: ConcurrentHashMap<i32, i32> = (0..50).map(|i| (i, -i)).collect();

        let mut entries = map.to_vec();
        entries.sort();
        assert_eq!(entries, (0..50).map(|i| (i, -i)).collect::<Vec<_>>());

        let mut keys = map.keys();
        keys.sort();
        assert_eq!(keys, (0..50).collect::<Vec<_>>());

        let mut values = map.values();
        values.sort();
        assert_eq!(values, (-49..=0).collect::<Vec<_>>());

        let mut iterated: Vec<_> = map.iter().collect();
        iterated.sort();
        assert_eq!(iterated, entries);
    }

    #[test]
    fn test_iterator_survives_concurrent_resize() {
        let map: ConcurrentHashMap<i32, i32> =
            ConcurrentHashMap::with_concurrency_level(1, 1).unwrap();
        for i in 0..10 {
            map.insert(i, i);
        }

        let mut iter = map.iter();
        let first = iter.next();
        assert!(first.is_some());

        for i in 10..1000 {
            map.insert(i, i);
        }

        // The snapshot taken before the resizes still holds every original
        // entry exactly once.
        let mut seen: Vec<_> = first.into_iter().chain(iter).collect();
        assert!(seen.iter().all(|(k, v)| k == v));
        seen.sort();
        assert!(seen.windows(2).all(|pair| pair[0] != pair[1]));
        let originals = seen.iter().filter(|(k, _)| *k < 10).count();
        assert_eq!(originals, 10);
    }

    #[test]
    fn test_concurrent_access() {
        let map = Arc::new(ConcurrentHashMap::new());
        let num_writers = 4;
        let num_readers = 4;
        let items_per_writer = 1000;

        let mut writer_handles = vec![];
        for writer_id in 0..num_writers {
            let map = Arc::clone(&map);
            writer_handles.push(thread::spawn(move || {
                for i in 0..items_per_writer {
                    let key = writer_id * items_per_writer + i;
                    map.insert(key, format!("value_{}", key));
                }
            }));
        }

        let mut reader_handles = vec![];
        for _ in 0..num_readers {
            let map = Arc::clone(&map);
            reader_handles.push(thread::spawn(move || {
                for i in 0..num_writers * items_per_writer {
                    if let Some(value) = map.get(&i) {
                        assert_eq!(value, format!("value_{}", i));
                    }
                }
            }));
        }

        for handle in writer_handles.into_iter().chain(reader_handles) {
            handle.join().unwrap();
        }

        assert_eq!(map.len(), num_writers * items_per_writer);
        for i in 0..num_writers * items_per_writer {
            assert!(map.get(&i).is_some(), "Missing key: {}", i);
        }
    }

    #[cfg(feature = "metrics")]
    #[test]
    fn test_metrics() {
        use crate::metrics::MetricsCollector;

        let map: ConcurrentHashMap<i32, i32> =
            ConcurrentHashMap::with_concurrency_level(1, 1).unwrap();
        for i in 0..10 {
            map.try_insert(i, i);
        }
        map.try_insert(0, 0);
        map.get(&100);

        let metrics = map.metrics();
        assert_eq!(metrics.successful_operations, 10);
        assert_eq!(metrics.failed_operations, 2);
        assert!(metrics.structural_changes >= 1);
    }

    #[cfg(feature = "metrics")]
    #[test]
    fn test_metrics_skip_operations_that_panic() {
        use crate::metrics::MetricsCollector;

        let map: ConcurrentHashMap<i32, i32> = ConcurrentHashMap::new();

        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            map.get_or_insert_with(1, |_| panic!("factory failed"))
        }));
        assert!(result.is_err());
        assert_eq!(map.metrics().total_operations, 0);

        map.insert(1, 10);
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            map.insert_or_update_with(1, |_| 0, |_, _| panic!("update failed"))
        }));
        assert!(result.is_err());
        assert_eq!(map.get(&1), Some(10));

        let metrics = map.metrics();
        assert_eq!(metrics.total_operations, 2);
        assert_eq!(metrics.successful_operations, 2);

        assert_eq!(map.get_or_insert_with(2, |_| 20), 20);
        assert_eq!(map.insert_or_update_with(2, |_| 0, |_, v| v + 1), 21);
        assert_eq!(map.metrics().successful_operations, 4);
    }
}
