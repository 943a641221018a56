//! Sorted copy-on-write intern set
//!
//! The set is one atomically swapped pointer to a sorted `Vec<Arc<T>>`.
//! Lookups binary-search whatever array is current without synchronizing
//! with writers. An insert copies the array with the new item spliced in and
//! publishes the copy with a compare-and-swap; losing the race means
//! searching the winner's array again, where the item may now be present.
//! Superseded arrays are reclaimed once no reader can still see them.
//!
//! Suited to small, read-mostly sets; every insert costs O(n).

use core::borrow::Borrow;
use core::cmp::Ordering as CmpOrdering;
use core::fmt;
use core::sync::atomic::Ordering;
use std::sync::Arc;

use crossbeam_epoch::{self as epoch, Atomic, Owned};

use crate::metrics::{delegate_metrics, AtomicMetrics};
use crate::util::ContentionBackoff;
use crate::{Error, Result};

/// A concurrent set that interns values into shared `Arc` handles
///
/// # Examples
///
/// ```rust
/// use strata::intern::InternSet;
/// use std::sync::Arc;
///
/// let names: InternSet<String> = InternSet::new();
/// let first = names.get_or_insert("request_id".to_string()).unwrap();
/// let second = names.get_or_insert("request_id".to_string()).unwrap();
///
/// assert!(Arc::ptr_eq(&first, &second));
/// assert_eq!(names.get("request_id").as_deref(), Some(&"request_id".to_string()));
/// assert_eq!(names.len(), 1);
/// ```
pub struct InternSet<T> {
    items: Atomic<Vec<Arc<T>>>,
    metrics: AtomicMetrics,
}

impl<T> InternSet<T> {
    /// Create an empty set
    pub fn new() -> Self {
        Self {
            items: Atomic::new(Vec::new()),
            metrics: AtomicMetrics::default(),
        }
    }

    /// Number of interned values
    pub fn len(&self) -> usize {
        let guard = &epoch::pin();
        unsafe { self.items.load(Ordering::Acquire, guard).deref() }.len()
    }

    /// Whether nothing has been interned yet
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Handles to every interned value, in sorted order
    pub fn snapshot(&self) -> Vec<Arc<T>> {
        let guard = &epoch::pin();
        unsafe { self.items.load(Ordering::Acquire, guard).deref() }.clone()
    }
}

impl<T: Ord> InternSet<T> {
    /// Look up the interned handle equal to `key`
    pub fn get<Q>(&self, key: &Q) -> Option<Arc<T>>
    where
        T: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        let guard = &epoch::pin();
        let items = unsafe { self.items.load(Ordering::Acquire, guard).deref() };
        let found = items
            .binary_search_by(|probe| T::borrow(probe).cmp(key))
            .ok()
            .map(|index| Arc::clone(&items[index]));

        if found.is_some() {
            self.metrics.record_success();
        } else {
            self.metrics.record_failure();
        }
        found
    }

    /// Return the interned handle equal to `item`, interning `item` if no
    /// equal value is present
    ///
    /// # Errors
    ///
    /// `Error::InvalidOperation` if `T`'s `Ord` implementation contradicts
    /// itself while the insertion point is being located. The set is left
    /// unchanged.
    pub fn get_or_insert(&self, item: T) -> Result<Arc<T>> {
        let guard = &epoch::pin();
        let candidate = Arc::new(item);
        let mut backoff = ContentionBackoff::new();

        loop {
            let current = self.items.load(Ordering::Acquire, guard);
            let items = unsafe { current.deref() };

            let position = match items.binary_search_by(|probe| T::cmp(probe, &candidate)) {
                Ok(index) => {
                    self.metrics.record_success();
                    return Ok(Arc::clone(&items[index]));
                }
                Err(position) => position,
            };

            let fits_before = position == 0 || ordered(&items[position - 1], &candidate);
            let fits_after = position == items.len() || ordered(&candidate, &items[position]);
            if !(fits_before && fits_after) {
                return Err(Error::InvalidOperation("inconsistent ordering"));
            }

            let mut grown = Vec::with_capacity(items.len() + 1);
            grown.extend_from_slice(&items[..position]);
            grown.push(Arc::clone(&candidate));
            grown.extend_from_slice(&items[position..]);

            match self.items.compare_exchange(
                current,
                Owned::new(grown),
                Ordering::AcqRel,
                Ordering::Acquire,
                guard,
            ) {
                Ok(_) => {
                    unsafe { guard.defer_destroy(current) };
                    self.metrics.record_success();
                    self.metrics.record_structural_change();
                    return Ok(candidate);
                }
                Err(_) => {
                    self.metrics.record_contention();
                    backoff.wait();
                }
            }
        }
    }
}

/// `lower` sorts strictly before `upper`, asked both ways round.
fn ordered<T: Ord>(lower: &T, upper: &T) -> bool {
    lower.cmp(upper) == CmpOrdering::Less && upper.cmp(lower) == CmpOrdering::Greater
}

impl<T> Default for InternSet<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for InternSet<T> {
    fn drop(&mut self) {
        unsafe {
            let items = self.items.load(Ordering::Relaxed, epoch::unprotected());
            drop(items.into_owned());
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for InternSet<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.snapshot()).finish()
    }
}

delegate_metrics!(InternSet<T>);

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use std::thread;

    #[test]
    fn test_interning_returns_canonical_handle() {
        let set = InternSet::new();
        assert!(set.is_empty());
        assert_eq!(set.get(&5), None);

        let five = set.get_or_insert(5).unwrap();
        let again = set.get_or_insert(5).unwrap();
        assert!(Arc::ptr_eq(&five, &again));

        set.get_or_insert(1).unwrap();
        set.get_or_insert(9).unwrap();
        set.get_or_insert(3).unwrap();

        let sorted: Vec<i32> = set.snapshot().iter().map(|v| **v).collect();
        assert_eq!(sorted, vec![1, 3, 5, 9]);
        assert!(Arc::ptr_eq(&set.get(&5).unwrap(), &five));
        assert_eq!(set.len(), 4);
    }

    #[test]
    fn test_lookup_by_borrowed_form() {
        let set: InternSet<String> = InternSet::new();
        set.get_or_insert("beta".to_string()).unwrap();
        set.get_or_insert("alpha".to_string()).unwrap();

        assert_eq!(set.get("alpha").map(|s| s.len()), Some(5));
        assert!(set.get("gamma").is_none());
    }

    /// Claims to be smaller than everything, itself included.
    #[derive(Debug, PartialEq, Eq)]
    struct Contrary(u32);

    impl PartialOrd for Contrary {
        fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
            Some(self.cmp(other))
        }
    }

    impl Ord for Contrary {
        fn cmp(&self, _other: &Self) -> CmpOrdering {
            CmpOrdering::Less
        }
    }

    #[test]
    fn test_inconsistent_ordering_is_reported() {
        let set = InternSet::new();
        set.get_or_insert(Contrary(1)).unwrap();

        let result = set.get_or_insert(Contrary(2));
        assert_eq!(result.unwrap_err(), Error::InvalidOperation("inconsistent ordering"));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_concurrent_interning_agrees() {
        let set = Arc::new(InternSet::new());

        let handles: Vec<_> = (0..8)
            .map(|thread_id| {
                let set = Arc::clone(&set);
                thread::spawn(move || {
                    (0..200)
                        .map(|i| set.get_or_insert((i * 7 + thread_id) % 100).unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let handles: Vec<Vec<Arc<u32>>> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(set.len(), 100);
        let values: BTreeSet<u32> = set.snapshot().iter().map(|v| **v).collect();
        assert_eq!(values, (0..100).collect());

        // Every handle anyone received is the canonical one.
        for handle in handles.iter().flatten() {
            assert!(Arc::ptr_eq(handle, &set.get(handle.as_ref()).unwrap()));
        }
    }
}
