//! Lock-Free Stack Implementation
//!
//! A Treiber stack whose only shared state is the head pointer. Every
//! structural change is a single compare-and-swap against an observed head,
//! including batch operations: a batch push links its whole chain privately
//! and publishes it with one CAS, and a batch pop detaches up to `n` nodes
//! with one CAS.
//!
//! Under contention the retry loops back off through
//! [`ContentionBackoff`](crate::util), which randomizes the wait once the
//! spinner is about to yield so that losing threads drift apart.
//!
//! Popped nodes are reclaimed through `crossbeam-epoch`, which also rules
//! out ABA on the head: a node address cannot come back while any thread
//! that might still compare against it is pinned.

use core::fmt;
use core::mem::ManuallyDrop;
use core::ptr;
use core::sync::atomic::Ordering;

use crossbeam_epoch::{self as epoch, Atomic, Guard, Owned, Shared};

use crate::handoff::SlotState;
use crate::metrics::{delegate_metrics, AtomicMetrics};
use crate::util::{CachePadded, ContentionBackoff};
use crate::{Error, Result};

struct Node<T> {
    value: ManuallyDrop<T>,
    // Lets `try_peek` and `to_vec` clone a value that a popper is about to
    // move out.
    state: SlotState,
    next: Atomic<Node<T>>,
}

impl<T> Node<T> {
    fn new(value: T, next: Shared<'_, Node<T>>) -> Self {
        Self {
            value: ManuallyDrop::new(value),
            state: SlotState::written(),
            next: Atomic::from(next),
        }
    }
}

/// A lock-free LIFO stack with single-CAS batch operations
///
/// # Type Parameters
///
/// * `T` - The type of elements stored in the stack
///
/// # Examples
///
/// ```rust
/// use strata::stack::LockFreeStack;
///
/// let stack = LockFreeStack::new();
///
/// stack.push(1);
/// stack.push(2);
/// stack.push(3);
///
/// assert_eq!(stack.try_pop(), Some(3));
/// assert_eq!(stack.try_pop(), Some(2));
/// assert_eq!(stack.try_pop(), Some(1));
/// assert_eq!(stack.try_pop(), None);
/// ```
pub struct LockFreeStack<T> {
    head: CachePadded<Atomic<Node<T>>>,
    metrics: AtomicMetrics,
}

impl<T> LockFreeStack<T> {
    /// Create a new empty stack
    pub fn new() -> Self {
        Self {
            head: CachePadded::new(Atomic::null()),
            metrics: AtomicMetrics::default(),
        }
    }

    /// Push a value onto the stack
    ///
    /// # Arguments
    ///
    /// * `value` - The value to push onto the stack
    pub fn push(&self, value: T) {
        let guard = &epoch::pin();
        let head = self.head.load(Ordering::Relaxed, guard);
        let node = Owned::new(Node::new(value, head)).into_shared(guard);

        if self
            .head
            .compare_exchange(head, node, Ordering::Release, Ordering::Relaxed, guard)
            .is_err()
        {
            self.push_core(node, node, guard);
        }
        self.metrics.record_success();
    }

    /// Push every value from `values` as one atomic batch
    ///
    /// Values are pushed in iteration order, so the last one ends up on top.
    /// A concurrent observer sees either none of the batch or all of it.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use strata::stack::LockFreeStack;
    ///
    /// let stack = LockFreeStack::new();
    /// stack.push(0);
    /// stack.push_range(vec![1, 2, 3]);
    ///
    /// assert_eq!(stack.try_pop(), Some(3));
    /// assert_eq!(stack.try_pop(), Some(2));
    /// assert_eq!(stack.try_pop(), Some(1));
    /// assert_eq!(stack.try_pop(), Some(0));
    /// ```
    pub fn push_range<I>(&self, values: I)
    where
        I: IntoIterator<Item = T>,
    {
        // Collect first so a panicking iterator cannot strand half a chain.
        let mut values = values.into_iter().collect::<Vec<_>>().into_iter();
        let Some(first) = values.next() else {
            return;
        };

        let guard = &epoch::pin();
        let bottom = Owned::new(Node::new(first, Shared::null())).into_shared(guard);
        let mut top = bottom;
        for value in values {
            top = Owned::new(Node::new(value, top)).into_shared(guard);
        }

        let head = self.head.load(Ordering::Relaxed, guard);
        unsafe { bottom.deref() }.next.store(head, Ordering::Relaxed);
        if self
            .head
            .compare_exchange(head, top, Ordering::Release, Ordering::Relaxed, guard)
            .is_err()
        {
            self.push_core(top, bottom, guard);
        }
        self.metrics.record_success();
    }

    /// Push `items[start..start + count]` as one atomic batch
    ///
    /// # Errors
    ///
    /// `Error::InvalidArgument` if `start` is past the end of `items` or the
    /// range runs past it. Nothing is pushed in that case.
    pub fn push_slice(&self, items: &[T], start: usize, count: usize) -> Result<()>
    where
        T: Clone,
    {
        let range = checked_range(items.len(), start, count)?;
        self.push_range(items[range].iter().cloned());
        Ok(())
    }

    /// Retry loop for publishing the chain `first..=last` after a lost race.
    fn push_core<'g>(
        &self,
        first: Shared<'g, Node<T>>,
        last: Shared<'g, Node<T>>,
        guard: &'g Guard,
    ) {
        let mut backoff = ContentionBackoff::new();
        loop {
            self.metrics.record_contention();
            backoff.wait();

            let head = self.head.load(Ordering::Relaxed, guard);
            unsafe { last.deref() }.next.store(head, Ordering::Relaxed);
            if self
                .head
                .compare_exchange(head, first, Ordering::Release, Ordering::Relaxed, guard)
                .is_ok()
            {
                return;
            }
        }
    }

    /// Pop the value on top of the stack
    ///
    /// # Returns
    ///
    /// * `Some(value)` if the stack was not empty
    /// * `None` if the stack was empty
    pub fn try_pop(&self) -> Option<T> {
        let guard = &epoch::pin();
        let head = self.head.load(Ordering::Acquire, guard);

        let popped = match unsafe { head.as_ref() } {
            None => None,
            Some(node) => {
                let next = node.next.load(Ordering::Relaxed, guard);
                if self
                    .head
                    .compare_exchange(head, next, Ordering::Acquire, Ordering::Relaxed, guard)
                    .is_ok()
                {
                    Some(unsafe { Self::take(head, guard) })
                } else {
                    self.pop_core(1, guard)
                        .map(|(first, _)| unsafe { Self::take(first, guard) })
                }
            }
        };

        if popped.is_some() {
            self.metrics.record_success();
        } else {
            self.metrics.record_failure();
        }
        popped
    }

    /// Pop up to `buffer.len()` values into `buffer`, top first
    ///
    /// The values are detached with a single CAS, so they were adjacent on
    /// the stack. Slots past the returned count are left untouched.
    ///
    /// # Returns
    ///
    /// The number of values popped; zero if the stack was empty.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use strata::stack::LockFreeStack;
    ///
    /// let stack = LockFreeStack::new();
    /// stack.push_range([1, 2, 3]);
    ///
    /// let mut buffer = [0; 5];
    /// assert_eq!(stack.try_pop_range(&mut buffer), 3);
    /// assert_eq!(buffer, [3, 2, 1, 0, 0]);
    /// ```
    pub fn try_pop_range(&self, buffer: &mut [T]) -> usize {
        if buffer.is_empty() {
            return 0;
        }

        let guard = &epoch::pin();
        let popped = match self.pop_core(buffer.len(), guard) {
            Some((first, count)) => {
                let mut slots = buffer.iter_mut();
                unsafe {
                    Self::drain_chain(first, count, guard, |value| {
                        if let Some(slot) = slots.next() {
                            *slot = value;
                        }
                    })
                };
                count
            }
            None => 0,
        };

        if popped > 0 {
            self.metrics.record_success();
        } else {
            self.metrics.record_failure();
        }
        popped
    }

    /// Pop up to `count` values into `buffer[start..start + count]`, top first
    ///
    /// # Errors
    ///
    /// `Error::InvalidArgument` if `start` is past the end of `buffer` or the
    /// range runs past it. The stack is not touched in that case.
    pub fn try_pop_range_in(&self, buffer: &mut [T], start: usize, count: usize) -> Result<usize> {
        let range = checked_range(buffer.len(), start, count)?;
        Ok(self.try_pop_range(&mut buffer[range]))
    }

    /// Pop up to `max_count` values with a single CAS, top first
    ///
    /// # Examples
    ///
    /// ```rust
    /// use strata::stack::LockFreeStack;
    ///
    /// let stack = LockFreeStack::new();
    /// stack.push_range(1..=5);
    ///
    /// assert_eq!(stack.pop_batch(3), vec![5, 4, 3]);
    /// assert_eq!(stack.len(), 2);
    /// ```
    pub fn pop_batch(&self, max_count: usize) -> Vec<T> {
        let guard = &epoch::pin();
        let mut result = Vec::new();

        if max_count > 0 {
            if let Some((first, count)) = self.pop_core(max_count, guard) {
                result.reserve_exact(count);
                unsafe { Self::drain_chain(first, count, guard, |value| result.push(value)) };
            }
        }

        if result.is_empty() {
            self.metrics.record_failure();
        } else {
            self.metrics.record_success();
        }
        result
    }

    /// Detaches up to `count` nodes from the top. Returns the first detached
    /// node and how many were taken, or `None` if the stack is empty.
    fn pop_core<'g>(&self, count: usize, guard: &'g Guard) -> Option<(Shared<'g, Node<T>>, usize)> {
        let mut backoff = ContentionBackoff::new();
        loop {
            let head = self.head.load(Ordering::Acquire, guard);
            if head.is_null() {
                return None;
            }

            let mut last = head;
            let mut taken = 1;
            while taken < count {
                let next = unsafe { last.deref() }.next.load(Ordering::Acquire, guard);
                if next.is_null() {
                    break;
                }
                last = next;
                taken += 1;
            }

            let rest = unsafe { last.deref() }.next.load(Ordering::Acquire, guard);
            if self
                .head
                .compare_exchange(head, rest, Ordering::Acquire, Ordering::Relaxed, guard)
                .is_ok()
            {
                return Some((head, taken));
            }

            self.metrics.record_contention();
            backoff.wait();
        }
    }

    /// Moves the value out of a node this thread has detached and schedules
    /// the node for reclamation.
    ///
    /// # Safety
    ///
    /// `node` must be non-null, unreachable from the head and owned by the
    /// caller.
    unsafe fn take(node: Shared<'_, Node<T>>, guard: &Guard) -> T {
        let detached = node.deref();
        detached.state.claim();
        let value = ManuallyDrop::into_inner(ptr::read(&detached.value));
        guard.defer_destroy(node);
        value
    }

    /// Feeds up to `count` values of a detached chain to `sink`, top first.
    ///
    /// # Safety
    ///
    /// The first `count` nodes starting at `first` must be detached and owned
    /// by the caller.
    unsafe fn drain_chain<F>(first: Shared<'_, Node<T>>, count: usize, guard: &Guard, mut sink: F)
    where
        F: FnMut(T),
    {
        let mut current = first;
        for _ in 0..count {
            if current.is_null() {
                break;
            }
            let next = current.deref().next.load(Ordering::Relaxed, guard);
            sink(Self::take(current, guard));
            current = next;
        }
    }

    /// Return a clone of the top value without removing it
    pub fn try_peek(&self) -> Option<T>
    where
        T: Clone,
    {
        let guard = &epoch::pin();
        loop {
            let head = self.head.load(Ordering::Acquire, guard);
            let Some(node) = (unsafe { head.as_ref() }) else {
                self.metrics.record_failure();
                return None;
            };

            if let Some(_pin) = node.state.begin_read() {
                self.metrics.record_success();
                return Some(T::clone(&node.value));
            }
            // Popped between the load and the read; the head has moved on.
        }
    }

    /// Whether the stack is empty at the moment of the call
    pub fn is_empty(&self) -> bool {
        let guard = &epoch::pin();
        self.head.load(Ordering::Acquire, guard).is_null()
    }

    /// Number of values on the stack
    ///
    /// Walks the whole chain, so it costs O(n) and is only a snapshot under
    /// concurrent modification.
    pub fn len(&self) -> usize {
        let guard = &epoch::pin();
        let mut count = 0;
        let mut current = self.head.load(Ordering::Acquire, guard);

        while let Some(node) = unsafe { current.as_ref() } {
            count += 1;
            current = node.next.load(Ordering::Acquire, guard);
        }
        count
    }

    /// Copy of the stack's values, top first
    ///
    /// Values popped while the copy is being taken may be missing from it.
    pub fn to_vec(&self) -> Vec<T>
    where
        T: Clone,
    {
        let guard = &epoch::pin();
        let mut values = Vec::new();
        let mut current = self.head.load(Ordering::Acquire, guard);

        while let Some(node) = unsafe { current.as_ref() } {
            if let Some(_pin) = node.state.begin_read() {
                values.push(T::clone(&node.value));
            }
            current = node.next.load(Ordering::Acquire, guard);
        }
        values
    }

    /// Remove and drop every value
    pub fn clear(&self) {
        let guard = &epoch::pin();
        let head = self.head.swap(Shared::null(), Ordering::Acquire, guard);

        let mut dropped = 0usize;
        unsafe { Self::drain_chain(head, usize::MAX, guard, |_| dropped += 1) };
        tracing::trace!(dropped, "stack cleared");
    }
}

/// Validates `start..start + count` against a slice of length `len`.
fn checked_range(len: usize, start: usize, count: usize) -> Result<core::ops::Range<usize>> {
    if start > len {
        return Err(Error::invalid_argument("start", "past the end of the slice"));
    }
    if count > len - start {
        return Err(Error::invalid_argument("count", "runs past the end of the slice"));
    }
    Ok(start..start + count)
}

impl<T> Default for LockFreeStack<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> FromIterator<T> for LockFreeStack<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        let stack = Self::new();
        stack.push_range(iter);
        stack
    }
}

impl<T> Drop for LockFreeStack<T> {
    fn drop(&mut self) {
        unsafe {
            let guard = epoch::unprotected();
            let mut current = self.head.load(Ordering::Relaxed, guard);
            while !current.is_null() {
                let mut node = current.into_owned();
                current = node.next.load(Ordering::Relaxed, guard);
                ManuallyDrop::drop(&mut node.value);
            }
        }
    }
}

impl<T> fmt::Debug for LockFreeStack<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockFreeStack")
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

delegate_metrics!(LockFreeStack<T>);
