//! Segmented Lock-Free Queue
//!
//! An unbounded multi-producer, multi-consumer FIFO built from fixed-size
//! array segments chained into a singly-linked list.
//!
//! ## Algorithm
//!
//! Each segment owns [`SEGMENT_SIZE`] slots and two cursors:
//!
//! ```text
//!            low                 high
//!             v                   v
//! [ taken | taken | ready | ready | reserved | free | free ]
//! ```
//!
//! - **Enqueue** reserves a slot with one `fetch_add` on the tail segment's
//!   `high` cursor, writes the value and publishes the slot. The producer that
//!   reserves the last slot links a fresh segment and moves the tail, so the
//!   next producer never waits for an allocation. A reservation that lands
//!   past the end retries against the new tail.
//! - **Dequeue** claims the slot at `low` with a compare-and-swap, waits for
//!   the slot to be published, and moves the value out. The consumer that
//!   claims the last slot of a segment advances the head and retires the
//!   drained segment.
//!
//! Reservation is a single atomic increment, so the order in which values
//! become dequeue-able is exactly the order in which producers reserved them.
//!
//! ## Snapshots
//!
//! Peeking, `to_vec` and iteration clone values in place. While any snapshot
//! is running, consumers move values out through the per-slot handshake in
//! [`crate::handoff`], so a clone never overlaps the move. A value dequeued in
//! the middle of a snapshot is skipped by it; snapshots are weakly consistent.
//!
//! ## Memory Ordering
//!
//! Cursor updates, segment links and the snapshot-taker count use `SeqCst`:
//! a consumer reads the taker count after claiming its slot, and a snapshot
//! reads the cursors after registering, so one of the two always sees the
//! other.

use core::cell::UnsafeCell;
use core::fmt;
use core::marker::PhantomData;
use core::mem::MaybeUninit;
use core::ptr;
use core::sync::atomic::{AtomicIsize, AtomicUsize, Ordering};

use crossbeam_epoch::{self as epoch, Atomic, Guard, Owned, Shared};
use crossbeam_utils::Backoff;

use crate::handoff::SlotState;
use crate::metrics::{delegate_metrics, AtomicMetrics};
use crate::util::CachePadded;
use crate::{Error, Result};

/// Number of slots in each segment
pub const SEGMENT_SIZE: usize = 32;

const LAST_INDEX: usize = SEGMENT_SIZE - 1;

struct Segment<T> {
    slots: [UnsafeCell<MaybeUninit<T>>; SEGMENT_SIZE],
    states: [SlotState; SEGMENT_SIZE],
    index: u64,
    low: AtomicIsize,
    high: AtomicIsize,
    next: Atomic<Segment<T>>,
}

impl<T> Segment<T> {
    fn new(index: u64) -> Self {
        Self {
            slots: core::array::from_fn(|_| UnsafeCell::new(MaybeUninit::uninit())),
            states: core::array::from_fn(|_| SlotState::empty()),
            index,
            low: AtomicIsize::new(0),
            high: AtomicIsize::new(-1),
            next: Atomic::null(),
        }
    }

    /// Next slot to dequeue, never past the end.
    #[inline]
    fn low(&self) -> isize {
        self.low.load(Ordering::SeqCst).min(SEGMENT_SIZE as isize)
    }

    /// Last reserved slot, never past the end.
    #[inline]
    fn high(&self) -> isize {
        self.high.load(Ordering::SeqCst).min(LAST_INDEX as isize)
    }

    #[inline]
    fn is_drained(&self) -> bool {
        self.low() > self.high()
    }

    fn try_append(
        &self,
        value: T,
        queue: &SegmentedQueue<T>,
        guard: &Guard,
    ) -> core::result::Result<(), T> {
        let reserved = self.high.fetch_add(1, Ordering::SeqCst) + 1;
        if reserved > LAST_INDEX as isize {
            return Err(value);
        }

        let slot = reserved as usize;
        unsafe { (*self.slots[slot].get()).write(value) };
        self.states[slot].publish();

        if slot == LAST_INDEX {
            self.grow(queue, guard);
        }
        Ok(())
    }

    /// Links the successor segment and makes it the tail. Only the producer
    /// that reserved the last slot gets here.
    fn grow(&self, queue: &SegmentedQueue<T>, guard: &Guard) {
        let next = Owned::new(Segment::new(self.index + 1)).into_shared(guard);
        self.next.store(next, Ordering::SeqCst);
        queue.tail.store(next, Ordering::SeqCst);

        queue.metrics.record_structural_change();
        tracing::trace!(segment = self.index + 1, "queue linked new segment");
    }

    fn try_remove(
        &self,
        current: Shared<'_, Segment<T>>,
        queue: &SegmentedQueue<T>,
        guard: &Guard,
    ) -> Option<T> {
        let backoff = Backoff::new();
        let mut low = self.low();
        let mut high = self.high();

        while low <= high {
            if self
                .low
                .compare_exchange(low, low + 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                let slot = low as usize;
                let state = &self.states[slot];
                state.wait_written();
                if queue.snapshot_takers.load(Ordering::SeqCst) > 0 {
                    state.claim();
                }
                let value = unsafe { (*self.slots[slot].get()).assume_init_read() };

                if slot == LAST_INDEX {
                    queue.retire_head(self, current, guard);
                }
                return Some(value);
            }

            queue.metrics.record_contention();
            backoff.spin();
            low = self.low();
            high = self.high();
        }
        None
    }

    /// Clones a reserved slot once its producer has finished writing it.
    /// `None` when a consumer has already moved the value out.
    fn clone_slot(&self, slot: usize) -> Option<T>
    where
        T: Clone,
    {
        let state = &self.states[slot];
        state.wait_written();
        let _pin = state.begin_read()?;
        Some(unsafe { (*self.slots[slot].get()).assume_init_ref().clone() })
    }
}

/// Boundaries of the live region, read without interference.
struct Positions<'g, T> {
    head: &'g Segment<T>,
    tail: &'g Segment<T>,
    head_low: isize,
    tail_high: isize,
}

/// Registers a snapshot for as long as it lives.
struct SnapshotGuard<'a> {
    takers: &'a AtomicUsize,
}

impl<'a> SnapshotGuard<'a> {
    fn register(takers: &'a AtomicUsize) -> Self {
        takers.fetch_add(1, Ordering::SeqCst);
        Self { takers }
    }
}

impl Drop for SnapshotGuard<'_> {
    fn drop(&mut self) {
        self.takers.fetch_sub(1, Ordering::SeqCst);
    }
}

/// An unbounded lock-free FIFO queue made of fixed-size segments
///
/// # Examples
///
/// ```rust
/// use strata::queue::SegmentedQueue;
///
/// let queue = SegmentedQueue::new();
/// queue.enqueue(1);
/// queue.enqueue(2);
/// queue.enqueue(3);
///
/// assert_eq!(queue.try_peek(), Some(1));
/// assert_eq!(queue.try_dequeue(), Some(1));
/// assert_eq!(queue.try_dequeue(), Some(2));
/// assert_eq!(queue.try_dequeue(), Some(3));
/// assert_eq!(queue.try_dequeue(), None);
/// ```
pub struct SegmentedQueue<T> {
    head: CachePadded<Atomic<Segment<T>>>,
    tail: CachePadded<Atomic<Segment<T>>>,
    snapshot_takers: CachePadded<AtomicUsize>,
    metrics: AtomicMetrics,
}

unsafe impl<T: Send> Send for SegmentedQueue<T> {}
unsafe impl<T: Send + Sync> Sync for SegmentedQueue<T> {}

impl<T> SegmentedQueue<T> {
    /// Create an empty queue holding a single segment
    pub fn new() -> Self {
        let first = Atomic::new(Segment::new(0));
        let tail = first.clone();
        Self {
            head: CachePadded::new(first),
            tail: CachePadded::new(tail),
            snapshot_takers: CachePadded::new(AtomicUsize::new(0)),
            metrics: AtomicMetrics::default(),
        }
    }

    /// Append a value at the tail
    ///
    /// Never blocks; a producer only retries when its reservation landed past
    /// the end of a segment that another producer is about to replace.
    pub fn enqueue(&self, value: T) {
        let guard = &epoch::pin();
        let backoff = Backoff::new();
        let mut value = value;

        loop {
            let tail = unsafe { self.tail.load(Ordering::SeqCst, guard).deref() };
            match tail.try_append(value, self, guard) {
                Ok(()) => {
                    self.metrics.record_success();
                    return;
                }
                Err(rejected) => {
                    value = rejected;
                    self.metrics.record_contention();
                    backoff.snooze();
                }
            }
        }
    }

    /// Remove and return the value at the head
    ///
    /// # Returns
    ///
    /// `None` if the queue was observed empty.
    pub fn try_dequeue(&self) -> Option<T> {
        let guard = &epoch::pin();
        let backoff = Backoff::new();

        loop {
            let current = self.head.load(Ordering::SeqCst, guard);
            let head = unsafe { current.deref() };

            if let Some(value) = head.try_remove(current, self, guard) {
                self.metrics.record_success();
                return Some(value);
            }

            if head.is_drained() && head.next.load(Ordering::SeqCst, guard).is_null() {
                self.metrics.record_failure();
                return None;
            }
            // Either new values arrived or the drained head is about to be
            // retired by the consumer that took its last slot.
            backoff.snooze();
        }
    }

    /// Whether the queue holds no values
    ///
    /// Waits out the short window in which a fully drained head segment has
    /// not yet been replaced by its successor.
    pub fn is_empty(&self) -> bool {
        let guard = &epoch::pin();
        let backoff = Backoff::new();

        loop {
            let head = unsafe { self.head.load(Ordering::SeqCst, guard).deref() };
            if !head.is_drained() {
                return false;
            }
            if head.next.load(Ordering::SeqCst, guard).is_null() {
                return true;
            }
            backoff.snooze();
        }
    }

    /// Number of values in the queue
    ///
    /// Computed from a stable reading of the head and tail cursors, so it is
    /// exact at some instant during the call.
    pub fn len(&self) -> usize {
        let guard = &epoch::pin();
        let Positions {
            head,
            tail,
            head_low,
            tail_high,
        } = self.positions(guard);

        let count = if ptr::eq(head, tail) {
            tail_high - head_low + 1
        } else {
            let full_segments = (tail.index - head.index - 1) as isize;
            (SEGMENT_SIZE as isize - head_low)
                + SEGMENT_SIZE as isize * full_segments
                + (tail_high + 1)
        };
        count.max(0) as usize
    }

    /// Reads head, tail and their cursors until two consecutive readings
    /// agree.
    fn positions<'g>(&self, guard: &'g Guard) -> Positions<'g, T> {
        let backoff = Backoff::new();
        loop {
            let head_ptr = self.head.load(Ordering::SeqCst, guard);
            let tail_ptr = self.tail.load(Ordering::SeqCst, guard);
            let (head, tail) = unsafe { (head_ptr.deref(), tail_ptr.deref()) };
            let head_low = head.low();
            let tail_high = tail.high();

            if head_ptr == self.head.load(Ordering::SeqCst, guard)
                && tail_ptr == self.tail.load(Ordering::SeqCst, guard)
                && head_low == head.low()
                && tail_high == tail.high()
                && head.index <= tail.index
            {
                return Positions {
                    head,
                    tail,
                    head_low,
                    tail_high,
                };
            }
            backoff.spin();
        }
    }

    fn retire_head(&self, drained: &Segment<T>, current: Shared<'_, Segment<T>>, guard: &Guard) {
        let backoff = Backoff::new();
        let mut next = drained.next.load(Ordering::SeqCst, guard);
        while next.is_null() {
            // The producer of the last slot links the successor right after
            // publishing it.
            backoff.snooze();
            next = drained.next.load(Ordering::SeqCst, guard);
        }

        self.head.store(next, Ordering::SeqCst);
        unsafe { guard.defer_destroy(current) };
        tracing::trace!(segment = drained.index, "queue retired drained segment");
    }

    /// Copy of the queue's contents, oldest first
    ///
    /// Values dequeued while the copy is being taken may be missing from it.
    pub fn to_vec(&self) -> Vec<T>
    where
        T: Clone,
    {
        self.iter().collect()
    }

    /// Copy the queue's contents into `dest` starting at `index`
    ///
    /// # Errors
    ///
    /// `Error::InvalidArgument` if `index` is past the end of `dest` or the
    /// values do not fit in the remaining room.
    pub fn copy_to(&self, dest: &mut [T], index: usize) -> Result<()>
    where
        T: Clone,
    {
        if index > dest.len() {
            return Err(Error::invalid_argument("index", "past the end of the destination"));
        }

        let values = self.to_vec();
        if values.len() > dest.len() - index {
            return Err(Error::invalid_argument(
                "dest",
                "not enough room after index for the queue's values",
            ));
        }

        for (slot, value) in dest[index..].iter_mut().zip(values) {
            *slot = value;
        }
        Ok(())
    }

    /// Weakly consistent iterator over clones of the queued values, oldest
    /// first
    ///
    /// The iterator covers the values present when it was created. Values
    /// enqueued afterwards are not visited; values dequeued while it runs are
    /// skipped.
    pub fn iter(&self) -> Iter<'_, T>
    where
        T: Clone,
    {
        let snapshot = SnapshotGuard::register(&self.snapshot_takers);
        let guard = epoch::pin();
        let Positions {
            head,
            tail,
            head_low,
            tail_high,
        } = self.positions(&guard);

        let (segment, tail) = (head as *const Segment<T>, tail as *const Segment<T>);
        Iter {
            _snapshot: snapshot,
            guard,
            segment,
            tail,
            index: head_low,
            tail_high,
            _queue: PhantomData,
        }
    }

    /// Return a clone of the value at the head without removing it
    pub fn try_peek(&self) -> Option<T>
    where
        T: Clone,
    {
        let _snapshot = SnapshotGuard::register(&self.snapshot_takers);
        let guard = &epoch::pin();
        let backoff = Backoff::new();

        loop {
            let head = unsafe { self.head.load(Ordering::SeqCst, guard).deref() };
            let low = head.low();
            if low <= head.high() {
                if let Some(value) = head.clone_slot(low as usize) {
                    return Some(value);
                }
                // Dequeued under us; look again.
                continue;
            }

            if head.next.load(Ordering::SeqCst, guard).is_null() {
                return None;
            }
            backoff.snooze();
        }
    }
}

impl<T> Default for SegmentedQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> FromIterator<T> for SegmentedQueue<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        let queue = Self::new();
        for value in iter {
            queue.enqueue(value);
        }
        queue
    }
}

impl<T> Drop for SegmentedQueue<T> {
    fn drop(&mut self) {
        unsafe {
            let guard = epoch::unprotected();
            let mut current = self.head.load(Ordering::Relaxed, guard);

            while let Some(segment) = current.as_ref() {
                for slot in segment.low()..=segment.high() {
                    let slot = slot as usize;
                    if segment.states[slot].is_written() {
                        (*segment.slots[slot].get()).assume_init_drop();
                    }
                }

                let next = segment.next.load(Ordering::Relaxed, guard);
                drop(current.into_owned());
                current = next;
            }
        }
    }
}

impl<T> fmt::Debug for SegmentedQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SegmentedQueue")
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

delegate_metrics!(SegmentedQueue<T>);

/// Iterator returned by [`SegmentedQueue::iter`]
pub struct Iter<'a, T> {
    _snapshot: SnapshotGuard<'a>,
    guard: Guard,
    segment: *const Segment<T>,
    tail: *const Segment<T>,
    index: isize,
    tail_high: isize,
    _queue: PhantomData<&'a SegmentedQueue<T>>,
}

impl<T: Clone> Iterator for Iter<'_, T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        loop {
            // Segments between head and tail stay allocated while the guard
            // is pinned, even if they are retired meanwhile.
            let segment = unsafe { self.segment.as_ref() }?;
            let at_tail = ptr::eq(segment, self.tail);
            let last = if at_tail {
                self.tail_high
            } else {
                LAST_INDEX as isize
            };

            if self.index > last {
                self.segment = if at_tail {
                    ptr::null()
                } else {
                    segment.next.load(Ordering::SeqCst, &self.guard).as_raw()
                };
                self.index = 0;
                continue;
            }

            let slot = self.index as usize;
            self.index += 1;
            if let Some(value) = segment.clone_slot(slot) {
                return Some(value);
            }
        }
    }
}

impl<T> fmt::Debug for Iter<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Iter")
            .field("index", &self.index)
            .finish_non_exhaustive()
    }
}
