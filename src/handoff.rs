//! Handshake between snapshot readers and the consumer of an owned value.
//!
//! Queue slots and stack nodes hand their value to exactly one consumer by
//! moving it out, while snapshot operations (peek, `to_vec`, iteration) clone
//! it in place. A clone must never start after the move, so every slot carries
//! a small state word:
//!
//! ```text
//!  bit 0   WRITTEN  value is initialized and visible
//!  bit 1   TAKEN    a consumer has claimed the value
//!  bits 2+ readers  snapshot readers currently cloning it
//! ```
//!
//! A reader registers before touching the value and backs off if `TAKEN` is
//! already set. A consumer sets `TAKEN` and then waits for the registered
//! readers to drain before it moves the value out.

use core::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_utils::Backoff;

const WRITTEN: usize = 0b01;
const TAKEN: usize = 0b10;
const READER: usize = 0b100;

#[derive(Debug)]
pub(crate) struct SlotState(AtomicUsize);

impl SlotState {
    /// State for a slot whose value will be written later.
    pub(crate) const fn empty() -> Self {
        Self(AtomicUsize::new(0))
    }

    /// State for a value that is initialized before it becomes reachable.
    pub(crate) const fn written() -> Self {
        Self(AtomicUsize::new(WRITTEN))
    }

    /// Marks the value as written. Pairs with the acquire in `wait_written`.
    pub(crate) fn publish(&self) {
        self.0.fetch_or(WRITTEN, Ordering::Release);
    }

    pub(crate) fn is_written(&self) -> bool {
        self.0.load(Ordering::Acquire) & WRITTEN != 0
    }

    /// Spins until a producer that reserved the slot has finished writing it.
    pub(crate) fn wait_written(&self) {
        let backoff = Backoff::new();
        while !self.is_written() {
            backoff.snooze();
        }
    }

    /// Registers a snapshot reader. Returns `None` when the value has already
    /// been claimed by a consumer.
    pub(crate) fn begin_read(&self) -> Option<ReadPin<'_>> {
        let previous = self.0.fetch_add(READER, Ordering::Acquire);
        if previous & TAKEN != 0 {
            self.0.fetch_sub(READER, Ordering::Release);
            return None;
        }
        Some(ReadPin { state: self })
    }

    /// Claims the value for the single consumer, waiting out readers that
    /// registered before the claim. Later readers observe `TAKEN` and skip.
    pub(crate) fn claim(&self) {
        let previous = self.0.fetch_or(TAKEN, Ordering::AcqRel);
        debug_assert_eq!(previous & TAKEN, 0, "slot claimed twice");

        if previous >= READER {
            let backoff = Backoff::new();
            while self.0.load(Ordering::Acquire) >= READER {
                backoff.snooze();
            }
        }
    }
}

/// Keeps a slot's value alive for the duration of a clone.
#[derive(Debug)]
pub(crate) struct ReadPin<'a> {
    state: &'a SlotState,
}

impl Drop for ReadPin<'_> {
    fn drop(&mut self) {
        self.state.0.fetch_sub(READER, Ordering::Release);
    }
}
