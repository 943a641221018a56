//! Common utilities and helper types

use core::fmt;
use core::ops::{Deref, DerefMut};

use crossbeam_utils::Backoff;
use rand::Rng;

/// Cache line size for alignment purposes
pub const CACHE_LINE_SIZE: usize = 64;

/// Pads and aligns a value to the cache line size so that hot atomics owned by
/// different threads never share a line.
#[repr(align(64))]
#[derive(Default)]
pub struct CachePadded<T> {
    value: T,
}

impl<T> CachePadded<T> {
    /// Create a new cache-padded value
    #[inline]
    pub const fn new(value: T) -> Self {
        Self { value }
    }

    /// Get the inner value
    #[inline]
    pub fn into_inner(self) -> T {
        self.value
    }
}

impl<T> Deref for CachePadded<T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        &self.value
    }
}

impl<T> DerefMut for CachePadded<T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        &mut self.value
    }
}

impl<T: Clone> Clone for CachePadded<T> {
    fn clone(&self) -> Self {
        Self::new(self.value.clone())
    }
}

impl<T: fmt::Debug> fmt::Debug for CachePadded<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.value, f)
    }
}

/// Upper bound (exclusive) of the random multiplier picked once spinning
/// would start yielding the thread.
const MAX_YIELD_ROUNDS: u32 = 8;

/// Ceiling for the doubling phase so a long losing streak cannot spin forever.
const MAX_SPIN_ROUNDS: u32 = 64;

/// Retry policy for compare-and-swap loops under contention.
///
/// Each `wait` performs `rounds` snoozes, doubling `rounds` while the
/// underlying backoff is still spinning. Once it reports that yielding is
/// imminent the multiplier is re-drawn at random from `1..MAX_YIELD_ROUNDS`,
/// so contending threads fall out of lock-step instead of retrying together.
pub(crate) struct ContentionBackoff {
    spinner: Backoff,
    rounds: u32,
}

impl ContentionBackoff {
    pub(crate) fn new() -> Self {
        Self {
            spinner: Backoff::new(),
            rounds: 1,
        }
    }

    pub(crate) fn wait(&mut self) {
        for _ in 0..self.rounds {
            self.spinner.snooze();
        }

        if self.spinner.is_completed() {
            self.rounds = rand::rng().random_range(1..MAX_YIELD_ROUNDS);
        } else {
            self.rounds = (self.rounds * 2).min(MAX_SPIN_ROUNDS);
        }
    }

    #[cfg(test)]
    pub(crate) fn rounds(&self) -> u32 {
        self.rounds
    }
}

impl fmt::Debug for ContentionBackoff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContentionBackoff")
            .field("rounds", &self.rounds)
            .finish()
    }
}
