//! # Strata
//!
//! Concurrent collections for sharing mutable state between threads without a
//! single global lock.
//!
//! ## Features
//!
//! - **Striped-lock hash map**: lock-free lookups, writers serialize per stripe
//! - **Segmented queue**: unbounded lock-free FIFO built from fixed-size segments
//! - **Lock-free stack**: Treiber stack with single-CAS batch push and pop
//! - **Intern set**: sorted copy-on-write set for name/metadata caches
//!
//! ## Quick Start
//!
//! ```rust
//! use strata::{ConcurrentHashMap, LockFreeStack, SegmentedQueue};
//!
//! let queue = SegmentedQueue::new();
//! queue.enqueue(42);
//! assert_eq!(queue.try_dequeue(), Some(42));
//!
//! let stack = LockFreeStack::new();
//! stack.push_range([1, 2, 3]);
//! assert_eq!(stack.try_pop(), Some(3));
//!
//! let map = ConcurrentHashMap::new();
//! assert!(map.try_insert("answer", 42));
//! assert_eq!(map.get(&"answer"), Some(42));
//! ```
//!
//! ## Thread Safety
//!
//! Every structure is meant to be shared (usually behind an `Arc`) and used
//! through `&self`. Memory unlinked by one thread while another may still be
//! reading it is reclaimed through epoch-based reclamation.
//!
//! ## Consistency
//!
//! Single-key and single-element operations are linearizable. Bulk reads on the
//! queue and stack (`to_vec`, `iter`, `len`) are weakly consistent: they never
//! fail or observe a torn value, but they do not promise an exact picture of a
//! structure that is being mutated concurrently. The map's bulk reads lock
//! every stripe and are exact.

#![warn(missing_docs, missing_debug_implementations, rust_2018_idioms)]

mod handoff;

pub mod intern;
pub mod map;
pub mod metrics;
pub mod queue;
pub mod stack;
pub mod util;

pub use crate::intern::InternSet;
pub use crate::map::{ConcurrentHashMap, HashComparer, KeyComparer, MapConfig};
pub use crate::metrics::{MetricsCollector, PerformanceMetrics};
pub use crate::queue::SegmentedQueue;
pub use crate::stack::LockFreeStack;

/// Error types for strata operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// An argument was rejected before any shared state was touched
    #[error("invalid argument `{name}`: {reason}")]
    InvalidArgument {
        /// Name of the offending parameter
        name: &'static str,
        /// What was wrong with it
        reason: &'static str,
    },
    /// The key is not present in the map
    #[error("the given key was not present in the map")]
    KeyNotFound,
    /// User-supplied code behaved inconsistently
    #[error("invalid operation: {0}")]
    InvalidOperation(&'static str),
}

impl Error {
    pub(crate) const fn invalid_argument(name: &'static str, reason: &'static str) -> Self {
        Error::InvalidArgument { name, reason }
    }
}

/// Result type for strata operations
pub type Result<T> = core::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(
            Error::invalid_argument("start", "past the end of the slice").to_string(),
            "invalid argument `start`: past the end of the slice"
        );
        assert_eq!(
            Error::KeyNotFound.to_string(),
            "the given key was not present in the map"
        );
        assert_eq!(
            Error::InvalidOperation("inconsistent ordering").to_string(),
            "invalid operation: inconsistent ordering"
        );
    }

    #[test]
    fn test_types_are_shareable() {
        fn assert_send_sync<T: Send + Sync>() {}

        assert_send_sync::<ConcurrentHashMap<String, u64>>();
        assert_send_sync::<SegmentedQueue<String>>();
        assert_send_sync::<LockFreeStack<String>>();
        assert_send_sync::<InternSet<String>>();
    }
}
