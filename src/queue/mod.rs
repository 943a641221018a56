//! Queue implementations
//!
//! ## Available Queues
//!
//! - [`SegmentedQueue`]: unbounded multi-producer, multi-consumer FIFO built
//!   from fixed-size segments
//!
//! ## Guarantees
//!
//! - **Lock-free**: producers and consumers only ever spin briefly on a slot
//!   that another thread has reserved but not finished
//! - **Strict FIFO**: values become dequeue-able in reservation order
//! - **Weakly consistent snapshots**: `to_vec`, `iter` and `try_peek` never
//!   observe a torn or moved-out value
//!
//! ## Performance Characteristics
//!
//! | Operation | Cost | Notes |
//! |-----------|------|-------|
//! | enqueue | O(1) | one `fetch_add`, one allocation per segment |
//! | try_dequeue | O(1) | one CAS on the segment's low cursor |
//! | len | O(1) | stable read of the head/tail cursors |
//! | to_vec / iter | O(n) | clones each live value |
//!
//! ## Examples
//!
//! ```rust
//! use strata::queue::SegmentedQueue;
//! use std::sync::Arc;
//! use std::thread;
//!
//! let queue = Arc::new(SegmentedQueue::new());
//! let producer = thread::spawn({
//!     let queue = Arc::clone(&queue);
//!     move || {
//!         for i in 0..100 {
//!             queue.enqueue(i);
//!         }
//!     }
//! });
//! producer.join().unwrap();
//!
//! assert_eq!(queue.len(), 100);
//! assert_eq!(queue.try_dequeue(), Some(0));
//! ```

pub mod segmented;

pub use self::segmented::{Iter, SegmentedQueue, SEGMENT_SIZE};

#[cfg(test)]
mod tests;

#[cfg(test)]
mod proptests;
