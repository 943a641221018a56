//! Stack Module
//!
//! Lock-free LIFO stack with atomic batch push and pop.

pub mod lock_free;

pub use lock_free::LockFreeStack;

#[cfg(test)]
mod proptests;
