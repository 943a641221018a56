//! Map implementations
//!
//! ## Available Maps
//!
//! - [`ConcurrentHashMap`]: lock-free reads, stripe-locked writes, resizing
//!   under every stripe
//!
//! ## Choosing a Layout
//!
//! - Leave `concurrency_level` unset to start with one stripe per hardware
//!   thread and let the stripe array double as the map grows
//! - Pin `concurrency_level` when the number of writers is known up front
//! - Supply a [`KeyComparer`] when key equality is not the key's own `Eq`

pub mod comparer;
pub mod concurrent;
pub mod config;

pub use self::comparer::{HashComparer, KeyComparer};
pub use self::concurrent::{ConcurrentHashMap, Iter};
pub use self::config::{default_concurrency_level, MapConfig, DEFAULT_CAPACITY, MAX_LOCK_COUNT};
