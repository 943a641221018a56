//! Interning
//!
//! - [`InternSet`]: sorted, append-only set that hands out shared `Arc`
//!   handles, for caches that map a name to one canonical value

pub mod sorted_set;

pub use self::sorted_set::InternSet;
