//! Construction parameters for the striped map

use std::sync::LazyLock;
use std::thread;

use crate::{Error, Result};

/// Initial bucket count used when no capacity is requested
pub const DEFAULT_CAPACITY: usize = 31;

/// Hard ceiling for the stripe-lock array when it is allowed to grow
pub const MAX_LOCK_COUNT: usize = 1024;

static DEFAULT_CONCURRENCY: LazyLock<usize> = LazyLock::new(|| {
    thread::available_parallelism()
        .map(|p| p.get())
        .unwrap_or(1)
});

/// Default number of stripes: one per available hardware thread
#[inline]
pub fn default_concurrency_level() -> usize {
    *DEFAULT_CONCURRENCY
}

/// How a [`ConcurrentHashMap`](super::ConcurrentHashMap) is laid out initially
///
/// # Examples
///
/// ```rust
/// use strata::{ConcurrentHashMap, MapConfig};
///
/// let config = MapConfig::new().concurrency_level(8).capacity(1024);
/// let map: ConcurrentHashMap<u64, u64> = ConcurrentHashMap::with_config(config).unwrap();
/// map.try_insert(1, 1);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapConfig {
    /// Number of stripe locks. `None` picks the hardware thread count and
    /// lets the lock array double during growth up to [`MAX_LOCK_COUNT`].
    pub concurrency_level: Option<usize>,
    /// Initial bucket count. Raised to the stripe count if smaller.
    pub capacity: usize,
}

impl Default for MapConfig {
    fn default() -> Self {
        Self {
            concurrency_level: None,
            capacity: DEFAULT_CAPACITY,
        }
    }
}

impl MapConfig {
    /// Default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Pin the number of stripe locks
    pub fn concurrency_level(mut self, level: usize) -> Self {
        self.concurrency_level = Some(level);
        self
    }

    /// Set the initial bucket count
    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Reject configurations the map cannot be built from
    pub fn validate(&self) -> Result<()> {
        if self.concurrency_level == Some(0) {
            return Err(Error::invalid_argument(
                "concurrency_level",
                "must be at least 1",
            ));
        }
        Ok(())
    }

    pub(crate) fn lock_count(&self) -> usize {
        self.concurrency_level
            .unwrap_or_else(default_concurrency_level)
            .max(1)
    }

    pub(crate) fn bucket_count(&self) -> usize {
        self.capacity.max(self.lock_count())
    }

    pub(crate) fn grows_lock_array(&self) -> bool {
        self.concurrency_level.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = MapConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.grows_lock_array());
        assert!(config.lock_count() >= 1);
        assert!(config.bucket_count() >= DEFAULT_CAPACITY);
    }

    #[test]
    fn test_capacity_raised_to_stripe_count() {
        let config = MapConfig::new().concurrency_level(16).capacity(4);
        assert_eq!(config.bucket_count(), 16);
        assert!(!config.grows_lock_array());
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let err = MapConfig::new().concurrency_level(0).validate().unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidArgument {
                name: "concurrency_level",
                ..
            }
        ));
    }
}
