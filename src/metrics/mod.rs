//! Operation statistics
//!
//! Every structure in the crate counts its operations so callers can see how
//! often they hit an empty structure, how often they lost a compare-and-swap
//! race and how often the structure had to reorganize itself. Counting is
//! compiled in with the `metrics` feature (on by default) and can be switched
//! off at runtime per instance.

#[cfg(feature = "metrics")]
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Point-in-time copy of a structure's counters
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PerformanceMetrics {
    /// Total number of operations performed
    pub total_operations: u64,
    /// Operations that produced or stored a value
    pub successful_operations: u64,
    /// Operations that found the structure empty or the key absent
    pub failed_operations: u64,
    /// Retries caused by another thread winning a race
    pub contended_operations: u64,
    /// Resizes, clears and segment allocations
    pub structural_changes: u64,
}

impl PerformanceMetrics {
    /// Calculate success rate as percentage
    pub fn success_rate(&self) -> f64 {
        Self::percentage(self.successful_operations, self.total_operations)
    }

    /// Calculate contention rate as percentage
    pub fn contention_rate(&self) -> f64 {
        Self::percentage(self.contended_operations, self.total_operations)
    }

    /// Calculate failure rate as percentage
    pub fn failure_rate(&self) -> f64 {
        Self::percentage(self.failed_operations, self.total_operations)
    }

    fn percentage(part: u64, total: u64) -> f64 {
        if total == 0 {
            0.0
        } else {
            (part as f64 / total as f64) * 100.0
        }
    }
}

/// Trait for data structures that support performance metrics
pub trait MetricsCollector {
    /// Get current performance metrics
    fn metrics(&self) -> PerformanceMetrics;

    /// Reset all metrics
    fn reset_metrics(&self);

    /// Enable or disable metrics collection
    fn set_metrics_enabled(&self, enabled: bool);

    /// Check if metrics collection is enabled
    fn is_metrics_enabled(&self) -> bool;
}

/// Internal atomic metrics collection
#[cfg(feature = "metrics")]
#[derive(Debug)]
pub(crate) struct AtomicMetrics {
    enabled: AtomicBool,
    total_operations: AtomicU64,
    successful_operations: AtomicU64,
    failed_operations: AtomicU64,
    contended_operations: AtomicU64,
    structural_changes: AtomicU64,
}

#[cfg(feature = "metrics")]
impl Default for AtomicMetrics {
    fn default() -> Self {
        Self {
            enabled: AtomicBool::new(true),
            total_operations: AtomicU64::new(0),
            successful_operations: AtomicU64::new(0),
            failed_operations: AtomicU64::new(0),
            contended_operations: AtomicU64::new(0),
            structural_changes: AtomicU64::new(0),
        }
    }
}

#[cfg(feature = "metrics")]
impl AtomicMetrics {
    #[inline]
    fn bump(&self, counter: &AtomicU64) {
        if self.enabled.load(Ordering::Relaxed) {
            counter.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record an operation that produced or stored a value
    #[inline]
    pub(crate) fn record_success(&self) {
        self.bump(&self.total_operations);
        self.bump(&self.successful_operations);
    }

    /// Record an operation that came back empty-handed
    #[inline]
    pub(crate) fn record_failure(&self) {
        self.bump(&self.total_operations);
        self.bump(&self.failed_operations);
    }

    /// Record a lost race that forced a retry
    #[inline]
    pub(crate) fn record_contention(&self) {
        self.bump(&self.contended_operations);
    }

    /// Record a resize, clear or segment allocation
    #[inline]
    pub(crate) fn record_structural_change(&self) {
        self.bump(&self.structural_changes);
    }

    pub(crate) fn snapshot(&self) -> PerformanceMetrics {
        PerformanceMetrics {
            total_operations: self.total_operations.load(Ordering::Relaxed),
            successful_operations: self.successful_operations.load(Ordering::Relaxed),
            failed_operations: self.failed_operations.load(Ordering::Relaxed),
            contended_operations: self.contended_operations.load(Ordering::Relaxed),
            structural_changes: self.structural_changes.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn reset(&self) {
        self.total_operations.store(0, Ordering::Relaxed);
        self.successful_operations.store(0, Ordering::Relaxed);
        self.failed_operations.store(0, Ordering::Relaxed);
        self.contended_operations.store(0, Ordering::Relaxed);
        self.structural_changes.store(0, Ordering::Relaxed);
    }

    pub(crate) fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    pub(crate) fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }
}

#[cfg(not(feature = "metrics"))]
#[derive(Debug, Default)]
pub(crate) struct AtomicMetrics;

#[cfg(not(feature = "metrics"))]
impl AtomicMetrics {
    #[inline]
    pub(crate) fn record_success(&self) {}
    #[inline]
    pub(crate) fn record_failure(&self) {}
    #[inline]
    pub(crate) fn record_contention(&self) {}
    #[inline]
    pub(crate) fn record_structural_change(&self) {}
    pub(crate) fn snapshot(&self) -> PerformanceMetrics {
        PerformanceMetrics::default()
    }
    pub(crate) fn reset(&self) {}
    pub(crate) fn set_enabled(&self, _enabled: bool) {}
    pub(crate) fn is_enabled(&self) -> bool {
        false
    }
}

/// Implements [`MetricsCollector`] by delegating to a `metrics` field.
macro_rules! delegate_metrics {
    ($ty:ident < $($param:ident),+ >) => {
        impl<$($param),+> $crate::metrics::MetricsCollector for $ty<$($param),+> {
            fn metrics(&self) -> $crate::metrics::PerformanceMetrics {
                self.metrics.snapshot()
            }

            fn reset_metrics(&self) {
                self.metrics.reset();
            }

            fn set_metrics_enabled(&self, enabled: bool) {
                self.metrics.set_enabled(enabled);
            }

            fn is_metrics_enabled(&self) -> bool {
                self.metrics.is_enabled()
            }
        }
    };
}

pub(crate) use delegate_metrics;
