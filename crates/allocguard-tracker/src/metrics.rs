//! Atomic counters for tracker observability.
//!
//! All counters use relaxed ordering; they are diagnostic, not
//! synchronization primitives.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Per-tracker operation counters.
#[derive(Debug)]
pub struct TrackerMetrics {
    /// Allocations recorded in the ledger.
    pub allocs_tracked: AtomicU64,
    /// Frees that removed a record and passed verification.
    pub frees_tracked: AtomicU64,
    /// Null pointers passed straight through.
    pub null_passthroughs: AtomicU64,
    /// Calls made while the tracker was disabled.
    pub disabled_passthroughs: AtomicU64,
    /// Allocations that got guard regions.
    pub canaries_installed: AtomicU64,
    /// Guard checks that found both regions intact.
    pub canary_passes: AtomicU64,
    /// Guard checks that found a damaged region.
    pub canary_failures: AtomicU64,
    /// Frees of pointers with no live record.
    pub unknown_frees: AtomicU64,
    /// Allocations whose address was already live.
    pub ledger_collisions: AtomicU64,
    /// Frees through the wrong allocator.
    pub allocator_mismatches: AtomicU64,
    /// `expect_no_allocations` calls.
    pub leak_checks: AtomicU64,
}

impl TrackerMetrics {
    /// Create a new zeroed metrics instance.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            allocs_tracked: AtomicU64::new(0),
            frees_tracked: AtomicU64::new(0),
            null_passthroughs: AtomicU64::new(0),
            disabled_passthroughs: AtomicU64::new(0),
            canaries_installed: AtomicU64::new(0),
            canary_passes: AtomicU64::new(0),
            canary_failures: AtomicU64::new(0),
            unknown_frees: AtomicU64::new(0),
            ledger_collisions: AtomicU64::new(0),
            allocator_mismatches: AtomicU64::new(0),
            leak_checks: AtomicU64::new(0),
        }
    }

    /// Increment a counter by 1.
    pub fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Read a counter value.
    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }

    fn counters(&self) -> [&AtomicU64; 11] {
        [
            &self.allocs_tracked,
            &self.frees_tracked,
            &self.null_passthroughs,
            &self.disabled_passthroughs,
            &self.canaries_installed,
            &self.canary_passes,
            &self.canary_failures,
            &self.unknown_frees,
            &self.ledger_collisions,
            &self.allocator_mismatches,
            &self.leak_checks,
        ]
    }

    /// Zero every counter.
    pub fn reset(&self) {
        for counter in self.counters() {
            counter.store(0, Ordering::Relaxed);
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            allocs_tracked: Self::get(&self.allocs_tracked),
            frees_tracked: Self::get(&self.frees_tracked),
            null_passthroughs: Self::get(&self.null_passthroughs),
            disabled_passthroughs: Self::get(&self.disabled_passthroughs),
            canaries_installed: Self::get(&self.canaries_installed),
            canary_passes: Self::get(&self.canary_passes),
            canary_failures: Self::get(&self.canary_failures),
            unknown_frees: Self::get(&self.unknown_frees),
            ledger_collisions: Self::get(&self.ledger_collisions),
            allocator_mismatches: Self::get(&self.allocator_mismatches),
            leak_checks: Self::get(&self.leak_checks),
        }
    }
}

impl Default for TrackerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of all tracker counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub allocs_tracked: u64,
    pub frees_tracked: u64,
    pub null_passthroughs: u64,
    pub disabled_passthroughs: u64,
    pub canaries_installed: u64,
    pub canary_passes: u64,
    pub canary_failures: u64,
    pub unknown_frees: u64,
    pub ledger_collisions: u64,
    pub allocator_mismatches: u64,
    pub leak_checks: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_start_at_zero() {
        assert_eq!(TrackerMetrics::new().snapshot(), MetricsSnapshot::default());
    }

    #[test]
    fn increment_and_reset() {
        let m = TrackerMetrics::new();
        TrackerMetrics::inc(&m.allocs_tracked);
        TrackerMetrics::inc(&m.allocs_tracked);
        TrackerMetrics::inc(&m.canary_failures);
        let snap = m.snapshot();
        assert_eq!(snap.allocs_tracked, 2);
        assert_eq!(snap.canary_failures, 1);

        m.reset();
        assert_eq!(m.snapshot(), MetricsSnapshot::default());
    }
}
