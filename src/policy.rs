use std::sync::atomic::{AtomicUsize, Ordering};

use crate::collect::DegenPoint;

/// Heap-wide cycle outcome counters, mirroring the per-generation
/// heuristics record surface at policy granularity.
pub struct CollectorPolicy {
    success_concurrent: AtomicUsize,
    success_degenerated: AtomicUsize,
    success_full: AtomicUsize,
    alloc_failure_to_degenerated: [AtomicUsize; DegenPoint::COUNT],
    alloc_failure_to_full: AtomicUsize,
    explicit_to_concurrent: AtomicUsize,
    explicit_to_full: AtomicUsize,
    implicit_to_concurrent: AtomicUsize,
    implicit_to_full: AtomicUsize,
}

/// Point-in-time copy of the policy counters, for monitoring and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleCounts {
    pub success_concurrent: usize,
    pub success_degenerated: usize,
    pub success_full: usize,
    pub alloc_failure_to_degenerated: usize,
    pub alloc_failure_to_full: usize,
    pub explicit_to_concurrent: usize,
    pub explicit_to_full: usize,
    pub implicit_to_concurrent: usize,
    pub implicit_to_full: usize,
}

impl CollectorPolicy {
    pub fn new() -> Self {
        Self {
            success_concurrent: AtomicUsize::new(0),
            success_degenerated: AtomicUsize::new(0),
            success_full: AtomicUsize::new(0),
            alloc_failure_to_degenerated: Default::default(),
            alloc_failure_to_full: AtomicUsize::new(0),
            explicit_to_concurrent: AtomicUsize::new(0),
            explicit_to_full: AtomicUsize::new(0),
            implicit_to_concurrent: AtomicUsize::new(0),
            implicit_to_full: AtomicUsize::new(0),
        }
    }

    pub fn record_success_concurrent(&self) {
        self.success_concurrent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_success_degenerated(&self) {
        self.success_degenerated.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_success_full(&self) {
        self.success_full.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_alloc_failure_to_degenerated(&self, point: DegenPoint) {
        self.alloc_failure_to_degenerated[point as usize].fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_alloc_failure_to_full(&self) {
        self.alloc_failure_to_full.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_explicit_to_concurrent(&self) {
        self.explicit_to_concurrent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_explicit_to_full(&self) {
        self.explicit_to_full.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_implicit_to_concurrent(&self) {
        self.implicit_to_concurrent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_implicit_to_full(&self) {
        self.implicit_to_full.fetch_add(1, Ordering::Relaxed);
    }

    pub fn cycle_counts(&self) -> CycleCounts {
        CycleCounts {
            success_concurrent: self.success_concurrent.load(Ordering::Relaxed),
            success_degenerated: self.success_degenerated.load(Ordering::Relaxed),
            success_full: self.success_full.load(Ordering::Relaxed),
            alloc_failure_to_degenerated: self
                .alloc_failure_to_degenerated
                .iter()
                .map(|c| c.load(Ordering::Relaxed))
                .sum(),
            alloc_failure_to_full: self.alloc_failure_to_full.load(Ordering::Relaxed),
            explicit_to_concurrent: self.explicit_to_concurrent.load(Ordering::Relaxed),
            explicit_to_full: self.explicit_to_full.load(Ordering::Relaxed),
            implicit_to_concurrent: self.implicit_to_concurrent.load(Ordering::Relaxed),
            implicit_to_full: self.implicit_to_full.load(Ordering::Relaxed),
        }
    }

    pub fn alloc_failure_to_degenerated_at(&self, point: DegenPoint) -> usize {
        self.alloc_failure_to_degenerated[point as usize].load(Ordering::Relaxed)
    }
}

impl Default for CollectorPolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl CycleCounts {
    /// Cycles that reached completion, whatever the route.
    pub fn total_completed(&self) -> usize {
        self.success_concurrent + self.success_degenerated + self.success_full
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn per_point_degeneration_counts() {
        let policy = CollectorPolicy::new();
        policy.record_alloc_failure_to_degenerated(DegenPoint::Mark);
        policy.record_alloc_failure_to_degenerated(DegenPoint::Mark);
        policy.record_alloc_failure_to_degenerated(DegenPoint::Evac);
        assert_eq!(policy.alloc_failure_to_degenerated_at(DegenPoint::Mark), 2);
        assert_eq!(policy.alloc_failure_to_degenerated_at(DegenPoint::Evac), 1);
        assert_eq!(policy.cycle_counts().alloc_failure_to_degenerated, 3);
    }
}
