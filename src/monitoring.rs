use std::sync::atomic::{AtomicUsize, Ordering};

use tracing::{debug, info};

use crate::utils::formatted_size;

/// Published heap counters.
///
/// The periodic counter task and the control thread's forced updates are
/// the only writers; embedder threads read the snapshot lock-free.
pub struct MonitoringSupport {
    used: AtomicUsize,
    committed: AtomicUsize,
    capacity: AtomicUsize,
    cycle_count: AtomicUsize,
    updates: AtomicUsize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub used: usize,
    pub committed: usize,
    pub capacity: usize,
    pub cycle_count: usize,
}

impl MonitoringSupport {
    pub fn new() -> Self {
        Self {
            used: AtomicUsize::new(0),
            committed: AtomicUsize::new(0),
            capacity: AtomicUsize::new(0),
            cycle_count: AtomicUsize::new(0),
            updates: AtomicUsize::new(0),
        }
    }

    pub fn update_counters(&self, used: usize, committed: usize, capacity: usize, cycles: usize) {
        self.used.store(used, Ordering::Release);
        self.committed.store(committed, Ordering::Release);
        self.capacity.store(capacity, Ordering::Release);
        self.cycle_count.store(cycles, Ordering::Release);
        let n = self.updates.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(
            used = %formatted_size(used),
            committed = %formatted_size(committed),
            capacity = %formatted_size(capacity),
            cycles,
            update = n,
            "monitoring counters refreshed"
        );
    }

    pub fn counters(&self) -> CounterSnapshot {
        CounterSnapshot {
            used: self.used.load(Ordering::Acquire),
            committed: self.committed.load(Ordering::Acquire),
            capacity: self.capacity.load(Ordering::Acquire),
            cycle_count: self.cycle_count.load(Ordering::Acquire),
        }
    }

    pub fn update_count(&self) -> usize {
        self.updates.load(Ordering::Relaxed)
    }
}

impl Default for MonitoringSupport {
    fn default() -> Self {
        Self::new()
    }
}

/// Metadata-space usage captured before a cycle so the post-cycle report
/// can log what the cycle changed.
#[derive(Debug, Clone, Copy)]
pub struct MetaspaceStats {
    pub used: usize,
}

impl MetaspaceStats {
    pub fn capture(used: usize) -> Self {
        Self { used }
    }

    /// Logs the metadata delta across the cycle, if any.
    pub fn print_change(&self, used_after: usize) {
        if used_after != self.used {
            info!(
                before = %formatted_size(self.used),
                after = %formatted_size(used_after),
                "metaspace change"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_last_update() {
        let mon = MonitoringSupport::new();
        mon.update_counters(10, 20, 30, 2);
        assert_eq!(
            mon.counters(),
            CounterSnapshot {
                used: 10,
                committed: 20,
                capacity: 30,
                cycle_count: 2
            }
        );
        assert_eq!(mon.update_count(), 1);
    }
}
