use std::time::Duration;

use thiserror::Error;

/// Startup configuration for the heap and its control thread.
///
/// Everything here is read-only after `Heap::new` except
/// `soft_max_heap_size`, which seeds the runtime-mutable soft limit
/// (see `Heap::set_soft_max_heap_size`).
#[derive(Debug, Clone)]
pub struct HeapOptions {
    /// Smallest capacity the heap may shrink to.
    pub min_heap_size: usize,
    /// Hard capacity limit.
    pub max_heap_size: usize,
    /// Initial soft capacity target, clamped to `[min, max]` on observation.
    pub soft_max_heap_size: usize,
    /// Upper bound on the control loop's idle wait.
    pub control_interval_max: Duration,
    /// Sleep used by the post-shutdown tail while waiting for `stop`.
    pub control_interval_min: Duration,
    /// How long a region must stay empty-committed before it may be
    /// uncommitted.
    pub uncommit_delay: Duration,
    /// Every Nth young concurrent cycle runs as an aging cycle.
    pub aging_cycle_period: usize,
    /// Consecutive degenerated cycles tolerated before heuristics demand a
    /// full collection.
    pub full_gc_threshold: usize,
    /// Enables the allocation pacer and its periodic notifier.
    pub pacing: bool,
    /// Force soft-reference clearing on every global cycle.
    pub always_clear_soft_refs: bool,
    /// Allow cancelled concurrent cycles to finish as degenerated cycles.
    pub degenerated_gc: bool,
    /// Implicit requests run concurrently instead of stop-the-world.
    pub implicit_gc_invokes_concurrent: bool,
    /// Explicit requests run concurrently instead of stop-the-world.
    pub explicit_gc_invokes_concurrent: bool,
    /// Ignore explicit collection requests entirely.
    pub disable_explicit_gc: bool,
    /// Enables the between-cycle shrink subtask.
    pub uncommit: bool,
    /// Run with distinct young/old generations rather than single-space.
    pub generational: bool,
    /// Stress knob: stall each collaborator phase for this long, so slow
    /// consumers and cancellation windows can be exercised. Zero in
    /// production.
    pub phase_pause_ms: u64,
    pub region_size_target: Option<usize>,
}

impl HeapOptions {
    pub fn with_max_heap(max_heap_size: usize) -> Self {
        Self {
            min_heap_size: max_heap_size / 8,
            max_heap_size,
            soft_max_heap_size: max_heap_size,
            control_interval_max: Duration::from_millis(10),
            control_interval_min: Duration::from_millis(1),
            uncommit_delay: Duration::from_millis(5000),
            aging_cycle_period: 1,
            full_gc_threshold: 3,
            pacing: false,
            always_clear_soft_refs: false,
            degenerated_gc: true,
            implicit_gc_invokes_concurrent: false,
            explicit_gc_invokes_concurrent: true,
            disable_explicit_gc: false,
            uncommit: true,
            generational: true,
            phase_pause_ms: 0,
            region_size_target: None,
        }
    }

    pub fn validate(&self) -> Result<(), OptionsError> {
        if self.max_heap_size == 0 {
            return Err(OptionsError::ZeroCapacity);
        }
        if self.min_heap_size > self.max_heap_size {
            return Err(OptionsError::MinAboveMax {
                min: self.min_heap_size,
                max: self.max_heap_size,
            });
        }
        if self.control_interval_max.is_zero() || self.control_interval_min.is_zero() {
            return Err(OptionsError::ZeroInterval);
        }
        if self.aging_cycle_period == 0 {
            return Err(OptionsError::ZeroAgingPeriod);
        }
        Ok(())
    }

    /// The shrink pass runs ten times per uncommit delay, keeping the
    /// observed lag under a tenth of the configured delay.
    pub fn shrink_period(&self) -> f64 {
        self.uncommit_delay.as_secs_f64() / 10.0
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum OptionsError {
    #[error("max heap size must be nonzero")]
    ZeroCapacity,
    #[error("min heap size {min} exceeds max heap size {max}")]
    MinAboveMax { min: usize, max: usize },
    #[error("control intervals must be nonzero")]
    ZeroInterval,
    #[error("aging cycle period must be nonzero")]
    ZeroAgingPeriod,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        assert_eq!(HeapOptions::with_max_heap(64 * 1024 * 1024).validate(), Ok(()));
    }

    #[test]
    fn rejects_inverted_bounds() {
        let mut opts = HeapOptions::with_max_heap(16 * 1024 * 1024);
        opts.min_heap_size = 32 * 1024 * 1024;
        assert!(matches!(
            opts.validate(),
            Err(OptionsError::MinAboveMax { .. })
        ));
    }

    #[test]
    fn rejects_zero_intervals() {
        let mut opts = HeapOptions::with_max_heap(16 * 1024 * 1024);
        opts.control_interval_max = Duration::ZERO;
        assert_eq!(opts.validate(), Err(OptionsError::ZeroInterval));
    }
}
