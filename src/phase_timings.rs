use std::time::Duration;

use parking_lot::Mutex;
use tracing::debug;

/// Phases the control plane times. Collaborator-internal subphases are out
/// of scope; this is the granularity the cycle report prints at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimedPhase {
    ConcReset,
    ConcMark,
    ConcEvac,
    ConcUpdateRefs,
    OldMark,
    DegenStw,
    FullStw,
    Uncommit,
}

impl TimedPhase {
    pub const COUNT: usize = 8;
    const ALL: [TimedPhase; Self::COUNT] = [
        TimedPhase::ConcReset,
        TimedPhase::ConcMark,
        TimedPhase::ConcEvac,
        TimedPhase::ConcUpdateRefs,
        TimedPhase::OldMark,
        TimedPhase::DegenStw,
        TimedPhase::FullStw,
        TimedPhase::Uncommit,
    ];

    pub fn name(self) -> &'static str {
        match self {
            TimedPhase::ConcReset => "concurrent reset",
            TimedPhase::ConcMark => "concurrent mark",
            TimedPhase::ConcEvac => "concurrent evacuation",
            TimedPhase::ConcUpdateRefs => "concurrent update refs",
            TimedPhase::OldMark => "old mark",
            TimedPhase::DegenStw => "degenerated stw",
            TimedPhase::FullStw => "full stw",
            TimedPhase::Uncommit => "uncommit",
        }
    }
}

#[derive(Default, Clone, Copy)]
struct Lap {
    seconds: [f64; TimedPhase::COUNT],
}

impl Lap {
    fn add(&mut self, other: &Lap) {
        for i in 0..TimedPhase::COUNT {
            self.seconds[i] += other.seconds[i];
        }
    }

    fn clear(&mut self) {
        self.seconds = [0.0; TimedPhase::COUNT];
    }

    fn total(&self) -> f64 {
        self.seconds.iter().sum()
    }
}

/// Per-cycle phase duration accumulation.
///
/// Worker laps collect durations while a cycle runs; the control thread
/// flushes workers to the cycle lap around dispatch boundaries and the
/// cycle lap to the global totals when the cycle's bookkeeping finishes.
pub struct PhaseTimings {
    workers: Mutex<Lap>,
    cycle: Mutex<Lap>,
    global: Mutex<Lap>,
}

impl PhaseTimings {
    pub fn new() -> Self {
        Self {
            workers: Mutex::new(Lap::default()),
            cycle: Mutex::new(Lap::default()),
            global: Mutex::new(Lap::default()),
        }
    }

    pub fn record_phase(&self, phase: TimedPhase, duration: Duration) {
        self.workers.lock().seconds[phase as usize] += duration.as_secs_f64();
    }

    pub fn flush_par_workers_to_cycle(&self) {
        let mut workers = self.workers.lock();
        self.cycle.lock().add(&workers);
        workers.clear();
    }

    pub fn flush_cycle_to_global(&self) {
        let mut cycle = self.cycle.lock();
        self.global.lock().add(&cycle);
        cycle.clear();
    }

    /// End-of-cycle report of phase durations for the cycle in flight.
    pub fn report_cycle(&self) {
        let cycle = self.cycle.lock();
        if cycle.total() == 0.0 {
            return;
        }
        for phase in TimedPhase::ALL {
            let secs = cycle.seconds[phase as usize];
            if secs > 0.0 {
                debug!(phase = phase.name(), ms = secs * 1000.0, "phase timing");
            }
        }
    }

    pub fn global_seconds(&self, phase: TimedPhase) -> f64 {
        self.global.lock().seconds[phase as usize]
    }
}

impl Default for PhaseTimings {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn laps_flush_downstream() {
        let timings = PhaseTimings::new();
        timings.record_phase(TimedPhase::ConcMark, Duration::from_millis(10));
        timings.record_phase(TimedPhase::ConcMark, Duration::from_millis(5));
        timings.flush_par_workers_to_cycle();
        assert_eq!(timings.global_seconds(TimedPhase::ConcMark), 0.0);
        timings.flush_cycle_to_global();
        let total = timings.global_seconds(TimedPhase::ConcMark);
        assert!((total - 0.015).abs() < 1e-9);

        // Cycle lap is consumed by the flush.
        timings.flush_cycle_to_global();
        assert!((timings.global_seconds(TimedPhase::ConcMark) - 0.015).abs() < 1e-9);
    }
}
