use std::time::Instant;

use tracing::debug;

use crate::cause::GcCause;
use crate::collect::DegenPoint;
use crate::generation::GenerationKind;
use crate::heap::Heap;
use crate::phase_timings::TimedPhase;

/// A concurrent collection of one generation.
///
/// Normal cycle goes via all concurrent phases. If cancellation happens
/// during any of them, the cycle stops cleanly at the next phase boundary
/// and records the degeneration point; the control loop completes the
/// collection as a degenerated cycle from there.
///
/// In bootstrap mode the young cycle additionally enqueues references into
/// the old generation's mark queues so an old concurrent mark can resume
/// from the completed young mark.
pub struct ConcurrentGc {
    generation: GenerationKind,
    do_old_bootstrap: bool,
    degen_point: DegenPoint,
}

impl ConcurrentGc {
    pub fn new(generation: GenerationKind, do_old_bootstrap: bool) -> Self {
        assert!(
            !do_old_bootstrap || generation == GenerationKind::Young,
            "only young cycles bootstrap old marking"
        );
        Self {
            generation,
            do_old_bootstrap,
            degen_point: DegenPoint::Unset,
        }
    }

    /// Valid after `collect` returned false.
    pub fn degen_point(&self) -> DegenPoint {
        self.degen_point
    }

    pub fn collect(&mut self, heap: &Heap, cause: GcCause) -> bool {
        let generation = heap.generation(self.generation);

        // Reset: marking state from the previous cycle is invalidated.
        let start = Instant::now();
        generation.set_mark_incomplete();
        if self.do_old_bootstrap {
            let old = heap.old_generation();
            assert!(
                !heap.is_concurrent_old_mark_in_progress(),
                "old marking already in progress"
            );
            assert!(old.task_queues().is_empty(), "old mark queues should be empty");
            heap.young_generation()
                .set_old_gen_task_queues(Some(old.task_queues().clone()));
            old.set_mark_incomplete();
        }
        heap.stress_pause();
        heap.phase_timings()
            .record_phase(TimedPhase::ConcReset, start.elapsed());
        if self.check_cancellation(heap, DegenPoint::Mark) {
            return false;
        }

        // Concurrent mark.
        let start = Instant::now();
        let regular_regions = {
            let inner = heap.locked();
            inner
                .regions
                .iter()
                .filter(|r| r.state() == crate::region::RegionState::Regular)
                .count()
        };
        if self.do_old_bootstrap {
            // Old references found by the young mark become old marking
            // work; the resumed old cycle drains them.
            if let Some(old_queues) = heap.young_generation().old_gen_task_queues() {
                old_queues.add_tasks(regular_regions + 1);
            }
        }
        heap.stress_pause();
        heap.phase_timings()
            .record_phase(TimedPhase::ConcMark, start.elapsed());
        if self.check_cancellation(heap, DegenPoint::Mark) {
            return false;
        }
        generation.set_mark_complete();
        if self.do_old_bootstrap {
            heap.set_concurrent_old_mark_in_progress(true);
        }

        // Immediate garbage shortcut: all reclaimable memory is in whole
        // dead regions, nothing needs to move.
        let trash_only = regular_regions == 0;
        if !trash_only {
            // Concurrent evacuation.
            let start = Instant::now();
            heap.stress_pause();
            heap.phase_timings()
                .record_phase(TimedPhase::ConcEvac, start.elapsed());
            if self.check_cancellation(heap, DegenPoint::Evac) {
                return false;
            }

            // Concurrent update refs.
            let start = Instant::now();
            heap.stress_pause();
            heap.phase_timings()
                .record_phase(TimedPhase::ConcUpdateRefs, start.elapsed());
            if self.check_cancellation(heap, DegenPoint::UpdateRefs) {
                return false;
            }
        } else {
            debug!(generation = %self.generation, "immediate garbage shortcut");
        }

        let recycled = heap.recycle_trash();
        debug!(
            generation = %self.generation,
            cause = %cause,
            recycled,
            "concurrent cycle complete"
        );
        generation.set_used(heap.used());
        true
    }

    fn check_cancellation(&mut self, heap: &Heap, point: DegenPoint) -> bool {
        if heap.cancelled_gc() {
            debug!(
                generation = %self.generation,
                point = %point,
                "concurrent cycle interrupted"
            );
            self.degen_point = point;
            return true;
        }
        false
    }
}
